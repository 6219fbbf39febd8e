// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Control-register registry.
//!
//! The accelerator exposes its control registers as named groups of 32-bit
//! registers. Each group has a fixed count, a byte offset from the register
//! base, an access mode and an optional validator that decides whether a
//! write is acceptable given the current device state.
//!
//! The registry is a plain table built once per session; there is no
//! process-wide register state.

use crate::error::{FpspinError, FpspinResult};

/// Number of clusters on the accelerator.
pub const NUM_CLUSTERS: usize = 2;

/// Number of rule sets in the matching engine.
pub const NUM_RULESETS: usize = 4;

/// Number of rules per rule set.
pub const RULES_PER_RULESET: usize = 4;

/// Number of handler execution contexts.
pub const NUM_HANDLER_CONTEXTS: usize = 4;

// Register group names.
pub const CL_CTRL: &str = "cl_ctrl";
pub const CL_FIFO: &str = "cl_fifo";
pub const CL_STAT: &str = "cl_stat";
pub const MPQ: &str = "mpq";
pub const DATAPATH_STATS: &str = "datapath_stats";
pub const ME_VALID: &str = "me_valid";
pub const ME_MODE: &str = "me_mode";
pub const ME_IDX: &str = "me_idx";
pub const ME_MASK: &str = "me_mask";
pub const ME_START: &str = "me_start";
pub const ME_END: &str = "me_end";
pub const HER_VALID: &str = "her_valid";
pub const HER_CTX_ENABLED: &str = "her_ctx_enabled";
pub const HER_HANDLER_MEM_ADDR: &str = "her_handler_mem_addr";
pub const HER_HANDLER_MEM_SIZE: &str = "her_handler_mem_size";
pub const HER_HOST_MEM_ADDR_LO: &str = "her_host_mem_addr_lo";
pub const HER_HOST_MEM_ADDR_HI: &str = "her_host_mem_addr_hi";
pub const HER_HOST_MEM_SIZE: &str = "her_host_mem_size";
pub const HER_HH_ADDR: &str = "her_hh_addr";
pub const HER_HH_SIZE: &str = "her_hh_size";
pub const HER_PH_ADDR: &str = "her_ph_addr";
pub const HER_PH_SIZE: &str = "her_ph_size";
pub const HER_TH_ADDR: &str = "her_th_addr";
pub const HER_TH_SIZE: &str = "her_th_size";
pub const HER_SCRATCHPAD_0_ADDR: &str = "her_scratchpad_0_addr";
pub const HER_SCRATCHPAD_0_SIZE: &str = "her_scratchpad_0_size";
pub const HER_SCRATCHPAD_1_ADDR: &str = "her_scratchpad_1_addr";
pub const HER_SCRATCHPAD_1_SIZE: &str = "her_scratchpad_1_size";
pub const HER_SCRATCHPAD_2_ADDR: &str = "her_scratchpad_2_addr";
pub const HER_SCRATCHPAD_2_SIZE: &str = "her_scratchpad_2_size";
pub const HER_SCRATCHPAD_3_ADDR: &str = "her_scratchpad_3_addr";
pub const HER_SCRATCHPAD_3_SIZE: &str = "her_scratchpad_3_size";

/// Index of the fetch-enable mask in `cl_ctrl`.
pub const CL_CTRL_FETCH_EN: usize = 0;
/// Index of the cluster reset in `cl_ctrl`.
pub const CL_CTRL_RESET: usize = 1;

/// Write check attached to a register group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// Fetch-enable mask limited to the cluster count, reset limited to {0, 1}.
    ClusterCtrl,
    /// Engine enable flag, limited to {0, 1}.
    EnableFlag,
    /// Matching-engine configuration; only writable while the ME is disabled.
    MeInConf,
    /// Handler-execution configuration; only writable while HER is disabled.
    HerInConf,
}

/// Device state the validators look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateState {
    pub in_reset: bool,
    pub me_enabled: bool,
    pub her_enabled: bool,
}

impl Default for GateState {
    /// The hardware comes up in reset with both engines disabled.
    fn default() -> Self {
        Self {
            in_reset: true,
            me_enabled: false,
            her_enabled: false,
        }
    }
}

impl GateState {
    /// Fold an accepted write into the gate state.
    pub fn apply(&mut self, group: &str, index: usize, value: u32) {
        match group {
            CL_CTRL if index == CL_CTRL_RESET => self.in_reset = value == 1,
            ME_VALID => self.me_enabled = value == 1,
            HER_VALID => self.her_enabled = value == 1,
            _ => {}
        }
    }
}

impl Validator {
    /// Check a write; returns the rejection reason if the write is refused.
    pub fn check(self, index: usize, value: u32, gates: &GateState) -> Result<(), &'static str> {
        match self {
            Validator::ClusterCtrl if index == CL_CTRL_FETCH_EN => {
                if value > (1 << NUM_CLUSTERS) - 1 {
                    Err("fetch-enable mask exceeds cluster count")
                } else {
                    Ok(())
                }
            }
            Validator::ClusterCtrl | Validator::EnableFlag => {
                if value > 1 {
                    Err("value must be 0 or 1")
                } else {
                    Ok(())
                }
            }
            Validator::MeInConf if gates.me_enabled => Err("matching engine is enabled"),
            Validator::HerInConf if gates.her_enabled => Err("handler execution is enabled"),
            Validator::MeInConf | Validator::HerInConf => Ok(()),
        }
    }
}

/// A group of identically-typed 32-bit registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    /// Group name, e.g. `me_idx`.
    pub name: &'static str,
    /// Number of registers in the group.
    pub count: usize,
    /// Group is read-only.
    pub read_only: bool,
    /// Byte offset of register 0 from the register base.
    pub offset: u32,
    /// Attribute directory relative to the sysfs base (`me/idx`).
    pub sysfs_dir: &'static str,
    pub validator: Option<Validator>,
}

impl RegisterBlock {
    const fn rw(
        name: &'static str,
        count: usize,
        offset: u32,
        sysfs_dir: &'static str,
        validator: Validator,
    ) -> Self {
        Self {
            name,
            count,
            read_only: false,
            offset,
            sysfs_dir,
            validator: Some(validator),
        }
    }

    const fn ro(name: &'static str, count: usize, offset: u32, sysfs_dir: &'static str) -> Self {
        Self {
            name,
            count,
            read_only: true,
            offset,
            sysfs_dir,
            validator: None,
        }
    }

    /// Byte offset of register `index` from the register base.
    #[inline]
    pub fn address(&self, index: usize) -> u32 {
        self.offset + 4 * index as u32
    }
}

use Validator::{ClusterCtrl, EnableFlag, HerInConf, MeInConf};

const CTX: usize = NUM_HANDLER_CONTEXTS;
const RULES: usize = NUM_RULESETS * RULES_PER_RULESET;

/// Register layout of the accelerator.
static REGISTER_TABLE: &[RegisterBlock] = &[
    RegisterBlock::rw(CL_CTRL, 2, 0x0000, "cl/ctrl", ClusterCtrl),
    RegisterBlock::ro(CL_FIFO, 1, 0x0008, "cl/fifo"),
    RegisterBlock::ro(CL_STAT, 2, 0x1000, "stats/cluster"),
    RegisterBlock::ro(MPQ, 1, 0x1008, "stats/mpq"),
    RegisterBlock::ro(DATAPATH_STATS, 2, 0x100c, "stats/datapath"),
    RegisterBlock::rw(ME_VALID, 1, 0x2000, "me/valid", EnableFlag),
    RegisterBlock::rw(ME_MODE, NUM_RULESETS, 0x2004, "me/mode", MeInConf),
    RegisterBlock::rw(ME_IDX, RULES, 0x2014, "me/idx", MeInConf),
    RegisterBlock::rw(ME_MASK, RULES, 0x2054, "me/mask", MeInConf),
    RegisterBlock::rw(ME_START, RULES, 0x2094, "me/start", MeInConf),
    RegisterBlock::rw(ME_END, RULES, 0x20d4, "me/end", MeInConf),
    RegisterBlock::rw(HER_VALID, 1, 0x3000, "her/valid", EnableFlag),
    RegisterBlock::rw(HER_CTX_ENABLED, CTX, 0x3004, "her/ctx_enabled", HerInConf),
    RegisterBlock::rw(HER_HANDLER_MEM_ADDR, CTX, 0x4000, "her_meta/handler_mem_addr", HerInConf),
    RegisterBlock::rw(HER_HANDLER_MEM_SIZE, CTX, 0x4010, "her_meta/handler_mem_size", HerInConf),
    RegisterBlock::rw(HER_HOST_MEM_ADDR_LO, CTX, 0x4020, "her_meta/host_mem_addr_0", HerInConf),
    RegisterBlock::rw(HER_HOST_MEM_ADDR_HI, CTX, 0x4030, "her_meta/host_mem_addr_1", HerInConf),
    RegisterBlock::rw(HER_HOST_MEM_SIZE, CTX, 0x4040, "her_meta/host_mem_size", HerInConf),
    RegisterBlock::rw(HER_HH_ADDR, CTX, 0x4050, "her_meta/hh_addr", HerInConf),
    RegisterBlock::rw(HER_HH_SIZE, CTX, 0x4060, "her_meta/hh_size", HerInConf),
    RegisterBlock::rw(HER_PH_ADDR, CTX, 0x4070, "her_meta/ph_addr", HerInConf),
    RegisterBlock::rw(HER_PH_SIZE, CTX, 0x4080, "her_meta/ph_size", HerInConf),
    RegisterBlock::rw(HER_TH_ADDR, CTX, 0x4090, "her_meta/th_addr", HerInConf),
    RegisterBlock::rw(HER_TH_SIZE, CTX, 0x40a0, "her_meta/th_size", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_0_ADDR, CTX, 0x40b0, "her_meta/scratchpad_0_addr", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_0_SIZE, CTX, 0x40c0, "her_meta/scratchpad_0_size", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_1_ADDR, CTX, 0x40d0, "her_meta/scratchpad_1_addr", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_1_SIZE, CTX, 0x40e0, "her_meta/scratchpad_1_size", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_2_ADDR, CTX, 0x40f0, "her_meta/scratchpad_2_addr", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_2_SIZE, CTX, 0x4100, "her_meta/scratchpad_2_size", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_3_ADDR, CTX, 0x4110, "her_meta/scratchpad_3_addr", HerInConf),
    RegisterBlock::rw(HER_SCRATCHPAD_3_SIZE, CTX, 0x4120, "her_meta/scratchpad_3_size", HerInConf),
];

/// Name-indexed view over the register table.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    blocks: &'static [RegisterBlock],
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterMap {
    /// Registry for the standard accelerator layout.
    pub fn new() -> Self {
        Self {
            blocks: REGISTER_TABLE,
        }
    }

    pub fn blocks(&self) -> &'static [RegisterBlock] {
        self.blocks
    }

    pub fn block(&self, name: &str) -> FpspinResult<&'static RegisterBlock> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| FpspinError::UnknownRegister(name.to_string()))
    }

    /// Look up a register group and check the index against its count.
    pub fn resolve(&self, name: &str, index: usize) -> FpspinResult<&'static RegisterBlock> {
        let block = self.block(name)?;
        if index >= block.count {
            return Err(FpspinError::RegisterIndexOutOfRange {
                group: block.name,
                index,
                count: block.count,
            });
        }
        Ok(block)
    }

    /// Validate a write against access mode and the group's validator.
    pub fn check_write(
        &self,
        name: &str,
        index: usize,
        value: u32,
        gates: &GateState,
    ) -> FpspinResult<&'static RegisterBlock> {
        let block = self.resolve(name, index)?;
        if block.read_only {
            return Err(FpspinError::ReadOnlyRegister(block.name));
        }
        if let Some(validator) = block.validator {
            validator
                .check(index, value, gates)
                .map_err(|reason| FpspinError::RegisterRejected {
                    group: block.name,
                    index,
                    value,
                    reason,
                })?;
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_unique() {
        let map = RegisterMap::new();
        for (i, a) in map.blocks().iter().enumerate() {
            for b in &map.blocks()[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_rule_registers_cover_all_rulesets() {
        let map = RegisterMap::new();
        for name in [ME_IDX, ME_MASK, ME_START, ME_END] {
            assert_eq!(map.block(name).unwrap().count, 16);
        }
        assert_eq!(map.block(ME_MASK).unwrap().address(1), 0x2058);
    }

    #[test]
    fn test_cluster_reset_rejects_out_of_range() {
        let map = RegisterMap::new();
        let gates = GateState::default();
        assert!(map.check_write(CL_CTRL, CL_CTRL_RESET, 1, &gates).is_ok());
        let err = map.check_write(CL_CTRL, CL_CTRL_RESET, 2, &gates).unwrap_err();
        assert!(matches!(err, FpspinError::RegisterRejected { index: 1, value: 2, .. }));
    }

    #[test]
    fn test_fetch_mask_limited_to_clusters() {
        let map = RegisterMap::new();
        let gates = GateState::default();
        assert!(map.check_write(CL_CTRL, CL_CTRL_FETCH_EN, 0b11, &gates).is_ok());
        assert!(map.check_write(CL_CTRL, CL_CTRL_FETCH_EN, 0b100, &gates).is_err());
    }

    #[test]
    fn test_me_config_requires_disabled_engine() {
        let map = RegisterMap::new();
        let mut gates = GateState::default();
        gates.apply(ME_VALID, 0, 1);
        assert!(matches!(
            map.check_write(ME_IDX, 0, 3, &gates),
            Err(FpspinError::RegisterRejected { group: ME_IDX, .. })
        ));
        gates.apply(ME_VALID, 0, 0);
        assert!(map.check_write(ME_IDX, 0, 3, &gates).is_ok());
    }

    #[test]
    fn test_read_only_and_unknown() {
        let map = RegisterMap::new();
        let gates = GateState::default();
        assert!(matches!(
            map.check_write(CL_STAT, 0, 0, &gates),
            Err(FpspinError::ReadOnlyRegister(CL_STAT))
        ));
        assert!(matches!(
            map.check_write("nope", 0, 0, &gates),
            Err(FpspinError::UnknownRegister(_))
        ));
        assert!(matches!(
            map.resolve(HER_VALID, 1),
            Err(FpspinError::RegisterIndexOutOfRange { count: 1, .. })
        ));
    }
}
