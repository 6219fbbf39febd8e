// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! In-process device model.
//!
//! `SimTransport` stands in for the accelerator: it stores register values,
//! the memory window and raw 64-bit memory, reports DMA regions and records
//! every register write and raw poke so tests can assert on ordering.
//! Validation is the session's job; the model accepts whatever reaches it.

use crate::device::MEM_SIZE;
use crate::error::{FpspinError, FpspinResult};
use crate::regs::{RegisterBlock, CL_CTRL, CL_CTRL_RESET, NUM_HANDLER_CONTEXTS};
use crate::transport::{DmaRegion, Transport};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A register write observed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub group: &'static str,
    pub index: usize,
    pub value: u32,
}

#[derive(Debug, Default)]
struct SimState {
    registers: HashMap<(&'static str, usize), u32>,
    memory: HashMap<u64, u32>,
    raw: HashMap<u64, u64>,
    dma: [Option<DmaRegion>; NUM_HANDLER_CONTEXTS],
    writes: Vec<RegisterWrite>,
    pokes: Vec<(u64, u64)>,
    failing_group: Option<&'static str>,
}

/// Simulated accelerator backend.
#[derive(Debug, Default)]
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl SimTransport {
    /// A device fresh out of power-on: cluster in reset, engines disabled,
    /// no DMA regions.
    pub fn new() -> Self {
        let sim = Self::default();
        sim.lock().registers.insert((CL_CTRL, CL_CTRL_RESET), 1);
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a DMA region for a context.
    pub fn enable_dma(&self, ctx: usize, handle: u64, size: u64) {
        if let Some(slot) = self.lock().dma.get_mut(ctx) {
            *slot = Some(DmaRegion {
                handle,
                size,
                enabled: true,
            });
        }
    }

    /// Make every write to `group` fail with an I/O error.
    pub fn fail_writes_to(&self, group: &'static str) {
        self.lock().failing_group = Some(group);
    }

    /// Current value of a register (0 if never written).
    pub fn register(&self, group: &str, index: usize) -> u32 {
        let state = self.lock();
        state
            .registers
            .iter()
            .find(|((g, i), _)| *g == group && *i == index)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// All register writes in order.
    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.lock().writes.clone()
    }

    /// Register writes to one group, in order.
    pub fn writes_to(&self, group: &str) -> Vec<RegisterWrite> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.group == group)
            .copied()
            .collect()
    }

    /// Forget recorded writes and pokes (register values are kept).
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.pokes.clear();
    }

    /// Word stored in the memory window.
    pub fn mem_word(&self, offset: u64) -> u32 {
        self.lock().memory.get(&offset).copied().unwrap_or(0)
    }

    /// All raw pokes in order.
    pub fn pokes(&self) -> Vec<(u64, u64)> {
        self.lock().pokes.clone()
    }

    /// Seed raw memory, e.g. the performance counters.
    pub fn set_raw(&self, addr: u64, value: u64) {
        self.lock().raw.insert(addr, value);
    }
}

impl Transport for SimTransport {
    fn read_register(&self, block: &RegisterBlock, index: usize) -> FpspinResult<u32> {
        Ok(self.register(block.name, index))
    }

    fn write_register(&self, block: &RegisterBlock, index: usize, value: u32) -> FpspinResult<()> {
        let mut state = self.lock();
        if state.failing_group == Some(block.name) {
            return Err(FpspinError::Io(std::io::Error::other(format!(
                "injected failure writing {}[{index}]",
                block.name
            ))));
        }
        state.registers.insert((block.name, index), value);
        state.writes.push(RegisterWrite {
            group: block.name,
            index,
            value,
        });
        Ok(())
    }

    fn read_mem_word(&self, offset: u64) -> FpspinResult<u32> {
        if offset >= MEM_SIZE {
            return Err(FpspinError::MemoryOutOfRange { offset, len: 4 });
        }
        Ok(self.mem_word(offset))
    }

    fn write_mem_word(&self, offset: u64, value: u32) -> FpspinResult<()> {
        if offset >= MEM_SIZE {
            return Err(FpspinError::MemoryOutOfRange { offset, len: 4 });
        }
        self.lock().memory.insert(offset, value);
        Ok(())
    }

    fn query_dma(&self, ctx: usize) -> FpspinResult<DmaRegion> {
        let state = self.lock();
        match state.dma.get(ctx) {
            Some(Some(region)) if region.enabled => Ok(*region),
            _ => Err(FpspinError::NotEnabled { ctx }),
        }
    }

    fn raw_peek(&self, addr: u64) -> FpspinResult<u64> {
        Ok(self.lock().raw.get(&addr).copied().unwrap_or(0))
    }

    fn raw_poke(&self, addr: u64, value: u64) -> FpspinResult<()> {
        let mut state = self.lock();
        state.raw.insert(addr, value);
        state.pokes.push((addr, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::RegisterMap;

    #[test]
    fn test_starts_in_reset() {
        let sim = SimTransport::new();
        assert_eq!(sim.register(CL_CTRL, CL_CTRL_RESET), 1);
    }

    #[test]
    fn test_dma_query_requires_enabled_region() {
        let sim = SimTransport::new();
        assert!(matches!(sim.query_dma(1), Err(FpspinError::NotEnabled { ctx: 1 })));
        sim.enable_dma(1, 0x1_0000_0000, 0x10000);
        assert_eq!(sim.query_dma(1).unwrap().handle, 0x1_0000_0000);
        assert!(matches!(sim.query_dma(9), Err(FpspinError::NotEnabled { ctx: 9 })));
    }

    #[test]
    fn test_injected_failure_leaves_register_unchanged() {
        let sim = SimTransport::new();
        let map = RegisterMap::new();
        let block = map.block("her_hh_addr").unwrap();
        sim.write_register(block, 0, 5).unwrap();
        sim.fail_writes_to("her_hh_addr");
        assert!(sim.write_register(block, 0, 6).is_err());
        assert_eq!(sim.register("her_hh_addr", 0), 5);
    }
}
