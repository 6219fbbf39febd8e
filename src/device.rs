// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device session.
//!
//! A [`DeviceSession`] owns one open device (its transport) and, once mapped,
//! the context's host DMA buffer. Register writes go through the session's
//! register registry, which refuses writes the hardware would reject before
//! they reach the transport.

use crate::dma::{DmaBuffer, PAGE_SIZE};
use crate::error::{FpspinError, FpspinResult};
use crate::regs::{
    GateState, RegisterMap, CL_CTRL, CL_CTRL_RESET, CL_STAT, DATAPATH_STATS, HER_VALID, ME_VALID,
    MPQ,
};
use crate::transport::{DmaRegion, Transport};
use std::sync::atomic::{AtomicBool, Ordering};

/// Size of the accelerator memory window in bytes.
pub const MEM_SIZE: u64 = 0x80_0000;

/// Default device node for the accelerator memory window.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/pspin0";

/// Snapshot of the read-only statistics registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    /// `cl_stat[0..2]`: end-of-computation and busy masks.
    pub cluster: [u32; 2],
    /// `mpq[0]`: message-queue full mask.
    pub mpq: u32,
    /// `datapath_stats[0..2]`: packet counters.
    pub datapath: [u32; 2],
}

/// An open accelerator device.
///
/// Field order matters: the DMA buffer is dropped (unmapped) before the
/// transport (device handle) is closed.
pub struct DeviceSession<T: Transport> {
    buffer: Option<DmaBuffer>,
    transport: T,
    ctx_id: usize,
    dma: Option<DmaRegion>,
    registers: RegisterMap,
    gates: GateState,
    ring_claimed: AtomicBool,
}

/// Exclusive hold on a session's flag ring. Released on drop.
pub(crate) struct RingClaim<'s> {
    flag: &'s AtomicBool,
}

impl Drop for RingClaim<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl<T: Transport> DeviceSession<T> {
    /// Wrap an already-open transport.
    ///
    /// Reads the reset and engine-enable registers so that later writes are
    /// validated against the actual device state.
    pub fn with_transport(transport: T, ctx_id: usize) -> FpspinResult<Self> {
        let registers = RegisterMap::new();
        let gates = GateState {
            in_reset: transport.read_register(registers.block(CL_CTRL)?, CL_CTRL_RESET)? == 1,
            me_enabled: transport.read_register(registers.block(ME_VALID)?, 0)? == 1,
            her_enabled: transport.read_register(registers.block(HER_VALID)?, 0)? == 1,
        };
        log::debug!("session for context {ctx_id}: {gates:?}");

        Ok(Self {
            buffer: None,
            transport,
            ctx_id,
            dma: None,
            registers,
            gates,
            ring_claimed: AtomicBool::new(false),
        })
    }

    pub fn context_id(&self) -> usize {
        self.ctx_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    /// Device state as last observed through this session.
    pub fn gates(&self) -> GateState {
        self.gates
    }

    /// Query the physical DMA region of `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::NotEnabled` if the driver has no active region
    /// for that context.
    pub fn query_dma(&mut self, ctx: usize) -> FpspinResult<DmaRegion> {
        let region = self.transport.query_dma(ctx)?;
        if !region.enabled {
            return Err(FpspinError::NotEnabled { ctx });
        }
        log::info!(
            "host dma of context {ctx}: physical {:#x}, size {}",
            region.handle,
            region.size
        );
        if ctx == self.ctx_id {
            self.dma = Some(region);
        }
        Ok(region)
    }

    /// Physical DMA region of this session's context, once queried.
    pub fn dma_region(&self) -> Option<DmaRegion> {
        self.dma
    }

    /// Map `page_count` pages of this context's DMA region.
    ///
    /// Replaces (and unmaps) any earlier mapping.
    pub fn map_dma_buffer(&mut self, page_count: usize) -> FpspinResult<&DmaBuffer> {
        if page_count == 0 {
            return Err(FpspinError::InvalidArgument(
                "dma buffer needs at least one page".into(),
            ));
        }
        let len = page_count.checked_mul(PAGE_SIZE);
        let offset = len.and_then(|len| self.ctx_id.checked_mul(len));
        let (Some(len), Some(offset)) = (len, offset) else {
            return Err(FpspinError::InvalidArgument(format!(
                "dma buffer of {page_count} pages is too large"
            )));
        };
        self.buffer = None;

        let buffer = match self.transport.dma_file() {
            Some(file) => DmaBuffer::map_device(file, len, offset as u64)?,
            None => DmaBuffer::anonymous(len)?,
        };
        log::info!("mapped {page_count} pages of host dma for context {}", self.ctx_id);
        Ok(self.buffer.insert(buffer))
    }

    /// The mapped DMA buffer.
    pub fn dma_buffer(&self) -> FpspinResult<&DmaBuffer> {
        self.buffer.as_ref().ok_or(FpspinError::NoDmaBuffer)
    }

    /// Reserve the flag ring. Fails while another ring is attached.
    pub(crate) fn claim_ring(&self) -> FpspinResult<RingClaim<'_>> {
        if self.ring_claimed.swap(true, Ordering::AcqRel) {
            return Err(FpspinError::InvalidArgument(format!(
                "flag ring of context {} is already attached",
                self.ctx_id
            )));
        }
        Ok(RingClaim {
            flag: &self.ring_claimed,
        })
    }

    pub fn read_register(&self, group: &str, index: usize) -> FpspinResult<u32> {
        let block = self.registers.resolve(group, index)?;
        self.transport.read_register(block, index)
    }

    /// Write register `index` of `group`.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::RegisterRejected` if the value or the current
    /// device state does not allow the write; the register is left unchanged.
    pub fn write_register(&mut self, group: &str, index: usize, value: u32) -> FpspinResult<()> {
        let block = self
            .registers
            .check_write(group, index, value, &self.gates)?;
        self.transport.write_register(block, index, value)?;
        self.gates.apply(block.name, index, value);
        log::trace!("{}[{index}] <- {value:#x}", block.name);
        Ok(())
    }

    pub fn read_mem_word(&self, offset: u64) -> FpspinResult<u32> {
        self.check_mem(offset)?;
        self.transport.read_mem_word(offset)
    }

    pub fn write_mem_word(&self, offset: u64, value: u32) -> FpspinResult<()> {
        self.check_mem(offset)?;
        self.transport.write_mem_word(offset, value)
    }

    fn check_mem(&self, offset: u64) -> FpspinResult<()> {
        if self.gates.in_reset {
            return Err(FpspinError::DeviceInReset);
        }
        if offset % 4 != 0 || offset + 4 > MEM_SIZE {
            return Err(FpspinError::MemoryOutOfRange { offset, len: 4 });
        }
        Ok(())
    }

    /// Read a 64-bit word outside of the mapped window.
    pub fn raw_peek(&self, addr: u64) -> FpspinResult<u64> {
        self.transport.raw_peek(addr)
    }

    /// Write a 64-bit word outside of the mapped window.
    pub fn raw_poke(&self, addr: u64, value: u64) -> FpspinResult<()> {
        self.transport.raw_poke(addr, value)
    }

    /// Read the statistics register groups.
    pub fn cluster_stats(&self) -> FpspinResult<ClusterStats> {
        Ok(ClusterStats {
            cluster: [
                self.read_register(CL_STAT, 0)?,
                self.read_register(CL_STAT, 1)?,
            ],
            mpq: self.read_register(MPQ, 0)?,
            datapath: [
                self.read_register(DATAPATH_STATS, 0)?,
                self.read_register(DATAPATH_STATS, 1)?,
            ],
        })
    }

    /// Unmap the DMA buffer, then close the device.
    pub fn close(mut self) {
        if self.buffer.take().is_some() {
            log::debug!("unmapped host dma of context {}", self.ctx_id);
        }
        log::info!("closing device session for context {}", self.ctx_id);
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::sysfs::SysfsTransport;
    use std::path::Path;

    impl DeviceSession<SysfsTransport> {
        /// Open the accelerator described by `config`.
        ///
        /// # Errors
        ///
        /// Returns `FpspinError::DeviceUnavailable` if the device node or the
        /// register directory cannot be opened.
        pub fn open(config: &DeviceConfig) -> FpspinResult<Self> {
            let transport = SysfsTransport::open(&config.device_path, &config.regs_base)?;
            log::info!("opened {}", config.device_path.display());
            Self::with_transport(transport, config.context_id)
        }
    }

    /// Check if the accelerator device node exists.
    pub fn is_fpspin_available() -> bool {
        Path::new(DEFAULT_DEVICE_PATH).exists()
    }
}

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    pub fn is_fpspin_available() -> bool {
        false
    }
}

/// Check if the accelerator device node is present on this system.
#[cfg(target_os = "linux")]
pub fn is_fpspin_available() -> bool {
    linux_impl::is_fpspin_available()
}

#[cfg(not(target_os = "linux"))]
pub fn is_fpspin_available() -> bool {
    stub_impl::is_fpspin_available()
}
