// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device transport abstraction.
//!
//! A transport carries register, memory-window and DMA-control traffic to
//! the accelerator. The session layer owns one transport per open device and
//! performs all validation before handing accesses down, so transports are
//! plain byte movers.

use crate::error::FpspinResult;
use crate::regs::RegisterBlock;
use std::fs::File;

/// Physical DMA region of a context, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// Bus address of the region.
    pub handle: u64,
    /// Region size in bytes.
    pub size: u64,
    /// Region is allocated and usable.
    pub enabled: bool,
}

/// Access primitives provided by a device backend.
pub trait Transport {
    /// Read register `index` of `block`.
    fn read_register(&self, block: &RegisterBlock, index: usize) -> FpspinResult<u32>;

    /// Write register `index` of `block`.
    fn write_register(&self, block: &RegisterBlock, index: usize, value: u32) -> FpspinResult<()>;

    /// Read a 32-bit word from the accelerator memory window.
    fn read_mem_word(&self, offset: u64) -> FpspinResult<u32>;

    /// Write a 32-bit word to the accelerator memory window.
    fn write_mem_word(&self, offset: u64, value: u32) -> FpspinResult<()>;

    /// Query the DMA region of a context.
    fn query_dma(&self, ctx: usize) -> FpspinResult<DmaRegion>;

    /// Read a 64-bit word outside of the mapped control window.
    fn raw_peek(&self, addr: u64) -> FpspinResult<u64>;

    /// Write a 64-bit word outside of the mapped control window.
    fn raw_poke(&self, addr: u64, value: u64) -> FpspinResult<()>;

    /// Device file backing the DMA mapping, if the backend has one.
    fn dma_file(&self) -> Option<&File> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn read_register(&self, block: &RegisterBlock, index: usize) -> FpspinResult<u32> {
        (**self).read_register(block, index)
    }

    fn write_register(&self, block: &RegisterBlock, index: usize, value: u32) -> FpspinResult<()> {
        (**self).write_register(block, index, value)
    }

    fn read_mem_word(&self, offset: u64) -> FpspinResult<u32> {
        (**self).read_mem_word(offset)
    }

    fn write_mem_word(&self, offset: u64, value: u32) -> FpspinResult<()> {
        (**self).write_mem_word(offset, value)
    }

    fn query_dma(&self, ctx: usize) -> FpspinResult<DmaRegion> {
        (**self).query_dma(ctx)
    }

    fn raw_peek(&self, addr: u64) -> FpspinResult<u64> {
        (**self).raw_peek(addr)
    }

    fn raw_poke(&self, addr: u64, value: u64) -> FpspinResult<()> {
        (**self).raw_poke(addr, value)
    }

    fn dma_file(&self) -> Option<&File> {
        (**self).dma_file()
    }
}
