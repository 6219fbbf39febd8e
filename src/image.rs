// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Firmware image access.
//!
//! The loader only needs three things from a compiled handler image: the
//! bytes of a section, the address and size of a section, and the address of
//! a symbol. [`FirmwareImage`] captures exactly that, so the loader can run
//! against an ELF file ([`ElfImage`](crate::elf::ElfImage)) or an in-memory
//! image built by hand.

use crate::error::{FpspinError, FpspinResult};
use std::collections::BTreeMap;

/// Load address and size of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionInfo {
    pub addr: u32,
    pub size: u32,
}

/// A compiled handler image.
pub trait FirmwareImage {
    /// Raw contents of a section.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::MissingSection` if the image has no such section.
    fn section_bytes(&self, name: &str) -> FpspinResult<&[u8]>;

    /// Address of a symbol, or `None` if the image does not define it.
    fn symbol_address(&self, name: &str) -> FpspinResult<Option<u32>>;

    /// Load address and size of a section.
    fn section_info(&self, name: &str) -> FpspinResult<SectionInfo>;
}

impl<I: FirmwareImage + ?Sized> FirmwareImage for &I {
    fn section_bytes(&self, name: &str) -> FpspinResult<&[u8]> {
        (**self).section_bytes(name)
    }

    fn symbol_address(&self, name: &str) -> FpspinResult<Option<u32>> {
        (**self).symbol_address(name)
    }

    fn section_info(&self, name: &str) -> FpspinResult<SectionInfo> {
        (**self).section_info(name)
    }
}

#[derive(Debug, Clone)]
struct Section {
    addr: u32,
    size: u32,
    bytes: Vec<u8>,
}

/// Image assembled in memory.
///
/// ```
/// use fpspin::{FirmwareImage, InMemoryImage};
///
/// let image = InMemoryImage::new()
///     .with_section(".text", 0x1d00_0100, vec![0x13, 0, 0, 0])
///     .with_symbol("_hh", 0x1d00_0200);
/// assert_eq!(image.symbol_address("_hh").unwrap(), Some(0x1d00_0200));
/// assert_eq!(image.symbol_address("_ph").unwrap(), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryImage {
    sections: BTreeMap<String, Section>,
    symbols: BTreeMap<String, u32>,
}

impl InMemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section whose size is its byte length.
    pub fn with_section(self, name: &str, addr: u32, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u32;
        self.with_sized_section(name, addr, size, bytes)
    }

    /// Add a section with an explicit size, e.g. a zero-initialised one with
    /// no bytes in the image.
    pub fn with_sized_section(mut self, name: &str, addr: u32, size: u32, bytes: Vec<u8>) -> Self {
        self.sections
            .insert(name.to_string(), Section { addr, size, bytes });
        self
    }

    pub fn with_symbol(mut self, name: &str, addr: u32) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }

    fn section(&self, name: &str) -> FpspinResult<&Section> {
        self.sections
            .get(name)
            .ok_or_else(|| FpspinError::MissingSection(name.to_string()))
    }
}

impl FirmwareImage for InMemoryImage {
    fn section_bytes(&self, name: &str) -> FpspinResult<&[u8]> {
        Ok(&self.section(name)?.bytes)
    }

    fn symbol_address(&self, name: &str) -> FpspinResult<Option<u32>> {
        Ok(self.symbols.get(name).copied())
    }

    fn section_info(&self, name: &str) -> FpspinResult<SectionInfo> {
        let section = self.section(name)?;
        Ok(SectionInfo {
            addr: section.addr,
            size: section.size,
        })
    }
}
