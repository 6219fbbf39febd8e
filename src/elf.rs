// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Minimal ELF32 reader for handler images.
//!
//! Handler firmware is built for a 32-bit little-endian RISC-V target. Only
//! section headers and the symbol table are read; program headers and
//! relocations are ignored.

use crate::error::{FpspinError, FpspinResult};
use crate::image::{FirmwareImage, SectionInfo};
use std::path::Path;

const EHDR_SIZE: usize = 52;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;

const SHT_SYMTAB: u32 = 2;
const SHT_NOBITS: u32 = 8;

#[derive(Debug, Clone)]
struct SectionHeader {
    name: String,
    kind: u32,
    addr: u32,
    offset: u32,
    size: u32,
}

/// A parsed ELF32 image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    data: Vec<u8>,
    sections: Vec<SectionHeader>,
    symbols: Vec<(String, u32)>,
}

fn u16_at(data: &[u8], off: usize) -> FpspinResult<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| FpspinError::InvalidImage(format!("truncated at {off:#x}")))
}

fn u32_at(data: &[u8], off: usize) -> FpspinResult<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| FpspinError::InvalidImage(format!("truncated at {off:#x}")))
}

fn cstr_at(data: &[u8], off: usize) -> FpspinResult<String> {
    let tail = data
        .get(off..)
        .ok_or_else(|| FpspinError::InvalidImage(format!("string offset {off:#x} out of range")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| FpspinError::InvalidImage(format!("unterminated string at {off:#x}")))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

impl ElfImage {
    /// Read and parse an image file.
    pub fn open(path: impl AsRef<Path>) -> FpspinResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        log::debug!("read {} ({} bytes)", path.display(), data.len());
        Self::parse(data)
    }

    /// Parse an image held in memory.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::InvalidImage` unless `data` is a well-formed
    /// 32-bit little-endian ELF file.
    pub fn parse(data: Vec<u8>) -> FpspinResult<Self> {
        if data.len() < EHDR_SIZE || &data[..4] != b"\x7fELF" {
            return Err(FpspinError::InvalidImage("not an ELF file".into()));
        }
        if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
            return Err(FpspinError::InvalidImage(
                "expected 32-bit little-endian ELF".into(),
            ));
        }

        let shoff = u32_at(&data, 0x20)? as usize;
        let shentsize = u16_at(&data, 0x2e)? as usize;
        let shnum = u16_at(&data, 0x30)? as usize;
        let shstrndx = u16_at(&data, 0x32)? as usize;
        if shnum > 0 && shentsize != SHDR_SIZE {
            return Err(FpspinError::InvalidImage(format!(
                "unexpected section header size {shentsize}"
            )));
        }

        // (name offset, type, addr, offset, size, link)
        let raw = (0..shnum)
            .map(|i| {
                let base = shoff + i * SHDR_SIZE;
                Ok((
                    u32_at(&data, base)? as usize,
                    u32_at(&data, base + 4)?,
                    u32_at(&data, base + 12)?,
                    u32_at(&data, base + 16)?,
                    u32_at(&data, base + 20)?,
                    u32_at(&data, base + 24)? as usize,
                ))
            })
            .collect::<FpspinResult<Vec<_>>>()?;

        let names_off = raw
            .get(shstrndx)
            .map(|s| s.3 as usize)
            .ok_or_else(|| FpspinError::InvalidImage("no section name table".into()))?;

        let sections = raw
            .iter()
            .map(|&(name, kind, addr, offset, size, _)| {
                Ok(SectionHeader {
                    name: cstr_at(&data, names_off + name)?,
                    kind,
                    addr,
                    offset,
                    size,
                })
            })
            .collect::<FpspinResult<Vec<_>>>()?;

        let mut symbols = Vec::new();
        for &(_, kind, _, offset, size, link) in &raw {
            if kind != SHT_SYMTAB {
                continue;
            }
            let strtab = raw
                .get(link)
                .map(|s| s.3 as usize)
                .ok_or_else(|| FpspinError::InvalidImage("symbol table without strings".into()))?;
            // Entry 0 is the undefined symbol.
            for i in 1..size as usize / SYM_SIZE {
                let entry = offset as usize + i * SYM_SIZE;
                let name = cstr_at(&data, strtab + u32_at(&data, entry)? as usize)?;
                if !name.is_empty() {
                    symbols.push((name, u32_at(&data, entry + 4)?));
                }
            }
        }

        log::debug!(
            "elf image: {} sections, {} symbols",
            sections.len(),
            symbols.len()
        );
        Ok(Self {
            data,
            sections,
            symbols,
        })
    }

    fn section(&self, name: &str) -> FpspinResult<&SectionHeader> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| FpspinError::MissingSection(name.to_string()))
    }

    /// Names of all sections, in header order.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }
}

impl FirmwareImage for ElfImage {
    fn section_bytes(&self, name: &str) -> FpspinResult<&[u8]> {
        let section = self.section(name)?;
        if section.kind == SHT_NOBITS {
            return Ok(&[]);
        }
        let start = section.offset as usize;
        self.data
            .get(start..start + section.size as usize)
            .ok_or_else(|| FpspinError::InvalidImage(format!("section {name} out of bounds")))
    }

    /// Exact name first; otherwise the first symbol ending in `name`, so
    /// `_hh` finds an application's `slmp_hh`.
    fn symbol_address(&self, name: &str) -> FpspinResult<Option<u32>> {
        let exact = self.symbols.iter().find(|(n, _)| n == name);
        let found = exact.or_else(|| self.symbols.iter().find(|(n, _)| n.ends_with(name)));
        Ok(found.map(|&(_, addr)| addr))
    }

    fn section_info(&self, name: &str) -> FpspinResult<SectionInfo> {
        let section = self.section(name)?;
        Ok(SectionInfo {
            addr: section.addr,
            size: section.size,
        })
    }
}
