// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Linux transport over the mqnic_app_pspin driver.
//!
//! - Registers are sysfs attributes, one file per register:
//!   `<regs_base>/<group dir>/<index>`. Reads return `0x%08x`, writes take
//!   a decimal value.
//! - The memory window is the character device itself, accessed with
//!   positioned reads and writes.
//! - DMA queries and raw 64-bit accesses are ioctls on the same device.

use crate::config::read_sysfs_string;
use crate::error::{FpspinError, FpspinResult};
use crate::regs::RegisterBlock;
use crate::transport::{DmaRegion, Transport};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const PSPIN_IOCTL_MAGIC: u64 = 0x95910;

const fn iowr(nr: u64, size: usize) -> u64 {
    const IOC_READ_WRITE: u64 = 3;
    (IOC_READ_WRITE << 30) | (PSPIN_IOCTL_MAGIC << 8) | nr | ((size as u64) << 16)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct QueryReq {
    ctx_id: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CtxDmaArea {
    dma_handle: u64,
    dma_size: u64,
    enabled: bool,
}

/// Raw read: carries the address in and the word back in the same field.
#[repr(C)]
#[derive(Clone, Copy)]
struct ReadRaw {
    word: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct WriteRaw {
    addr: u64,
    data: u64,
}

#[repr(C)]
union IoctlMsg {
    req: QueryReq,
    resp: CtxDmaArea,
    read_raw: ReadRaw,
    write_raw: WriteRaw,
}

impl IoctlMsg {
    fn read_raw(addr: u64) -> Self {
        let mut msg = Self {
            resp: CtxDmaArea {
                dma_handle: 0,
                dma_size: 0,
                enabled: false,
            },
        };
        msg.read_raw = ReadRaw { word: addr };
        msg
    }

    fn read_word(&self) -> u64 {
        // SAFETY: every variant starts with an initialized u64 at offset 0.
        unsafe { self.read_raw.word }
    }
}

const PSPIN_HOSTDMA_QUERY: u64 = iowr(1, std::mem::size_of::<IoctlMsg>());
const PSPIN_HOSTDMA_READ_RAW: u64 = iowr(2, std::mem::size_of::<IoctlMsg>());
const PSPIN_HOSTDMA_WRITE_RAW: u64 = iowr(3, std::mem::size_of::<IoctlMsg>());

/// Transport backed by the Linux driver.
#[derive(Debug)]
pub struct SysfsTransport {
    device: File,
    regs_base: PathBuf,
}

impl SysfsTransport {
    /// Open the device node and check the register directory.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::PermissionDenied` if the device may not be
    /// opened, `FpspinError::DeviceUnavailable` if either path is missing.
    pub fn open(device_path: &Path, regs_base: &Path) -> FpspinResult<Self> {
        let device = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device_path)
            .map_err(|e| {
                if e.kind() == ErrorKind::PermissionDenied {
                    FpspinError::PermissionDenied(device_path.display().to_string())
                } else {
                    FpspinError::DeviceUnavailable(format!("{}: {e}", device_path.display()))
                }
            })?;

        if !regs_base.is_dir() {
            return Err(FpspinError::DeviceUnavailable(format!(
                "register directory {} not found",
                regs_base.display()
            )));
        }

        Ok(Self {
            device,
            regs_base: regs_base.to_path_buf(),
        })
    }

    fn attribute(&self, block: &RegisterBlock, index: usize) -> PathBuf {
        self.regs_base.join(block.sysfs_dir).join(index.to_string())
    }

    fn ioctl(&self, request: u64, msg: &mut IoctlMsg) -> FpspinResult<()> {
        // SAFETY: `msg` is a live, correctly sized message for every request
        // this transport issues.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                request as libc::Ioctl,
                msg as *mut IoctlMsg,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn parse_register(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

impl Transport for SysfsTransport {
    fn read_register(&self, block: &RegisterBlock, index: usize) -> FpspinResult<u32> {
        let path = self.attribute(block, index);
        let text = read_sysfs_string(&path)?;
        parse_register(&text).ok_or_else(|| {
            FpspinError::InvalidArgument(format!("invalid register value in {}: {text}", path.display()))
        })
    }

    fn write_register(&self, block: &RegisterBlock, index: usize, value: u32) -> FpspinResult<()> {
        fs::write(self.attribute(block, index), value.to_string())?;
        Ok(())
    }

    fn read_mem_word(&self, offset: u64) -> FpspinResult<u32> {
        let mut word = [0u8; 4];
        self.device.read_exact_at(&mut word, offset)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_mem_word(&self, offset: u64, value: u32) -> FpspinResult<()> {
        self.device.write_all_at(&value.to_le_bytes(), offset)?;
        Ok(())
    }

    fn query_dma(&self, ctx: usize) -> FpspinResult<DmaRegion> {
        let ctx_id = libc::c_int::try_from(ctx)
            .map_err(|_| FpspinError::InvalidArgument(format!("context {ctx}")))?;
        let mut msg = IoctlMsg {
            resp: CtxDmaArea {
                dma_handle: 0,
                dma_size: 0,
                enabled: false,
            },
        };
        msg.req = QueryReq { ctx_id };
        self.ioctl(PSPIN_HOSTDMA_QUERY, &mut msg)?;

        // SAFETY: the driver answers a query with the response variant.
        let resp = unsafe { msg.resp };
        Ok(DmaRegion {
            handle: resp.dma_handle,
            size: resp.dma_size,
            enabled: resp.enabled,
        })
    }

    fn raw_peek(&self, addr: u64) -> FpspinResult<u64> {
        let mut msg = IoctlMsg::read_raw(addr);
        self.ioctl(PSPIN_HOSTDMA_READ_RAW, &mut msg)?;
        Ok(msg.read_word())
    }

    fn raw_poke(&self, addr: u64, value: u64) -> FpspinResult<()> {
        let mut msg = IoctlMsg {
            write_raw: WriteRaw { addr, data: value },
        };
        self.ioctl(PSPIN_HOSTDMA_WRITE_RAW, &mut msg)
    }

    fn dma_file(&self) -> Option<&File> {
        Some(&self.device)
    }
}
