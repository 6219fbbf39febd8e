// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host DMA buffer mapping.
//!
//! The driver allocates one coherent DMA region per context and exposes it
//! through `mmap` on the device file, at offset `ctx * len`. The accelerator
//! writes request descriptors into this region and the host writes responses
//! back in place.
//!
//! Every mapping is marked `MADV_DONTFORK`: a forked child must never get a
//! copy-on-write duplicate of memory the device writes into.

use crate::error::{FpspinError, FpspinResult};
use std::fs::File;

/// Size of a host page; ring slots are page-sized.
pub const PAGE_SIZE: usize = 4096;

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::os::unix::io::AsRawFd;

    /// A mapped DMA buffer.
    ///
    /// Unmapped on drop.
    pub struct DmaBuffer {
        ptr: *mut u8,
        len: usize,
    }

    // SAFETY: DmaBuffer can be sent between threads because:
    // - The mapping is owned and stays valid until drop
    // - All accesses through the public API are volatile or bounded slices
    unsafe impl Send for DmaBuffer {}

    // SAFETY: Concurrent readers of distinct slots never alias; the ring layer
    // hands out at most one mutable view per slot.
    unsafe impl Sync for DmaBuffer {}

    impl DmaBuffer {
        /// Map `len` bytes of the device file at `offset`.
        pub fn map_device(file: &File, len: usize, offset: u64) -> FpspinResult<Self> {
            let offset = libc::off_t::try_from(offset).map_err(|_| {
                FpspinError::InvalidArgument(format!("mapping offset {offset:#x} too large"))
            })?;

            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    offset,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(FpspinError::MmapFailed(format!(
                    "map host dma area: {}",
                    std::io::Error::last_os_error()
                )));
            }

            Self::pin(ptr, len)
        }

        /// Map `len` bytes of anonymous shared memory.
        ///
        /// Used when the backend has no device file, e.g. the simulator.
        pub fn anonymous(len: usize) -> FpspinResult<Self> {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(FpspinError::MmapFailed(format!(
                    "map anonymous dma area: {}",
                    std::io::Error::last_os_error()
                )));
            }

            Self::pin(ptr, len)
        }

        /// Exclude a fresh mapping from fork; unmaps it again on failure.
        fn pin(ptr: *mut libc::c_void, len: usize) -> FpspinResult<Self> {
            let guard = scopeguard::guard(ptr, |ptr| unsafe {
                libc::munmap(ptr, len);
            });

            if unsafe { libc::madvise(*guard, len, libc::MADV_DONTFORK) } != 0 {
                return Err(FpspinError::MmapFailed(format!(
                    "madvise DONTFORK: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let ptr = scopeguard::ScopeGuard::into_inner(guard);
            log::debug!("mapped host dma at {ptr:p} ({len} bytes)");
            Ok(Self {
                ptr: ptr as *mut u8,
                len,
            })
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }
    }

    impl Drop for DmaBuffer {
        fn drop(&mut self) {
            if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0 {
                log::warn!("unmap host dma: {}", std::io::Error::last_os_error());
            }
        }
    }
}

// ============================================================================
// Non-Linux Stub Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    /// Stub DMA buffer for non-Linux platforms.
    ///
    /// All constructors return `FpspinError::PlatformNotSupported`.
    pub struct DmaBuffer {
        _private: (),
    }

    impl DmaBuffer {
        pub fn map_device(_file: &File, _len: usize, _offset: u64) -> FpspinResult<Self> {
            Err(FpspinError::PlatformNotSupported)
        }

        pub fn anonymous(_len: usize) -> FpspinResult<Self> {
            Err(FpspinError::PlatformNotSupported)
        }

        pub fn len(&self) -> usize {
            0
        }

        pub fn is_empty(&self) -> bool {
            true
        }

        pub fn as_ptr(&self) -> *mut u8 {
            std::ptr::null_mut()
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::DmaBuffer;

#[cfg(not(target_os = "linux"))]
pub use stub_impl::DmaBuffer;

impl DmaBuffer {
    fn check_range(&self, offset: usize, len: usize) -> FpspinResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(FpspinError::InvalidArgument(format!(
                "dma access at {offset:#x} (+{len}) outside of {} byte buffer",
                self.len()
            ))),
        }
    }

    fn check_word(&self, offset: usize) -> FpspinResult<()> {
        self.check_range(offset, 8)?;
        if offset % 8 != 0 {
            return Err(FpspinError::InvalidArgument(format!(
                "unaligned dma word offset {offset:#x}"
            )));
        }
        Ok(())
    }

    // The raw accessors below are `unsafe` because a `Request` may hold a
    // `&mut [u8]` into the buffer. Callers must not touch a range that is
    // currently lent out as a request payload.

    /// Volatile read of a 64-bit word at `offset` (8-byte aligned).
    ///
    /// # Safety
    ///
    /// The word must not lie inside a live [`slice_mut`](Self::slice_mut) view.
    pub unsafe fn read_u64(&self, offset: usize) -> FpspinResult<u64> {
        self.check_word(offset)?;
        Ok(std::ptr::read_volatile(self.as_ptr().add(offset) as *const u64))
    }

    /// Volatile write of a 64-bit word at `offset` (8-byte aligned).
    ///
    /// # Safety
    ///
    /// As for [`read_u64`](Self::read_u64).
    pub unsafe fn write_u64(&self, offset: usize, value: u64) -> FpspinResult<()> {
        self.check_word(offset)?;
        std::ptr::write_volatile(self.as_ptr().add(offset) as *mut u64, value);
        Ok(())
    }

    /// Mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// No other live reference may overlap the range for the lifetime of the
    /// returned slice. The device may still write into it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> FpspinResult<&mut [u8]> {
        self.check_range(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.as_ptr().add(offset), len))
    }

    /// Copy bytes out of the buffer.
    ///
    /// # Safety
    ///
    /// The range must not overlap a live [`slice_mut`](Self::slice_mut) view.
    pub unsafe fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> FpspinResult<()> {
        self.check_range(offset, dst.len())?;
        std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    /// Copy bytes into the buffer.
    ///
    /// # Safety
    ///
    /// As for [`read_bytes`](Self::read_bytes).
    pub unsafe fn write_bytes(&self, offset: usize, src: &[u8]) -> FpspinResult<()> {
        self.check_range(offset, src.len())?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len());
        Ok(())
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
