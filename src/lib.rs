// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # FPsPIN Host Runtime
//!
//! Host-side runtime for FPsPIN, a packet-processing FPGA accelerator
//! built from PsPIN clusters of HPUs (handler processing units) behind a
//! Corundum NIC. The crate covers the four pieces a host application needs:
//!
//! - [`DeviceSession`]: register file, memory window, host DMA buffer and
//!   raw 64-bit access to accelerator memory.
//! - [`FirmwareLoader`]: writes firmware sections, programs per-context
//!   handler stages and apertures, and programs the matching engine.
//! - [`FlagRing`]: per-HPU request/response slots in the host DMA buffer.
//! - [`SlmpChannel`]: out-of-band bulk transfer over UDP with the SLMP
//!   fragmentation protocol.
//!
//! [`FpspinContext`] strings these together for the common case.
//!
//! ## Platform Support
//!
//! | Platform | Hardware | Simulator |
//! |----------|----------|-----------|
//! | Linux    | Supported (mqnic_app_pspin driver) | Supported |
//! | Other    | Not available | Register and SLMP only |
//!
//! The host DMA buffer is an `mmap`, so the flag ring needs Linux even
//! with [`sim::SimTransport`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpspin::{DeviceConfig, DeviceSession, ElfImage, FirmwareLoader, FpspinError, HostAperture, RuleSet};
//!
//! fn main() -> Result<(), FpspinError> {
//!     let config = DeviceConfig::from_env()?;
//!     let mut session = DeviceSession::open(&config)?;
//!
//!     let region = session.query_dma(config.context_id)?;
//!     session.map_dma_buffer(config.hostdma_num_pages()?)?;
//!
//!     let image = ElfImage::open("handlers.elf")?;
//!     let mut loader = FirmwareLoader::new();
//!     let handlers = loader.load_image(
//!         &mut session,
//!         &image,
//!         config.context_id,
//!         HostAperture::from_region(region)?,
//!     )?;
//!     loader.program_rulesets(&mut session, &[RuleSet::slmp()])?;
//!     println!("{handlers:?}");
//!
//!     loader.unload_image(&mut session, config.context_id)?;
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements
//!
//! - Linux with the `mqnic` and `mqnic_app_pspin` kernel modules loaded
//! - Read/write access to `/dev/pspin0` and the application's sysfs
//!   register directory
//! - Host DMA enabled for the context (`hostdma_num_pages` module parameter)

pub mod config;
pub mod device;
pub mod dma;
pub mod elf;
pub mod error;
pub mod image;
pub mod loader;
pub mod regs;
pub mod ring;
pub mod rules;
pub mod runtime;
pub mod sim;
pub mod slmp;
#[cfg(target_os = "linux")]
pub mod sysfs;
pub mod transport;
pub mod util;

pub use config::DeviceConfig;
pub use device::{is_fpspin_available, ClusterStats, DeviceSession};
pub use dma::DmaBuffer;
pub use elf::ElfImage;
pub use error::{FpspinError, FpspinResult};
pub use image::{FirmwareImage, InMemoryImage, SectionInfo};
pub use loader::{FirmwareLoader, HandlerContext, HostAperture, LoadStage, LoadState};
pub use regs::{GateState, RegisterBlock, RegisterMap};
pub use ring::{Backoff, FlagRing, FlagWord, Request, RingGeometry, UnitRing};
pub use rules::{classify_packet, MatchMode, MatchRule, RuleSet};
pub use runtime::FpspinContext;
pub use slmp::{ParallelFailurePolicy, SlmpChannel, SlmpConfig, SlmpFlags, SlmpHeader};
#[cfg(target_os = "linux")]
pub use sysfs::SysfsTransport;
pub use transport::{DmaRegion, Transport};
