// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for FPsPIN operations.

use crate::loader::LoadStage;
use thiserror::Error;

/// Errors that can occur while driving the accelerator.
#[derive(Debug, Error)]
pub enum FpspinError {
    /// The device could not be opened or mapped.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The DMA region of a context is not active.
    #[error("DMA region of context {ctx} is not enabled")]
    NotEnabled { ctx: usize },

    /// A register write was refused; the register keeps its previous value.
    #[error("write of {value:#x} to {group}[{index}] rejected: {reason}")]
    RegisterRejected {
        group: &'static str,
        index: usize,
        value: u32,
        reason: &'static str,
    },

    /// No register group with this name exists.
    #[error("unknown register group: {0}")]
    UnknownRegister(String),

    /// Register index past the end of its group.
    #[error("register index {index} out of range for {group} (count {count})")]
    RegisterIndexOutOfRange {
        group: &'static str,
        index: usize,
        count: usize,
    },

    /// Attempted to write a read-only register group.
    #[error("register group {0} is read-only")]
    ReadOnlyRegister(&'static str),

    /// Memory window access while the cluster is held in reset.
    #[error("accelerator cluster is in reset")]
    DeviceInReset,

    /// Memory window access outside of the device memory.
    #[error("memory access at {offset:#x} (+{len}) outside of the device memory window")]
    MemoryOutOfRange { offset: u64, len: usize },

    /// A firmware load step failed; device state is partial until `unload_image`.
    #[error("firmware load of context {ctx} failed while {stage}: {source}")]
    FirmwareLoadFailed {
        ctx: usize,
        stage: LoadStage,
        #[source]
        source: Box<FpspinError>,
    },

    /// The firmware image has no section with this name.
    #[error("firmware image has no section {0}")]
    MissingSection(String),

    /// The firmware image has no symbol with this name.
    #[error("firmware image has no symbol {0}")]
    MissingSymbol(String),

    /// The firmware image could not be parsed.
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session has no DMA buffer mapped yet.
    #[error("no DMA buffer mapped")]
    NoDmaBuffer,

    /// No SLMP acknowledgement arrived within the timeout.
    #[error("SLMP ACK timeout for message {msg_id} at offset {offset}")]
    SlmpAckTimeout { msg_id: u32, offset: u32 },

    /// A reply arrived but was not a valid acknowledgement.
    #[error("SLMP reply for message {msg_id} at offset {offset} is not an ACK (flags {flags:#06x})")]
    SlmpNoAck { msg_id: u32, offset: u32, flags: u16 },

    /// Sending a fragment or receiving its ACK failed.
    #[error("SLMP send failed: {0}")]
    SlmpSendFailed(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Permission denied accessing the device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Platform not supported.
    #[error("platform not supported: FPsPIN requires Linux with the mqnic_app_pspin driver")]
    PlatformNotSupported,
}

impl FpspinError {
    /// Wrap an error as a failed firmware-load step.
    pub(crate) fn load_failed(ctx: usize, stage: LoadStage, source: FpspinError) -> Self {
        Self::FirmwareLoadFailed {
            ctx,
            stage,
            source: Box::new(source),
        }
    }
}

/// Result type alias for FPsPIN operations.
pub type FpspinResult<T> = Result<T, FpspinError>;
