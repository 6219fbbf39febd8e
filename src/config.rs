// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device configuration.
//!
//! Defaults match a standard mqnic installation; every path can be
//! overridden in code or through the environment:
//!
//! | variable           | field          |
//! |--------------------|----------------|
//! | `FPSPIN_DEVICE`    | `device_path`  |
//! | `FPSPIN_REGS_BASE` | `regs_base`    |
//! | `FPSPIN_CTX`       | `context_id`   |

use crate::device::DEFAULT_DEVICE_PATH;
use crate::error::{FpspinError, FpspinResult};
use crate::regs::NUM_HANDLER_CONTEXTS;
use crate::ring::{RingGeometry, NUM_HPUS};
use std::fs;
use std::path::{Path, PathBuf};

/// Sysfs directory of the pspin application registers.
pub const DEFAULT_REGS_BASE: &str =
    "/sys/devices/pci0000:00/0000:00:03.1/0000:1d:00.0/mqnic.app_12340100.0";

/// Kernel module parameter holding the host DMA size in pages.
pub const HOSTDMA_PAGES_PARAM: &str = "/sys/module/mqnic_app_pspin/parameters/hostdma_num_pages";

pub const ENV_DEVICE: &str = "FPSPIN_DEVICE";
pub const ENV_REGS_BASE: &str = "FPSPIN_REGS_BASE";
pub const ENV_CTX: &str = "FPSPIN_CTX";

/// Where to find the device and which context to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Character device of the memory window.
    pub device_path: PathBuf,
    /// Sysfs directory holding the register attribute groups.
    pub regs_base: PathBuf,
    /// File holding the host DMA page count.
    pub hostdma_pages_file: PathBuf,
    /// Handler context to bind.
    pub context_id: usize,
    /// Number of HPU slots in the ring.
    pub unit_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            regs_base: PathBuf::from(DEFAULT_REGS_BASE),
            hostdma_pages_file: PathBuf::from(HOSTDMA_PAGES_PARAM),
            context_id: 0,
            unit_count: NUM_HPUS,
        }
    }
}

impl DeviceConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> FpspinResult<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> FpspinResult<Self> {
        if let Some(path) = var(ENV_DEVICE) {
            self.device_path = path.into();
        }
        if let Some(path) = var(ENV_REGS_BASE) {
            self.regs_base = path.into();
        }
        if let Some(ctx) = var(ENV_CTX) {
            let ctx = ctx.trim().parse().map_err(|_| {
                FpspinError::InvalidArgument(format!("{ENV_CTX}={ctx} is not a context id"))
            })?;
            self = self.with_context(ctx)?;
        }
        Ok(self)
    }

    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    pub fn with_regs_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.regs_base = path.into();
        self
    }

    pub fn with_hostdma_pages_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostdma_pages_file = path.into();
        self
    }

    pub fn with_context(mut self, ctx: usize) -> FpspinResult<Self> {
        if ctx >= NUM_HANDLER_CONTEXTS {
            return Err(FpspinError::InvalidArgument(format!(
                "context {ctx} out of range (0..{NUM_HANDLER_CONTEXTS})"
            )));
        }
        self.context_id = ctx;
        Ok(self)
    }

    pub fn with_unit_count(mut self, units: usize) -> Self {
        self.unit_count = units;
        self
    }

    /// Default slot layout over `unit_count` slots.
    pub fn ring_geometry(&self) -> RingGeometry {
        RingGeometry {
            unit_count: self.unit_count,
            ..RingGeometry::default()
        }
    }

    /// Host DMA size in pages, as configured in the kernel module.
    pub fn hostdma_num_pages(&self) -> FpspinResult<usize> {
        read_sysfs_usize(&self.hostdma_pages_file)
    }
}

pub(crate) fn read_sysfs_string(path: &Path) -> FpspinResult<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn read_sysfs_usize(path: &Path) -> FpspinResult<usize> {
    let s = read_sysfs_string(path)?;
    s.parse().map_err(|_| {
        FpspinError::InvalidArgument(format!("invalid count in {}: {s}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.device_path, Path::new("/dev/pspin0"));
        assert_eq!(config.context_id, 0);
        assert_eq!(config.unit_count, 16);
    }

    #[test]
    fn test_ring_geometry_follows_unit_count() {
        let geometry = DeviceConfig::default().with_unit_count(4).ring_geometry();
        assert_eq!(geometry.unit_count, 4);
        assert_eq!(geometry.slot_size, RingGeometry::default().slot_size);
        assert_eq!(geometry.required_len(), 4 * crate::dma::PAGE_SIZE);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DEVICE, "/dev/pspin1"),
            (ENV_REGS_BASE, "/tmp/regs"),
            (ENV_CTX, "2"),
        ]
        .into_iter()
        .collect();
        let config = DeviceConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.device_path, Path::new("/dev/pspin1"));
        assert_eq!(config.regs_base, Path::new("/tmp/regs"));
        assert_eq!(config.context_id, 2);
    }

    #[test]
    fn test_bad_context_override() {
        let result = DeviceConfig::default().with_overrides(|k| (k == ENV_CTX).then(|| "9".into()));
        assert!(matches!(result, Err(FpspinError::InvalidArgument(_))));
        let result = DeviceConfig::default().with_overrides(|k| (k == ENV_CTX).then(|| "x".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_hostdma_num_pages() {
        let dir = tempfile::tempdir().unwrap();
        let param = dir.path().join("hostdma_num_pages");
        fs::write(&param, "512\n").unwrap();
        let config = DeviceConfig::default().with_hostdma_pages_file(&param);
        assert_eq!(config.hostdma_num_pages().unwrap(), 512);

        fs::write(&param, "lots\n").unwrap();
        assert!(config.hostdma_num_pages().is_err());
        assert!(DeviceConfig::default()
            .with_hostdma_pages_file(dir.path().join("missing"))
            .hostdma_num_pages()
            .is_err());
    }
}
