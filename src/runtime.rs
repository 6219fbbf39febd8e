// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level runtime API.

use crate::device::{ClusterStats, DeviceSession};
use crate::error::{FpspinError, FpspinResult};
use crate::image::FirmwareImage;
use crate::loader::{FirmwareLoader, HandlerContext, HostAperture, LoadState, HOST_DATA_SYMBOL, L2_BASE};
use crate::ring::{FlagRing, RingGeometry, NUM_HPUS};
use crate::rules::RuleSet;
use crate::transport::{DmaRegion, Transport};

/// A context brought up end to end: DMA mapped, firmware loaded, rule
/// engine programmed.
///
/// `FpspinContext` owns the device session; the flag ring borrows it, so
/// the ring is created with [`ring`](Self::ring) and lives as long as the
/// polling loop.
///
/// # Example
///
/// ```rust,no_run
/// use fpspin::{DeviceConfig, DeviceSession, ElfImage, FlagWord, FpspinContext, FpspinError, RuleSet};
///
/// fn main() -> Result<(), FpspinError> {
///     let config = DeviceConfig::from_env()?;
///     let session = DeviceSession::open(&config)?;
///     let image = ElfImage::open("handlers.elf")?;
///     let pages = config.hostdma_num_pages()?;
///
///     let ctx = FpspinContext::init(session, &image, &[RuleSet::udp()], pages)?;
///     {
///         let mut ring = ctx.ring()?;
///         if let Some(request) = ring.pop_request(0)? {
///             let len = request.flag().length();
///             ring.push_response(0, FlagWord::with_len(len))?;
///         }
///     }
///     ctx.exit()
/// }
/// ```
pub struct FpspinContext<T: Transport> {
    session: DeviceSession<T>,
    loader: FirmwareLoader,
    handlers: HandlerContext,
    host_flag_base: u64,
}

impl<T: Transport> FpspinContext<T> {
    /// Bring up the session's context.
    ///
    /// Queries and maps `pages` pages of host DMA, loads `image` with the
    /// DMA region as host aperture, programs `rulesets` and locates the
    /// firmware's host flag block.
    ///
    /// # Errors
    ///
    /// - `FpspinError::NotEnabled` if the context has no DMA region
    /// - `FpspinError::FirmwareLoadFailed` if a load step fails; the context
    ///   is unloaded again before returning
    /// - `FpspinError::MissingSymbol` if the image lacks `__host_data`
    pub fn init<I: FirmwareImage + ?Sized>(
        mut session: DeviceSession<T>,
        image: &I,
        rulesets: &[RuleSet],
        pages: usize,
    ) -> FpspinResult<Self> {
        let ctx = session.context_id();
        let region = session.query_dma(ctx)?;
        session.map_dma_buffer(pages)?;

        let mut loader = FirmwareLoader::new();
        match Self::bring_up(&mut session, &mut loader, image, rulesets, region) {
            Ok((handlers, host_flag_base)) => {
                log::info!("context {ctx} up, host flags at {host_flag_base:#x}");
                Ok(Self {
                    session,
                    loader,
                    handlers,
                    host_flag_base,
                })
            }
            Err(e) => {
                if let Err(cleanup) = loader.unload_image(&mut session, ctx) {
                    log::warn!("unload after failed init of context {ctx}: {cleanup}");
                }
                session.close();
                Err(e)
            }
        }
    }

    fn bring_up<I: FirmwareImage + ?Sized>(
        session: &mut DeviceSession<T>,
        loader: &mut FirmwareLoader,
        image: &I,
        rulesets: &[RuleSet],
        region: DmaRegion,
    ) -> FpspinResult<(HandlerContext, u64)> {
        let ctx = session.context_id();
        let handlers = loader.load_image(session, image, ctx, HostAperture::from_region(region)?)?;
        loader.program_rulesets(session, rulesets)?;

        let host_flag_base = image
            .symbol_address(HOST_DATA_SYMBOL)?
            .map(u64::from)
            .ok_or_else(|| FpspinError::MissingSymbol(HOST_DATA_SYMBOL.into()))?;
        if host_flag_base < L2_BASE {
            return Err(FpspinError::InvalidImage(format!(
                "{HOST_DATA_SYMBOL} at {host_flag_base:#x} is below L2"
            )));
        }
        Ok((handlers, host_flag_base))
    }

    /// Flag ring with one slot per HPU.
    ///
    /// Create it once per polling loop: a new ring treats whatever is in
    /// the slots as already consumed. Only one ring may be alive at a time;
    /// a second call fails with `FpspinError::InvalidArgument` until the
    /// first ring and all of its units are dropped.
    pub fn ring(&self) -> FpspinResult<FlagRing<'_, T>> {
        self.ring_with(RingGeometry::default())
    }

    /// Flag ring with a custom layout, e.g. [`DeviceConfig::ring_geometry`].
    ///
    /// [`DeviceConfig::ring_geometry`]: crate::DeviceConfig::ring_geometry
    pub fn ring_with(&self, geometry: RingGeometry) -> FpspinResult<FlagRing<'_, T>> {
        FlagRing::initialize(&self.session, geometry, self.host_flag_base)
    }

    pub fn session(&self) -> &DeviceSession<T> {
        &self.session
    }

    /// Handler configuration written by the loader.
    pub fn handlers(&self) -> &HandlerContext {
        &self.handlers
    }

    /// L2 address of the firmware's host flag block.
    pub fn host_flag_base(&self) -> u64 {
        self.host_flag_base
    }

    pub fn state(&self) -> LoadState {
        self.loader.state(self.session.context_id())
    }

    /// Replace the rule engine configuration.
    pub fn program_rulesets(&mut self, rulesets: &[RuleSet]) -> FpspinResult<()> {
        self.loader.program_rulesets(&mut self.session, rulesets)
    }

    /// Average handler runtime in cycles, as accumulated by the firmware.
    ///
    /// The counter word follows the per-HPU host flags: the low half holds
    /// the sample count, the high half the cycle sum. The average is
    /// truncated; 0 when no samples were taken.
    pub fn avg_cycles(&self) -> FpspinResult<u32> {
        let addr = self.host_flag_base - L2_BASE + 8 * NUM_HPUS as u64;
        let word = self.session.raw_peek(addr)?;
        let count = word as u32;
        let sum = (word >> 32) as u32;
        if count == 0 {
            return Ok(0);
        }
        Ok(sum / count)
    }

    pub fn cluster_stats(&self) -> FpspinResult<ClusterStats> {
        self.session.cluster_stats()
    }

    /// Unload the context and close the session.
    ///
    /// The session is closed even if unloading fails.
    pub fn exit(mut self) -> FpspinResult<()> {
        let ctx = self.session.context_id();
        let result = self.loader.unload_image(&mut self.session, ctx);
        self.session.close();
        result
    }
}

impl<T: Transport> std::fmt::Debug for FpspinContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FpspinContext")
            .field("ctx", &self.session.context_id())
            .field("handlers", &self.handlers)
            .field("host_flag_base", &format_args!("{:#x}", self.host_flag_base))
            .finish()
    }
}
