// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Firmware and rule loading.
//!
//! Bringing up a context follows a fixed hardware sequence:
//!
//! ```text
//! Unloaded --fetch off, reset--> FetchDisabled --sections--> SectionsWritten
//!          --HER off, stages, apertures--> HandlersProgrammed --ctx on, HER on--> Enabled
//! ```
//!
//! Fetch enable, cluster reset and the matching-engine enable are shared by
//! all contexts. The loader takes `&mut DeviceSession`, so calls through one
//! session are serialized; callers driving one device from several sessions
//! must serialize loader calls themselves.

use crate::device::DeviceSession;
use crate::error::{FpspinError, FpspinResult};
use crate::image::FirmwareImage;
use crate::regs::*;
use crate::rules::RuleSet;
use crate::transport::{DmaRegion, Transport};
use std::fmt;

/// Start of the L2 memory in the accelerator address space.
pub const L2_BASE: u64 = 0x1c00_0000;
/// End of the L2 memory; the handler-data aperture extends up to here.
pub const L2_END: u64 = 0x1c10_0000;
/// Start of the program memory in the accelerator address space.
pub const PROGRAM_BASE: u64 = 0x1d00_0000;
/// Offset of the program memory inside the memory window.
pub const PROGRAM_REGION_BIAS: u64 = 0x40_0000;

/// Size programmed for every present handler stage.
pub const HANDLER_STAGE_SIZE: u32 = 4096;
/// Size of each scratchpad aperture.
pub const SCRATCHPAD_SIZE: u32 = 4096;

/// Sections copied into device memory, in write order.
pub const FIRMWARE_SECTIONS: [&str; 4] = [".rodata", ".l2_handler_data", ".vectors", ".text"];
/// Section holding the handlers' private data.
pub const HANDLER_DATA_SECTION: &str = ".l2_handler_data";
/// Symbol of the per-HPU host flag array.
pub const HOST_DATA_SYMBOL: &str = "__host_data";

const FETCH_ALL_CLUSTERS: u32 = (1 << NUM_CLUSTERS) - 1;

/// Translate an accelerator address into a memory-window offset.
///
/// # Errors
///
/// Returns `FpspinError::InvalidImage` for addresses below L2.
pub fn translate_address(addr: u32) -> FpspinResult<u64> {
    let addr = u64::from(addr);
    if addr >= PROGRAM_BASE {
        Ok(addr - PROGRAM_BASE + PROGRAM_REGION_BIAS)
    } else if addr >= L2_BASE {
        Ok(addr - L2_BASE)
    } else {
        Err(FpspinError::InvalidImage(format!(
            "address {addr:#x} is outside device memory"
        )))
    }
}

/// Step of [`FirmwareLoader::load_image`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Reset,
    WriteSections,
    EnableFetch,
    DisableHandlers,
    ProgramHandlers,
    ProgramApertures,
    Enable,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStage::Reset => "resetting the cluster",
            LoadStage::WriteSections => "writing firmware sections",
            LoadStage::EnableFetch => "enabling instruction fetch",
            LoadStage::DisableHandlers => "disabling handler execution",
            LoadStage::ProgramHandlers => "programming handler stages",
            LoadStage::ProgramApertures => "programming memory apertures",
            LoadStage::Enable => "enabling the context",
        })
    }
}

/// Load progress of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    FetchDisabled,
    SectionsWritten,
    HandlersProgrammed,
    Enabled,
}

/// Address range as programmed into the handler registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aperture {
    pub addr: u32,
    pub size: u32,
}

/// Host memory the accelerator may write into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostAperture {
    pub addr: u64,
    pub size: u32,
}

impl HostAperture {
    /// Aperture covering a context's DMA region.
    pub fn from_region(region: DmaRegion) -> FpspinResult<Self> {
        let size = u32::try_from(region.size).map_err(|_| {
            FpspinError::InvalidArgument(format!(
                "dma region of {} bytes does not fit the host aperture",
                region.size
            ))
        })?;
        Ok(Self {
            addr: region.handle,
            size,
        })
    }
}

/// Configuration written for a context by [`FirmwareLoader::load_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerContext {
    pub ctx: usize,
    pub hh: Aperture,
    pub ph: Aperture,
    /// Completion (tail) handler.
    pub th: Aperture,
    pub handler_mem: Aperture,
    pub host_mem: HostAperture,
    pub scratchpad_size: u32,
    pub enabled: bool,
}

/// Drives the load sequence for all contexts of a device.
#[derive(Debug, Clone, Default)]
pub struct FirmwareLoader {
    states: [LoadState; NUM_HANDLER_CONTEXTS],
}

fn check_ctx(ctx: usize) -> FpspinResult<()> {
    if ctx >= NUM_HANDLER_CONTEXTS {
        return Err(FpspinError::InvalidArgument(format!(
            "context {ctx} out of range (0..{NUM_HANDLER_CONTEXTS})"
        )));
    }
    Ok(())
}

fn fetch_off<T: Transport>(session: &mut DeviceSession<T>) -> FpspinResult<()> {
    session.write_register(CL_CTRL, CL_CTRL_FETCH_EN, 0)
}

fn pulse_reset<T: Transport>(session: &mut DeviceSession<T>) -> FpspinResult<()> {
    session.write_register(CL_CTRL, CL_CTRL_RESET, 1)?;
    session.write_register(CL_CTRL, CL_CTRL_RESET, 0)
}

/// Stream a section into the memory window, one little-endian word at a
/// time; the last word is zero-padded.
fn write_section<T: Transport, I: FirmwareImage + ?Sized>(
    session: &mut DeviceSession<T>,
    image: &I,
    name: &str,
) -> FpspinResult<()> {
    let info = image.section_info(name)?;
    let bytes = image.section_bytes(name)?;
    let base = translate_address(info.addr)?;
    log::debug!(
        "section {name}: {} bytes at {:#x} (offset {base:#x})",
        bytes.len(),
        info.addr
    );

    for (i, chunk) in bytes.chunks(4).enumerate() {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        session.write_mem_word(base + 4 * i as u64, u32::from_le_bytes(word))?;
    }
    Ok(())
}

fn write_ruleset<T: Transport>(
    session: &mut DeviceSession<T>,
    slot: usize,
    ruleset: &RuleSet,
) -> FpspinResult<()> {
    session.write_register(ME_MODE, slot, ruleset.mode.register_value())?;
    for (i, rule) in ruleset.rules.iter().enumerate() {
        let index = slot * RULES_PER_RULESET + i;
        session.write_register(ME_IDX, index, rule.field_index)?;
        // The engine compares network-order packet words.
        session.write_register(ME_MASK, index, rule.mask.to_be())?;
        session.write_register(ME_START, index, rule.start.to_be())?;
        session.write_register(ME_END, index, rule.end.to_be())?;
    }
    Ok(())
}

impl FirmwareLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, ctx: usize) -> LoadState {
        self.states.get(ctx).copied().unwrap_or_default()
    }

    /// Load `image` and bring context `ctx` up.
    ///
    /// Stages without a handler symbol (`_hh`, `_ph`, `_th`) are programmed
    /// as disabled (address and size 0).
    ///
    /// # Errors
    ///
    /// Any failure is returned as `FpspinError::FirmwareLoadFailed` naming
    /// the stage. Nothing is rolled back; call
    /// [`unload_image`](Self::unload_image) before retrying.
    pub fn load_image<T: Transport, I: FirmwareImage + ?Sized>(
        &mut self,
        session: &mut DeviceSession<T>,
        image: &I,
        ctx: usize,
        host: HostAperture,
    ) -> FpspinResult<HandlerContext> {
        check_ctx(ctx)?;
        log::info!("loading firmware into context {ctx}");
        let fail = |stage: LoadStage| move |e: FpspinError| FpspinError::load_failed(ctx, stage, e);

        self.states[ctx] = LoadState::Unloaded;
        fetch_off(session)
            .and_then(|_| pulse_reset(session))
            .map_err(fail(LoadStage::Reset))?;
        self.states[ctx] = LoadState::FetchDisabled;

        for name in FIRMWARE_SECTIONS {
            write_section(session, image, name).map_err(fail(LoadStage::WriteSections))?;
        }
        self.states[ctx] = LoadState::SectionsWritten;

        session
            .write_register(CL_CTRL, CL_CTRL_FETCH_EN, FETCH_ALL_CLUSTERS)
            .map_err(fail(LoadStage::EnableFetch))?;
        session
            .write_register(HER_VALID, 0, 0)
            .map_err(fail(LoadStage::DisableHandlers))?;

        let mut config = HandlerContext {
            ctx,
            host_mem: host,
            scratchpad_size: SCRATCHPAD_SIZE,
            ..Default::default()
        };
        config.hh = Self::program_stage(session, image, ctx, "hh", HER_HH_ADDR, HER_HH_SIZE)
            .map_err(fail(LoadStage::ProgramHandlers))?;
        config.ph = Self::program_stage(session, image, ctx, "ph", HER_PH_ADDR, HER_PH_SIZE)
            .map_err(fail(LoadStage::ProgramHandlers))?;
        config.th = Self::program_stage(session, image, ctx, "th", HER_TH_ADDR, HER_TH_SIZE)
            .map_err(fail(LoadStage::ProgramHandlers))?;

        config.handler_mem =
            Self::program_apertures(session, image, ctx, host).map_err(fail(LoadStage::ProgramApertures))?;
        self.states[ctx] = LoadState::HandlersProgrammed;

        session
            .write_register(HER_CTX_ENABLED, ctx, 1)
            .and_then(|_| session.write_register(HER_VALID, 0, 1))
            .map_err(fail(LoadStage::Enable))?;
        self.states[ctx] = LoadState::Enabled;
        config.enabled = true;

        log::info!("context {ctx} enabled");
        Ok(config)
    }

    fn program_stage<T: Transport, I: FirmwareImage + ?Sized>(
        session: &mut DeviceSession<T>,
        image: &I,
        ctx: usize,
        stage: &str,
        addr_reg: &str,
        size_reg: &str,
    ) -> FpspinResult<Aperture> {
        let aperture = match image.symbol_address(&format!("_{stage}"))? {
            Some(addr) => Aperture {
                addr,
                size: HANDLER_STAGE_SIZE,
            },
            None => Aperture::default(),
        };
        log::debug!("{stage}: {:#x} (size {})", aperture.addr, aperture.size);
        session.write_register(addr_reg, ctx, aperture.addr)?;
        session.write_register(size_reg, ctx, aperture.size)?;
        Ok(aperture)
    }

    fn program_apertures<T: Transport, I: FirmwareImage + ?Sized>(
        session: &mut DeviceSession<T>,
        image: &I,
        ctx: usize,
        host: HostAperture,
    ) -> FpspinResult<Aperture> {
        let data = image.section_info(HANDLER_DATA_SECTION)?;
        let size = L2_END
            .checked_sub(u64::from(data.addr))
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| {
                FpspinError::InvalidImage(format!(
                    "{HANDLER_DATA_SECTION} at {:#x} is beyond L2",
                    data.addr
                ))
            })?;
        let handler_mem = Aperture {
            addr: data.addr.wrapping_add(data.size),
            size,
        };
        session.write_register(HER_HANDLER_MEM_ADDR, ctx, handler_mem.addr)?;
        session.write_register(HER_HANDLER_MEM_SIZE, ctx, handler_mem.size)?;

        session.write_register(HER_HOST_MEM_ADDR_HI, ctx, (host.addr >> 32) as u32)?;
        session.write_register(HER_HOST_MEM_ADDR_LO, ctx, host.addr as u32)?;
        session.write_register(HER_HOST_MEM_SIZE, ctx, host.size)?;

        // Scratchpad addresses are computed by the hardware.
        session.write_register(HER_SCRATCHPAD_0_SIZE, ctx, SCRATCHPAD_SIZE)?;
        session.write_register(HER_SCRATCHPAD_1_SIZE, ctx, SCRATCHPAD_SIZE)?;
        Ok(handler_mem)
    }

    /// Program all four matching-engine slots.
    ///
    /// Slots past the end of `rulesets` get [`RuleSet::bypass`]. Safe to
    /// repeat.
    pub fn program_rulesets<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        rulesets: &[RuleSet],
    ) -> FpspinResult<()> {
        if rulesets.len() > NUM_RULESETS {
            return Err(FpspinError::InvalidArgument(format!(
                "{} rulesets given, device has {NUM_RULESETS}",
                rulesets.len()
            )));
        }

        session.write_register(ME_VALID, 0, 0)?;
        let bypass = RuleSet::bypass();
        for slot in 0..NUM_RULESETS {
            let ruleset = rulesets.get(slot).unwrap_or(&bypass);
            log::debug!("ruleset {slot}: {ruleset:?}");
            write_ruleset(session, slot, ruleset)?;
        }
        session.write_register(ME_VALID, 0, 1)
    }

    /// Stop the cluster and detach context `ctx` from the matching engine.
    ///
    /// Works regardless of how far a previous load got.
    pub fn unload_image<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        ctx: usize,
    ) -> FpspinResult<()> {
        check_ctx(ctx)?;
        log::info!("unloading context {ctx}");
        fetch_off(session)?;
        pulse_reset(session)?;
        session.write_register(ME_VALID, 0, 0)?;
        write_ruleset(session, ctx, &RuleSet::bypass())?;
        session.write_register(ME_VALID, 0, 1)?;
        self.states[ctx] = LoadState::Unloaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::InMemoryImage;
    use crate::rules::MatchRule;
    use crate::sim::{RegisterWrite, SimTransport};

    fn image() -> InMemoryImage {
        InMemoryImage::new()
            .with_section(".rodata", 0x1c00_0000, b"ro!".to_vec())
            .with_sized_section(".l2_handler_data", 0x1c0c_0000, 0x100, vec![0xaa; 8])
            .with_section(".vectors", 0x1d00_0000, vec![0x6f, 0, 0, 0])
            .with_section(".text", 0x1d00_0100, vec![1, 2, 3, 4, 5, 6, 7, 8])
            .with_symbol("_hh", 0x1d00_0200)
            .with_symbol("_th", 0x1d00_0300)
    }

    const HOST: HostAperture = HostAperture {
        addr: 0x1_2345_6000,
        size: 0x10000,
    };

    #[test]
    fn test_translate_address() {
        assert_eq!(translate_address(0x1c00_0010).unwrap(), 0x10);
        assert_eq!(translate_address(0x1d00_0100).unwrap(), 0x40_0100);
        assert!(translate_address(0x1000).is_err());
    }

    #[test]
    fn test_load_writes_sections_after_reset() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let mut loader = FirmwareLoader::new();
        loader.load_image(&mut session, &image(), 1, HOST).unwrap();

        let writes = sim.writes();
        let reg = |group, index, value| RegisterWrite {
            group,
            index,
            value,
        };
        assert_eq!(
            &writes[..5],
            &[
                reg(CL_CTRL, 0, 0),
                reg(CL_CTRL, 1, 1),
                reg(CL_CTRL, 1, 0),
                reg(CL_CTRL, 0, 0b11),
                reg(HER_VALID, 0, 0),
            ]
        );
        assert_eq!(writes.last(), Some(&reg(HER_VALID, 0, 1)));

        assert_eq!(sim.mem_word(0), u32::from_le_bytes(*b"ro!\0"));
        assert_eq!(sim.mem_word(0xc_0004), 0xaaaa_aaaa);
        assert_eq!(sim.mem_word(0x40_0000), 0x6f);
        assert_eq!(sim.mem_word(0x40_0104), 0x0807_0605);
        assert_eq!(loader.state(1), LoadState::Enabled);
    }

    #[test]
    fn test_missing_handler_programs_zero() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let config = FirmwareLoader::new()
            .load_image(&mut session, &image(), 2, HOST)
            .unwrap();

        assert_eq!(config.hh, Aperture { addr: 0x1d00_0200, size: 4096 });
        assert_eq!(config.ph, Aperture::default());
        assert_eq!(sim.register(HER_PH_ADDR, 2), 0);
        assert_eq!(sim.register(HER_PH_SIZE, 2), 0);
        assert_eq!(sim.register(HER_HH_SIZE, 2), 4096);
        assert_eq!(sim.register(HER_TH_ADDR, 2), 0x1d00_0300);
    }

    #[test]
    fn test_apertures() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        FirmwareLoader::new()
            .load_image(&mut session, &image(), 0, HOST)
            .unwrap();

        assert_eq!(sim.register(HER_HANDLER_MEM_ADDR, 0), 0x1c0c_0100);
        assert_eq!(sim.register(HER_HANDLER_MEM_SIZE, 0), 0x4_0000);
        assert_eq!(sim.register(HER_HOST_MEM_ADDR_HI, 0), 1);
        assert_eq!(sim.register(HER_HOST_MEM_ADDR_LO, 0), 0x2345_6000);
        assert_eq!(sim.register(HER_HOST_MEM_SIZE, 0), 0x10000);
        assert_eq!(sim.register(HER_SCRATCHPAD_0_SIZE, 0), 4096);
        assert_eq!(sim.register(HER_SCRATCHPAD_1_SIZE, 0), 4096);
        assert_eq!(sim.register(HER_CTX_ENABLED, 0), 1);
    }

    #[test]
    fn test_transport_failure_names_stage() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let mut loader = FirmwareLoader::new();
        sim.fail_writes_to(HER_HOST_MEM_ADDR_HI);

        let err = loader.load_image(&mut session, &image(), 0, HOST).unwrap_err();
        assert!(matches!(
            err,
            FpspinError::FirmwareLoadFailed {
                ctx: 0,
                stage: LoadStage::ProgramApertures,
                ..
            }
        ));
        assert_eq!(loader.state(0), LoadState::SectionsWritten);
        loader.unload_image(&mut session, 0).unwrap();
        assert_eq!(loader.state(0), LoadState::Unloaded);
    }

    #[test]
    fn test_missing_section_fails_load() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let err = FirmwareLoader::new()
            .load_image(&mut session, &InMemoryImage::new(), 0, HOST)
            .unwrap_err();
        match err {
            FpspinError::FirmwareLoadFailed { stage, source, .. } => {
                assert_eq!(stage, LoadStage::WriteSections);
                assert!(matches!(*source, FpspinError::MissingSection(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_rulesets_means_all_bypass() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let mut loader = FirmwareLoader::new();
        loader.program_rulesets(&mut session, &[]).unwrap();

        for index in 0..NUM_RULESETS * RULES_PER_RULESET {
            assert_eq!(sim.register(ME_MASK, index), 0);
            assert_eq!(sim.register(ME_START, index), 1u32.to_be());
            assert_eq!(sim.register(ME_END, index), 0);
        }
        assert_eq!(sim.register(ME_VALID, 0), 1);
    }

    #[test]
    fn test_rulesets_by_slot() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let mut loader = FirmwareLoader::new();
        let sets = [RuleSet::match_all(), RuleSet::udp()];
        loader.program_rulesets(&mut session, &sets).unwrap();
        let first = sim.writes();
        sim.clear_log();
        loader.program_rulesets(&mut session, &sets).unwrap();
        assert_eq!(sim.writes(), first);

        // slot 1, rule 0 is the IPv4 rule
        assert_eq!(sim.register(ME_IDX, 4), 3);
        assert_eq!(sim.register(ME_MASK, 4), 0xffff_0000u32.to_be());
        assert_eq!(sim.register(ME_START, 4), MatchRule::ipv4().start.to_be());
        assert_eq!(sim.register(ME_START, 8), 1u32.to_be());
        assert_eq!(first.first().map(|w| (w.group, w.value)), Some((ME_VALID, 0)));
        assert_eq!(first.last().map(|w| (w.group, w.value)), Some((ME_VALID, 1)));
    }

    #[test]
    fn test_too_many_rulesets() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let sets = [RuleSet::bypass(); NUM_RULESETS + 1];
        assert!(matches!(
            FirmwareLoader::new().program_rulesets(&mut session, &sets),
            Err(FpspinError::InvalidArgument(_))
        ));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn test_unload_without_load() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        let mut loader = FirmwareLoader::new();
        loader.unload_image(&mut session, 3).unwrap();
        assert_eq!(sim.register(CL_CTRL, CL_CTRL_FETCH_EN), 0);
        assert_eq!(sim.register(ME_START, 12), 1u32.to_be());
        assert_eq!(sim.register(ME_VALID, 0), 1);
        assert!(loader.unload_image(&mut session, 4).is_err());
    }

    #[test]
    fn test_host_aperture_from_region() {
        let region = DmaRegion {
            handle: 0xff00_0000_0000,
            size: 0x20_0000,
            enabled: true,
        };
        assert_eq!(HostAperture::from_region(region).unwrap().size, 0x20_0000);
        let huge = DmaRegion {
            size: 1 << 32,
            ..region
        };
        assert!(HostAperture::from_region(huge).is_err());
    }
}
