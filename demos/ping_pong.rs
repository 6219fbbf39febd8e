// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Ping-pong over the flag ring, plus an SLMP transfer.
//!
//! Runs against the in-process simulator unless `--hardware` is given, in
//! which case the firmware at `FPSPIN_IMAGE` is loaded onto the device
//! named by the `FPSPIN_*` variables.
//!
//! Run with: `cargo run --example ping_pong`

use fpspin::dma::PAGE_SIZE;
use fpspin::ring::{DMA_ALIGN, NUM_HPUS};
use fpspin::sim::SimTransport;
use fpspin::{
    is_fpspin_available, DeviceSession, FirmwareImage, FlagWord, FpspinContext, FpspinError,
    InMemoryImage, RingGeometry, RuleSet, SlmpChannel, SlmpConfig, SlmpFlags, SlmpHeader, Transport,
};
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

const ROUNDS: u8 = 8;

/// Minimal image: one header handler and the host flag block.
fn synthetic_image() -> InMemoryImage {
    InMemoryImage::new()
        .with_section(".rodata", 0x1c00_0000, b"ping-pong\0\0\0".to_vec())
        .with_sized_section(".l2_handler_data", 0x1c0c_0000, 0x1000, vec![])
        .with_section(".vectors", 0x1d00_0000, vec![0x6f, 0x00, 0x00, 0x00])
        .with_section(".text", 0x1d00_0100, vec![0x13, 0x00, 0x00, 0x00])
        .with_symbol("_hh", 0x1d00_0100)
        .with_symbol("__host_data", 0x1c0f_f000)
}

/// Host side of the ping-pong: echo every request with its bytes reversed.
///
/// On the simulator the accelerator side is played here as well.
fn ping_pong<T: Transport>(
    ctx: &FpspinContext<T>,
    geometry: RingGeometry,
    simulated: bool,
) -> Result<(), FpspinError> {
    let mut ring = ctx.ring_with(geometry)?;
    let buffer = ctx.session().dma_buffer()?;

    for round in 1..=ROUNDS {
        let unit = usize::from(round) % ring.unit_count();
        if simulated {
            let ping = format!("ping {round}");
            // SAFETY: no request is held while the accelerator side is played.
            unsafe {
                buffer.write_bytes(unit * PAGE_SIZE + DMA_ALIGN, ping.as_bytes())?;
                buffer.write_u64(
                    unit * PAGE_SIZE,
                    FlagWord::compose(round, ping.len() as u8, unit as u8).bits(),
                )?;
            }
        }

        let len = {
            let Some(mut request) = ring.pop_request(unit)? else {
                println!("  hpu {unit}: no request");
                continue;
            };
            let len = usize::from(request.flag().length());
            let payload = &mut request.payload_mut()[..len];
            print!("  hpu {unit}: {:?}", String::from_utf8_lossy(payload));
            payload.reverse();
            println!(" -> {:?}", String::from_utf8_lossy(payload));
            len
        };
        ring.push_response(unit, FlagWord::with_len(len as u8))?;
    }
    Ok(())
}

/// Push a message through SLMP to a local receiver that acknowledges every
/// SYN fragment.
fn slmp_transfer() -> Result<(), FpspinError> {
    let receiver = UdpSocket::bind("127.0.0.1:0")?;
    let dest = receiver.local_addr()?;
    receiver.set_read_timeout(Some(Duration::from_secs(1)))?;

    let peer = thread::spawn(move || {
        let mut datagram = [0u8; 2048];
        let mut received = 0usize;
        while let Ok((len, from)) = receiver.recv_from(&mut datagram) {
            let Ok(header) = SlmpHeader::decode(&datagram[..len]) else {
                break;
            };
            received += len - fpspin::slmp::SLMP_HEADER_LEN;
            if header.flags.contains(SlmpFlags::SYN) {
                let ack = SlmpHeader::new(SlmpFlags::ACK, header.msg_id, header.offset);
                let _ = receiver.send_to(&ack.encode(), from);
            }
            if header.flags.contains(SlmpFlags::EOM) {
                break;
            }
        }
        received
    });

    let message: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    let channel = SlmpChannel::new(SlmpConfig::default())?;
    channel.send_message_to(dest, 1, &message)?;
    channel.close();

    let received = peer.join().unwrap_or(0);
    println!("  sent {} bytes, receiver got {received}", message.len());
    Ok(())
}

fn run_simulated() -> Result<(), FpspinError> {
    let sim = SimTransport::new();
    sim.enable_dma(0, 0x8_0000_0000, (NUM_HPUS * PAGE_SIZE) as u64);
    let session = DeviceSession::with_transport(&sim, 0)?;

    let image = synthetic_image();
    println!("Loading synthetic image...");
    let ctx = FpspinContext::init(session, &image, &[RuleSet::slmp()], NUM_HPUS)?;
    println!("  {:?}", ctx.handlers());
    println!("  register writes: {}", sim.writes().len());

    println!("\nPing-pong over the flag ring...");
    ping_pong(&ctx, RingGeometry::default(), true)?;
    println!("  host flag pokes: {}", sim.pokes().len());
    println!("  average handler cycles: {}", ctx.avg_cycles()?);

    ctx.exit()
}

#[cfg(target_os = "linux")]
fn run_hardware() -> Result<(), FpspinError> {
    use fpspin::{DeviceConfig, ElfImage};

    let config = DeviceConfig::from_env()?;
    let path = std::env::var("FPSPIN_IMAGE")
        .map_err(|_| FpspinError::InvalidArgument("FPSPIN_IMAGE not set".into()))?;
    let image = ElfImage::open(&path)?;
    println!("Loading {path} ({} sections)...", image.section_names().count());
    if image.symbol_address("__host_data")?.is_none() {
        return Err(FpspinError::MissingSymbol("__host_data".into()));
    }

    let session = DeviceSession::open(&config)?;
    let ctx = FpspinContext::init(session, &image, &[RuleSet::slmp()], config.hostdma_num_pages()?)?;
    println!("  {:?}", ctx.cluster_stats()?);

    println!("\nPolling the flag ring...");
    ping_pong(&ctx, config.ring_geometry(), false)?;
    println!("  average handler cycles: {}", ctx.avg_cycles()?);
    ctx.exit()
}

#[cfg(not(target_os = "linux"))]
fn run_hardware() -> Result<(), FpspinError> {
    Err(FpspinError::PlatformNotSupported)
}

fn main() {
    println!("FPsPIN Ping-Pong Example");
    println!("========================\n");
    println!("FPsPIN device present: {}\n", is_fpspin_available());

    let hardware = std::env::args().any(|arg| arg == "--hardware");
    let result = if hardware { run_hardware() } else { run_simulated() };
    if let Err(e) = result {
        println!("Error: {e}");
        return;
    }

    println!("\nSLMP transfer over loopback...");
    match slmp_transfer() {
        Ok(()) => println!("\nDone."),
        Err(e) => println!("  SLMP transfer failed: {e}"),
    }
}
