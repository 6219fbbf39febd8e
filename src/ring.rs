// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-HPU request/response flag ring.
//!
//! The host DMA buffer is divided into one page-sized slot per HPU. The
//! accelerator DMAs a request into a slot and bumps the sequence id in the
//! slot's flag word; the host polls that word, processes the payload in
//! place and hands the slot back by poking the HPU's host flag in L2.
//!
//! # Flag word layout
//!
//! ```text
//! 63          32 31    24 23    16 15     8 7   4 3    0
//! +-------------+--------+--------+--------+-----+------+
//! |  reserved   |  hpu   |  rsvd  | length | rsvd|  seq |
//! +-------------+--------+--------+--------+-----+------+
//! ```
//!
//! The sequence id wraps at 16. The length field is defined by the
//! application; the runtime only carries it.
//!
//! # Concurrency
//!
//! [`FlagRing::into_units`] splits the ring into one [`UnitRing`] per HPU.
//! Unit handles are `Send` but polling requires `&mut`, so each slot has
//! exactly one consumer.

use crate::device::{DeviceSession, RingClaim};
use crate::dma::{DmaBuffer, PAGE_SIZE};
use crate::error::{FpspinError, FpspinResult};
use crate::loader::L2_BASE;
use crate::transport::Transport;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of HPUs on the accelerator.
pub const NUM_HPUS: usize = 16;

/// DMA bus alignment; the payload of a slot starts at this offset.
pub const DMA_ALIGN: usize = 64;

// The flag word must fit before the payload.
const _: () = assert!(DMA_ALIGN >= 8);

/// A slot's 64-bit descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagWord(pub u64);

impl FlagWord {
    const SEQ_MASK: u64 = 0xf;
    const LEN_SHIFT: u32 = 8;
    const UNIT_SHIFT: u32 = 24;

    /// Build a flag word from its fields. The sequence id is truncated to
    /// four bits.
    #[inline]
    pub const fn compose(seq: u8, len: u8, unit: u8) -> Self {
        Self(
            (seq as u64 & Self::SEQ_MASK)
                | ((len as u64) << Self::LEN_SHIFT)
                | ((unit as u64) << Self::UNIT_SHIFT),
        )
    }

    /// Application flag carrying only a length.
    #[inline]
    pub const fn with_len(len: u8) -> Self {
        Self::compose(0, len, 0)
    }

    #[inline]
    pub const fn seq(self) -> u8 {
        (self.0 & Self::SEQ_MASK) as u8
    }

    #[inline]
    pub const fn length(self) -> u8 {
        (self.0 >> Self::LEN_SHIFT) as u8
    }

    /// Originating HPU id.
    #[inline]
    pub const fn unit(self) -> u8 {
        (self.0 >> Self::UNIT_SHIFT) as u8
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl From<u64> for FlagWord {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Shape of the ring inside the DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Number of slots (one per HPU).
    pub unit_count: usize,
    /// Bytes per slot.
    pub slot_size: usize,
    /// Payload offset inside a slot.
    pub payload_offset: usize,
}

impl Default for RingGeometry {
    fn default() -> Self {
        Self {
            unit_count: NUM_HPUS,
            slot_size: PAGE_SIZE,
            payload_offset: DMA_ALIGN,
        }
    }
}

impl RingGeometry {
    /// Bytes of DMA buffer the ring needs.
    pub fn required_len(&self) -> usize {
        self.unit_count * self.slot_size
    }

    /// Payload capacity of one slot.
    pub fn payload_len(&self) -> usize {
        self.slot_size - self.payload_offset
    }

    fn validate(&self, buffer_len: usize) -> FpspinResult<()> {
        if self.unit_count == 0 || self.unit_count > usize::from(u8::MAX) + 1 {
            return Err(FpspinError::InvalidArgument(format!(
                "unit count {} out of range",
                self.unit_count
            )));
        }
        if self.slot_size % 8 != 0 || self.payload_offset < 8 || self.payload_offset >= self.slot_size
        {
            return Err(FpspinError::InvalidArgument(format!(
                "bad slot layout: size {}, payload offset {}",
                self.slot_size, self.payload_offset
            )));
        }
        if self.required_len() > buffer_len {
            return Err(FpspinError::InvalidArgument(format!(
                "ring needs {} bytes, dma buffer has {buffer_len}",
                self.required_len()
            )));
        }
        Ok(())
    }
}

/// A request taken from a slot.
///
/// Borrows the slot's payload region; write the response into
/// [`payload_mut`](Request::payload_mut) and then call
/// [`UnitRing::push_response`].
#[derive(Debug)]
pub struct Request<'a> {
    flag: FlagWord,
    payload: &'a mut [u8],
}

impl Request<'_> {
    /// Flag word that announced the request.
    pub fn flag(&self) -> FlagWord {
        self.flag
    }

    /// Whole payload region of the slot.
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Payload region for writing the response in place.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.payload
    }
}

/// Poll schedule for the blocking wait helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Busy-poll with a spin hint between reads.
    Spin,
    /// Sleep between reads.
    Sleep(Duration),
}

/// Host side of one HPU slot.
pub struct UnitRing<'s, T: Transport> {
    session: &'s DeviceSession<T>,
    buffer: &'s DmaBuffer,
    geometry: RingGeometry,
    unit: usize,
    last_seen: u8,
    anomalies: u64,
    host_flag_base: u64,
    _claim: Arc<RingClaim<'s>>,
}

impl<'s, T: Transport> UnitRing<'s, T> {
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Sequence id of the last consumed request.
    pub fn last_seen(&self) -> u8 {
        self.last_seen
    }

    /// Requests whose source HPU did not match this slot.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    fn slot_offset(&self) -> usize {
        self.unit * self.geometry.slot_size
    }

    fn read_flag(&self) -> FpspinResult<FlagWord> {
        // SAFETY: the flag word precedes the payload, which is the only part
        // of a slot ever lent out.
        unsafe { self.buffer.read_u64(self.slot_offset()) }.map(FlagWord)
    }

    /// Returns true if the slot holds a request not yet consumed.
    pub fn has_request(&self) -> FpspinResult<bool> {
        Ok(self.read_flag()?.seq() != self.last_seen)
    }

    /// Take the pending request, if any. Never blocks.
    pub fn pop_request(&mut self) -> FpspinResult<Option<Request<'_>>> {
        let flag = self.read_flag()?;
        if flag.seq() == self.last_seen {
            return Ok(None);
        }

        if usize::from(flag.unit()) != self.unit {
            self.anomalies += 1;
            log::warn!(
                "ring anomaly on slot {}: flag {:#x} names hpu {}",
                self.unit,
                flag.bits(),
                flag.unit()
            );
        }
        self.last_seen = flag.seq();
        log::trace!("hpu {} request: seq {} len {}", self.unit, flag.seq(), flag.length());

        let offset = self.slot_offset() + self.geometry.payload_offset;
        // SAFETY: slots are disjoint, and this handle is the only consumer of
        // its slot; the returned borrow holds `&mut self`.
        let payload = unsafe { self.buffer.slice_mut(offset, self.geometry.payload_len())? };
        Ok(Some(Request { flag, payload }))
    }

    /// Poll until a request arrives or `max_polls` reads came up empty.
    pub fn wait_request(
        &mut self,
        backoff: Backoff,
        max_polls: u64,
    ) -> FpspinResult<Option<Request<'_>>> {
        let mut polls = 0;
        while !self.has_request()? {
            polls += 1;
            if polls >= max_polls {
                return Ok(None);
            }
            match backoff {
                Backoff::Spin => core::hint::spin_loop(),
                Backoff::Sleep(pause) => std::thread::sleep(pause),
            }
        }
        self.pop_request()
    }

    /// Async variant of [`wait_request`](Self::wait_request) that sleeps on
    /// the tokio timer between reads.
    #[cfg(feature = "async")]
    pub async fn wait_request_async(
        &mut self,
        interval: Duration,
        max_polls: u64,
    ) -> FpspinResult<Option<Request<'_>>> {
        let mut polls = 0;
        while !self.has_request()? {
            polls += 1;
            if polls >= max_polls {
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
        self.pop_request()
    }

    /// Hand the slot back to the HPU.
    ///
    /// The response must already be in the payload region. `flag` carries
    /// the application fields; sequence id and HPU id are filled in.
    pub fn push_response(&mut self, flag: FlagWord) -> FpspinResult<()> {
        // Payload stores must be visible before the HPU sees the flag.
        fence(Ordering::SeqCst);

        let value = flag.bits() | FlagWord::compose(self.last_seen, 0, self.unit as u8).bits();
        let addr = self
            .host_flag_base
            .checked_sub(L2_BASE)
            .ok_or_else(|| {
                FpspinError::InvalidArgument(format!(
                    "host flag base {:#x} below L2",
                    self.host_flag_base
                ))
            })?
            + 8 * self.unit as u64;
        log::trace!("hpu {} response: {value:#x} -> {addr:#x}", self.unit);
        self.session.raw_poke(addr, value)
    }
}

/// The request/response ring of a session.
pub struct FlagRing<'s, T: Transport> {
    units: Vec<UnitRing<'s, T>>,
}

impl<T: Transport> std::fmt::Debug for UnitRing<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRing")
            .field("unit", &self.unit)
            .field("last_seen", &self.last_seen)
            .field("anomalies", &self.anomalies)
            .finish()
    }
}

impl<'s, T: Transport> FlagRing<'s, T> {
    /// Attach to the session's mapped DMA buffer.
    ///
    /// Records every slot's current sequence id so that stale flags from
    /// before the host attached are not taken as requests.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::NoDmaBuffer` if the session has not mapped its
    /// DMA buffer, or `FpspinError::InvalidArgument` if the geometry does not
    /// fit into it or another ring (or one of its units) is still alive.
    pub fn initialize(
        session: &'s DeviceSession<T>,
        geometry: RingGeometry,
        host_flag_base: u64,
    ) -> FpspinResult<Self> {
        let buffer = session.dma_buffer()?;
        geometry.validate(buffer.len())?;
        let claim = Arc::new(session.claim_ring()?);

        let units = (0..geometry.unit_count)
            .map(|unit| {
                // SAFETY: the ring was just claimed, so no payload is lent out.
                let flag = unsafe { buffer.read_u64(unit * geometry.slot_size)? };
                let last_seen = FlagWord(flag).seq();
                Ok(UnitRing {
                    session,
                    buffer,
                    geometry,
                    unit,
                    last_seen,
                    anomalies: 0,
                    host_flag_base,
                    _claim: Arc::clone(&claim),
                })
            })
            .collect::<FpspinResult<Vec<_>>>()?;

        log::debug!(
            "flag ring: {} slots of {} bytes, host flags at {host_flag_base:#x}",
            geometry.unit_count,
            geometry.slot_size
        );
        Ok(Self { units })
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Handle of one slot.
    pub fn unit(&mut self, unit: usize) -> FpspinResult<&mut UnitRing<'s, T>> {
        let count = self.units.len();
        self.units.get_mut(unit).ok_or_else(|| {
            FpspinError::InvalidArgument(format!("hpu {unit} out of range (0..{count})"))
        })
    }

    /// Take the pending request of `unit`, if any.
    pub fn pop_request(&mut self, unit: usize) -> FpspinResult<Option<Request<'_>>> {
        self.unit(unit)?.pop_request()
    }

    /// Hand slot `unit` back to its HPU.
    pub fn push_response(&mut self, unit: usize, flag: FlagWord) -> FpspinResult<()> {
        self.unit(unit)?.push_response(flag)
    }

    /// Split into per-slot handles for polling from separate threads.
    pub fn into_units(self) -> Vec<UnitRing<'s, T>> {
        self.units
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::sim::SimTransport;

    const HOST_DATA: u64 = L2_BASE + 0x100;

    fn session(sim: &SimTransport) -> DeviceSession<&SimTransport> {
        let mut session = DeviceSession::with_transport(sim, 0).unwrap();
        session.map_dma_buffer(NUM_HPUS).unwrap();
        session
    }

    /// Accelerator side: write payload, then bump the slot's flag.
    fn deliver(session: &DeviceSession<&SimTransport>, unit: usize, seq: u8, hpu: u8, data: &[u8]) {
        let buffer = session.dma_buffer().unwrap();
        let slot = unit * PAGE_SIZE;
        // SAFETY: callers never hold a request of `unit` across a delivery.
        unsafe {
            buffer.write_bytes(slot + DMA_ALIGN, data).unwrap();
            buffer
                .write_u64(slot, FlagWord::compose(seq, data.len() as u8, hpu).bits())
                .unwrap();
        }
    }

    #[test]
    fn test_flag_word_fields() {
        let flag = FlagWord::compose(0x1f, 200, 7);
        assert_eq!(flag.seq(), 0xf);
        assert_eq!(flag.length(), 200);
        assert_eq!(flag.unit(), 7);
        assert_eq!(flag.bits(), 0x0700_c80f);
    }

    #[test]
    fn test_empty_after_initialize() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        for unit in 0..NUM_HPUS {
            assert!(ring.pop_request(unit).unwrap().is_none());
        }
    }

    #[test]
    fn test_second_ring_on_session_rejected() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        assert!(matches!(
            FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA),
            Err(FpspinError::InvalidArgument(_))
        ));

        let mut units = ring.into_units();
        units.truncate(1);
        assert!(FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).is_err());
        drop(units);
        assert!(FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).is_ok());
    }

    #[test]
    fn test_stale_flag_ignored() {
        let sim = SimTransport::new();
        let session = session(&sim);
        deliver(&session, 3, 5, 3, b"old");
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        assert!(ring.pop_request(3).unwrap().is_none());
    }

    #[test]
    fn test_one_delivery_per_sequence_change() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();

        deliver(&session, 2, 1, 2, b"ping");
        {
            let req = ring.pop_request(2).unwrap().unwrap();
            assert_eq!(req.flag().length(), 4);
            assert_eq!(&req.payload()[..4], b"ping");
        }
        assert!(ring.pop_request(2).unwrap().is_none());

        deliver(&session, 2, 2, 2, b"pong");
        assert!(ring.pop_request(2).unwrap().is_some());
        assert!(ring.pop_request(2).unwrap().is_none());
        assert_eq!(ring.unit(2).unwrap().anomalies(), 0);
    }

    #[test]
    fn test_unit_mismatch_is_delivered() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        deliver(&session, 4, 1, 9, b"x");
        assert!(ring.pop_request(4).unwrap().is_some());
        assert_eq!(ring.unit(4).unwrap().anomalies(), 1);
    }

    #[test]
    fn test_push_response_pokes_host_flag() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();

        deliver(&session, 5, 3, 5, b"abc");
        {
            let mut req = ring.pop_request(5).unwrap().unwrap();
            req.payload_mut()[..3].copy_from_slice(b"ABC");
        }
        ring.push_response(5, FlagWord::with_len(3)).unwrap();

        let mut echoed = [0u8; 3];
        // SAFETY: the request was dropped above.
        unsafe {
            session
                .dma_buffer()
                .unwrap()
                .read_bytes(5 * PAGE_SIZE + DMA_ALIGN, &mut echoed)
                .unwrap();
        }
        assert_eq!(&echoed, b"ABC");
        assert_eq!(
            sim.pokes(),
            vec![(0x100 + 8 * 5, FlagWord::compose(3, 3, 5).bits())]
        );
    }

    #[test]
    fn test_wait_request_gives_up() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        let unit = ring.unit(0).unwrap();
        assert!(unit.wait_request(Backoff::Spin, 10).unwrap().is_none());
        deliver(&session, 0, 1, 0, b"x");
        assert!(unit.wait_request(Backoff::Spin, 10).unwrap().is_some());
    }

    #[test]
    fn test_units_polled_from_threads() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        for unit in 0..NUM_HPUS {
            deliver(&session, unit, 1, unit as u8, &[unit as u8]);
        }

        std::thread::scope(|s| {
            for mut unit in ring.into_units() {
                s.spawn(move || {
                    let id = unit.unit();
                    let req = unit.pop_request().unwrap().unwrap();
                    assert_eq!(req.payload()[0], id as u8);
                    unit.push_response(FlagWord::with_len(1)).unwrap();
                });
            }
        });
        assert_eq!(sim.pokes().len(), NUM_HPUS);
    }

    #[test]
    fn test_geometry_must_fit_buffer() {
        let sim = SimTransport::new();
        let mut session = DeviceSession::with_transport(&sim, 0).unwrap();
        session.map_dma_buffer(4).unwrap();
        assert!(matches!(
            FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA),
            Err(FpspinError::InvalidArgument(_))
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_wait_request_async() {
        let sim = SimTransport::new();
        let session = session(&sim);
        let mut ring = FlagRing::initialize(&session, RingGeometry::default(), HOST_DATA).unwrap();
        deliver(&session, 1, 1, 1, b"y");
        let unit = ring.unit(1).unwrap();
        let req = unit
            .wait_request_async(Duration::from_millis(1), 5)
            .await
            .unwrap();
        assert!(req.is_some());
    }
}
