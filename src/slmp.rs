// FPsPIN Host Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! SLMP: reliable delivery of large messages to the accelerator over UDP.
//!
//! A message is cut into fragments of at most [`SLMP_MAX_FRAGMENT`] bytes,
//! rounded down to the configured alignment. Every datagram carries a
//! 10-byte big-endian header:
//!
//! ```text
//!  0      2          6          10
//! +------+----------+----------+-----------------+
//! | flags|  msg_id  |  offset  |  payload ...    |
//! +------+----------+----------+-----------------+
//! ```
//!
//! Fragments flagged `SYN` are acknowledged by a header-only reply with
//! `ACK` set. The first fragment carries `SYN`, the last `SYN | EOM`; the
//! interior ones carry nothing unless every fragment must be acknowledged.
//! There are no retransmissions: a missing acknowledgement fails the send.

use crate::error::{FpspinError, FpspinResult};
use crate::util::hexdump;
use bitflags::bitflags;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Well-known UDP port of the SLMP receiver.
pub const SLMP_PORT: u16 = 9330;

/// Largest fragment payload: 1500-byte MTU minus IPv4, UDP and SLMP headers.
pub const SLMP_MAX_FRAGMENT: usize = 1500 - 20 - 8 - SLMP_HEADER_LEN;

/// Size of the SLMP header.
pub const SLMP_HEADER_LEN: usize = 10;

/// Default time to wait for an acknowledgement.
pub const SLMP_ACK_TIMEOUT: Duration = Duration::from_millis(100);

bitflags! {
    /// SLMP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SlmpFlags: u16 {
        /// Last fragment of the message.
        const EOM = 0x8000;
        /// Sender waits for an acknowledgement.
        const SYN = 0x4000;
        /// Acknowledgement reply.
        const ACK = 0x2000;
    }
}

/// Decoded SLMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlmpHeader {
    pub flags: SlmpFlags,
    pub msg_id: u32,
    pub offset: u32,
}

impl SlmpHeader {
    pub fn new(flags: SlmpFlags, msg_id: u32, offset: u32) -> Self {
        Self {
            flags,
            msg_id,
            offset,
        }
    }

    pub fn encode(&self) -> [u8; SLMP_HEADER_LEN] {
        let mut out = [0u8; SLMP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[2..6].copy_from_slice(&self.msg_id.to_be_bytes());
        out[6..10].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    /// Parse the header at the start of a datagram. Unknown flag bits are
    /// kept.
    pub fn decode(bytes: &[u8]) -> FpspinResult<Self> {
        let b = bytes.get(..SLMP_HEADER_LEN).ok_or_else(|| {
            FpspinError::InvalidArgument(format!("SLMP datagram of {} bytes", bytes.len()))
        })?;
        Ok(Self {
            flags: SlmpFlags::from_bits_retain(u16::from_be_bytes([b[0], b[1]])),
            msg_id: u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
            offset: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
        })
    }
}

/// One planned datagram of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Byte offset inside the message.
    pub offset: u32,
    /// Payload bytes in this fragment.
    pub len: usize,
    pub flags: SlmpFlags,
}

impl Fragment {
    /// Sender waits for an ACK after this fragment.
    pub fn needs_ack(&self) -> bool {
        self.flags.contains(SlmpFlags::SYN)
    }

    fn data<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        let start = self.offset as usize;
        &payload[start..start + self.len]
    }
}

/// Split a message of `len` bytes into fragments of `fragment_size`.
///
/// An empty message has no fragments.
pub fn plan_fragments(len: usize, fragment_size: usize, always_ack: bool) -> Vec<Fragment> {
    if fragment_size == 0 {
        return Vec::new();
    }
    let count = len.div_ceil(fragment_size);
    (0..count)
        .map(|i| {
            let offset = i * fragment_size;
            let mut flags = if i + 1 == count {
                SlmpFlags::SYN | SlmpFlags::EOM
            } else if i == 0 {
                SlmpFlags::SYN
            } else {
                SlmpFlags::empty()
            };
            if always_ack {
                flags |= SlmpFlags::SYN;
            }
            Fragment {
                offset: offset as u32,
                len: fragment_size.min(len - offset),
                flags,
            }
        })
        .collect()
}

/// What parallel senders do once another sender has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelFailurePolicy {
    /// Finish the fragment in hand, including its ACK wait, then stop.
    #[default]
    Drain,
    /// Stop at once; an outstanding ACK is not waited for.
    Abort,
}

/// Sender configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlmpConfig {
    /// Fragment payloads are a multiple of this many bytes.
    pub alignment: usize,
    /// Every fragment is acknowledged, not just the first and last.
    pub always_ack: bool,
    /// Pause after every fragment; zero disables pacing.
    pub flow_control_delay: Duration,
    /// Send interior fragments from several threads.
    pub parallel: bool,
    /// Number of sender threads in parallel mode.
    pub workers: usize,
    pub failure_policy: ParallelFailurePolicy,
    pub ack_timeout: Duration,
}

impl Default for SlmpConfig {
    fn default() -> Self {
        Self {
            alignment: 1,
            always_ack: false,
            flow_control_delay: Duration::ZERO,
            parallel: false,
            workers: 4,
            failure_policy: ParallelFailurePolicy::Drain,
            ack_timeout: SLMP_ACK_TIMEOUT,
        }
    }
}

impl SlmpConfig {
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_always_ack(mut self, always_ack: bool) -> Self {
        self.always_ack = always_ack;
        self
    }

    pub fn with_flow_control_delay(mut self, delay: Duration) -> Self {
        self.flow_control_delay = delay;
        self
    }

    pub fn with_parallel(mut self, workers: usize) -> Self {
        self.parallel = workers > 1;
        self.workers = workers.max(1);
        self
    }

    pub fn with_failure_policy(mut self, policy: ParallelFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Payload bytes per fragment.
    ///
    /// # Errors
    ///
    /// Returns `FpspinError::InvalidArgument` if no aligned payload fits in
    /// a fragment.
    pub fn fragment_size(&self) -> FpspinResult<usize> {
        if self.alignment == 0 || self.alignment > SLMP_MAX_FRAGMENT {
            return Err(FpspinError::InvalidArgument(format!(
                "alignment {} leaves no room for payload",
                self.alignment
            )));
        }
        Ok(SLMP_MAX_FRAGMENT / self.alignment * self.alignment)
    }
}

/// Send one fragment and, if flagged, wait for its acknowledgement.
fn send_fragment(
    socket: &UdpSocket,
    dest: SocketAddr,
    msg_id: u32,
    fragment: &Fragment,
    payload: &[u8],
    config: &SlmpConfig,
    cancel: Option<&AtomicBool>,
) -> FpspinResult<()> {
    let mut packet = Vec::with_capacity(SLMP_HEADER_LEN + fragment.len);
    packet.extend_from_slice(&SlmpHeader::new(fragment.flags, msg_id, fragment.offset).encode());
    packet.extend_from_slice(fragment.data(payload));

    socket
        .send_to(&packet, dest)
        .map_err(|e| FpspinError::SlmpSendFailed(format!("offset {}: {e}", fragment.offset)))?;
    log::trace!(
        "sent msg {msg_id} offset {} flags {:?}",
        fragment.offset,
        fragment.flags
    );
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{}", hexdump(&packet[..packet.len().min(64)]));
    }

    let abort = cancel.is_some_and(|c| c.load(Ordering::Relaxed));
    if fragment.needs_ack() && !abort {
        wait_ack(socket, msg_id, fragment.offset)?;
    }

    if !config.flow_control_delay.is_zero() {
        std::thread::sleep(config.flow_control_delay);
    }
    Ok(())
}

fn wait_ack(socket: &UdpSocket, msg_id: u32, offset: u32) -> FpspinResult<()> {
    let mut reply = [0u8; 64];
    let len = match socket.recv_from(&mut reply) {
        Ok((len, _)) => len,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Err(FpspinError::SlmpAckTimeout { msg_id, offset });
        }
        Err(e) => {
            return Err(FpspinError::SlmpSendFailed(format!(
                "ACK wait for offset {offset}: {e}"
            )))
        }
    };
    if len != SLMP_HEADER_LEN {
        return Err(FpspinError::SlmpSendFailed(format!(
            "ACK size mismatch: expected {SLMP_HEADER_LEN}, got {len}"
        )));
    }

    let header = SlmpHeader::decode(&reply[..len])?;
    if !header.flags.contains(SlmpFlags::ACK) {
        return Err(FpspinError::SlmpNoAck {
            msg_id,
            offset,
            flags: header.flags.bits(),
        });
    }
    if header.msg_id != msg_id || header.offset != offset {
        log::debug!(
            "ACK for msg {} offset {} while waiting for msg {msg_id} offset {offset}",
            header.msg_id,
            header.offset
        );
    }
    Ok(())
}

/// SLMP sender bound to one local UDP socket.
#[derive(Debug)]
pub struct SlmpChannel {
    socket: UdpSocket,
    config: SlmpConfig,
}

impl SlmpChannel {
    /// Open a channel on an ephemeral port of every local interface.
    pub fn new(config: SlmpConfig) -> FpspinResult<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), config)
    }

    pub fn bind(local: SocketAddr, config: SlmpConfig) -> FpspinResult<Self> {
        config.fragment_size()?;
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(config.ack_timeout))?;
        log::debug!("slmp channel on {}", socket.local_addr()?);
        Ok(Self { socket, config })
    }

    pub fn config(&self) -> &SlmpConfig {
        &self.config
    }

    pub fn local_addr(&self) -> FpspinResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Deliver `payload` as message `msg_id` to the SLMP port of `dest`.
    ///
    /// Blocks until the last fragment is acknowledged.
    ///
    /// # Errors
    ///
    /// The first missing or malformed acknowledgement, or send failure,
    /// aborts the message. In parallel mode some interior fragments may have
    /// been delivered already.
    pub fn send_message(&self, dest: IpAddr, msg_id: u32, payload: &[u8]) -> FpspinResult<()> {
        self.send_message_to(SocketAddr::new(dest, SLMP_PORT), msg_id, payload)
    }

    /// Like [`send_message`](Self::send_message) for a peer on another port.
    pub fn send_message_to(
        &self,
        dest: SocketAddr,
        msg_id: u32,
        payload: &[u8],
    ) -> FpspinResult<()> {
        if u32::try_from(payload.len()).is_err() {
            return Err(FpspinError::InvalidArgument(format!(
                "message of {} bytes exceeds the SLMP offset range",
                payload.len()
            )));
        }
        let fragments = plan_fragments(
            payload.len(),
            self.config.fragment_size()?,
            self.config.always_ack,
        );
        log::debug!(
            "slmp msg {msg_id}: {} bytes in {} fragments to {dest}",
            payload.len(),
            fragments.len()
        );

        match fragments.as_slice() {
            [first, interior @ .., last] if self.config.parallel && !interior.is_empty() => {
                send_fragment(&self.socket, dest, msg_id, first, payload, &self.config, None)?;
                self.send_parallel(dest, msg_id, interior, payload)?;
                send_fragment(&self.socket, dest, msg_id, last, payload, &self.config, None)
            }
            _ => fragments.iter().try_for_each(|fragment| {
                send_fragment(&self.socket, dest, msg_id, fragment, payload, &self.config, None)
            }),
        }
    }

    /// Send the interior fragments from `workers` threads, each on its own
    /// socket. The first failure stops the others.
    fn send_parallel(
        &self,
        dest: SocketAddr,
        msg_id: u32,
        interior: &[Fragment],
        payload: &[u8],
    ) -> FpspinResult<()> {
        let workers = self.config.workers.min(interior.len());
        let local = SocketAddr::new(self.socket.local_addr()?.ip(), 0);
        let sockets = (0..workers)
            .map(|_| {
                let socket = UdpSocket::bind(local)?;
                socket.set_read_timeout(Some(self.config.ack_timeout))?;
                Ok(socket)
            })
            .collect::<FpspinResult<Vec<_>>>()?;

        let cancel = AtomicBool::new(false);
        let cancel = &cancel;
        let config = &self.config;

        let results = std::thread::scope(|s| {
            let handles = sockets
                .iter()
                .enumerate()
                .map(|(w, socket)| {
                    s.spawn(move || {
                        for fragment in interior.iter().skip(w).step_by(workers) {
                            if cancel.load(Ordering::Relaxed) {
                                break;
                            }
                            let guard = match config.failure_policy {
                                ParallelFailurePolicy::Drain => None,
                                ParallelFailurePolicy::Abort => Some(cancel),
                            };
                            if let Err(e) =
                                send_fragment(socket, dest, msg_id, fragment, payload, config, guard)
                            {
                                cancel.store(true, Ordering::Relaxed);
                                return Err(e);
                            }
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(FpspinError::SlmpSendFailed("sender thread panicked".into()))
                    })
                })
                .collect::<Vec<_>>()
        });

        results.into_iter().collect()
    }

    /// Release the channel socket.
    pub fn close(self) {
        log::debug!("slmp channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread::JoinHandle;

    /// How the test peer answers `SYN` fragments.
    #[derive(Clone, Copy)]
    enum Reply {
        Ack,
        NoAckBit,
        Silent,
    }

    /// Receive datagrams until `EOM`, returning headers and the reassembled
    /// message.
    fn spawn_peer(reply: Reply) -> (SocketAddr, JoinHandle<(Vec<SlmpHeader>, Vec<u8>)>) {
        spawn_peer_on("127.0.0.1:0", reply)
    }

    fn spawn_peer_on(
        local: &str,
        reply: Reply,
    ) -> (SocketAddr, JoinHandle<(Vec<SlmpHeader>, Vec<u8>)>) {
        let socket = UdpSocket::bind(local).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut headers = Vec::new();
            let mut message = Vec::new();
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                let header = SlmpHeader::decode(&buf[..len]).unwrap();
                let data = &buf[SLMP_HEADER_LEN..len];
                let end = header.offset as usize + data.len();
                if message.len() < end {
                    message.resize(end, 0);
                }
                message[header.offset as usize..end].copy_from_slice(data);
                headers.push(header);

                if header.flags.contains(SlmpFlags::SYN) {
                    let flags = match reply {
                        Reply::Ack => SlmpFlags::ACK,
                        Reply::NoAckBit => SlmpFlags::SYN,
                        Reply::Silent => break,
                    };
                    let ack = SlmpHeader::new(flags, header.msg_id, header.offset);
                    socket.send_to(&ack.encode(), from).unwrap();
                }
                if header.flags.contains(SlmpFlags::EOM) || !matches!(reply, Reply::Ack) {
                    break;
                }
            }
            (headers, message)
        });
        (addr, handle)
    }

    fn channel(config: SlmpConfig) -> SlmpChannel {
        SlmpChannel::bind("127.0.0.1:0".parse().unwrap(), config).unwrap()
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    proptest! {
        #[test]
        fn prop_fragment_plan(len in 1usize..20_000, size in 1usize..2_000, always_ack: bool) {
            let plan = plan_fragments(len, size, always_ack);
            prop_assert_eq!(plan.len(), len.div_ceil(size));
            prop_assert!(plan[0].flags.contains(SlmpFlags::SYN));
            let last = plan[plan.len() - 1];
            prop_assert_eq!(last.flags & (SlmpFlags::SYN | SlmpFlags::EOM), SlmpFlags::SYN | SlmpFlags::EOM);
            for (i, f) in plan.iter().enumerate() {
                prop_assert_eq!(f.offset as usize, i * size);
                prop_assert_eq!(f.flags.contains(SlmpFlags::EOM), i + 1 == plan.len());
                prop_assert_eq!(f.needs_ack(), always_ack || i == 0 || i + 1 == plan.len());
            }
            prop_assert_eq!(plan.iter().map(|f| f.len).sum::<usize>(), len);
        }
    }

    #[test]
    fn test_header_wire_format() {
        let header = SlmpHeader::new(SlmpFlags::SYN | SlmpFlags::EOM, 0x0102_0304, 0x0a0b_0c0d);
        assert_eq!(
            header.encode(),
            [0xc0, 0x00, 0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d]
        );
        assert_eq!(SlmpHeader::decode(&header.encode()).unwrap(), header);
        assert!(SlmpHeader::decode(&[0; 9]).is_err());
    }

    #[test]
    fn test_fragment_size_alignment() {
        assert_eq!(SLMP_MAX_FRAGMENT, 1462);
        assert_eq!(SlmpConfig::default().fragment_size().unwrap(), 1462);
        assert_eq!(
            SlmpConfig::default().with_alignment(64).fragment_size().unwrap(),
            1408
        );
        assert!(SlmpConfig::default().with_alignment(0).fragment_size().is_err());
        assert!(SlmpConfig::default().with_alignment(2048).fragment_size().is_err());
    }

    #[test]
    fn test_single_fragment() {
        let plan = plan_fragments(100, 1462, false);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].flags, SlmpFlags::SYN | SlmpFlags::EOM);
        assert!(plan_fragments(0, 1462, false).is_empty());
    }

    #[test]
    fn test_send_over_loopback() {
        let (peer, handle) = spawn_peer(Reply::Ack);
        let payload = message(5000);
        channel(SlmpConfig::default())
            .send_message_to(peer, 7, &payload)
            .unwrap();

        let (headers, received) = handle.join().unwrap();
        assert_eq!(received, payload);
        let offsets: Vec<u32> = headers.iter().map(|h| h.offset).collect();
        assert_eq!(offsets, vec![0, 1462, 2924, 4386]);
        assert!(headers.iter().all(|h| h.msg_id == 7));
    }

    #[test]
    fn test_send_to_bare_ip_uses_slmp_port() {
        let (peer, handle) = spawn_peer_on("127.0.0.1:9330", Reply::Ack);
        assert_eq!(peer.port(), SLMP_PORT);
        let payload = message(2000);
        channel(SlmpConfig::default())
            .send_message(Ipv4Addr::LOCALHOST.into(), 2, &payload)
            .unwrap();

        let (headers, received) = handle.join().unwrap();
        assert_eq!(received, payload);
        assert!(headers.iter().all(|h| h.msg_id == 2));
    }

    #[test]
    fn test_always_ack_holds_next_fragment_until_acked() {
        // Acknowledge the first fragment only, then record what else arrives.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let peer = socket.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let mut offsets = Vec::new();
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                let header = SlmpHeader::decode(&buf[..len]).unwrap();
                if offsets.is_empty() {
                    let ack = SlmpHeader::new(SlmpFlags::ACK, header.msg_id, header.offset);
                    socket.send_to(&ack.encode(), from).unwrap();
                }
                offsets.push(header.offset);
            }
            offsets
        });

        let config = SlmpConfig::default()
            .with_always_ack(true)
            .with_ack_timeout(Duration::from_millis(50));
        let err = channel(config)
            .send_message_to(peer, 6, &message(4 * 1462))
            .unwrap_err();
        assert!(matches!(
            err,
            FpspinError::SlmpAckTimeout {
                msg_id: 6,
                offset: 1462
            }
        ));
        assert_eq!(handle.join().unwrap(), vec![0, 1462]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_ack_wait_socket_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        // Non-blocking with nothing queued reads as a timeout.
        assert!(matches!(
            wait_ack(&socket, 1, 0),
            Err(FpspinError::SlmpAckTimeout { .. })
        ));

        // A refused datagram surfaces as a receive error.
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
        let gone = closed.local_addr().unwrap();
        drop(closed);
        socket.set_nonblocking(false).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        socket.connect(gone).unwrap();
        socket.send(&[0u8; 4]).unwrap();
        match wait_ack(&socket, 1, 0) {
            Err(FpspinError::SlmpSendFailed(msg)) => assert!(msg.contains("offset 0")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_always_ack_waits_for_every_fragment() {
        let (peer, handle) = spawn_peer(Reply::Ack);
        let payload = message(4000);
        channel(SlmpConfig::default().with_always_ack(true))
            .send_message_to(peer, 1, &payload)
            .unwrap();

        let (headers, received) = handle.join().unwrap();
        assert_eq!(received, payload);
        assert_eq!(headers.len(), 3);
        assert!(headers.iter().all(|h| h.flags.contains(SlmpFlags::SYN)));
    }

    #[test]
    fn test_ack_timeout() {
        let (peer, handle) = spawn_peer(Reply::Silent);
        let err = channel(SlmpConfig::default().with_ack_timeout(Duration::from_millis(20)))
            .send_message_to(peer, 3, &message(3000))
            .unwrap_err();
        assert!(matches!(
            err,
            FpspinError::SlmpAckTimeout {
                msg_id: 3,
                offset: 0
            }
        ));
        let (headers, _) = handle.join().unwrap();
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_reply_without_ack_bit() {
        let (peer, handle) = spawn_peer(Reply::NoAckBit);
        let err = channel(SlmpConfig::default())
            .send_message_to(peer, 4, &message(10))
            .unwrap_err();
        assert!(matches!(
            err,
            FpspinError::SlmpNoAck {
                msg_id: 4,
                offset: 0,
                ..
            }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_parallel_send() {
        let (peer, handle) = spawn_peer(Reply::Ack);
        let payload = message(10 * 1462 + 17);
        let config = SlmpConfig::default().with_parallel(3);
        assert!(config.parallel);
        channel(config).send_message_to(peer, 9, &payload).unwrap();

        let (headers, received) = handle.join().unwrap();
        assert_eq!(received, payload);
        assert_eq!(headers.len(), 11);
        assert_eq!(headers[0].offset, 0);
        assert_eq!(headers[10].flags, SlmpFlags::SYN | SlmpFlags::EOM);
    }

    #[test]
    fn test_parallel_failure_cancels() {
        // The peer acknowledges only the first fragment, then stays silent.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let peer = socket.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (len, from) = socket.recv_from(&mut buf).unwrap();
            let header = SlmpHeader::decode(&buf[..len]).unwrap();
            socket
                .send_to(&SlmpHeader::new(SlmpFlags::ACK, header.msg_id, 0).encode(), from)
                .unwrap();
            let mut received = 1;
            while socket.recv_from(&mut buf).is_ok() {
                received += 1;
            }
            received
        });

        let config = SlmpConfig::default()
            .with_always_ack(true)
            .with_parallel(2)
            .with_failure_policy(ParallelFailurePolicy::Abort);
        let err = channel(config)
            .send_message_to(peer, 5, &message(8 * 1462))
            .unwrap_err();
        assert!(matches!(err, FpspinError::SlmpAckTimeout { msg_id: 5, .. }));
        // first fragment and at most one interior per worker; never the last
        let received = handle.join().unwrap();
        assert!((2..=3).contains(&received), "peer saw {received} fragments");
    }

    #[test]
    fn test_new_binds_ephemeral_port() {
        let channel = SlmpChannel::new(SlmpConfig::default()).unwrap();
        assert_ne!(channel.local_addr().unwrap().port(), 0);
        channel.close();
    }
}
