//! Per-peer connection state: reliability, ordering, fragmentation, and
//! replay tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::codec::{Compressor, Encryptor};
use crate::error::{ProtocolError, ReplayError};
use crate::fragment::{self, Assembler};
use crate::packet::{self, ControlKind, PacketFlags, PacketHeader, HEADER_SIZE};
use crate::qos::{Priority, QosProfile, Reliability};
use crate::replay::ReplayWindow;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// CONNECT sent, awaiting its acknowledgement
    Connecting,
    /// Session established
    Connected,
    /// Teardown in progress
    Disconnecting,
}

/// A reliable packet awaiting acknowledgement.
pub struct ReliableEntry {
    /// Encoded frame, resent verbatim
    pub bytes: Vec<u8>,
    /// Retransmissions performed so far
    pub attempts: u32,
    /// When the frame was first transmitted
    pub sent_at: Instant,
    /// When the next retransmission is due
    pub next_attempt_at: Instant,
    max_retries: u32,
    retry_delay: Duration,
}

/// Traffic counters for one connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionStats {
    /// Bytes transmitted, headers included
    pub bytes_sent: u64,
    /// Bytes received, headers included
    pub bytes_received: u64,
    /// Frames transmitted
    pub packets_sent: u64,
    /// Frames received
    pub packets_received: u64,
    /// Reliable frames declared lost
    pub packets_lost: u64,
    /// `packets_lost / packets_sent`
    pub loss_rate: f64,
}

/// Payload transforms in effect for a connection.
pub struct Transforms<'a> {
    /// Compression codec
    pub compressor: &'a dyn Compressor,
    /// Encryption codec
    pub encryptor: &'a dyn Encryptor,
}

/// A validated, in-order packet ready for the application (or, for
/// control opcodes, the dispatcher).
#[derive(Debug)]
pub struct Delivery {
    /// Header as received (fragment flags cleared for assembled payloads)
    pub header: PacketHeader,
    /// Decrypted, decompressed payload
    pub payload: Vec<u8>,
}

/// Result of feeding one inbound packet through the reliability layer.
#[derive(Default, Debug)]
pub struct ReceiveOutcome {
    /// Sequences to acknowledge, in order, before any delivery happens
    pub acks: Vec<u32>,
    /// Packets released to the layer above
    pub deliveries: Vec<Delivery>,
}

/// State for a single `(ip, port)` peer.
///
/// The connection owns its reliable queue, out-of-order buffer, fragment
/// assembler, and replay window; nothing else mutates them.
pub struct Connection {
    /// Peer endpoint
    pub remote: SocketAddr,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Traffic counters
    pub stats: ConnectionStats,
    next_sequence: u32,
    last_allocated: u32,
    last_delivered: u32,
    reliable: BTreeMap<u32, ReliableEntry>,
    out_of_order: BTreeMap<u32, Delivery>,
    delivered_ahead: BTreeSet<u32>,
    assembler: Assembler,
    replay: ReplayWindow,
    rtt_avg: Option<Duration>,
    rtt_last: Option<Duration>,
    connect_sequence: Option<u32>,
    created_at: Instant,
    last_recv: Instant,
    last_send: Instant,
}

impl Connection {
    /// Create a connection in the `Connected` state (the server side of
    /// an implicitly admitted peer).
    pub fn new(remote: SocketAddr, fragment_timeout: Duration, now: Instant) -> Self {
        Self {
            remote,
            state: ConnectionState::Connected,
            stats: ConnectionStats::default(),
            next_sequence: 1,
            last_allocated: 0,
            last_delivered: 0,
            reliable: BTreeMap::new(),
            out_of_order: BTreeMap::new(),
            delivered_ahead: BTreeSet::new(),
            assembler: Assembler::new(fragment_timeout),
            replay: ReplayWindow::new(now),
            rtt_avg: None,
            rtt_last: None,
            connect_sequence: None,
            created_at: now,
            last_recv: now,
            last_send: now,
        }
    }

    /// The `ip:port` identity of the peer.
    pub fn client_id(&self) -> String {
        format!("{}:{}", self.remote.ip(), self.remote.port())
    }

    fn allocate_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        if self.next_sequence == 0 {
            self.next_sequence = 1;
        }
        self.last_allocated = seq;
        seq
    }

    /// Run an inbound sequence through the replay window.
    ///
    /// Fragment frames are exempt: their sequences carry group/index
    /// structure, and the assembler deduplicates by index instead.
    pub fn check_replay(
        &mut self,
        header: &PacketHeader,
        now: Instant,
    ) -> Result<(), ReplayError> {
        if header.flags.contains(PacketFlags::IS_FRAGMENT) {
            return Ok(());
        }
        self.replay.check(header.sequence, now)
    }

    /// Encode and queue an outbound payload under a profile.
    ///
    /// Returns the frames to transmit; reliable classes are additionally
    /// entered into the retransmission queue.
    pub fn send(
        &mut self,
        payload: &[u8],
        profile: &QosProfile,
        control: u8,
        transforms: &Transforms<'_>,
        now: Instant,
        now_secs: u32,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut flags = PacketFlags::HAS_TIMESTAMP | PacketFlags::HAS_QOS;
        let mut body = payload.to_vec();
        if profile.compression {
            body = transforms.compressor.compress(&body)?;
            flags.insert(PacketFlags::COMPRESSED);
        }
        if profile.encryption {
            body = transforms.encryptor.encrypt(&body)?;
            flags.insert(PacketFlags::ENCRYPTED);
        }

        let base = self.allocate_sequence();
        let mut frames = Vec::new();

        if profile.needs_fragmentation(body.len()) {
            let chunks = fragment::split(&body, profile.fragment_size)?;
            let group = fragment::group_of(base);
            let count = chunks.len() as u16;
            for (i, chunk) in chunks.iter().enumerate() {
                let index = i as u16 + 1;
                let mut header = PacketHeader {
                    sequence: fragment::fragment_sequence(group, index),
                    ack_sequence: 0,
                    data_length: 0,
                    flags: flags | PacketFlags::IS_FRAGMENT,
                    reliability: profile.reliability,
                    priority: profile.priority,
                    control,
                    timestamp: now_secs,
                };
                if index == count {
                    header.flags.insert(PacketFlags::LAST_FRAGMENT);
                }
                frames.push(self.encode_outbound(header, chunk, profile, now, now_secs)?);
            }
        } else {
            let header = PacketHeader {
                sequence: base,
                ack_sequence: 0,
                data_length: 0,
                flags,
                reliability: profile.reliability,
                priority: profile.priority,
                control,
                timestamp: now_secs,
            };
            frames.push(self.encode_outbound(header, &body, profile, now, now_secs)?);
        }

        Ok(frames)
    }

    fn encode_outbound(
        &mut self,
        header: PacketHeader,
        body: &[u8],
        profile: &QosProfile,
        now: Instant,
        now_secs: u32,
    ) -> Result<Vec<u8>, ProtocolError> {
        let frame = packet::encode(header, body, now_secs)?;
        if profile.reliability.is_reliable() {
            self.reliable.insert(
                header.sequence,
                ReliableEntry {
                    bytes: frame.clone(),
                    attempts: 0,
                    sent_at: now,
                    next_attempt_at: now,
                    max_retries: profile.max_retries,
                    retry_delay: profile.retry_delay,
                },
            );
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.last_send = now;
        Ok(frame)
    }

    /// Send a CONNECT and move to `Connecting`; the peer's acknowledgement
    /// completes the transition to `Connected`.
    pub fn begin_connect(
        &mut self,
        profile: &QosProfile,
        transforms: &Transforms<'_>,
        now: Instant,
        now_secs: u32,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.state = ConnectionState::Connecting;
        let frames = self.send(&[], profile, ControlKind::Connect as u8, transforms, now, now_secs)?;
        self.connect_sequence = Some(self.last_allocated);
        Ok(frames)
    }

    /// Build a pure acknowledgement frame for `ack_of`.
    pub fn make_ack(
        &mut self,
        ack_of: u32,
        now: Instant,
        now_secs: u32,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut header = PacketHeader::data(
            self.allocate_sequence(),
            Reliability::Unreliable,
            Priority::System,
            now_secs,
        );
        header.flags.insert(PacketFlags::HAS_ACKS);
        header.ack_sequence = ack_of;
        let frame = packet::encode(header, &[], now_secs)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.last_send = now;
        Ok(frame)
    }

    /// Feed one validated inbound packet through acknowledgement,
    /// reassembly, and the reliability policy.
    pub fn receive(
        &mut self,
        header: PacketHeader,
        payload: Vec<u8>,
        transforms: &Transforms<'_>,
        now: Instant,
    ) -> Result<ReceiveOutcome, ProtocolError> {
        self.stats.packets_received += 1;
        self.stats.bytes_received += (HEADER_SIZE + payload.len()) as u64;
        self.last_recv = now;

        let mut out = ReceiveOutcome::default();

        if header.flags.contains(PacketFlags::HAS_ACKS) {
            self.handle_ack(header.ack_sequence, now);
            // A pure acknowledgement carries nothing further.
            if payload.is_empty() && header.control == 0 {
                return Ok(out);
            }
        }

        self.process(header, payload, false, transforms, &mut out, now)?;
        Ok(out)
    }

    fn process(
        &mut self,
        header: PacketHeader,
        payload: Vec<u8>,
        from_assembly: bool,
        transforms: &Transforms<'_>,
        out: &mut ReceiveOutcome,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        if header.flags.contains(PacketFlags::IS_FRAGMENT) && !from_assembly {
            if header.reliability.is_reliable() {
                out.acks.push(header.sequence);
            }
            let is_last = header.flags.contains(PacketFlags::LAST_FRAGMENT);
            if let Some(assembled) = self.assembler.insert(
                header.fragment_group(),
                header.fragment_index(),
                is_last,
                payload,
                now,
            )? {
                let mut inner = header;
                inner.flags.remove(PacketFlags::IS_FRAGMENT | PacketFlags::LAST_FRAGMENT);
                // The assembled packet re-enters under the fragment group,
                // which is the low half of the original sequence.
                inner.sequence = header.fragment_group() as u32;
                self.process(inner, assembled, true, transforms, out, now)?;
            }
            return Ok(());
        }

        let mut body = payload;
        if header.flags.contains(PacketFlags::ENCRYPTED) {
            body = transforms.encryptor.decrypt(&body)?;
        }
        if header.flags.contains(PacketFlags::COMPRESSED) {
            body = transforms.compressor.decompress(&body)?;
        }

        let seq = header.sequence;
        match header.reliability {
            Reliability::Unreliable => {
                out.deliveries.push(Delivery { header, payload: body });
                self.note_delivered(seq, out);
            }
            Reliability::UnreliableSequenced => {
                if seq > self.last_delivered {
                    self.last_delivered = seq;
                    out.deliveries.push(Delivery { header, payload: body });
                }
            }
            Reliability::Reliable => {
                if !from_assembly {
                    out.acks.push(seq);
                }
                out.deliveries.push(Delivery { header, payload: body });
                self.note_delivered(seq, out);
            }
            Reliability::ReliableOrdered => {
                if !from_assembly {
                    out.acks.push(seq);
                }
                if seq == self.last_delivered.wrapping_add(1) {
                    self.last_delivered = seq;
                    out.deliveries.push(Delivery { header, payload: body });
                    self.drain_cursor(out);
                } else if seq > self.last_delivered {
                    self.out_of_order.insert(seq, Delivery { header, payload: body });
                }
            }
            Reliability::ReliableSequenced => {
                if !from_assembly {
                    out.acks.push(seq);
                }
                if seq > self.last_delivered {
                    self.last_delivered = seq;
                    out.deliveries.push(Delivery { header, payload: body });
                }
            }
        }
        Ok(())
    }

    // The ordered cursor tracks contiguous deliveries of every class, so
    // an interleaved unordered packet (a CONNECT, a keep-alive) does not
    // leave a permanent hole in front of an ordered stream.
    fn note_delivered(&mut self, seq: u32, out: &mut ReceiveOutcome) {
        if seq == self.last_delivered.wrapping_add(1) {
            self.last_delivered = seq;
            self.drain_cursor(out);
        } else if seq > self.last_delivered {
            self.delivered_ahead.insert(seq);
            if self.delivered_ahead.len() > 1024 {
                self.delivered_ahead.pop_first();
            }
        }
    }

    fn drain_cursor(&mut self, out: &mut ReceiveOutcome) {
        loop {
            let next = self.last_delivered.wrapping_add(1);
            if self.delivered_ahead.remove(&next) {
                self.last_delivered = next;
                continue;
            }
            if let Some(buffered) = self.out_of_order.remove(&next) {
                self.last_delivered = next;
                out.deliveries.push(buffered);
                continue;
            }
            break;
        }
        while let Some(&stale) = self.delivered_ahead.first() {
            if stale <= self.last_delivered {
                self.delivered_ahead.remove(&stale);
            } else {
                break;
            }
        }
    }

    fn handle_ack(&mut self, ack_sequence: u32, now: Instant) {
        if let Some(entry) = self.reliable.remove(&ack_sequence) {
            let sample = now.saturating_duration_since(entry.sent_at);
            self.record_rtt(sample);
        }
        if self.state == ConnectionState::Connecting
            && self.connect_sequence == Some(ack_sequence)
        {
            self.state = ConnectionState::Connected;
            self.connect_sequence = None;
        }
    }

    fn record_rtt(&mut self, sample: Duration) {
        self.rtt_last = Some(sample);
        self.rtt_avg = Some(match self.rtt_avg {
            Some(avg) => Duration::from_secs_f64(
                avg.as_secs_f64() * 0.875 + sample.as_secs_f64() * 0.125,
            ),
            None => sample,
        });
    }

    /// Smoothed round-trip estimate.
    pub fn average_rtt(&self) -> Option<Duration> {
        self.rtt_avg
    }

    /// Most recent round-trip sample.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.rtt_last
    }

    /// Retransmit due reliable entries with exponential backoff.
    ///
    /// Returns the frames to resend and how many entries were declared
    /// lost this pass.
    pub fn retransmit_due(&mut self, now: Instant) -> (Vec<Vec<u8>>, u32) {
        let due: Vec<u32> = self
            .reliable
            .iter()
            .filter(|(_, e)| now >= e.next_attempt_at)
            .map(|(&seq, _)| seq)
            .collect();

        let mut resend = Vec::new();
        let mut lost = 0u32;
        for seq in due {
            let entry = self.reliable.get_mut(&seq).expect("entry present");
            entry.attempts += 1;
            if entry.attempts > entry.max_retries {
                self.reliable.remove(&seq);
                lost += 1;
            } else {
                entry.next_attempt_at =
                    now + entry.retry_delay * 2u32.saturating_pow(entry.attempts.min(16));
                resend.push(entry.bytes.clone());
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += entry.bytes.len() as u64;
            }
        }
        if !resend.is_empty() {
            self.last_send = now;
        }
        if lost > 0 {
            self.stats.packets_lost += lost as u64;
            if self.stats.packets_sent > 0 {
                self.stats.loss_rate =
                    self.stats.packets_lost as f64 / self.stats.packets_sent as f64;
            }
        }
        (resend, lost)
    }

    /// Whether a keep-alive is due on this link.
    pub fn keep_alive_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_send) >= interval
    }

    /// Whether the peer has been silent past the timeout.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_recv) >= timeout
    }

    /// Whether a `Connecting` handshake has been pending past the timeout.
    pub fn connect_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ConnectionState::Connecting
            && now.saturating_duration_since(self.created_at) >= timeout
    }

    /// Buffered inbound packets (out-of-order entries plus pending
    /// fragments); bounded by the admission queue cap.
    pub fn queued_packets(&self) -> usize {
        self.out_of_order.len() + self.assembler.pending()
    }

    /// Reliable entries awaiting acknowledgement.
    pub fn reliable_pending(&self) -> usize {
        self.reliable.len()
    }

    /// Evict expired fragment groups.
    pub fn sweep_fragments(&mut self, now: Instant) -> usize {
        self.assembler.sweep(now)
    }

    /// Reset the replay window if it has been idle past `threshold`.
    pub fn sweep_replay(&mut self, now: Instant, threshold: Duration) {
        if self.replay.idle(now) > threshold {
            self.replay.reset(now);
        }
    }
}
