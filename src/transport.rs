//! The dispatcher: socket pump, admission, demultiplexing, and cleanup.
//!
//! A `Transport` owns the UDP socket, the connection table, and every
//! process-wide admission table. All of them are mutated exclusively from
//! [`Transport::tick`], which drains the socket under a wall-clock
//! budget, routes each datagram through admission → codec → replay →
//! connection, drives retransmission and keep-alives, and runs the
//! periodic sweeps.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionControl, Verdict};
use crate::codec::{Compressor, Encryptor, NoCompression, NoEncryption};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionState, ConnectionStats, Delivery, Transforms};
use crate::error::{CloseReason, ProtocolError};
use crate::filter::PayloadInspector;
use crate::integrity::{
    self, HwidOutcome, HwidRegistry, IntegrityGate, IntegrityOracle, ResponseOutcome,
};
use crate::packet::{self, unix_now, ControlKind, PacketFlags, PacketHeader, MAX_SIZE};
use crate::qos::{Priority, ProfileCatalog, QosProfile, Reliability, PROFILE_SYSTEM};
use crate::simulator::{NetworkSimulator, SimVerdict};

const REPLAY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REPLAY_IDLE_THRESHOLD: Duration = Duration::from_secs(300);
const BAN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A fully validated, in-order application message.
pub struct ReceivedMessage {
    /// Decrypted, decompressed payload
    pub payload: Vec<u8>,
    /// Peer endpoint
    pub peer: SocketAddr,
    /// The peer's `ip:port` identity
    pub client_id: String,
    /// Header as received
    pub header: PacketHeader,
}

/// Application delivery callback.
pub type MessageCallback = Box<dyn FnMut(ReceivedMessage) + Send>;
/// Client-side hook answering integrity challenges.
pub type ChallengeResponder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Operational counters for the transport.
///
/// All fields are behind mutexes so monitoring threads may read them
/// while the dispatcher runs.
#[derive(Clone)]
pub struct TransportMetrics {
    /// Datagrams received from the socket
    pub packets_received_total: Arc<Mutex<u64>>,
    /// Frames written to the socket
    pub packets_sent_total: Arc<Mutex<u64>>,
    /// Bytes received from the socket
    pub bytes_received: Arc<Mutex<u64>>,
    /// Bytes written to the socket
    pub bytes_sent: Arc<Mutex<u64>>,
    /// Datagrams rejected by the admission gate
    pub packets_dropped_admission: Arc<Mutex<u64>>,
    /// Datagrams that failed frame validation
    pub frame_errors_total: Arc<Mutex<u64>>,
    /// Sequences rejected by replay windows
    pub replay_rejections_total: Arc<Mutex<u64>>,
    /// Bans issued
    pub bans_total: Arc<Mutex<u64>>,
    /// Failed integrity responses
    pub integrity_failures_total: Arc<Mutex<u64>>,
    /// Reliable frames declared lost
    pub packets_lost_total: Arc<Mutex<u64>>,
    /// Live connections
    pub connected_clients: Arc<Mutex<usize>>,
    /// Mean smoothed RTT across connections, milliseconds
    pub average_latency_ms: Arc<Mutex<u64>>,
    /// Lost-to-sent ratio across connections
    pub packet_loss: Arc<Mutex<f64>>,
}

impl TransportMetrics {
    fn new() -> Self {
        Self {
            packets_received_total: Arc::new(Mutex::new(0)),
            packets_sent_total: Arc::new(Mutex::new(0)),
            bytes_received: Arc::new(Mutex::new(0)),
            bytes_sent: Arc::new(Mutex::new(0)),
            packets_dropped_admission: Arc::new(Mutex::new(0)),
            frame_errors_total: Arc::new(Mutex::new(0)),
            replay_rejections_total: Arc::new(Mutex::new(0)),
            bans_total: Arc::new(Mutex::new(0)),
            integrity_failures_total: Arc::new(Mutex::new(0)),
            packets_lost_total: Arc::new(Mutex::new(0)),
            connected_clients: Arc::new(Mutex::new(0)),
            average_latency_ms: Arc::new(Mutex::new(0)),
            packet_loss: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn export_metrics(&self) -> String {
        format!(
            "gatelink_packets_received_total {{}} {}\n\
             gatelink_packets_sent_total {{}} {}\n\
             gatelink_bytes_received {{}} {}\n\
             gatelink_bytes_sent {{}} {}\n\
             gatelink_packets_dropped_admission {{}} {}\n\
             gatelink_frame_errors_total {{}} {}\n\
             gatelink_replay_rejections_total {{}} {}\n\
             gatelink_bans_total {{}} {}\n\
             gatelink_integrity_failures_total {{}} {}\n\
             gatelink_packets_lost_total {{}} {}\n\
             gatelink_connected_clients {{}} {}\n\
             gatelink_average_latency_ms {{}} {}\n\
             gatelink_packet_loss {{}} {}\n",
            self.packets_received_total.lock(),
            self.packets_sent_total.lock(),
            self.bytes_received.lock(),
            self.bytes_sent.lock(),
            self.packets_dropped_admission.lock(),
            self.frame_errors_total.lock(),
            self.replay_rejections_total.lock(),
            self.bans_total.lock(),
            self.integrity_failures_total.lock(),
            self.packets_lost_total.lock(),
            self.connected_clients.lock(),
            self.average_latency_ms.lock(),
            self.packet_loss.lock(),
        )
    }
}

fn keep_alive_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::Unreliable,
        priority: Priority::Lowest,
        max_retries: 0,
        retry_delay: Duration::ZERO,
        timeout: Duration::from_secs(1),
        compression: false,
        encryption: false,
        fragment_size: 512,
        ordering_channel: 0,
        sequencing_channel: 0,
    }
}

fn transmit(
    socket: &UdpSocket,
    simulator: &mut Option<NetworkSimulator>,
    metrics: &TransportMetrics,
    peer: SocketAddr,
    bytes: &[u8],
    now: Instant,
) {
    let send_once = |data: &[u8]| match socket.send_to(data, peer) {
        Ok(written) => {
            *metrics.packets_sent_total.lock() += 1;
            *metrics.bytes_sent.lock() += written as u64;
        }
        Err(e) => warn!(%peer, error = %e, "socket send failed"),
    };

    match simulator {
        Some(sim) => match sim.process(bytes, now) {
            SimVerdict::Drop => trace!(%peer, "simulator dropped outbound datagram"),
            SimVerdict::Pass {
                bytes,
                delay,
                duplicate,
            } => {
                if delay > Duration::ZERO {
                    trace!(%peer, ?delay, "ignoring simulator delay hint");
                }
                send_once(&bytes);
                if duplicate {
                    send_once(&bytes);
                }
            }
        },
        None => send_once(bytes),
    }
}

fn client_id_of(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// Multi-peer UDP transport with per-message delivery guarantees and
/// admission control.
///
/// Designed for single-threaded event-loop usage: either call
/// [`Transport::run`] to block on the internal tick loop, or drive
/// [`Transport::tick`] from your own scheduler.
pub struct Transport {
    /// Underlying UDP socket
    pub socket: Arc<UdpSocket>,
    /// Operational counters
    pub metrics: TransportMetrics,
    config: TransportConfig,
    profiles: ProfileCatalog,
    connections: HashMap<SocketAddr, Connection>,
    admission: AdmissionControl,
    integrity: IntegrityGate,
    oracle: Option<Box<dyn IntegrityOracle>>,
    hwids: Option<Box<dyn HwidRegistry>>,
    compressor: Box<dyn Compressor>,
    encryptor: Box<dyn Encryptor>,
    inspector: Option<Box<dyn PayloadInspector>>,
    simulator: Option<NetworkSimulator>,
    on_message: Option<MessageCallback>,
    challenge_responder: Option<ChallengeResponder>,
    last_replay_sweep: Instant,
    last_ban_sweep: Instant,
}

impl Transport {
    /// Validate the configuration, bind the socket, and assemble a
    /// transport with no codecs, oracle, or simulator installed.
    pub fn bind(config: TransportConfig) -> std::io::Result<Self> {
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

        let socket = UdpSocket::bind(("0.0.0.0", config.port))?;
        socket.set_nonblocking(true)?;
        info!(addr = ?socket.local_addr()?, "transport bound");

        let now = Instant::now();
        Ok(Self {
            socket: Arc::new(socket),
            metrics: TransportMetrics::new(),
            admission: AdmissionControl::new(&config),
            integrity: IntegrityGate::new(
                config.integrity_check_interval,
                config.max_integrity_failures,
            ),
            config,
            profiles: ProfileCatalog::new(),
            connections: HashMap::new(),
            oracle: None,
            hwids: None,
            compressor: Box::new(NoCompression),
            encryptor: Box::new(NoEncryption),
            inspector: None,
            simulator: None,
            on_message: None,
            challenge_responder: None,
            last_replay_sweep: now,
            last_ban_sweep: now,
        })
    }

    /// Register the application delivery callback.
    pub fn with_message_callback(mut self, callback: MessageCallback) -> Self {
        self.on_message = Some(callback);
        self
    }

    /// Install an integrity oracle, enabling the challenge/response gate
    /// for all sessions.
    pub fn with_integrity_oracle(mut self, oracle: Box<dyn IntegrityOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Install the hardware-id registry consulted during the integrity
    /// handshake.
    pub fn with_hwid_registry(mut self, registry: Box<dyn HwidRegistry>) -> Self {
        self.hwids = Some(registry);
        self
    }

    /// Install a compression codec.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Install an encryption codec.
    pub fn with_encryptor(mut self, encryptor: Box<dyn Encryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// Install the opt-in payload inspector.
    pub fn with_payload_inspector(mut self, inspector: Box<dyn PayloadInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Interpose a network-condition simulator on both directions.
    pub fn with_simulator(mut self, simulator: NetworkSimulator) -> Self {
        self.simulator = Some(simulator);
        self
    }

    /// Install the client-side hook answering integrity challenges.
    pub fn with_challenge_responder(mut self, responder: ChallengeResponder) -> Self {
        self.challenge_responder = Some(responder);
        self
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The QoS profile catalog.
    pub fn profiles(&self) -> &ProfileCatalog {
        &self.profiles
    }

    /// Mutable access to the QoS profile catalog.
    pub fn profiles_mut(&mut self) -> &mut ProfileCatalog {
        &mut self.profiles
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a peer currently has a connection.
    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.connections
            .get(&peer)
            .map(|c| c.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// Traffic counters for a peer.
    pub fn connection_stats(&self, peer: SocketAddr) -> Option<ConnectionStats> {
        self.connections.get(&peer).map(|c| c.stats)
    }

    /// Reliable frames a peer has in flight.
    pub fn reliable_pending(&self, peer: SocketAddr) -> usize {
        self.connections
            .get(&peer)
            .map(|c| c.reliable_pending())
            .unwrap_or(0)
    }

    /// Smoothed RTT for a peer.
    pub fn average_rtt(&self, peer: SocketAddr) -> Option<Duration> {
        self.connections.get(&peer).and_then(|c| c.average_rtt())
    }

    /// Block forever, pumping the socket at the configured tick rate.
    pub fn run(&mut self) {
        info!(tick_rate = self.config.tick_rate, "entering dispatcher loop");
        loop {
            self.tick();
            std::thread::sleep(self.config.tick_interval());
        }
    }

    /// One dispatcher tick: drain the socket, drive every connection,
    /// run due sweeps.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let now_secs = unix_now();
        self.pump_socket(now);
        self.drive_connections(now, now_secs);
        self.run_sweeps(now);
        self.refresh_gauges();
    }

    fn pump_socket(&mut self, tick_start: Instant) {
        let mut buf = vec![0u8; self.config.buffer_size.max(MAX_SIZE + 1)];
        let budget = self.config.tick_interval();
        let mut per_sender: HashMap<IpAddr, u32> = HashMap::new();

        loop {
            if tick_start.elapsed() > budget {
                debug!("tick drain budget exhausted");
                break;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let seen = per_sender.entry(from.ip()).or_insert(0);
                    *seen += 1;
                    if *seen > self.config.packet_flood_threshold {
                        trace!(%from, "per-tick flood threshold exceeded, discarding");
                        continue;
                    }
                    let data = buf[..len].to_vec();
                    self.handle_datagram(data, from);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "socket receive failed");
                    break;
                }
            }
        }
    }

    /// Feed one raw datagram into the receive pipeline, as if it had
    /// arrived on the socket.
    pub fn handle_datagram(&mut self, data: Vec<u8>, from: SocketAddr) {
        let started = Instant::now();

        let (data, copies) = match &mut self.simulator {
            Some(sim) => match sim.process(&data, started) {
                SimVerdict::Drop => {
                    trace!(%from, "simulator dropped inbound datagram");
                    return;
                }
                SimVerdict::Pass {
                    bytes, duplicate, ..
                } => (bytes, 1 + duplicate as usize),
            },
            None => (data, 1),
        };

        for _ in 0..copies {
            self.process_inbound(&data, from, started);
        }
    }

    fn process_inbound(&mut self, data: &[u8], from: SocketAddr, started: Instant) {
        *self.metrics.packets_received_total.lock() += 1;
        *self.metrics.bytes_received.lock() += data.len() as u64;

        let is_new = !self.connections.contains_key(&from);
        let queued = self
            .connections
            .get(&from)
            .map(|c| c.queued_packets())
            .unwrap_or(0);

        match self.admission.screen(from, data.len(), is_new, queued, started) {
            Verdict::Accept => {}
            Verdict::Drop(reason) => {
                *self.metrics.packets_dropped_admission.lock() += 1;
                trace!(%from, ?reason, "admission dropped datagram");
                return;
            }
            Verdict::Banned(reason) => {
                *self.metrics.bans_total.lock() += 1;
                self.destroy_connection(from, CloseReason::Banned(reason), false);
                return;
            }
        }

        let now_secs = unix_now();
        let (header, payload) = match packet::decode(data, now_secs) {
            Ok(decoded) => decoded,
            Err(e) => {
                *self.metrics.frame_errors_total.lock() += 1;
                debug!(%from, error = %e, status = ?PacketFlags::for_error(&e), "dropping invalid frame");
                return;
            }
        };

        if is_new {
            if self.connections.len() >= self.config.max_connections {
                debug!(%from, "connection table full, ignoring new peer");
                return;
            }
            self.admission.note_connection_open(from.ip());
            self.connections.insert(
                from,
                Connection::new(from, self.config.fragment_timeout, started),
            );
            debug!(%from, "connection created");
        }

        let client_id = client_id_of(&from);
        if self.oracle.is_some() {
            if self.integrity.needs_challenge(&client_id, started) {
                self.issue_challenge(from, &client_id, started, now_secs);
            }
            // Application data waits for verification; control packets and
            // pure acknowledgements keep flowing so the handshake itself
            // can complete.
            let pure_ack =
                header.flags.contains(PacketFlags::HAS_ACKS) && header.data_length == 0;
            if !self.integrity.is_verified(&client_id, started) && header.control == 0 && !pure_ack
            {
                trace!(%from, "withholding application data from unverified peer");
                return;
            }
        }

        if let Some(inspector) = &self.inspector {
            if header.control == 0 && !payload.is_empty() {
                if let Some(why) = inspector.inspect(&payload) {
                    let reason = format!("Suspicious payload: {}", why);
                    *self.metrics.bans_total.lock() += 1;
                    self.admission.ban(&from, &reason, started);
                    self.destroy_connection(from, CloseReason::Banned(reason), false);
                    return;
                }
            }
        }

        if started.elapsed() > self.config.max_packet_processing_time {
            warn!(%from, "packet processing deadline exceeded, aborting packet");
            return;
        }

        let outcome = {
            let transforms = Transforms {
                compressor: self.compressor.as_ref(),
                encryptor: self.encryptor.as_ref(),
            };
            let conn = match self.connections.get_mut(&from) {
                Some(conn) => conn,
                None => return,
            };

            if let Err(e) = conn.check_replay(&header, started) {
                *self.metrics.replay_rejections_total.lock() += 1;
                debug!(%from, error = %e, sequence = header.sequence, "replay window rejected packet");
                return;
            }

            let outcome = match conn.receive(header, payload, &transforms, started) {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(%from, error = %e, "receive pipeline error, packet aborted");
                    return;
                }
            };

            // Acknowledgements go out before anything is delivered.
            for seq in &outcome.acks {
                match conn.make_ack(*seq, started, now_secs) {
                    Ok(frame) => transmit(
                        &self.socket,
                        &mut self.simulator,
                        &self.metrics,
                        from,
                        &frame,
                        started,
                    ),
                    Err(e) => debug!(%from, error = %e, "failed to build ack"),
                }
            }
            outcome
        };

        for delivery in outcome.deliveries {
            match delivery.header.control_kind() {
                None => self.deliver(from, delivery),
                Some(kind) => self.handle_control(from, kind, &delivery, started, now_secs),
            }
            if self.connections.get(&from).is_none() {
                break;
            }
        }
    }

    fn deliver(&mut self, from: SocketAddr, delivery: Delivery) {
        if let Some(callback) = &mut self.on_message {
            callback(ReceivedMessage {
                payload: delivery.payload,
                peer: from,
                client_id: client_id_of(&from),
                header: delivery.header,
            });
        }
    }

    fn issue_challenge(
        &mut self,
        from: SocketAddr,
        client_id: &str,
        now: Instant,
        now_secs: u32,
    ) {
        let challenge = match self.oracle.as_mut() {
            Some(oracle) => self.integrity.issue(client_id, oracle.as_mut(), now),
            None => return,
        };
        debug!(%from, "issuing integrity challenge");
        self.send_control(from, ControlKind::IntegrityChallenge, &challenge, now, now_secs);
    }

    // Control traffic rides the SYSTEM profile downgraded to plain
    // reliable delivery: a control packet must get through even when the
    // peer's ordered stream is stalled on withheld or in-flight data.
    fn control_profile(&self) -> QosProfile {
        let mut profile = self.profiles.get(PROFILE_SYSTEM).clone();
        profile.reliability = Reliability::Reliable;
        profile
    }

    fn send_control(
        &mut self,
        peer: SocketAddr,
        kind: ControlKind,
        payload: &[u8],
        now: Instant,
        now_secs: u32,
    ) {
        let profile = self.control_profile();
        let transforms = Transforms {
            compressor: self.compressor.as_ref(),
            encryptor: self.encryptor.as_ref(),
        };
        let frames = match self.connections.get_mut(&peer) {
            Some(conn) => conn.send(payload, &profile, kind as u8, &transforms, now, now_secs),
            None => return,
        };
        match frames {
            Ok(frames) => {
                for frame in &frames {
                    transmit(
                        &self.socket,
                        &mut self.simulator,
                        &self.metrics,
                        peer,
                        frame,
                        now,
                    );
                }
            }
            Err(e) => debug!(%peer, error = %e, "failed to encode control packet"),
        }
    }

    fn handle_control(
        &mut self,
        from: SocketAddr,
        kind: ControlKind,
        delivery: &Delivery,
        now: Instant,
        now_secs: u32,
    ) {
        match kind {
            ControlKind::Connect => {
                if let Some(conn) = self.connections.get_mut(&from) {
                    conn.state = ConnectionState::Connected;
                    debug!(%from, "peer connected");
                }
            }
            ControlKind::Disconnect => {
                info!(%from, "peer disconnected");
                self.destroy_connection(from, CloseReason::PeerDisconnect, true);
            }
            ControlKind::KeepAlive => {
                trace!(%from, "keep-alive");
            }
            ControlKind::IntegrityChallenge => {
                let response = match &mut self.challenge_responder {
                    Some(responder) => responder(&delivery.payload),
                    None => {
                        debug!(%from, "received integrity challenge with no responder installed");
                        return;
                    }
                };
                let encoded = integrity::encode_response(&response, None);
                self.send_control(from, ControlKind::IntegrityResponse, &encoded, now, now_secs);
            }
            ControlKind::IntegrityResponse => {
                self.handle_integrity_response(from, &delivery.payload, now);
            }
        }
    }

    fn handle_integrity_response(&mut self, from: SocketAddr, payload: &[u8], now: Instant) {
        let oracle = match self.oracle.as_ref() {
            Some(oracle) => oracle,
            None => return,
        };
        let client_id = client_id_of(&from);
        let (response, hwid) = match integrity::decode_response(payload) {
            Some(parts) => parts,
            None => (payload, None),
        };

        match self
            .integrity
            .handle_response(&client_id, response, oracle.as_ref(), now)
        {
            ResponseOutcome::Accepted => {
                debug!(%from, "integrity verified");
                if self.config.enable_hwid_ban {
                    if let Some(hwid) = hwid {
                        self.gate_hwid(from, &client_id, hwid, now);
                    }
                }
            }
            ResponseOutcome::NoPending => {
                trace!(%from, "integrity response without pending challenge, dropping");
            }
            ResponseOutcome::Failed(count) => {
                *self.metrics.integrity_failures_total.lock() += 1;
                debug!(%from, failures = count, "integrity challenge failed");
            }
            ResponseOutcome::BudgetExhausted => {
                *self.metrics.integrity_failures_total.lock() += 1;
                *self.metrics.bans_total.lock() += 1;
                self.admission.ban(&from, "integrity violations", now);
                self.destroy_connection(from, CloseReason::IntegrityViolation, false);
            }
        }
    }

    fn gate_hwid(&mut self, from: SocketAddr, client_id: &str, hwid: &str, now: Instant) {
        let registry = match self.hwids.as_ref() {
            Some(registry) => registry,
            None => return,
        };
        match self.integrity.gate_hwid(
            client_id,
            hwid,
            registry.as_ref(),
            self.config.allow_virtual_machine,
        ) {
            HwidOutcome::Admitted => {}
            HwidOutcome::Banned | HwidOutcome::VirtualEnvironment => {
                let reason = "Hardware id rejected".to_string();
                *self.metrics.bans_total.lock() += 1;
                self.admission.ban(&from, &reason, now);
                self.destroy_connection(from, CloseReason::Banned(reason), false);
            }
        }
    }

    /// Open a session to a peer: sends a reliable CONNECT and moves the
    /// connection to `Connecting` until the peer acknowledges it.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<(), ProtocolError> {
        let now = Instant::now();
        let now_secs = unix_now();
        if !self.connections.contains_key(&peer) {
            if self.connections.len() >= self.config.max_connections {
                return Err(ProtocolError::InvalidState);
            }
            self.admission.note_connection_open(peer.ip());
            self.connections.insert(
                peer,
                Connection::new(peer, self.config.fragment_timeout, now),
            );
        }

        let profile = self.control_profile();
        let transforms = Transforms {
            compressor: self.compressor.as_ref(),
            encryptor: self.encryptor.as_ref(),
        };
        let conn = self.connections.get_mut(&peer).expect("connection present");
        let frames = conn.begin_connect(&profile, &transforms, now, now_secs)?;
        for frame in &frames {
            transmit(
                &self.socket,
                &mut self.simulator,
                &self.metrics,
                peer,
                frame,
                now,
            );
        }
        Ok(())
    }

    /// Send a payload to a peer under a named profile; unknown names
    /// fall back to `DEFAULT`. A connection is created implicitly.
    pub fn send_to(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        profile_name: &str,
    ) -> Result<(), ProtocolError> {
        let now = Instant::now();
        let now_secs = unix_now();
        if !self.connections.contains_key(&peer) {
            if self.connections.len() >= self.config.max_connections {
                return Err(ProtocolError::InvalidState);
            }
            self.admission.note_connection_open(peer.ip());
            self.connections.insert(
                peer,
                Connection::new(peer, self.config.fragment_timeout, now),
            );
        }

        let profile = self.profiles.get(profile_name).clone();
        let transforms = Transforms {
            compressor: self.compressor.as_ref(),
            encryptor: self.encryptor.as_ref(),
        };
        let conn = self.connections.get_mut(&peer).expect("connection present");
        let frames = conn.send(payload, &profile, 0, &transforms, now, now_secs)?;
        for frame in &frames {
            transmit(
                &self.socket,
                &mut self.simulator,
                &self.metrics,
                peer,
                frame,
                now,
            );
        }
        Ok(())
    }

    /// Send a payload to every connected peer.
    pub fn broadcast(&mut self, payload: &[u8], profile_name: &str) {
        let peers: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.send_to(peer, payload, profile_name) {
                debug!(%peer, error = %e, "broadcast send failed");
            }
        }
    }

    /// Disconnect a peer: notify it reliably, then flush all of its
    /// state. Subsequent packets from the address are treated as a new,
    /// unknown peer.
    pub fn disconnect(&mut self, peer: SocketAddr, reason: CloseReason) {
        let now = Instant::now();
        let now_secs = unix_now();
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.state = ConnectionState::Disconnecting;
        }
        self.send_control(
            peer,
            ControlKind::Disconnect,
            reason.to_string().as_bytes(),
            now,
            now_secs,
        );
        self.destroy_connection(peer, reason, true);
    }

    fn destroy_connection(&mut self, peer: SocketAddr, reason: CloseReason, cooldown: bool) {
        let conn = match self.connections.remove(&peer) {
            Some(conn) => conn,
            None => return,
        };
        let client_id = conn.client_id();
        self.admission.note_connection_closed(peer.ip());
        if cooldown {
            self.admission.note_disconnect(peer.ip(), Instant::now());
        }

        let banned = matches!(
            reason,
            CloseReason::Banned(_) | CloseReason::IntegrityViolation
        );
        if banned && self.config.enable_hwid_ban {
            if let Some(registry) = self.hwids.as_mut() {
                if let Some(hwid) = self.integrity.hwid_of(&client_id) {
                    registry.ban_hwid(hwid, &reason.to_string(), self.config.hwid_ban_duration);
                }
            }
        }
        self.integrity.forget(&client_id);
        info!(%peer, %reason, "connection destroyed");
    }

    fn drive_connections(&mut self, now: Instant, now_secs: u32) {
        let mut timed_out = Vec::new();
        let mut keep_alive = Vec::new();

        for (peer, conn) in self.connections.iter_mut() {
            let (resend, lost) = conn.retransmit_due(now);
            if lost > 0 {
                *self.metrics.packets_lost_total.lock() += lost as u64;
            }
            for frame in &resend {
                transmit(
                    &self.socket,
                    &mut self.simulator,
                    &self.metrics,
                    *peer,
                    frame,
                    now,
                );
            }

            conn.sweep_fragments(now);

            if conn.timed_out(now, self.config.connection_timeout)
                || conn.connect_timed_out(now, self.config.connection_timeout)
            {
                timed_out.push(*peer);
            } else if conn.keep_alive_due(now, self.config.keep_alive_interval) {
                keep_alive.push(*peer);
            }
        }

        for peer in timed_out {
            self.destroy_connection(peer, CloseReason::Timeout, false);
        }

        let profile = keep_alive_profile();
        for peer in keep_alive {
            let transforms = Transforms {
                compressor: self.compressor.as_ref(),
                encryptor: self.encryptor.as_ref(),
            };
            let frames = match self.connections.get_mut(&peer) {
                Some(conn) => {
                    conn.send(&[], &profile, ControlKind::KeepAlive as u8, &transforms, now, now_secs)
                }
                None => continue,
            };
            if let Ok(frames) = frames {
                for frame in &frames {
                    transmit(
                        &self.socket,
                        &mut self.simulator,
                        &self.metrics,
                        peer,
                        frame,
                        now,
                    );
                }
            }
        }
    }

    fn run_sweeps(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_replay_sweep) >= REPLAY_SWEEP_INTERVAL {
            for conn in self.connections.values_mut() {
                conn.sweep_replay(now, REPLAY_IDLE_THRESHOLD);
            }
            self.last_replay_sweep = now;
        }
        if now.saturating_duration_since(self.last_ban_sweep) >= BAN_SWEEP_INTERVAL {
            self.admission.sweep(now);
            self.integrity.sweep(now);
            self.last_ban_sweep = now;
        }
    }

    fn refresh_gauges(&mut self) {
        *self.metrics.connected_clients.lock() = self.connections.len();

        let rtts: Vec<Duration> = self
            .connections
            .values()
            .filter_map(|c| c.average_rtt())
            .collect();
        if !rtts.is_empty() {
            let total: Duration = rtts.iter().sum();
            *self.metrics.average_latency_ms.lock() = (total / rtts.len() as u32).as_millis() as u64;
        }

        let (sent, lost) = self.connections.values().fold((0u64, 0u64), |acc, c| {
            (acc.0 + c.stats.packets_sent, acc.1 + c.stats.packets_lost)
        });
        if sent > 0 {
            *self.metrics.packet_loss.lock() = lost as f64 / sent as f64;
        }
    }
}
