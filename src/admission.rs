//! Admission control: every inbound datagram passes this gate before any
//! protocol state is touched.
//!
//! The gate owns the process-wide abuse tables: escalating bans keyed by
//! `ip:port`, and per-IP connection caps, connection-burst windows, and
//! two-level packet token buckets. Frame validity is not its concern;
//! only volume and provenance.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::TransportConfig;

/// How long an expired ban keeps its holder on the stricter post-ban
/// packet allowance.
const RECENT_UNBAN_RETENTION: Duration = Duration::from_secs(3600);

/// An active (or not yet swept) ban.
#[derive(Debug, Clone)]
pub struct BanEntry {
    /// When the ban lapses
    pub expires_at: Instant,
    /// Why the ban was issued
    pub reason: String,
    /// How many times this address has been banned
    pub ban_count: u32,
}

struct BurstBucket {
    count: u32,
    window_start: Instant,
}

struct PacketBucket {
    count: u32,
    burst_count: u32,
    window_start: Instant,
    burst_start: Instant,
}

/// Why a datagram was silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Sender is banned
    Banned,
    /// Sender reconnected within the cooldown window
    Cooldown,
    /// Sender IP is at its live-connection cap
    IpConnectionCap,
}

/// Gate decision for one inbound datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Process the datagram
    Accept,
    /// Discard without penalty
    Drop(DropReason),
    /// The sender was just banned for the given reason; discard and tear
    /// down its connection
    Banned(String),
}

/// Process-wide admission tables, owned by the dispatcher.
pub struct AdmissionControl {
    banned: HashMap<String, BanEntry>,
    ip_connections: HashMap<IpAddr, usize>,
    connection_attempts: HashMap<IpAddr, Instant>,
    connection_burst: HashMap<IpAddr, BurstBucket>,
    packet_buckets: HashMap<IpAddr, PacketBucket>,
    recently_unbanned: HashMap<String, (Instant, u32)>,
    last_disconnect: HashMap<IpAddr, Instant>,
    max_packet_size: usize,
    max_packets_per_second: u32,
    packet_burst_limit: u32,
    packet_burst_window: Duration,
    connection_burst_limit: u32,
    connection_burst_window: Duration,
    connection_cooldown: Duration,
    max_connections_per_ip: usize,
    max_packet_queue_size: usize,
    ban_duration: Duration,
}

fn client_id(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

impl AdmissionControl {
    /// Create the gate from transport configuration.
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            banned: HashMap::new(),
            ip_connections: HashMap::new(),
            connection_attempts: HashMap::new(),
            connection_burst: HashMap::new(),
            packet_buckets: HashMap::new(),
            recently_unbanned: HashMap::new(),
            last_disconnect: HashMap::new(),
            max_packet_size: config.max_packet_size,
            max_packets_per_second: config.max_packets_per_second,
            packet_burst_limit: config.packet_burst_limit,
            packet_burst_window: config.packet_burst_window,
            connection_burst_limit: config.connection_burst_limit,
            connection_burst_window: config.connection_burst_window,
            connection_cooldown: config.connection_cooldown,
            max_connections_per_ip: config.max_connections_per_ip,
            max_packet_queue_size: config.max_packet_queue_size,
            ban_duration: config.ban_duration,
        }
    }

    /// Screen one inbound datagram.
    ///
    /// `is_new_peer` marks senders without an existing connection;
    /// `queued` is the target connection's buffered inbound packet count.
    pub fn screen(
        &mut self,
        from: SocketAddr,
        len: usize,
        is_new_peer: bool,
        queued: usize,
        now: Instant,
    ) -> Verdict {
        let id = client_id(&from);
        let ip = from.ip();

        if let Some(entry) = self.banned.get(&id) {
            if entry.expires_at > now {
                return Verdict::Drop(DropReason::Banned);
            }
            let lapsed = self.banned.remove(&id).expect("ban present");
            debug!(client = %id, "ban expired, entering post-ban grace");
            self.recently_unbanned.insert(id.clone(), (now, lapsed.ban_count));
        }

        if len > self.max_packet_size {
            return self.issue_ban(&from, "Oversized packet", now);
        }

        if is_new_peer {
            if let Some(at) = self.last_disconnect.get(&ip) {
                if now.saturating_duration_since(*at) < self.connection_cooldown {
                    return Verdict::Drop(DropReason::Cooldown);
                }
            }
            if self.ip_connections.get(&ip).copied().unwrap_or(0) >= self.max_connections_per_ip {
                return Verdict::Drop(DropReason::IpConnectionCap);
            }

            self.connection_attempts.insert(ip, now);
            let bucket = self.connection_burst.entry(ip).or_insert(BurstBucket {
                count: 0,
                window_start: now,
            });
            if now.saturating_duration_since(bucket.window_start) > self.connection_burst_window {
                bucket.count = 0;
                bucket.window_start = now;
            }
            bucket.count += 1;
            if bucket.count > self.connection_burst_limit {
                return self.issue_ban(&from, "Connection burst limit exceeded", now);
            }
        }

        let allowance = if self.recently_unbanned.contains_key(&id) {
            self.max_packets_per_second / 2
        } else {
            self.max_packets_per_second
        };
        let burst_limit = self.packet_burst_limit;
        let burst_window = self.packet_burst_window;
        let bucket = self.packet_buckets.entry(ip).or_insert(PacketBucket {
            count: 0,
            burst_count: 0,
            window_start: now,
            burst_start: now,
        });
        if now.saturating_duration_since(bucket.window_start) > Duration::from_secs(1) {
            bucket.count = 0;
            bucket.window_start = now;
        }
        if now.saturating_duration_since(bucket.burst_start) > burst_window {
            bucket.burst_count = 0;
            bucket.burst_start = now;
        }
        bucket.count += 1;
        bucket.burst_count += 1;
        if bucket.count > allowance || bucket.burst_count > burst_limit {
            return self.issue_ban(&from, "Rate limit exceeded", now);
        }

        if queued >= self.max_packet_queue_size {
            return self.issue_ban(&from, "Packet queue overflow", now);
        }

        Verdict::Accept
    }

    fn issue_ban(&mut self, addr: &SocketAddr, reason: &str, now: Instant) -> Verdict {
        self.ban(addr, reason, now);
        Verdict::Banned(reason.to_string())
    }

    /// Ban an address with linear escalation; returns the new ban count.
    pub fn ban(&mut self, addr: &SocketAddr, reason: &str, now: Instant) -> u32 {
        let id = client_id(addr);
        let prior = self
            .banned
            .get(&id)
            .map(|b| b.ban_count)
            .or_else(|| self.recently_unbanned.get(&id).map(|(_, count)| *count))
            .unwrap_or(0);
        let ban_count = prior + 1;
        let expires_at = now + self.ban_duration * ban_count;
        info!(client = %id, reason, ban_count, "banning sender");
        self.recently_unbanned.remove(&id);
        self.banned.insert(
            id,
            BanEntry {
                expires_at,
                reason: reason.to_string(),
                ban_count,
            },
        );
        ban_count
    }

    /// The active ban for an address, if any.
    pub fn ban_entry(&self, addr: &SocketAddr) -> Option<&BanEntry> {
        self.banned.get(&client_id(addr))
    }

    /// Record a connection entering the table.
    pub fn note_connection_open(&mut self, ip: IpAddr) {
        *self.ip_connections.entry(ip).or_insert(0) += 1;
    }

    /// Record a connection leaving the table.
    pub fn note_connection_closed(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Record an explicit disconnect for reconnect-cooldown purposes.
    pub fn note_disconnect(&mut self, ip: IpAddr, now: Instant) {
        self.last_disconnect.insert(ip, now);
    }

    /// Drop expired bans, stale grace entries, and idle buckets.
    pub fn sweep(&mut self, now: Instant) {
        let mut lapsed = Vec::new();
        for (id, entry) in &self.banned {
            if entry.expires_at <= now {
                lapsed.push((id.clone(), entry.ban_count));
            }
        }
        for (id, count) in lapsed {
            self.banned.remove(&id);
            self.recently_unbanned.insert(id, (now, count));
        }

        self.recently_unbanned
            .retain(|_, (at, _)| now.saturating_duration_since(*at) <= RECENT_UNBAN_RETENTION);
        let attempt_retention = self.connection_burst_window * 2;
        self.connection_attempts
            .retain(|_, at| now.saturating_duration_since(*at) <= attempt_retention);
        self.connection_burst.retain(|_, b| {
            now.saturating_duration_since(b.window_start) <= attempt_retention
        });
        self.packet_buckets
            .retain(|_, b| now.saturating_duration_since(b.window_start) <= Duration::from_secs(10));
        let cooldown = self.connection_cooldown;
        self.last_disconnect
            .retain(|_, at| now.saturating_duration_since(*at) <= cooldown);
    }

    /// Number of active bans.
    pub fn banned_count(&self) -> usize {
        self.banned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().expect("valid addr")
    }

    fn gate() -> AdmissionControl {
        AdmissionControl::new(&TransportConfig::default())
    }

    #[test]
    fn eleventh_connection_attempt_in_window_is_banned() {
        let now = Instant::now();
        let mut gate = gate();

        for port in 1..=10u16 {
            assert_eq!(
                gate.screen(addr(port), 100, true, 0, now),
                Verdict::Accept,
                "attempt {} should pass",
                port
            );
        }
        let verdict = gate.screen(addr(11), 100, true, 0, now);
        assert_eq!(
            verdict,
            Verdict::Banned("Connection burst limit exceeded".to_string())
        );

        let entry = gate.ban_entry(&addr(11)).expect("banned");
        assert_eq!(entry.ban_count, 1);
        assert_eq!(entry.expires_at, now + Duration::from_secs(3600));
    }

    #[test]
    fn burst_window_resets() {
        let now = Instant::now();
        let mut gate = gate();
        for port in 1..=10u16 {
            gate.screen(addr(port), 100, true, 0, now);
        }
        let later = now + Duration::from_secs(6);
        assert_eq!(gate.screen(addr(11), 100, true, 0, later), Verdict::Accept);
    }

    #[test]
    fn banned_sender_is_dropped_until_expiry() {
        let now = Instant::now();
        let mut gate = gate();
        gate.ban(&addr(1), "test", now);

        assert_eq!(
            gate.screen(addr(1), 100, false, 0, now + Duration::from_secs(10)),
            Verdict::Drop(DropReason::Banned)
        );
        // Past expiry the sender is admitted again, on the stricter
        // allowance.
        assert_eq!(
            gate.screen(addr(1), 100, false, 0, now + Duration::from_secs(3601)),
            Verdict::Accept
        );
    }

    #[test]
    fn ban_escalation_is_linear() {
        let now = Instant::now();
        let mut gate = gate();
        assert_eq!(gate.ban(&addr(1), "first", now), 1);
        assert_eq!(gate.ban(&addr(1), "second", now), 2);
        let entry = gate.ban_entry(&addr(1)).expect("banned");
        assert_eq!(entry.expires_at, now + Duration::from_secs(7200));
    }

    #[test]
    fn escalation_survives_expiry_grace() {
        let now = Instant::now();
        let mut gate = gate();
        gate.ban(&addr(1), "first", now);
        gate.sweep(now + Duration::from_secs(3601));
        assert_eq!(gate.banned_count(), 0);
        assert_eq!(gate.ban(&addr(1), "second", now + Duration::from_secs(3700)), 2);
    }

    #[test]
    fn oversized_datagram_bans() {
        let now = Instant::now();
        let mut gate = gate();
        assert_eq!(
            gate.screen(addr(1), 2048, false, 0, now),
            Verdict::Banned("Oversized packet".to_string())
        );
    }

    #[test]
    fn per_second_rate_limit_bans() {
        let now = Instant::now();
        let mut config = TransportConfig::default();
        config.max_packets_per_second = 50;
        config.packet_burst_limit = 1000;
        let mut gate = AdmissionControl::new(&config);

        for i in 0..50 {
            assert_eq!(
                gate.screen(addr(1), 100, false, 0, now),
                Verdict::Accept,
                "packet {} should pass",
                i
            );
        }
        assert_eq!(
            gate.screen(addr(1), 100, false, 0, now),
            Verdict::Banned("Rate limit exceeded".to_string())
        );
    }

    #[test]
    fn packet_burst_limit_bans() {
        let now = Instant::now();
        let mut config = TransportConfig::default();
        config.packet_burst_limit = 5;
        let mut gate = AdmissionControl::new(&config);

        for _ in 0..5 {
            assert_eq!(gate.screen(addr(1), 100, false, 0, now), Verdict::Accept);
        }
        assert_eq!(
            gate.screen(addr(1), 100, false, 0, now),
            Verdict::Banned("Rate limit exceeded".to_string())
        );
    }

    #[test]
    fn post_ban_allowance_is_halved() {
        let now = Instant::now();
        let mut config = TransportConfig::default();
        config.max_packets_per_second = 10;
        config.packet_burst_limit = 1000;
        let mut gate = AdmissionControl::new(&config);

        gate.ban(&addr(1), "first", now);
        gate.sweep(now + Duration::from_secs(3601));

        let later = now + Duration::from_secs(3700);
        for _ in 0..5 {
            assert_eq!(gate.screen(addr(1), 100, false, 0, later), Verdict::Accept);
        }
        assert_eq!(
            gate.screen(addr(1), 100, false, 0, later),
            Verdict::Banned("Rate limit exceeded".to_string())
        );
    }

    #[test]
    fn queue_overflow_bans() {
        let now = Instant::now();
        let mut gate = gate();
        assert_eq!(
            gate.screen(addr(1), 100, false, 1000, now),
            Verdict::Banned("Packet queue overflow".to_string())
        );
    }

    #[test]
    fn ip_connection_cap_drops_new_peers() {
        let now = Instant::now();
        let mut gate = gate();
        for _ in 0..3 {
            gate.note_connection_open("10.0.0.1".parse().expect("ip"));
        }
        assert_eq!(
            gate.screen(addr(9), 100, true, 0, now),
            Verdict::Drop(DropReason::IpConnectionCap)
        );
        gate.note_connection_closed("10.0.0.1".parse().expect("ip"));
        assert_eq!(gate.screen(addr(9), 100, true, 0, now), Verdict::Accept);
    }

    #[test]
    fn reconnect_cooldown_drops_without_ban() {
        let now = Instant::now();
        let mut gate = gate();
        gate.note_disconnect("10.0.0.1".parse().expect("ip"), now);
        assert_eq!(
            gate.screen(addr(1), 100, true, 0, now + Duration::from_secs(2)),
            Verdict::Drop(DropReason::Cooldown)
        );
        assert_eq!(
            gate.screen(addr(1), 100, true, 0, now + Duration::from_secs(6)),
            Verdict::Accept
        );
        assert_eq!(gate.banned_count(), 0);
    }
}
