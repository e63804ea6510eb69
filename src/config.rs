//! Transport configuration.

use std::time::Duration;

use crate::error::ProtocolError;
use crate::packet::{HEADER_SIZE, MAX_SIZE};

/// Tunables for a [`Transport`](crate::transport::Transport) instance.
///
/// Defaults match a small game server: 32 peers, 1 KiB datagrams, and a
/// 60 Hz tick. `validate()` runs at bind time; a rejected configuration
/// never reaches a live socket.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// UDP port to bind
    pub port: u16,
    /// Maximum simultaneous connections
    pub max_connections: usize,
    /// Receive buffer size handed to the socket pump
    pub buffer_size: usize,
    /// Largest datagram accepted from the network; larger senders are
    /// banned
    pub max_packet_size: usize,
    /// Default fragment size for profiles that do not override it
    pub fragment_size: usize,
    /// Incomplete fragment groups are evicted after this long
    pub fragment_timeout: Duration,
    /// Connections with no inbound activity for this long are destroyed
    pub connection_timeout: Duration,
    /// Idle links emit a keep-alive at this interval
    pub keep_alive_interval: Duration,
    /// Known peers are re-challenged after this much silence
    pub integrity_check_interval: Duration,
    /// Failed challenges tolerated before the peer is banned
    pub max_integrity_failures: u32,
    /// Per-IP packet allowance per second
    pub max_packets_per_second: u32,
    /// Cooldown before a disconnected peer may reconnect
    pub connection_cooldown: Duration,
    /// Live connections allowed per source IP
    pub max_connections_per_ip: usize,
    /// Datagrams drained from one sender in a single tick before the
    /// remainder is discarded as a flood
    pub packet_flood_threshold: u32,
    /// Base ban length; escalates linearly with repeat offenses
    pub ban_duration: Duration,
    /// Buffered inbound packets per connection before the sender is
    /// banned for queue overflow
    pub max_packet_queue_size: usize,
    /// New connections per IP within the burst window
    pub connection_burst_limit: u32,
    /// Window for [`connection_burst_limit`](Self::connection_burst_limit)
    pub connection_burst_window: Duration,
    /// Packets per IP within the burst window
    pub packet_burst_limit: u32,
    /// Window for [`packet_burst_limit`](Self::packet_burst_limit)
    pub packet_burst_window: Duration,
    /// Wall-clock budget for processing a single packet
    pub max_packet_processing_time: Duration,
    /// Enforce the hardware-id gate during the integrity handshake
    pub enable_hwid_ban: bool,
    /// Ban length propagated to the hardware-id sink
    pub hwid_ban_duration: Duration,
    /// Admit clients reporting a virtual environment
    pub allow_virtual_machine: bool,
    /// Dispatcher ticks per second
    pub tick_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            max_connections: 32,
            buffer_size: 1024,
            max_packet_size: 1024,
            fragment_size: 512,
            fragment_timeout: Duration::from_millis(5000),
            connection_timeout: Duration::from_millis(30_000),
            keep_alive_interval: Duration::from_millis(1000),
            integrity_check_interval: Duration::from_secs(30),
            max_integrity_failures: 3,
            max_packets_per_second: 1000,
            connection_cooldown: Duration::from_secs(5),
            max_connections_per_ip: 3,
            packet_flood_threshold: 100,
            ban_duration: Duration::from_secs(3600),
            max_packet_queue_size: 1000,
            connection_burst_limit: 10,
            connection_burst_window: Duration::from_secs(5),
            packet_burst_limit: 100,
            packet_burst_window: Duration::from_secs(1),
            max_packet_processing_time: Duration::from_millis(100),
            enable_hwid_ban: true,
            hwid_ban_duration: Duration::from_secs(7_776_000),
            allow_virtual_machine: false,
            tick_rate: 60,
        }
    }
}

impl TransportConfig {
    /// Reject configurations the transport cannot operate under.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.max_packet_size > MAX_SIZE {
            return Err(ProtocolError::InvalidConfig(format!(
                "max_packet_size {} exceeds frame limit {}",
                self.max_packet_size, MAX_SIZE
            )));
        }
        if self.max_packet_size < HEADER_SIZE {
            return Err(ProtocolError::InvalidConfig(format!(
                "max_packet_size {} below header size {}",
                self.max_packet_size, HEADER_SIZE
            )));
        }
        if self.fragment_size == 0 {
            return Err(ProtocolError::InvalidConfig(
                "fragment_size must be nonzero".to_string(),
            ));
        }
        if self.buffer_size < self.max_packet_size {
            return Err(ProtocolError::InvalidConfig(format!(
                "buffer_size {} smaller than max_packet_size {}",
                self.buffer_size, self.max_packet_size
            )));
        }
        if self.max_connections == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_connections must be nonzero".to_string(),
            ));
        }
        if self.tick_rate == 0 {
            return Err(ProtocolError::InvalidConfig(
                "tick_rate must be nonzero".to_string(),
            ));
        }
        if self.max_packets_per_second == 0 || self.packet_burst_limit == 0 {
            return Err(ProtocolError::InvalidConfig(
                "packet rate limits must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep interval between dispatcher ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn oversize_packet_limit_rejected() {
        let mut config = TransportConfig::default();
        config.max_packet_size = MAX_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_fragment_size_rejected() {
        let mut config = TransportConfig::default();
        config.fragment_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn undersized_buffer_rejected() {
        let mut config = TransportConfig::default();
        config.buffer_size = config.max_packet_size - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tick_interval_from_rate() {
        let mut config = TransportConfig::default();
        config.tick_rate = 50;
        assert_eq!(config.tick_interval(), Duration::from_millis(20));
    }
}
