//! QoS profiles governing reliability, priority, retries, and
//! fragmentation.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ProtocolError;

/// Delivery guarantee for a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reliability {
    /// Fire and forget
    Unreliable = 0,
    /// Fire and forget, but stale packets are dropped on the receiver
    UnreliableSequenced = 1,
    /// Acknowledged and retransmitted until the retry budget runs out
    Reliable = 2,
    /// Acknowledged, retransmitted, and delivered in submission order
    ReliableOrdered = 3,
    /// Acknowledged and retransmitted; stale packets dropped on the receiver
    ReliableSequenced = 4,
}

impl Reliability {
    /// Create a reliability class from its wire byte.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unreliable),
            1 => Some(Self::UnreliableSequenced),
            2 => Some(Self::Reliable),
            3 => Some(Self::ReliableOrdered),
            4 => Some(Self::ReliableSequenced),
            _ => None,
        }
    }

    /// True for classes that require acknowledgement and retransmission.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }
}

/// Scheduling priority hint carried in the packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Background traffic (keep-alives)
    Lowest = 0,
    /// Bulk transfers
    Low = 1,
    /// Ordinary application traffic
    Normal = 2,
    /// Latency-sensitive traffic
    High = 3,
    /// Most urgent application traffic
    Highest = 4,
    /// Transport-internal control traffic
    System = 5,
}

impl Priority {
    /// Create a priority from its wire byte.
    pub fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Lowest),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Highest),
            5 => Some(Self::System),
            _ => None,
        }
    }
}

/// Immutable descriptor selecting delivery semantics for a send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QosProfile {
    /// Delivery guarantee
    pub reliability: Reliability,
    /// Scheduling priority
    pub priority: Priority,
    /// Retransmissions before a reliable packet is declared lost
    pub max_retries: u32,
    /// Base delay before the first retransmission
    pub retry_delay: Duration,
    /// Overall lifetime of a reliable entry
    pub timeout: Duration,
    /// Compress payloads before transmission
    pub compression: bool,
    /// Encrypt payloads before transmission
    pub encryption: bool,
    /// Payloads above this size are fragmented
    pub fragment_size: usize,
    /// Ordering channel (profile metadata, not wire-visible)
    pub ordering_channel: u8,
    /// Sequencing channel (profile metadata, not wire-visible)
    pub sequencing_channel: u8,
}

impl QosProfile {
    /// Retransmission delay after `attempts` failed attempts
    /// (exponential backoff).
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        self.retry_delay * 2u32.saturating_pow(attempts.min(16))
    }

    /// Whether a payload of `len` bytes must be fragmented.
    pub fn needs_fragmentation(&self, len: usize) -> bool {
        len > self.fragment_size
    }

    /// Number of fragments a payload of `len` bytes splits into.
    pub fn fragment_count(&self, len: usize) -> usize {
        len.div_ceil(self.fragment_size.max(1))
    }
}

fn default_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::Reliable,
        priority: Priority::Normal,
        max_retries: 3,
        retry_delay: Duration::from_millis(250),
        timeout: Duration::from_secs(5),
        compression: true,
        encryption: false,
        fragment_size: 512,
        ordering_channel: 0,
        sequencing_channel: 0,
    }
}

fn realtime_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::UnreliableSequenced,
        priority: Priority::High,
        max_retries: 0,
        retry_delay: Duration::from_millis(0),
        timeout: Duration::from_secs(1),
        compression: false,
        encryption: false,
        fragment_size: 512,
        ordering_channel: 0,
        sequencing_channel: 1,
    }
}

fn system_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::ReliableOrdered,
        priority: Priority::System,
        max_retries: 5,
        retry_delay: Duration::from_millis(200),
        timeout: Duration::from_secs(10),
        compression: false,
        encryption: true,
        fragment_size: 512,
        ordering_channel: 255,
        sequencing_channel: 0,
    }
}

fn bulk_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::Reliable,
        priority: Priority::Low,
        max_retries: 10,
        retry_delay: Duration::from_millis(500),
        timeout: Duration::from_secs(30),
        compression: true,
        encryption: false,
        fragment_size: 8 * 1024,
        ordering_channel: 0,
        sequencing_channel: 0,
    }
}

fn chat_profile() -> QosProfile {
    QosProfile {
        reliability: Reliability::ReliableOrdered,
        priority: Priority::Normal,
        max_retries: 3,
        retry_delay: Duration::from_millis(250),
        timeout: Duration::from_secs(5),
        compression: false,
        encryption: true,
        fragment_size: 512,
        ordering_channel: 1,
        sequencing_channel: 0,
    }
}

/// Name of the fallback profile.
pub const PROFILE_DEFAULT: &str = "DEFAULT";
/// Name of the transport-internal control profile.
pub const PROFILE_SYSTEM: &str = "SYSTEM";
/// Name of the low-latency profile.
pub const PROFILE_REALTIME: &str = "REALTIME";
/// Name of the large-transfer profile.
pub const PROFILE_BULK: &str = "BULK";
/// Name of the ordered, encrypted text profile.
pub const PROFILE_CHAT: &str = "CHAT";

const PERMANENT: [&str; 2] = [PROFILE_DEFAULT, PROFILE_SYSTEM];

/// Registry of named QoS profiles.
///
/// `DEFAULT` and `SYSTEM` are permanent; every other name may be replaced
/// or removed at runtime. Lookups of unknown names fall back to `DEFAULT`.
pub struct ProfileCatalog {
    profiles: HashMap<String, QosProfile>,
}

impl ProfileCatalog {
    /// Create a catalog holding the five built-in profiles.
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(PROFILE_DEFAULT.to_string(), default_profile());
        profiles.insert(PROFILE_REALTIME.to_string(), realtime_profile());
        profiles.insert(PROFILE_SYSTEM.to_string(), system_profile());
        profiles.insert(PROFILE_BULK.to_string(), bulk_profile());
        profiles.insert(PROFILE_CHAT.to_string(), chat_profile());
        Self { profiles }
    }

    /// Look up a profile by name, falling back to `DEFAULT`.
    pub fn get(&self, name: &str) -> &QosProfile {
        self.profiles
            .get(name)
            .unwrap_or_else(|| &self.profiles[PROFILE_DEFAULT])
    }

    /// Register or replace a profile. Permanent names refuse replacement.
    pub fn add(&mut self, name: &str, profile: QosProfile) -> Result<(), ProtocolError> {
        if PERMANENT.contains(&name) {
            return Err(ProtocolError::PermanentProfile(name.to_string()));
        }
        self.profiles.insert(name.to_string(), profile);
        Ok(())
    }

    /// Remove a profile. Permanent names refuse removal; removing an
    /// unknown name is a no-op.
    pub fn remove(&mut self, name: &str) -> Result<(), ProtocolError> {
        if PERMANENT.contains(&name) {
            return Err(ProtocolError::PermanentProfile(name.to_string()));
        }
        self.profiles.remove(name);
        Ok(())
    }

    /// Names of all registered profiles.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(|s| s.as_str())
    }
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_falls_back_to_default() {
        let catalog = ProfileCatalog::new();
        assert_eq!(catalog.get("NO_SUCH_PROFILE"), catalog.get(PROFILE_DEFAULT));
    }

    #[test]
    fn permanent_profiles_refuse_removal() {
        let mut catalog = ProfileCatalog::new();
        assert!(catalog.remove(PROFILE_DEFAULT).is_err());
        assert!(catalog.remove(PROFILE_SYSTEM).is_err());
        assert!(catalog.remove(PROFILE_BULK).is_ok());
    }

    #[test]
    fn replaceable_profiles_can_be_swapped() {
        let mut catalog = ProfileCatalog::new();
        let mut custom = catalog.get(PROFILE_REALTIME).clone();
        custom.max_retries = 1;
        catalog.add(PROFILE_REALTIME, custom.clone()).unwrap();
        assert_eq!(catalog.get(PROFILE_REALTIME).max_retries, 1);

        assert!(catalog.add(PROFILE_SYSTEM, custom).is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let profile = default_profile();
        assert_eq!(profile.retry_backoff(0), Duration::from_millis(250));
        assert_eq!(profile.retry_backoff(1), Duration::from_millis(500));
        assert_eq!(profile.retry_backoff(2), Duration::from_millis(1000));
    }

    #[test]
    fn fragment_count_rounds_up() {
        let profile = default_profile();
        assert!(!profile.needs_fragmentation(512));
        assert!(profile.needs_fragmentation(513));
        assert_eq!(profile.fragment_count(1024), 2);
        assert_eq!(profile.fragment_count(1025), 3);
    }
}
