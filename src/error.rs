//! Error types for the gatelink protocol.

use thiserror::Error;

/// Protocol-level errors surfaced while encoding, decoding, or routing
/// packets.
///
/// Frame errors (`TooShort` through `InvalidPriority`) cause the offending
/// datagram to be dropped without penalty; abuse escalation is the
/// admission layer's job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram shorter than the fixed header
    #[error("frame too short")]
    TooShort,
    /// Datagram exceeds the maximum frame size
    #[error("frame too large")]
    TooLarge,
    /// Leading magic bytes do not match
    #[error("bad magic")]
    BadMagic,
    /// Recomputed header checksum does not match the wire value
    #[error("bad checksum")]
    BadChecksum,
    /// Payload length differs from the header's data-length field
    #[error("payload length mismatch")]
    LengthMismatch,
    /// Sequence number is zero or otherwise unusable
    #[error("invalid sequence")]
    InvalidSequence,
    /// A size field is out of bounds (payload, fragment index, fragment count)
    #[error("invalid size")]
    InvalidSize,
    /// Timestamp outside the accepted past/future window
    #[error("timestamp outside tolerance")]
    TimestampInvalid,
    /// Reserved flag bits set on ingress
    #[error("reserved flag bits set")]
    ReservedBits,
    /// Reliability class byte does not name a known class
    #[error("unknown reliability class")]
    InvalidReliability,
    /// Priority byte does not name a known priority
    #[error("unknown priority")]
    InvalidPriority,
    /// Header failed its own invariants while encoding
    #[error("invalid header state")]
    InvalidState,
    /// Compression or encryption transform failed
    #[error("transform failure")]
    TransformFailure,
    /// Attempt to replace or remove a permanent QoS profile
    #[error("profile {0:?} is permanent")]
    PermanentProfile(String),
    /// Configuration rejected at startup
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Verdicts from the per-connection replay window.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// Sequence jumped further from the last seen sequence than the
    /// permitted gap
    #[error("sequence gap too large")]
    SequenceGapTooLarge,
    /// Sequence precedes the start of the sliding window
    #[error("sequence too old")]
    SequenceTooOld,
    /// Sequence was already accepted within the active window
    #[error("replayed sequence")]
    Replay,
}

/// Reason a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No inbound activity within the connection timeout
    Timeout,
    /// The application asked for the disconnect
    Requested,
    /// The peer sent a disconnect notification
    PeerDisconnect,
    /// The sender address was banned
    Banned(String),
    /// The peer exhausted its integrity-failure budget
    IntegrityViolation,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Timeout => write!(f, "Connection timeout"),
            CloseReason::Requested => write!(f, "Disconnect requested"),
            CloseReason::PeerDisconnect => write!(f, "Peer disconnected"),
            CloseReason::Banned(reason) => write!(f, "Banned: {}", reason),
            CloseReason::IntegrityViolation => write!(f, "integrity violations"),
        }
    }
}
