//! Packet framing, validation, and serialization.
//!
//! ```text
//! ┌───────────┬──────────────┬─────────┬──────────┬───────┬─────┬──────┬──────┐
//! │ Magic (2) │ Sequence (4) │ Ack (4) │ Len (2)  │ Flags │ Rel │ Prio │ Ctrl │
//! ├───────────┴──────────────┼─────────┴──────────┴───────┴─────┴──────┴──────┤
//! │      Timestamp (4)       │ Checksum (4) │ Payload ...                     │
//! └──────────────────────────┴──────────────┴─────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. The checksum is CRC-32 (polynomial
//! 0x04C11DB7, non-reflected, init and final XOR 0xFFFFFFFF) over the
//! header with the checksum field zeroed.

use std::time::{SystemTime, UNIX_EPOCH};

use crc::Crc;

use crate::error::ProtocolError;
use crate::qos::{Priority, Reliability};

/// Magic bytes opening every frame.
pub const MAGIC: u16 = 0xBAE0;
/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 24;
/// Maximum accepted frame size.
pub const MAX_SIZE: usize = 8192;
/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD: usize = MAX_SIZE - HEADER_SIZE;
/// Highest permitted fragment index (1-based).
pub const MAX_FRAGMENT_INDEX: u16 = 64;
/// Seconds a timestamp may lag the receiver's clock.
pub const TIMESTAMP_PAST_TOLERANCE: u32 = 30;
/// Seconds a timestamp may lead the receiver's clock.
pub const TIMESTAMP_FUTURE_TOLERANCE: u32 = 5;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_BZIP2);

/// Current wall clock as whole seconds since the Unix epoch.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Packet flag bitfield.
///
/// The low byte travels on the wire; everything above it is internal
/// status that must never be transmitted. Encoding fails if any internal
/// bit is set, and ingress frames with unknown wire bits are rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// Frame acknowledges `ack_sequence`.
    pub const HAS_ACKS: PacketFlags = PacketFlags(0x0001);
    /// Frame carries one fragment of a larger payload.
    pub const IS_FRAGMENT: PacketFlags = PacketFlags(0x0002);
    /// Frame carries the final fragment of its group.
    pub const LAST_FRAGMENT: PacketFlags = PacketFlags(0x0004);
    /// Payload was compressed before transmission.
    pub const COMPRESSED: PacketFlags = PacketFlags(0x0008);
    /// Payload was encrypted before transmission.
    pub const ENCRYPTED: PacketFlags = PacketFlags(0x0010);
    /// Header timestamp is meaningful.
    pub const HAS_TIMESTAMP: PacketFlags = PacketFlags(0x0020);
    /// Header reliability/priority bytes are meaningful.
    pub const HAS_QOS: PacketFlags = PacketFlags(0x0040);

    /// Integrity challenge issued to the peer (internal).
    pub const INTEGRITY_CHALLENGE: PacketFlags = PacketFlags(0x0100);
    /// Integrity response received from the peer (internal).
    pub const INTEGRITY_RESPONSE: PacketFlags = PacketFlags(0x0200);
    /// Protocol version probe (internal).
    pub const VERSION_CHECK: PacketFlags = PacketFlags(0x0400);
    /// Peer failed an integrity challenge (internal).
    pub const INTEGRITY_FAILED: PacketFlags = PacketFlags(0x0800);
    /// Reserved bits were set on ingress (internal).
    pub const TAMPERED: PacketFlags = PacketFlags(0x1000);
    /// Sequence failed validation (internal).
    pub const INVALID_SEQUENCE: PacketFlags = PacketFlags(0x2000);
    /// A size field failed validation (internal).
    pub const INVALID_SIZE: PacketFlags = PacketFlags(0x4000);
    /// Checksum mismatch (internal).
    pub const INVALID_CHECKSUM: PacketFlags = PacketFlags(0x8000);
    /// Replay window rejected the sequence (internal).
    pub const REPLAY_DETECTED: PacketFlags = PacketFlags(0x0001_0000);
    /// Timestamp outside tolerance (internal).
    pub const TIMESTAMP_INVALID: PacketFlags = PacketFlags(0x0002_0000);

    const WIRE_MASK: u32 = 0x007F;

    /// Empty flag set.
    pub fn empty() -> Self {
        PacketFlags(0)
    }

    /// Reconstruct flags from the wire byte.
    pub fn from_wire(byte: u8) -> Self {
        PacketFlags(byte as u32)
    }

    /// The byte written to the wire.
    pub fn wire_bits(self) -> u8 {
        (self.0 & Self::WIRE_MASK) as u8
    }

    /// Raw bit value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    /// True if any bit outside the transmittable set is present.
    pub fn has_internal(self) -> bool {
        self.0 & !Self::WIRE_MASK != 0
    }

    /// The internal status bit corresponding to a validation failure.
    pub fn for_error(err: &ProtocolError) -> PacketFlags {
        match err {
            ProtocolError::BadChecksum => Self::INVALID_CHECKSUM,
            ProtocolError::InvalidSequence => Self::INVALID_SEQUENCE,
            ProtocolError::InvalidSize | ProtocolError::TooLarge | ProtocolError::TooShort => {
                Self::INVALID_SIZE
            }
            ProtocolError::TimestampInvalid => Self::TIMESTAMP_INVALID,
            ProtocolError::ReservedBits | ProtocolError::BadMagic => Self::TAMPERED,
            _ => PacketFlags::empty(),
        }
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// Transport-internal control opcodes carried in the header's reserved
/// byte. Zero means application data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// Connection request
    Connect = 1,
    /// Graceful disconnect notification
    Disconnect = 2,
    /// Idle-link keep-alive
    KeepAlive = 3,
    /// Integrity challenge issued by the receiver
    IntegrityChallenge = 4,
    /// Integrity response answering a challenge
    IntegrityResponse = 5,
}

impl ControlKind {
    /// Decode the reserved byte; `None` for application data or unknown
    /// opcodes.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Connect),
            2 => Some(Self::Disconnect),
            3 => Some(Self::KeepAlive),
            4 => Some(Self::IntegrityChallenge),
            5 => Some(Self::IntegrityResponse),
            _ => None,
        }
    }
}

/// Fixed packet header.
///
/// The magic and checksum fields are implicit; both are produced during
/// encoding and verified during decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet sequence number, never zero
    pub sequence: u32,
    /// Sequence acknowledged by this packet when `HAS_ACKS` is set
    pub ack_sequence: u32,
    /// Payload length in bytes
    pub data_length: u16,
    /// Flag bitfield
    pub flags: PacketFlags,
    /// Delivery guarantee class
    pub reliability: Reliability,
    /// Scheduling priority
    pub priority: Priority,
    /// Control opcode; zero for application data
    pub control: u8,
    /// Send time, whole seconds since the Unix epoch
    pub timestamp: u32,
}

impl PacketHeader {
    /// Build a header for an application-data packet.
    pub fn data(sequence: u32, reliability: Reliability, priority: Priority, now: u32) -> Self {
        Self {
            sequence,
            ack_sequence: 0,
            data_length: 0,
            flags: PacketFlags::HAS_TIMESTAMP | PacketFlags::HAS_QOS,
            reliability,
            priority,
            control: 0,
            timestamp: now,
        }
    }

    /// Fragment index when `IS_FRAGMENT` is set (low 16 bits of the
    /// sequence).
    pub fn fragment_index(&self) -> u16 {
        (self.sequence & 0xFFFF) as u16
    }

    /// Fragment group when `IS_FRAGMENT` is set (high 16 bits of the
    /// sequence).
    pub fn fragment_group(&self) -> u16 {
        (self.sequence >> 16) as u16
    }

    /// Control opcode carried by this packet, if any.
    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_byte(self.control)
    }

    /// Header invariants shared by encode and decode.
    fn validate(&self, now: u32) -> Result<(), ProtocolError> {
        if self.flags.has_internal() {
            return Err(ProtocolError::ReservedBits);
        }
        if self.sequence == 0 {
            return Err(ProtocolError::InvalidSequence);
        }
        if self.data_length as usize > MAX_PAYLOAD {
            return Err(ProtocolError::InvalidSize);
        }
        if self.flags.contains(PacketFlags::IS_FRAGMENT) {
            let index = self.fragment_index();
            if index == 0 || index > MAX_FRAGMENT_INDEX {
                return Err(ProtocolError::InvalidSize);
            }
        }
        let oldest = now.saturating_sub(TIMESTAMP_PAST_TOLERANCE);
        let newest = now.saturating_add(TIMESTAMP_FUTURE_TOLERANCE);
        if self.timestamp < oldest || self.timestamp > newest {
            return Err(ProtocolError::TimestampInvalid);
        }
        Ok(())
    }
}

fn header_checksum(header: &[u8]) -> u32 {
    let mut copy = [0u8; HEADER_SIZE];
    copy.copy_from_slice(&header[..HEADER_SIZE]);
    copy[20..24].fill(0);
    CRC32.checksum(&copy)
}

/// Encode a header and payload into a wire frame.
///
/// The header's `data_length` is overwritten with the payload length.
/// Fails with `InvalidState` if the resulting header violates its own
/// invariants.
pub fn encode(mut header: PacketHeader, payload: &[u8], now: u32) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::InvalidState);
    }
    header.data_length = payload.len() as u16;
    header.validate(now).map_err(|_| ProtocolError::InvalidState)?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&header.sequence.to_be_bytes());
    buf.extend_from_slice(&header.ack_sequence.to_be_bytes());
    buf.extend_from_slice(&header.data_length.to_be_bytes());
    buf.push(header.flags.wire_bits());
    buf.push(header.reliability as u8);
    buf.push(header.priority as u8);
    buf.push(header.control);
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);

    let checksum = header_checksum(&buf);
    buf[20..24].copy_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode and validate a wire frame.
///
/// Validation order is part of the protocol: length bounds, magic, field
/// parse, header invariants, checksum, payload length.
pub fn decode(bytes: &[u8], now: u32) -> Result<(PacketHeader, Vec<u8>), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort);
    }
    if bytes.len() > MAX_SIZE {
        return Err(ProtocolError::TooLarge);
    }
    let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }

    let raw_flags = bytes[12];
    if raw_flags & !(PacketFlags::WIRE_MASK as u8) != 0 {
        return Err(ProtocolError::ReservedBits);
    }
    let reliability =
        Reliability::from_bits(bytes[13]).ok_or(ProtocolError::InvalidReliability)?;
    let priority = Priority::from_bits(bytes[14]).ok_or(ProtocolError::InvalidPriority)?;

    let header = PacketHeader {
        sequence: u32::from_be_bytes(bytes[2..6].try_into().expect("4 bytes")),
        ack_sequence: u32::from_be_bytes(bytes[6..10].try_into().expect("4 bytes")),
        data_length: u16::from_be_bytes([bytes[10], bytes[11]]),
        flags: PacketFlags::from_wire(raw_flags),
        reliability,
        priority,
        control: bytes[15],
        timestamp: u32::from_be_bytes(bytes[16..20].try_into().expect("4 bytes")),
    };

    header.validate(now)?;

    let wire_checksum = u32::from_be_bytes(bytes[20..24].try_into().expect("4 bytes"));
    if wire_checksum != header_checksum(bytes) {
        return Err(ProtocolError::BadChecksum);
    }

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != header.data_length as usize {
        return Err(ProtocolError::LengthMismatch);
    }

    Ok((header, payload.to_vec()))
}
