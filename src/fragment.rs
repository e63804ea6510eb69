//! Payload fragmentation and reassembly.
//!
//! A fragmented payload travels as up to [`MAX_FRAGMENTS`] packets whose
//! sequences encode a shared group id in the upper 16 bits and a 1-based
//! fragment index in the lower 16 bits. The final fragment carries the
//! `LAST_FRAGMENT` flag.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::error::ProtocolError;

/// Maximum fragments per group.
pub const MAX_FRAGMENTS: u16 = 64;

/// Group id derived from the sequence of the original, unfragmented
/// packet. Zero is remapped so fragment sequences can never be zero.
pub fn group_of(original_sequence: u32) -> u16 {
    match (original_sequence & 0xFFFF) as u16 {
        0 => 1,
        g => g,
    }
}

/// Sequence carried by the fragment `index` (1-based) of `group`.
pub fn fragment_sequence(group: u16, index: u16) -> u32 {
    ((group as u32) << 16) | index as u32
}

/// Split a payload into fragments of at most `fragment_size` bytes.
///
/// Fails with `InvalidSize` when the payload would need more than
/// [`MAX_FRAGMENTS`] pieces.
pub fn split(payload: &[u8], fragment_size: usize) -> Result<Vec<&[u8]>, ProtocolError> {
    if fragment_size == 0 {
        return Err(ProtocolError::InvalidSize);
    }
    let count = payload.len().div_ceil(fragment_size);
    if count > MAX_FRAGMENTS as usize {
        return Err(ProtocolError::InvalidSize);
    }
    Ok(payload.chunks(fragment_size).collect())
}

struct FragmentGroup {
    fragments: BTreeMap<u16, Vec<u8>>,
    last_index: Option<u16>,
    created_at: Instant,
}

impl FragmentGroup {
    fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => (1..=last).all(|i| self.fragments.contains_key(&i)),
            None => false,
        }
    }

    fn assemble(self) -> Vec<u8> {
        let mut payload = Vec::new();
        for (_, chunk) in self.fragments {
            payload.extend_from_slice(&chunk);
        }
        payload
    }
}

/// Inbound reassembly table for one connection.
///
/// Groups are evicted when complete, when their TTL expires, or when the
/// owning connection is destroyed (by dropping the assembler).
pub struct Assembler {
    groups: HashMap<u16, FragmentGroup>,
    timeout: Duration,
}

impl Assembler {
    /// Create an assembler evicting incomplete groups after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            timeout,
        }
    }

    /// Store one fragment; returns the assembled payload once the group
    /// completes.
    ///
    /// A group growing beyond [`MAX_FRAGMENTS`] is discarded wholesale and
    /// the fragment rejected with `InvalidSize`.
    pub fn insert(
        &mut self,
        group: u16,
        index: u16,
        is_last: bool,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if index == 0 || index > MAX_FRAGMENTS {
            self.groups.remove(&group);
            return Err(ProtocolError::InvalidSize);
        }

        let entry = self.groups.entry(group).or_insert_with(|| FragmentGroup {
            fragments: BTreeMap::new(),
            last_index: None,
            created_at: now,
        });

        if is_last {
            entry.last_index = Some(index);
        }
        // A last-fragment marker below an index already stored means the
        // group can never be consistent.
        let inconsistent = match entry.last_index {
            Some(last) => index > last || entry.fragments.keys().any(|&i| i > last),
            None => false,
        };
        if inconsistent {
            self.groups.remove(&group);
            return Err(ProtocolError::InvalidSize);
        }

        let entry = self.groups.get_mut(&group).expect("group present");
        entry.fragments.insert(index, payload);
        if entry.fragments.len() > MAX_FRAGMENTS as usize {
            self.groups.remove(&group);
            return Err(ProtocolError::InvalidSize);
        }

        if entry.is_complete() {
            let done = self.groups.remove(&group).expect("group present");
            return Ok(Some(done.assemble()));
        }
        Ok(None)
    }

    /// Evict groups older than the TTL; returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.groups.len();
        self.groups
            .retain(|_, g| now.saturating_duration_since(g.created_at) <= timeout);
        before - self.groups.len()
    }

    /// Total fragments currently buffered across all groups.
    pub fn pending(&self) -> usize {
        self.groups.values().map(|g| g.fragments.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> Assembler {
        Assembler::new(Duration::from_secs(5))
    }

    #[test]
    fn split_respects_fragment_size() {
        let payload = vec![7u8; 2048];
        let chunks = split(&payload, 512).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 512));

        let uneven = split(&payload[..1300], 512).unwrap();
        assert_eq!(uneven.len(), 3);
        assert_eq!(uneven[2].len(), 276);
    }

    #[test]
    fn split_refuses_oversize_payloads() {
        let payload = vec![0u8; 65 * 100];
        assert_eq!(split(&payload, 100), Err(ProtocolError::InvalidSize));
    }

    #[test]
    fn in_order_reassembly() {
        let now = Instant::now();
        let mut asm = assembler();
        assert_eq!(asm.insert(9, 1, false, b"he".to_vec(), now), Ok(None));
        assert_eq!(asm.insert(9, 2, false, b"ll".to_vec(), now), Ok(None));
        let done = asm.insert(9, 3, true, b"o".to_vec(), now).unwrap();
        assert_eq!(done, Some(b"hello".to_vec()));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn out_of_order_reassembly() {
        let now = Instant::now();
        let mut asm = assembler();
        assert_eq!(asm.insert(3, 3, true, b"c".to_vec(), now), Ok(None));
        assert_eq!(asm.insert(3, 1, false, b"a".to_vec(), now), Ok(None));
        let done = asm.insert(3, 2, false, b"b".to_vec(), now).unwrap();
        assert_eq!(done, Some(b"abc".to_vec()));
    }

    #[test]
    fn round_trip_matches_input() {
        let now = Instant::now();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let chunks = split(&payload, 96).unwrap();
        let last = chunks.len() as u16;

        let mut asm = assembler();
        let mut assembled = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let index = i as u16 + 1;
            assembled = asm
                .insert(17, index, index == last, chunk.to_vec(), now)
                .unwrap();
        }
        assert_eq!(assembled, Some(payload));
    }

    #[test]
    fn index_out_of_bounds_discards_group() {
        let now = Instant::now();
        let mut asm = assembler();
        assert_eq!(asm.insert(5, 1, false, b"x".to_vec(), now), Ok(None));
        assert_eq!(
            asm.insert(5, MAX_FRAGMENTS + 1, false, b"y".to_vec(), now),
            Err(ProtocolError::InvalidSize)
        );
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn fragment_after_last_discards_group() {
        let now = Instant::now();
        let mut asm = assembler();
        assert_eq!(asm.insert(5, 2, true, b"x".to_vec(), now), Ok(None));
        assert_eq!(
            asm.insert(5, 3, false, b"y".to_vec(), now),
            Err(ProtocolError::InvalidSize)
        );
    }

    #[test]
    fn ttl_eviction() {
        let start = Instant::now();
        let mut asm = assembler();
        asm.insert(1, 1, false, b"x".to_vec(), start).unwrap();
        assert_eq!(asm.sweep(start + Duration::from_secs(4)), 0);
        assert_eq!(asm.sweep(start + Duration::from_secs(6)), 1);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn group_id_never_zero() {
        assert_eq!(group_of(0x0001_0000), 1);
        assert_eq!(group_of(42), 42);
        assert_eq!(fragment_sequence(42, 3), (42 << 16) | 3);
    }
}
