//! Opt-in inspection of application payloads for abuse patterns.
//!
//! The transport never inspects payloads on its own; an inspector is
//! installed explicitly and runs after a packet is otherwise fully
//! validated. A flagged payload is an abuse signal, not a frame error.

/// Pluggable payload predicate.
pub trait PayloadInspector: Send {
    /// Return a short reason when the payload looks hostile, `None`
    /// otherwise.
    fn inspect(&self, payload: &[u8]) -> Option<&'static str>;
}

const SUSPICIOUS_PATTERNS: &[(&[u8], &str)] = &[
    (b"<script", "script injection"),
    (b"javascript:", "script injection"),
    (b"eval(", "script injection"),
    (b"exec(", "script injection"),
    (b"SELECT ", "sql injection"),
    (b"INSERT INTO", "sql injection"),
    (b"DROP TABLE", "sql injection"),
    (b"UNION SELECT", "sql injection"),
    (b"../", "path traversal"),
];

/// Longest tolerated run of a single repeated byte.
const MAX_BYTE_RUN: usize = 64;
/// Payloads shorter than this skip the dominance check.
const DOMINANCE_MIN_LEN: usize = 32;
/// A single byte value occupying more than this share is flagged.
const DOMINANCE_RATIO: f64 = 0.4;

/// Default inspector flagging script/SQL-like substrings, long byte
/// runs, and single-byte dominance.
pub struct SuspiciousPayloadFilter;

impl SuspiciousPayloadFilter {
    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle)
    }

    fn longest_run(payload: &[u8]) -> usize {
        let mut longest = 0;
        let mut current = 0;
        let mut previous = None;
        for &b in payload {
            if Some(b) == previous {
                current += 1;
            } else {
                previous = Some(b);
                current = 1;
            }
            longest = longest.max(current);
        }
        longest
    }

    fn dominant_byte_share(payload: &[u8]) -> f64 {
        let mut counts = [0usize; 256];
        for &b in payload {
            counts[b as usize] += 1;
        }
        let max = counts.iter().copied().max().unwrap_or(0);
        max as f64 / payload.len() as f64
    }
}

impl PayloadInspector for SuspiciousPayloadFilter {
    fn inspect(&self, payload: &[u8]) -> Option<&'static str> {
        if payload.is_empty() {
            return None;
        }
        for (pattern, reason) in SUSPICIOUS_PATTERNS {
            if Self::contains(payload, pattern) {
                return Some(reason);
            }
        }
        if Self::longest_run(payload) > MAX_BYTE_RUN {
            return Some("repeated byte run");
        }
        if payload.len() >= DOMINANCE_MIN_LEN
            && Self::dominant_byte_share(payload) > DOMINANCE_RATIO
        {
            return Some("single byte dominance");
        }
        None
    }
}
