//! Replay attack detection using a sliding window.

use std::time::{Duration, Instant};

use crate::error::ReplayError;

/// Number of sequence slots tracked per connection.
pub const REPLAY_WINDOW_SIZE: u32 = 1024;
/// Largest permitted jump between consecutive sequences.
pub const MAX_SEQUENCE_GAP: u32 = 10_000;

const WORDS: usize = (REPLAY_WINDOW_SIZE / 64) as usize;

/// Sliding bitmap accepting each sequence number at most once.
///
/// Slots are indexed by `sequence % REPLAY_WINDOW_SIZE`; `window_start`
/// tracks the oldest sequence still covered. Sequences below the window
/// are rejected outright, and jumps beyond `MAX_SEQUENCE_GAP` are treated
/// as forgery rather than loss.
pub struct ReplayWindow {
    bits: [u64; WORDS],
    window_start: u32,
    last_sequence: u32,
    last_update: Instant,
    primed: bool,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new(now: Instant) -> Self {
        Self {
            bits: [0; WORDS],
            window_start: 0,
            last_sequence: 0,
            last_update: now,
            primed: false,
        }
    }

    /// Highest sequence accepted so far.
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Oldest sequence still covered by the window.
    pub fn window_start(&self) -> u32 {
        self.window_start
    }

    /// Time since the window last accepted a sequence.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }

    /// Forget all history, returning the window to its initial state.
    pub fn reset(&mut self, now: Instant) {
        self.bits = [0; WORDS];
        self.window_start = 0;
        self.last_sequence = 0;
        self.last_update = now;
        self.primed = false;
    }

    fn bit_set(&self, seq: u32) -> bool {
        let slot = seq % REPLAY_WINDOW_SIZE;
        self.bits[(slot / 64) as usize] & (1u64 << (slot % 64)) != 0
    }

    fn set_bit(&mut self, seq: u32) {
        let slot = seq % REPLAY_WINDOW_SIZE;
        self.bits[(slot / 64) as usize] |= 1u64 << (slot % 64);
    }

    fn clear_bit(&mut self, seq: u32) {
        let slot = seq % REPLAY_WINDOW_SIZE;
        self.bits[(slot / 64) as usize] &= !(1u64 << (slot % 64));
    }

    /// Check a sequence against the window, recording it on acceptance.
    pub fn check(&mut self, seq: u32, now: Instant) -> Result<(), ReplayError> {
        if !self.primed {
            self.primed = true;
            self.set_bit(seq);
            self.last_sequence = seq;
            if seq > REPLAY_WINDOW_SIZE {
                self.window_start = seq - REPLAY_WINDOW_SIZE;
            }
            self.last_update = now;
            return Ok(());
        }

        if self.last_sequence.abs_diff(seq) > MAX_SEQUENCE_GAP {
            return Err(ReplayError::SequenceGapTooLarge);
        }
        if seq < self.window_start {
            return Err(ReplayError::SequenceTooOld);
        }
        // Bits below window_start are cleared as the window advances, so a
        // set bit always belongs to a sequence still inside the window.
        if self.bit_set(seq) {
            return Err(ReplayError::Replay);
        }

        self.set_bit(seq);
        if seq > self.last_sequence {
            self.last_sequence = seq;
        }
        if seq.saturating_sub(self.window_start) > REPLAY_WINDOW_SIZE {
            self.advance(seq - REPLAY_WINDOW_SIZE);
        }
        self.last_update = now;
        Ok(())
    }

    fn advance(&mut self, new_start: u32) {
        if new_start.saturating_sub(self.window_start) >= REPLAY_WINDOW_SIZE {
            self.bits = [0; WORDS];
            self.set_bit(self.last_sequence);
        } else {
            for seq in self.window_start..new_start {
                self.clear_bit(seq);
            }
        }
        self.window_start = new_start;
    }
}
