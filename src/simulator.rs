//! Network-condition simulation for testing.
//!
//! The simulator is a pure interposer: given a datagram it decides to
//! drop, corrupt, delay, or duplicate it, per configured probabilities,
//! with bandwidth accounted over one-second windows. The transport only
//! observes pass-or-drop plus a delay hint it may queue or ignore.

use std::time::{Duration, Instant};

/// Probabilities and limits for a simulated link.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Chance a datagram is silently dropped
    pub drop_chance: f64,
    /// Chance a datagram is corrupted
    pub corrupt_chance: f64,
    /// Per-byte flip chance within a corrupted datagram
    pub byte_corrupt_chance: f64,
    /// Chance a datagram is emitted twice
    pub duplicate_chance: f64,
    /// Lower bound of the added latency
    pub min_delay: Duration,
    /// Upper bound of the added latency
    pub max_delay: Duration,
    /// Datagrams above this size are rejected outright
    pub mtu: Option<usize>,
    /// Bytes allowed per one-second window
    pub bandwidth_limit: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            drop_chance: 0.0,
            corrupt_chance: 0.0,
            byte_corrupt_chance: 0.01,
            duplicate_chance: 0.0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            mtu: None,
            bandwidth_limit: None,
        }
    }
}

/// Verdict for one datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum SimVerdict {
    /// The link ate the datagram
    Drop,
    /// The datagram survives, possibly mangled
    Pass {
        /// Bytes as they leave the simulated link
        bytes: Vec<u8>,
        /// Latency hint; the caller may queue or ignore it
        delay: Duration,
        /// Emit the datagram a second time
        duplicate: bool,
    },
}

/// A simulated lossy link.
pub struct NetworkSimulator {
    config: SimulatorConfig,
    window_start: Option<Instant>,
    window_bytes: usize,
}

impl NetworkSimulator {
    /// Create a simulator from its configuration.
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            window_start: None,
            window_bytes: 0,
        }
    }

    /// Run one datagram through the simulated link.
    pub fn process(&mut self, bytes: &[u8], now: Instant) -> SimVerdict {
        if let Some(mtu) = self.config.mtu {
            if bytes.len() > mtu {
                return SimVerdict::Drop;
            }
        }

        if let Some(limit) = self.config.bandwidth_limit {
            let window_elapsed = self
                .window_start
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or(Duration::MAX);
            if window_elapsed >= Duration::from_secs(1) {
                self.window_start = Some(now);
                self.window_bytes = 0;
            }
            if self.window_bytes + bytes.len() > limit {
                return SimVerdict::Drop;
            }
            self.window_bytes += bytes.len();
        }

        if rand::random::<f64>() < self.config.drop_chance {
            return SimVerdict::Drop;
        }

        let mut out = bytes.to_vec();
        if rand::random::<f64>() < self.config.corrupt_chance {
            for byte in out.iter_mut() {
                if rand::random::<f64>() < self.config.byte_corrupt_chance {
                    *byte ^= 1 << (rand::random::<u8>() % 8);
                }
            }
        }

        let delay = if self.config.max_delay > self.config.min_delay {
            let span = (self.config.max_delay - self.config.min_delay).as_secs_f64();
            self.config.min_delay + Duration::from_secs_f64(span * rand::random::<f64>())
        } else {
            self.config.min_delay
        };

        SimVerdict::Pass {
            bytes: out,
            delay,
            duplicate: rand::random::<f64>() < self.config.duplicate_chance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_link_passes_unchanged() {
        let mut sim = NetworkSimulator::new(SimulatorConfig::default());
        match sim.process(b"datagram", Instant::now()) {
            SimVerdict::Pass {
                bytes,
                delay,
                duplicate,
            } => {
                assert_eq!(bytes, b"datagram");
                assert_eq!(delay, Duration::ZERO);
                assert!(!duplicate);
            }
            SimVerdict::Drop => panic!("clean link dropped a datagram"),
        }
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut sim = NetworkSimulator::new(SimulatorConfig {
            drop_chance: 1.0,
            ..SimulatorConfig::default()
        });
        assert_eq!(sim.process(b"x", Instant::now()), SimVerdict::Drop);
    }

    #[test]
    fn mtu_rejects_oversize() {
        let mut sim = NetworkSimulator::new(SimulatorConfig {
            mtu: Some(4),
            ..SimulatorConfig::default()
        });
        let now = Instant::now();
        assert!(matches!(sim.process(b"abcd", now), SimVerdict::Pass { .. }));
        assert_eq!(sim.process(b"abcde", now), SimVerdict::Drop);
    }

    #[test]
    fn bandwidth_window_caps_throughput() {
        let mut sim = NetworkSimulator::new(SimulatorConfig {
            bandwidth_limit: Some(10),
            ..SimulatorConfig::default()
        });
        let now = Instant::now();
        assert!(matches!(sim.process(b"12345", now), SimVerdict::Pass { .. }));
        assert!(matches!(sim.process(b"12345", now), SimVerdict::Pass { .. }));
        assert_eq!(sim.process(b"x", now), SimVerdict::Drop);

        // A fresh window readmits traffic.
        let later = now + Duration::from_secs(1);
        assert!(matches!(sim.process(b"12345", later), SimVerdict::Pass { .. }));
    }

    #[test]
    fn always_corrupt_flips_bytes() {
        let mut sim = NetworkSimulator::new(SimulatorConfig {
            corrupt_chance: 1.0,
            byte_corrupt_chance: 1.0,
            ..SimulatorConfig::default()
        });
        match sim.process(&[0u8; 32], Instant::now()) {
            SimVerdict::Pass { bytes, .. } => assert_ne!(bytes, vec![0u8; 32]),
            SimVerdict::Drop => panic!("corruption should not drop"),
        }
    }

    #[test]
    fn delay_stays_within_bounds() {
        let mut sim = NetworkSimulator::new(SimulatorConfig {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..SimulatorConfig::default()
        });
        for _ in 0..32 {
            match sim.process(b"x", Instant::now()) {
                SimVerdict::Pass { delay, .. } => {
                    assert!(delay >= Duration::from_millis(10));
                    assert!(delay <= Duration::from_millis(50));
                }
                SimVerdict::Drop => panic!("clean link dropped"),
            }
        }
    }
}
