//! Challenge/response integrity gating for new sessions.
//!
//! Before a peer may exchange application data, the dispatcher issues an
//! opaque challenge and withholds delivery until the peer's response
//! verifies. Known peers are re-challenged after a configurable stretch
//! of silence. The verification itself is delegated to an oracle; a
//! SHA-256 cookie oracle is provided as the default.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Verdict returned by an [`IntegrityOracle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityVerdict {
    /// Response matches the challenge
    Verified,
    /// Response does not match
    FailedChallenge,
    /// Response was structurally unusable
    FailedMalformed,
}

/// External verifier for challenge/response pairs.
pub trait IntegrityOracle: Send {
    /// Produce an opaque challenge.
    fn create_challenge(&mut self) -> Vec<u8>;
    /// Judge a response against the challenge it answers.
    fn verify_response(&self, challenge: &[u8], response: &[u8]) -> IntegrityVerdict;
}

/// External hardware-id registry and ban sink.
pub trait HwidRegistry: Send {
    /// Whether a hardware id is currently banned.
    fn is_hwid_banned(&self, id: &str) -> bool;
    /// Record a hardware-id ban.
    fn ban_hwid(&mut self, id: &str, reason: &str, duration: Duration);
    /// Lift a hardware-id ban.
    fn unban_hwid(&mut self, id: &str);
    /// Whether the id reports a virtual environment.
    fn is_virtual_environment(&self, id: &str) -> bool;
}

/// Cookie-style oracle: the expected response is
/// `SHA-256(secret || challenge)`.
///
/// Both sides hold the shared secret; [`CookieOracle::answer`] computes
/// the client half.
pub struct CookieOracle {
    secret: [u8; 32],
}

impl CookieOracle {
    /// Create an oracle from a shared secret.
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Compute the response a client must return for `challenge`.
    pub fn answer(secret: &[u8; 32], challenge: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.update(challenge);
        hasher.finalize().to_vec()
    }
}

impl IntegrityOracle for CookieOracle {
    fn create_challenge(&mut self) -> Vec<u8> {
        let nonce: [u8; 32] = rand::random();
        nonce.to_vec()
    }

    fn verify_response(&self, challenge: &[u8], response: &[u8]) -> IntegrityVerdict {
        if response.len() != 32 {
            return IntegrityVerdict::FailedMalformed;
        }
        if Self::answer(&self.secret, challenge) == response {
            IntegrityVerdict::Verified
        } else {
            IntegrityVerdict::FailedChallenge
        }
    }
}

/// Pack an oracle response and an optional hardware id into one
/// integrity-response payload (length-prefixed response, hwid trailing).
pub fn encode_response(response: &[u8], hwid: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + response.len());
    out.extend_from_slice(&(response.len() as u16).to_be_bytes());
    out.extend_from_slice(response);
    if let Some(hwid) = hwid {
        out.extend_from_slice(hwid.as_bytes());
    }
    out
}

/// Split an integrity-response payload into the oracle response and the
/// optional trailing hardware id.
pub fn decode_response(payload: &[u8]) -> Option<(&[u8], Option<&str>)> {
    if payload.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let rest = &payload[2..];
    if rest.len() < len {
        return None;
    }
    let (response, trailer) = rest.split_at(len);
    let hwid = if trailer.is_empty() {
        None
    } else {
        std::str::from_utf8(trailer).ok()
    };
    Some((response, hwid))
}

struct PendingChallenge {
    challenge: Vec<u8>,
    issued_at: Instant,
}

/// Outcome of processing an integrity response.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Peer verified; application traffic may flow
    Accepted,
    /// No challenge was pending for this peer
    NoPending,
    /// Response failed; the failure budget has room left
    Failed(u32),
    /// Response failed and the budget is exhausted; ban the peer
    BudgetExhausted,
}

/// Outcome of the optional hardware-id gate.
#[derive(Debug, PartialEq, Eq)]
pub enum HwidOutcome {
    /// Hardware id admitted (or gating disabled)
    Admitted,
    /// Hardware id is on the ban list
    Banned,
    /// Client reports a virtual environment and VMs are disallowed
    VirtualEnvironment,
}

/// Per-client challenge bookkeeping.
///
/// Challenges time out after twice the re-check interval; stale entries
/// are dropped by [`IntegrityGate::sweep`].
pub struct IntegrityGate {
    pending: HashMap<String, PendingChallenge>,
    failures: HashMap<String, u32>,
    verified_at: HashMap<String, Instant>,
    client_hwids: HashMap<String, String>,
    check_interval: Duration,
    max_failures: u32,
}

impl IntegrityGate {
    /// Create a gate re-challenging after `check_interval` of silence and
    /// banning after `max_failures` failed responses.
    pub fn new(check_interval: Duration, max_failures: u32) -> Self {
        Self {
            pending: HashMap::new(),
            failures: HashMap::new(),
            verified_at: HashMap::new(),
            client_hwids: HashMap::new(),
            check_interval,
            max_failures,
        }
    }

    /// Whether a client may exchange application data right now.
    pub fn is_verified(&self, client_id: &str, now: Instant) -> bool {
        match self.verified_at.get(client_id) {
            Some(at) => now.saturating_duration_since(*at) < self.check_interval,
            None => false,
        }
    }

    /// Whether a challenge should be issued to this client.
    pub fn needs_challenge(&self, client_id: &str, now: Instant) -> bool {
        !self.is_verified(client_id, now) && !self.pending.contains_key(client_id)
    }

    /// Issue and record a challenge for a client.
    pub fn issue(
        &mut self,
        client_id: &str,
        oracle: &mut dyn IntegrityOracle,
        now: Instant,
    ) -> Vec<u8> {
        let challenge = oracle.create_challenge();
        self.pending.insert(
            client_id.to_string(),
            PendingChallenge {
                challenge: challenge.clone(),
                issued_at: now,
            },
        );
        challenge
    }

    /// Judge a response against the client's pending challenge.
    pub fn handle_response(
        &mut self,
        client_id: &str,
        response: &[u8],
        oracle: &dyn IntegrityOracle,
        now: Instant,
    ) -> ResponseOutcome {
        let pending = match self.pending.get(client_id) {
            Some(p) => p,
            None => return ResponseOutcome::NoPending,
        };

        match oracle.verify_response(&pending.challenge, response) {
            IntegrityVerdict::Verified => {
                self.pending.remove(client_id);
                self.failures.remove(client_id);
                self.verified_at.insert(client_id.to_string(), now);
                ResponseOutcome::Accepted
            }
            IntegrityVerdict::FailedChallenge | IntegrityVerdict::FailedMalformed => {
                // Each challenge is answered once; the next packet from
                // the peer triggers a fresh one.
                self.pending.remove(client_id);
                let count = self.failures.entry(client_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= self.max_failures {
                    self.forget(client_id);
                    ResponseOutcome::BudgetExhausted
                } else {
                    ResponseOutcome::Failed(*count)
                }
            }
        }
    }

    /// Run the hardware-id gate for a freshly verified client.
    pub fn gate_hwid(
        &mut self,
        client_id: &str,
        hwid: &str,
        registry: &dyn HwidRegistry,
        allow_virtual_machine: bool,
    ) -> HwidOutcome {
        if registry.is_hwid_banned(hwid) {
            return HwidOutcome::Banned;
        }
        if !allow_virtual_machine && registry.is_virtual_environment(hwid) {
            return HwidOutcome::VirtualEnvironment;
        }
        self.client_hwids
            .insert(client_id.to_string(), hwid.to_string());
        HwidOutcome::Admitted
    }

    /// Hardware id recorded for a client, if any.
    pub fn hwid_of(&self, client_id: &str) -> Option<&str> {
        self.client_hwids.get(client_id).map(|s| s.as_str())
    }

    /// Drop all state for a client (disconnect or ban).
    pub fn forget(&mut self, client_id: &str) {
        self.pending.remove(client_id);
        self.failures.remove(client_id);
        self.verified_at.remove(client_id);
        self.client_hwids.remove(client_id);
    }

    /// Expire pending challenges that were never answered.
    pub fn sweep(&mut self, now: Instant) {
        let deadline = self.check_interval * 2;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.issued_at) <= deadline);
    }

    /// Number of challenges awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];

    fn gate() -> IntegrityGate {
        IntegrityGate::new(Duration::from_secs(30), 3)
    }

    #[test]
    fn cookie_oracle_verifies_correct_answers() {
        let mut oracle = CookieOracle::new(SECRET);
        let challenge = oracle.create_challenge();
        let response = CookieOracle::answer(&SECRET, &challenge);
        assert_eq!(
            oracle.verify_response(&challenge, &response),
            IntegrityVerdict::Verified
        );
        assert_eq!(
            oracle.verify_response(&challenge, &[0u8; 32]),
            IntegrityVerdict::FailedChallenge
        );
        assert_eq!(
            oracle.verify_response(&challenge, b"short"),
            IntegrityVerdict::FailedMalformed
        );
    }

    #[test]
    fn challenge_response_happy_path() {
        let now = Instant::now();
        let mut oracle = CookieOracle::new(SECRET);
        let mut gate = gate();

        assert!(gate.needs_challenge("1.2.3.4:5000", now));
        let challenge = gate.issue("1.2.3.4:5000", &mut oracle, now);
        assert!(!gate.needs_challenge("1.2.3.4:5000", now));

        let response = CookieOracle::answer(&SECRET, &challenge);
        assert_eq!(
            gate.handle_response("1.2.3.4:5000", &response, &oracle, now),
            ResponseOutcome::Accepted
        );
        assert!(gate.is_verified("1.2.3.4:5000", now));
    }

    #[test]
    fn verification_expires_after_interval() {
        let now = Instant::now();
        let mut oracle = CookieOracle::new(SECRET);
        let mut gate = gate();

        let challenge = gate.issue("peer:1", &mut oracle, now);
        let response = CookieOracle::answer(&SECRET, &challenge);
        gate.handle_response("peer:1", &response, &oracle, now);

        let later = now + Duration::from_secs(31);
        assert!(!gate.is_verified("peer:1", later));
        assert!(gate.needs_challenge("peer:1", later));
    }

    #[test]
    fn response_without_pending_challenge_ignored() {
        let now = Instant::now();
        let oracle = CookieOracle::new(SECRET);
        let mut gate = gate();
        assert_eq!(
            gate.handle_response("peer:1", &[0u8; 32], &oracle, now),
            ResponseOutcome::NoPending
        );
    }

    #[test]
    fn third_failure_exhausts_budget() {
        let now = Instant::now();
        let mut oracle = CookieOracle::new(SECRET);
        let mut gate = gate();

        for expected in 1..=2u32 {
            gate.issue("peer:1", &mut oracle, now);
            assert_eq!(
                gate.handle_response("peer:1", &[0u8; 32], &oracle, now),
                ResponseOutcome::Failed(expected)
            );
        }
        gate.issue("peer:1", &mut oracle, now);
        assert_eq!(
            gate.handle_response("peer:1", &[0u8; 32], &oracle, now),
            ResponseOutcome::BudgetExhausted
        );
    }

    struct StaticRegistry {
        banned: Vec<String>,
        virtual_ids: Vec<String>,
    }

    impl HwidRegistry for StaticRegistry {
        fn is_hwid_banned(&self, id: &str) -> bool {
            self.banned.iter().any(|b| b == id)
        }
        fn ban_hwid(&mut self, id: &str, _reason: &str, _duration: Duration) {
            self.banned.push(id.to_string());
        }
        fn unban_hwid(&mut self, id: &str) {
            self.banned.retain(|b| b != id);
        }
        fn is_virtual_environment(&self, id: &str) -> bool {
            self.virtual_ids.iter().any(|v| v == id)
        }
    }

    #[test]
    fn hwid_gate_blocks_banned_and_virtual() {
        let mut gate = gate();
        let registry = StaticRegistry {
            banned: vec!["hw-bad".to_string()],
            virtual_ids: vec!["hw-vm".to_string()],
        };

        assert_eq!(
            gate.gate_hwid("p:1", "hw-bad", &registry, false),
            HwidOutcome::Banned
        );
        assert_eq!(
            gate.gate_hwid("p:1", "hw-vm", &registry, false),
            HwidOutcome::VirtualEnvironment
        );
        assert_eq!(
            gate.gate_hwid("p:1", "hw-vm", &registry, true),
            HwidOutcome::Admitted
        );
        assert_eq!(
            gate.gate_hwid("p:2", "hw-ok", &registry, false),
            HwidOutcome::Admitted
        );
        assert_eq!(gate.hwid_of("p:2"), Some("hw-ok"));
    }

    #[test]
    fn response_payload_roundtrip() {
        let encoded = encode_response(&[9u8; 32], Some("hw-1234"));
        let (response, hwid) = decode_response(&encoded).expect("decodes");
        assert_eq!(response, &[9u8; 32]);
        assert_eq!(hwid, Some("hw-1234"));

        let bare = encode_response(&[9u8; 32], None);
        let (response, hwid) = decode_response(&bare).expect("decodes");
        assert_eq!(response.len(), 32);
        assert_eq!(hwid, None);

        assert!(decode_response(&[0x00]).is_none());
        assert!(decode_response(&[0x00, 0xFF, 0x01]).is_none());
    }

    #[test]
    fn sweep_expires_unanswered_challenges() {
        let now = Instant::now();
        let mut oracle = CookieOracle::new(SECRET);
        let mut gate = gate();
        gate.issue("peer:1", &mut oracle, now);
        assert_eq!(gate.pending_count(), 1);

        gate.sweep(now + Duration::from_secs(59));
        assert_eq!(gate.pending_count(), 1);
        gate.sweep(now + Duration::from_secs(61));
        assert_eq!(gate.pending_count(), 0);
    }
}
