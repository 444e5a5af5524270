//! Ed25519 message signing and replay-window verification for host frames
//! (spec.md §4.8: "checkpoint notices are signed by the host").

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;

use crate::error::{CoreError, Result};

const REPLAY_WINDOW_SIZE: usize = 256;

pub fn sign_payload(signing_key: &ed25519_dalek::SigningKey, payload: &[u8]) -> [u8; 64] {
    use ed25519_dalek::Signer;
    signing_key.sign(payload).to_bytes()
}

pub fn verify_signature(verifying_key: &VerifyingKey, payload: &[u8], signature: &[u8; 64]) -> bool {
    let sig = Signature::from_bytes(signature);
    verifying_key.verify(payload, &sig).is_ok()
}

/// Rejects a signed frame whose nonce has already been seen, bounding replay
/// to a sliding window of the last `REPLAY_WINDOW_SIZE` nonces rather than
/// keeping an unbounded history for the life of a session.
pub struct ReplayGuard {
    seen: Mutex<VecDeque<u64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(VecDeque::with_capacity(REPLAY_WINDOW_SIZE)),
        }
    }

    pub fn check_and_record(&self, nonce: u64) -> Result<()> {
        let mut seen = self.seen.lock();
        if seen.contains(&nonce) {
            return Err(CoreError::Internal {
                message: format!("replayed nonce {nonce}"),
            });
        }
        if seen.len() == REPLAY_WINDOW_SIZE {
            seen.pop_front();
        }
        seen.push_back(nonce);
        Ok(())
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn signature_round_trips() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let payload = b"checkpoint:1600";
        let sig = sign_payload(&signing_key, payload);
        assert!(verify_signature(&verifying_key, payload, &sig));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let sig = sign_payload(&signing_key, b"checkpoint:1600");
        assert!(!verify_signature(&verifying_key, b"checkpoint:1601", &sig));
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let guard = ReplayGuard::new();
        guard.check_and_record(42).unwrap();
        assert!(guard.check_and_record(42).is_err());
    }
}
