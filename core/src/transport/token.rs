//! Bearer token issuance and refresh for transport authentication
//! (spec.md §4.8: hosts accept a short-lived bearer token, refreshed on
//! `TokenExpired`).

use std::sync::Arc;

use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::SessionId;
use crate::wallet::WalletCapability;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Claims {
    sub: String,
    session_id: String,
    iat: u64,
    exp: u64,
}

const TOKEN_TTL_SECS: u64 = 300;

/// Whether a bearer token observed to expire at `expires_at_ms` is within
/// `refresh_before_ms` of `now_ms` (spec.md §4.8: "the transport refreshes
/// it whenever its observed `expiresAt` is within `refreshBeforeMs` of
/// now"). A transport calls this before each send and, when due, mints a
/// fresh token via `TokenIssuer::refresh` for the next `reconnect`.
pub fn is_due_for_refresh(expires_at_ms: u64, refresh_before_ms: u64, now_ms: u64) -> bool {
    expires_at_ms.saturating_sub(now_ms) <= refresh_before_ms
}

/// Issues and caches bearer tokens per session, minting a fresh one on
/// expiry rather than the caller needing to track TTLs itself.
pub struct TokenIssuer {
    wallet: Arc<dyn WalletCapability>,
    signing_secret: Vec<u8>,
    cache: Mutex<std::collections::HashMap<SessionId, (String, u64)>>,
}

impl TokenIssuer {
    pub fn new(wallet: Arc<dyn WalletCapability>, signing_secret: Vec<u8>) -> Self {
        Self {
            wallet,
            signing_secret,
            cache: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn token_for(&self, session_id: &SessionId) -> Result<String> {
        let now = crate::transport::signing::now_unix_ms() / 1000;
        if let Some((token, exp)) = self.cache.lock().get(session_id).cloned() {
            if exp > now + 10 {
                return Ok(token);
            }
        }
        self.mint(session_id, now).await
    }

    pub async fn refresh(&self, session_id: &SessionId) -> Result<String> {
        let now = crate::transport::signing::now_unix_ms() / 1000;
        self.mint(session_id, now).await
    }

    async fn mint(&self, session_id: &SessionId, now: u64) -> Result<String> {
        let address = self.wallet.get_address().await?;
        let exp = now + TOKEN_TTL_SECS;
        let claims = Claims {
            sub: address,
            session_id: session_id.as_str().to_string(),
            iat: now,
            exp,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.signing_secret),
        )
        .map_err(|e| CoreError::Internal {
            message: format!("token encoding failed: {e}"),
        })?;

        self.cache.lock().insert(session_id.clone(), (token.clone(), exp));
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::LocalEd25519Wallet;

    #[tokio::test]
    async fn token_is_cached_until_near_expiry() {
        let wallet = Arc::new(LocalEd25519Wallet::from_seed_bytes(&[7u8; 32]));
        let issuer = TokenIssuer::new(wallet, b"test-secret".to_vec());
        let session_id = SessionId::generate();
        let first = issuer.token_for(&session_id).await.unwrap();
        let second = issuer.token_for(&session_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn refresh_mints_a_new_token() {
        let wallet = Arc::new(LocalEd25519Wallet::from_seed_bytes(&[7u8; 32]));
        let issuer = TokenIssuer::new(wallet, b"test-secret".to_vec());
        let session_id = SessionId::generate();
        let first = issuer.token_for(&session_id).await.unwrap();
        let refreshed = issuer.refresh(&session_id).await.unwrap();
        assert_ne!(first, refreshed);
    }

    #[test]
    fn refresh_is_due_once_within_the_configured_window() {
        let expires_at_ms = 100_000;
        assert!(!is_due_for_refresh(expires_at_ms, 30_000, 60_000));
        assert!(is_due_for_refresh(expires_at_ms, 30_000, 71_000));
        assert!(is_due_for_refresh(expires_at_ms, 30_000, 150_000));
    }
}
