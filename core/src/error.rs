//! Structured error types for infermesh-core
//!
//! Every failure surfaces as a typed variant rather than a free-form string,
//! carrying enough structured data for a caller to decide retry vs. fail.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for infermesh-core operations
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Construction / configuration
    // =========================================================================
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    // =========================================================================
    // Identity / wallet
    // =========================================================================
    #[error("identity not authenticated: a wallet capability is required")]
    IdentityNotAuthenticated,

    #[error("invalid private key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid entropy length: expected {expected} bytes, got {actual}")]
    InvalidEntropyLength { expected: usize, actual: usize },

    // =========================================================================
    // On-chain / contract facade (permanent failures)
    // =========================================================================
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u128, available: u128 },

    #[error("unauthorized signer: {address}")]
    UnauthorizedSigner { address: String },

    #[error("contract call reverted: {reason}")]
    ContractReverted { reason: String },

    // =========================================================================
    // Network / transport
    // =========================================================================
    #[error("transient network error: {message}")]
    NetworkTransient { message: String },

    #[error("transport dropped")]
    TransportDropped,

    #[error("transport closed")]
    TransportClosed,

    #[error("transport timed out after {duration:?}")]
    TransportTimeout { duration: Duration },

    #[error("permission denied: operation {operation} is not permitted by the current token")]
    PermissionDenied { operation: String },

    #[error("token expired")]
    TokenExpired,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("signed message rejected: {reason}")]
    SignatureInvalid { reason: String },

    // =========================================================================
    // Session lifecycle
    // =========================================================================
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session already closed: {session_id}")]
    SessionAlreadyClosed { session_id: String },

    // =========================================================================
    // Checkpoint / settlement integrity
    // =========================================================================
    #[error("proof hash mismatch for session {session_id}")]
    ProofHashMismatch { session_id: String },

    #[error("failed to fetch checkpoint delta: {reason}")]
    DeltaFetchFailed { reason: String },

    #[error("checkpoint not accepted on-chain for session {session_id}")]
    CheckpointNotAccepted { session_id: String },

    // =========================================================================
    // Discovery / selection
    // =========================================================================
    #[error("host unavailable: {host_id}")]
    HostUnavailable { host_id: String },

    // =========================================================================
    // RAG / vectors
    // =========================================================================
    #[error("embedding dimension mismatch: session expects {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    // =========================================================================
    // Storage
    // =========================================================================
    #[error("storage path not found: {path}")]
    StorageNotFound { path: String },

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("unexpected state: {description}")]
    UnexpectedState { description: String },

    // =========================================================================
    // External wrappers (transparent)
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Check if error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkTransient { .. } => true,
            Self::TransportDropped => true,
            Self::TransportTimeout { .. } => true,
            Self::RateLimited { .. } => true,
            Self::DeltaFetchFailed { .. } => true,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::InvalidConfig { .. }
            | Self::IdentityNotAuthenticated
            | Self::InvalidKey { .. }
            | Self::InvalidEntropyLength { .. }
            | Self::InsufficientFunds { .. }
            | Self::UnauthorizedSigner { .. }
            | Self::ContractReverted { .. }
            | Self::TransportClosed
            | Self::PermissionDenied { .. }
            | Self::TokenExpired
            | Self::SignatureInvalid { .. }
            | Self::SessionNotFound { .. }
            | Self::SessionAlreadyClosed { .. }
            | Self::ProofHashMismatch { .. }
            | Self::CheckpointNotAccepted { .. }
            | Self::HostUnavailable { .. }
            | Self::EmbeddingDimensionMismatch { .. }
            | Self::StorageNotFound { .. }
            | Self::Internal { .. }
            | Self::UnexpectedState { .. }
            | Self::Json(_)
            | Self::Http(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Get suggested retry delay for retryable errors
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            Self::NetworkTransient { .. } => Some(Duration::from_secs(1)),
            Self::TransportDropped => Some(Duration::from_secs(2)),
            Self::DeltaFetchFailed { .. } => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Whether this error should trigger an automatic, bounded retry of the
    /// operation that produced it (token refresh, then retry once).
    pub fn triggers_refresh(&self) -> bool {
        matches!(self, Self::TokenExpired)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Extension trait for converting Option to Result with CoreError
pub trait OptionExt<T> {
    fn ok_or_storage_not_found(self, path: impl Into<String>) -> Result<T>;
    fn ok_or_session_not_found(self, session_id: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_storage_not_found(self, path: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CoreError::StorageNotFound { path: path.into() })
    }

    fn ok_or_session_not_found(self, session_id: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CoreError::SessionNotFound {
            session_id: session_id.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(CoreError::RateLimited { retry_after_ms: 500 }.is_retryable());
        assert!(CoreError::NetworkTransient {
            message: "connection reset".to_string()
        }
        .is_retryable());
        assert!(!CoreError::InsufficientFunds {
            needed: 100,
            available: 10
        }
        .is_retryable());
        assert!(!CoreError::SessionNotFound {
            session_id: "s1".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_delay() {
        let err = CoreError::RateLimited { retry_after_ms: 1234 };
        assert_eq!(err.retry_delay(), Some(Duration::from_millis(1234)));
        assert_eq!(CoreError::TokenExpired.retry_delay(), None);
    }

    #[test]
    fn test_token_expired_triggers_refresh() {
        assert!(CoreError::TokenExpired.triggers_refresh());
        assert!(!CoreError::TransportClosed.triggers_refresh());
    }

    #[test]
    fn test_option_ext() {
        let opt: Option<i32> = None;
        let result = opt.ok_or_storage_not_found("vectors/s1/c1");
        assert!(matches!(result, Err(CoreError::StorageNotFound { .. })));

        let opt: Option<i32> = None;
        let result = opt.ok_or_session_not_found("s1");
        assert!(matches!(result, Err(CoreError::SessionNotFound { .. })));
    }
}
