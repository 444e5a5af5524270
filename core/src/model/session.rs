use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{HostId, SessionId};

/// Session lifecycle state. Advances only forward, except into `Failed`,
/// which is terminal from any prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Funded,
    TransportOpen,
    Active,
    ClosingPendingHost,
    Settled,
    Failed,
}

impl SessionState {
    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Failed {
            return self != Settled && self != Failed;
        }
        matches!(
            (self, next),
            (Created, Funded)
                | (Funded, TransportOpen)
                | (TransportOpen, Active)
                | (Active, ClosingPendingHost)
                // A session closed before any prompt/response pair
                // completed never reached Active (spec.md §4.9); ending it
                // is still a legal explicit `endSession`.
                | (TransportOpen, ClosingPendingHost)
                | (ClosingPendingHost, Settled)
        )
    }
}

/// Explicit, fully-enumerated session configuration (spec.md §9: no dynamic
/// freeform config objects).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub deposit_amount: u128,
    pub price_per_token: u128,
    pub proof_interval: u64,
    pub duration: u64,
    pub payment_token: String,
    pub chain_id: u64,
    pub model: String,
    pub host_id: HostId,
    pub host_endpoint: String,
    pub use_deposit: bool,
}

/// A bounded, paid conversation or query stream with one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub job_id: String,
    pub user_address: String,
    pub host_id: HostId,
    pub host_endpoint: String,
    pub model: String,
    pub price_per_token: u128,
    pub deposit_amount: u128,
    pub proof_interval: u64,
    pub duration: u64,
    pub chain_id: u64,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        if matches!(next, SessionState::Settled | SessionState::Failed) {
            self.ended_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_linear() {
        assert!(SessionState::Created.can_advance_to(SessionState::Funded));
        assert!(!SessionState::Created.can_advance_to(SessionState::Active));
        assert!(!SessionState::Created.can_advance_to(SessionState::Created));
    }

    #[test]
    fn failed_reachable_from_any_nonterminal_state() {
        assert!(SessionState::Created.can_advance_to(SessionState::Failed));
        assert!(SessionState::Active.can_advance_to(SessionState::Failed));
        assert!(!SessionState::Settled.can_advance_to(SessionState::Failed));
        assert!(!SessionState::Failed.can_advance_to(SessionState::Failed));
    }
}
