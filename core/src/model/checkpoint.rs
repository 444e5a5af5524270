use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SessionId;

/// A host-signed, delta-based token-usage claim posted on-chain.
///
/// Invariant: `cumulative_tokens` is strictly non-decreasing per session;
/// each record's `cumulative_tokens` equals the prior record's plus
/// `delta_tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub session_id: SessionId,
    pub cumulative_tokens: u64,
    pub delta_tokens: u64,
    /// 32-byte proof hash, hex-encoded on the wire.
    pub proof_hash: [u8; 32],
    /// 65-byte recoverable signature, hex-encoded on the wire.
    pub signature: [u8; 65],
    pub proof_cid: String,
    pub submitted_at: DateTime<Utc>,
    pub on_chain_tx_hash: Option<String>,
    pub verified_on_chain: bool,
    /// True if the client padded `delta_tokens` up to `MIN_CHECKPOINT_TOKENS`
    /// rather than this being genuine usage (spec.md §9, Open Question b).
    pub padded: bool,
}
