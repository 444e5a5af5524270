//! Wire protocol for the duplex inference transport (spec.md §4.8).

use serde::{Deserialize, Serialize};

use super::signing::now_unix_ms;
use crate::model::{ChunkId, DocumentId, HostId, SessionId};

pub const PROTOCOL_VERSION: u32 = 1;

/// Every frame on the wire is an `Envelope` wrapping a tagged `ClientFrame`
/// or `HostFrame`; `v` lets either side reject an incompatible peer before
/// attempting to deserialize `payload`. `timestamp_ms` is stamped at
/// envelope construction for every message type (spec.md §6: "Envelope
/// fields: type, session_id, timestamp"), independent of the optional,
/// signed-mode-only `timestamp_ms` carried inside `Prompt`/`Response`
/// payloads for replay-window verification.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope<T> {
    pub v: u32,
    pub request_id: Option<uuid::Uuid>,
    pub timestamp_ms: u64,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            request_id: Some(uuid::Uuid::new_v4()),
            timestamp_ms: now_unix_ms(),
            payload,
        }
    }
}

/// `kind` discriminant for `embed_text` (spec.md §4.8): a query embedding
/// is never persisted, a document embedding is destined for upload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbedKind {
    Query,
    Document,
}

/// One chunk within a batched `upload_vectors` frame.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VectorUploadItem {
    pub chunk_id: ChunkId,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SessionInit {
        session_id: SessionId,
        bearer_token: String,
        model: String,
    },
    /// Carries the full prior conversation; the host decides truncation
    /// (spec.md §4.9: "never truncate on the client").
    SessionResume {
        session_id: SessionId,
        bearer_token: String,
        conversation_context: Vec<(crate::model::MessageRole, String)>,
        last_message_index: u64,
    },
    Prompt {
        session_id: SessionId,
        message_index: u64,
        content: String,
        context_chunks: Vec<ChunkId>,
        /// True if `content` is zstd-compressed (spec.md §4.8: content
        /// over the compression threshold is compressed before sending).
        compressed: bool,
        /// Present only in signed mode: ed25519 signature over
        /// `content || timestamp_ms || nonce`.
        signature: Option<[u8; 64]>,
        nonce: Option<u64>,
        timestamp_ms: Option<u64>,
    },
    /// Sent instead of individual `Prompt` frames when batching is enabled
    /// and more than one prompt accumulated within `batchWindowMs`.
    PromptBatch {
        session_id: SessionId,
        prompts: Vec<BatchedPrompt>,
    },
    SearchVectors {
        session_id: SessionId,
        query_embedding: Vec<f32>,
        top_k: u32,
        threshold: f32,
    },
    EmbedText {
        session_id: SessionId,
        chunk_id: ChunkId,
        text: String,
        kind: EmbedKind,
    },
    UploadVectors {
        session_id: SessionId,
        document_id: DocumentId,
        items: Vec<VectorUploadItem>,
    },
    SessionEnd {
        session_id: SessionId,
        total_tokens: u64,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchedPrompt {
    pub message_index: u64,
    pub content: String,
    pub context_chunks: Vec<ChunkId>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    SessionAck {
        session_id: SessionId,
        host_id: HostId,
    },
    Response {
        session_id: SessionId,
        message_index: u64,
        delta: String,
        done: bool,
        tokens_used: Option<u64>,
        /// Present only in signed mode: signature over
        /// `delta || timestamp_ms` by the host's announced key.
        signature: Option<[u8; 64]>,
        timestamp_ms: Option<u64>,
    },
    /// The host proposes a checkpoint for the client to countersign-check
    /// and submit on-chain (spec.md §9, Open Question a: the host
    /// authors the checkpoint, the client verifies before submission).
    /// `host_signature` is the host's Ed25519 signature over
    /// `session_id || cumulative_tokens || proof_hash`, verified locally by
    /// `checkpoint::CheckpointEngine` before `onchain_signature` (the
    /// contract-native 65-byte recoverable signature) is ever submitted.
    CheckpointNotice {
        session_id: SessionId,
        cumulative_tokens: u64,
        delta_tokens: u64,
        proof_hash: [u8; 32],
        proof_cid: String,
        host_signature: [u8; 64],
        onchain_signature: [u8; 65],
    },
    SearchResult {
        session_id: SessionId,
        hits: Vec<SearchHit>,
    },
    EmbedResult {
        session_id: SessionId,
        chunk_id: ChunkId,
        embedding: Vec<f32>,
    },
    UploadAck {
        session_id: SessionId,
        uploaded: Vec<ChunkId>,
        rejected: Vec<ChunkId>,
        errors: Vec<String>,
    },
    Error {
        session_id: Option<SessionId>,
        code: String,
        message: String,
        retry_after_ms: Option<u64>,
    },
    SessionEnded {
        session_id: SessionId,
        total_tokens: u64,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub text: String,
}
