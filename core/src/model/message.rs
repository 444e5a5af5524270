use serde::{Deserialize, Serialize};

use super::ids::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A single turn in a session's conversation. Ordering is strictly
/// monotonic by `(timestamp_ms, id)`; `message_index` is assigned
/// contiguously from 0 within a session by `ConversationStore::append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_ms: i64,
    pub message_index: u64,
    pub tokens: Option<u64>,
    pub web_search_meta: Option<serde_json::Value>,
}
