//! Append-only per-session message log, layered on `StorageFacade`
//! (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::facade::StorageFacade;
use crate::error::Result;
use crate::model::{Message, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationManifest {
    pub model: String,
    pub provider: String,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub enum ExportFormat {
    Json,
    Markdown,
}

pub struct ConversationStore {
    storage: Arc<dyn StorageFacade>,
    // Serializes append() per session so index assignment stays gap-free
    // even though the underlying facade only guarantees per-path ordering.
    session_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(storage: Arc<dyn StorageFacade>) -> Self {
        Self {
            storage,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn messages_path(session_id: &SessionId, index: u64) -> String {
        format!("conversations/{session_id}/messages/{index}")
    }

    fn manifest_path(session_id: &SessionId) -> String {
        format!("conversations/{session_id}/manifest")
    }

    /// Appends a message, assigning the next contiguous `message_index`.
    /// Idempotent on `message.id`: appending a message whose id is already
    /// present returns the stored copy unchanged.
    pub async fn append(&self, session_id: &SessionId, mut message: Message) -> Result<Message> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let existing = self.load(session_id).await?;
        if let Some(found) = existing.iter().find(|m| m.id == message.id) {
            return Ok(found.clone());
        }

        let next_index = existing.len() as u64;
        message.message_index = next_index;

        let bytes = serde_json::to_vec(&message)?;
        self.storage
            .put(&Self::messages_path(session_id, next_index), &bytes)
            .await?;

        self.touch_manifest(session_id, &message).await?;
        Ok(message)
    }

    /// Loads all messages for a session, ordered by `message_index`.
    pub async fn load(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let paths = self
            .storage
            .list(&format!("conversations/{session_id}/messages"))
            .await?;

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(bytes) = self.storage.get(&path).await? {
                messages.push(serde_json::from_slice::<Message>(&bytes)?);
            }
        }
        messages.sort_by_key(|m| m.message_index);
        Ok(messages)
    }

    pub async fn manifest(&self, session_id: &SessionId) -> Result<Option<ConversationManifest>> {
        match self.storage.get(&Self::manifest_path(session_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn touch_manifest(&self, session_id: &SessionId, message: &Message) -> Result<()> {
        let now = Utc::now();
        let mut manifest = match self.manifest(session_id).await? {
            Some(m) => m,
            None => ConversationManifest {
                model: String::new(),
                provider: String::new(),
                total_tokens: 0,
                created_at: now,
                updated_at: now,
            },
        };
        manifest.total_tokens += message.tokens.unwrap_or(0);
        manifest.updated_at = now;

        let bytes = serde_json::to_vec(&manifest)?;
        self.storage
            .put(&Self::manifest_path(session_id), &bytes)
            .await
    }

    pub async fn export(&self, session_id: &SessionId, format: ExportFormat) -> Result<String> {
        let messages = self.load(session_id).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&messages)?),
            ExportFormat::Markdown => {
                let mut out = String::new();
                for m in &messages {
                    out.push_str(&format!("**{:?}**: {}\n\n", m.role, m.content));
                }
                Ok(out)
            }
        }
    }

    pub async fn delete(&self, session_id: &SessionId) -> Result<()> {
        let paths = self
            .storage
            .list(&format!("conversations/{session_id}/messages"))
            .await?;
        for path in paths {
            self.storage.delete(&path).await?;
        }
        self.storage
            .delete(&Self::manifest_path(session_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyDerivation;
    use crate::model::MessageRole;
    use crate::storage::FsStorageFacade;

    fn make_message(id: &str, session_id: &SessionId, content: &str) -> Message {
        Message {
            id: id.to_string(),
            session_id: session_id.clone(),
            role: MessageRole::User,
            content: content.to_string(),
            timestamp_ms: 0,
            message_index: 0,
            tokens: Some(10),
            web_search_meta: None,
        }
    }

    async fn store() -> (tempfile::TempDir, ConversationStore) {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let facade = FsStorageFacade::connect(&seed, tmp.path()).unwrap();
        (tmp, ConversationStore::new(Arc::new(facade)))
    }

    #[tokio::test]
    async fn append_then_load_returns_appended_sequence() {
        let (_tmp, store) = store().await;
        let session_id = SessionId::generate();

        store
            .append(&session_id, make_message("m1", &session_id, "hi"))
            .await
            .unwrap();
        store
            .append(&session_id, make_message("m2", &session_id, "there"))
            .await
            .unwrap();

        let loaded = store.load(&session_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].message_index, 0);
        assert_eq!(loaded[1].message_index, 1);
        assert_eq!(loaded[0].id, "m1");
        assert_eq!(loaded[1].id, "m2");
    }

    #[tokio::test]
    async fn append_is_idempotent_on_id() {
        let (_tmp, store) = store().await;
        let session_id = SessionId::generate();

        store
            .append(&session_id, make_message("m1", &session_id, "hi"))
            .await
            .unwrap();
        store
            .append(&session_id, make_message("m1", &session_id, "hi again"))
            .await
            .unwrap();

        let loaded = store.load(&session_id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "hi");
    }

    #[tokio::test]
    async fn export_json_then_reparse_preserves_fields() {
        let (_tmp, store) = store().await;
        let session_id = SessionId::generate();
        store
            .append(&session_id, make_message("m1", &session_id, "hi"))
            .await
            .unwrap();

        let json = store.export(&session_id, ExportFormat::Json).await.unwrap();
        let reparsed: Vec<Message> = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.len(), 1);
        assert_eq!(reparsed[0].content, "hi");
    }
}
