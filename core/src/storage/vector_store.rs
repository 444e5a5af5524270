//! Client-side vector chunk metadata shard (spec.md §4.4). Nearest-neighbor
//! search is always delegated to the host over `InferenceTransport`; this
//! store only persists chunk metadata so the client can supplement host
//! search hits and survive host restarts.

use std::sync::Arc;

use super::facade::StorageFacade;
use crate::error::{CoreError, Result};
use crate::model::{ChunkId, SessionId, VectorChunk};

pub struct VectorStore {
    storage: Arc<dyn StorageFacade>,
}

impl VectorStore {
    pub fn new(storage: Arc<dyn StorageFacade>) -> Self {
        Self { storage }
    }

    fn path(session_id: &SessionId, chunk_id: &ChunkId) -> String {
        format!("vectors/{session_id}/{chunk_id}")
    }

    /// Stores a chunk, enforcing that its embedding dimensionality matches
    /// whatever the session's first upload fixed.
    pub async fn put(&self, chunk: &VectorChunk, fixed_dimension: Option<usize>) -> Result<()> {
        if let Some(expected) = fixed_dimension {
            if chunk.embedding.len() != expected {
                return Err(CoreError::EmbeddingDimensionMismatch {
                    expected,
                    actual: chunk.embedding.len(),
                });
            }
        }
        let bytes = serde_json::to_vec(chunk)?;
        self.storage
            .put(&Self::path(&chunk.session_id, &chunk.chunk_id), &bytes)
            .await
    }

    pub async fn get(&self, session_id: &SessionId, chunk_id: &ChunkId) -> Result<Option<VectorChunk>> {
        match self.storage.get(&Self::path(session_id, chunk_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, session_id: &SessionId) -> Result<Vec<VectorChunk>> {
        let paths = self.storage.list(&format!("vectors/{session_id}")).await?;
        let mut chunks = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(bytes) = self.storage.get(&path).await? {
                chunks.push(serde_json::from_slice::<VectorChunk>(&bytes)?);
            }
        }
        Ok(chunks)
    }

    /// Discards all chunk metadata for a session (spec.md §3: VectorChunks
    /// are session-scoped and discarded on close unless retained).
    pub async fn discard_session(&self, session_id: &SessionId) -> Result<()> {
        let paths = self.storage.list(&format!("vectors/{session_id}")).await?;
        for path in paths {
            self.storage.delete(&path).await?;
        }
        Ok(())
    }

    /// The embedding dimensionality already fixed for a session, if any
    /// chunk has been uploaded.
    pub async fn fixed_dimension(&self, session_id: &SessionId) -> Result<Option<usize>> {
        let chunks = self.list(session_id).await?;
        Ok(chunks.first().map(|c| c.embedding.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyDerivation;
    use crate::storage::FsStorageFacade;

    fn make_chunk(session_id: &SessionId, dim: usize) -> VectorChunk {
        VectorChunk {
            chunk_id: ChunkId::generate(),
            session_id: session_id.clone(),
            document_id: crate::model::DocumentId::generate(),
            document_name: "doc.txt".to_string(),
            document_type: "text".to_string(),
            index: 0,
            start_offset: 0,
            end_offset: 10,
            text: "hello".to_string(),
            embedding: vec![0.0; dim],
        }
    }

    async fn store() -> (tempfile::TempDir, VectorStore) {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let facade = FsStorageFacade::connect(&seed, tmp.path()).unwrap();
        (tmp, VectorStore::new(Arc::new(facade)))
    }

    #[tokio::test]
    async fn mismatched_embedding_dimension_is_rejected() {
        let (_tmp, store) = store().await;
        let session_id = SessionId::generate();
        let chunk = make_chunk(&session_id, 4);
        let err = store.put(&chunk, Some(8)).await.unwrap_err();
        assert!(matches!(err, CoreError::EmbeddingDimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn put_then_list_round_trips() {
        let (_tmp, store) = store().await;
        let session_id = SessionId::generate();
        let chunk = make_chunk(&session_id, 4);
        store.put(&chunk, None).await.unwrap();

        let chunks = store.list(&session_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, chunk.chunk_id);
    }
}
