use serde::{Deserialize, Serialize};

use super::ids::{ChunkId, DocumentId, SessionId};

/// A single chunk of an ingested document with its embedding.
/// Embedding dimensionality is fixed per session at first upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorChunk {
    pub chunk_id: ChunkId,
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub document_name: String,
    pub document_type: String,
    pub index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}
