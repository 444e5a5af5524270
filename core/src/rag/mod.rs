//! Document ingestion and retrieval-augmented query assembly (spec.md
//! §4.11). Embedding and nearest-neighbor search are always delegated to
//! the host over `InferenceTransport`; this module owns extraction,
//! chunking, progress reporting and the client-side chunk metadata cache.

mod chunking;
mod extract;

pub use chunking::{TextChunk, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
pub use extract::{extract_text, DocumentFormat};

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::model::{DocumentId, SessionId, VectorChunk};
use crate::storage::VectorStore;
use crate::transport::{EmbedKind, InferenceTransport, SearchHit, VectorUploadItem};

/// Bound on raw document size before ingestion (spec.md §4.11 default).
pub const MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Extracting,
    Chunking,
    Embedding,
    Uploading,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestProgress {
    pub stage: IngestStage,
    pub percent: u8,
}

/// Document ingestion → chunking → host-delegated embedding → vector
/// upload, and query embedding → host-delegated search → context
/// assembly. One instance per session, sharing its `InferenceTransport`
/// and `VectorStore`.
pub struct RAGPipeline {
    vector_store: Arc<VectorStore>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RAGPipeline {
    pub fn new(vector_store: Arc<VectorStore>) -> Self {
        Self {
            vector_store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Ingests one document: extract, chunk, embed every chunk via the
    /// host, upload the batch, and only then persist chunk metadata
    /// locally. Any failure along the way leaves no chunk referenceable
    /// (spec.md §4.11: ingestion fails atomically).
    pub async fn ingest_document(
        &self,
        transport: &InferenceTransport,
        session_id: &SessionId,
        document_id: DocumentId,
        document_name: &str,
        bytes: &[u8],
        format: DocumentFormat,
        mut on_progress: impl FnMut(IngestProgress),
    ) -> Result<Vec<VectorChunk>> {
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(CoreError::InvalidConfig {
                message: format!(
                    "document {} bytes exceeds the {} byte ingestion bound",
                    bytes.len(),
                    MAX_DOCUMENT_BYTES
                ),
            });
        }

        on_progress(IngestProgress {
            stage: IngestStage::Extracting,
            percent: 0,
        });
        let text = extract_text(bytes, format)?;
        on_progress(IngestProgress {
            stage: IngestStage::Extracting,
            percent: 100,
        });

        on_progress(IngestProgress {
            stage: IngestStage::Chunking,
            percent: 0,
        });
        let text_chunks = chunking::chunk_text(&text, self.chunk_size, self.chunk_overlap);
        on_progress(IngestProgress {
            stage: IngestStage::Chunking,
            percent: 100,
        });

        if text_chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut vector_chunks = Vec::with_capacity(text_chunks.len());
        let mut upload_items = Vec::with_capacity(text_chunks.len());
        let document_type = format!("{format:?}");

        for (i, chunk) in text_chunks.iter().enumerate() {
            let chunk_id = crate::model::ChunkId::generate();
            let embedding = transport
                .embed_text(chunk_id.clone(), chunk.text.clone(), EmbedKind::Document)
                .await?;

            on_progress(IngestProgress {
                stage: IngestStage::Embedding,
                percent: (((i + 1) * 100) / text_chunks.len()) as u8,
            });

            upload_items.push(VectorUploadItem {
                chunk_id: chunk_id.clone(),
                embedding: embedding.clone(),
            });
            vector_chunks.push(VectorChunk {
                chunk_id,
                session_id: session_id.clone(),
                document_id: document_id.clone(),
                document_name: document_name.to_string(),
                document_type: document_type.clone(),
                index: chunk.index,
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
                text: chunk.text.clone(),
                embedding,
            });
        }

        on_progress(IngestProgress {
            stage: IngestStage::Uploading,
            percent: 0,
        });
        let (_uploaded, rejected, errors) = transport.upload_vectors(document_id, upload_items).await?;
        if !rejected.is_empty() {
            return Err(CoreError::Internal {
                message: format!(
                    "{} of {} chunks rejected by host: {}",
                    rejected.len(),
                    vector_chunks.len(),
                    errors.join("; ")
                ),
            });
        }
        on_progress(IngestProgress {
            stage: IngestStage::Uploading,
            percent: 100,
        });

        let fixed_dimension = self.vector_store.fixed_dimension(session_id).await?;
        for chunk in &vector_chunks {
            self.vector_store.put(chunk, fixed_dimension).await?;
        }

        Ok(vector_chunks)
    }

    /// Embeds `query`, searches via the host, and returns hits ordered by
    /// score — a prioritized list of chunks ready to splice into the next
    /// prompt (spec.md §4.11).
    pub async fn query(
        &self,
        transport: &InferenceTransport,
        query: &str,
        top_k: u32,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let placeholder_chunk_id = crate::model::ChunkId::generate();
        let embedding = transport
            .embed_text(placeholder_chunk_id, query.to_string(), EmbedKind::Query)
            .await?;
        transport.search_vectors(embedding, top_k, threshold).await
    }

    /// Splices retrieved chunk text into a prompt, in score order, under a
    /// simple header the host can ignore or weight as it likes.
    pub fn splice_context(prompt: &str, hits: &[SearchHit]) -> String {
        if hits.is_empty() {
            return prompt.to_string();
        }
        let mut out = String::from("Context:\n");
        for hit in hits {
            out.push_str("- ");
            out.push_str(&hit.text);
            out.push('\n');
        }
        out.push_str("\nQuestion: ");
        out.push_str(prompt);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_context_is_identity_with_no_hits() {
        assert_eq!(RAGPipeline::splice_context("hi", &[]), "hi");
    }

    #[test]
    fn splice_context_prepends_hit_text() {
        let hits = vec![SearchHit {
            chunk_id: crate::model::ChunkId::generate(),
            score: 0.9,
            text: "relevant fact".to_string(),
        }];
        let spliced = RAGPipeline::splice_context("what is it?", &hits);
        assert!(spliced.contains("relevant fact"));
        assert!(spliced.contains("what is it?"));
    }

    #[test]
    fn oversized_document_check_uses_byte_bound() {
        assert!(MAX_DOCUMENT_BYTES == 5 * 1024 * 1024);
    }
}
