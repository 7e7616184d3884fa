//! Document ingestion: extract → chunk → embed → index → persist.
//!
//! A document enters the index all at once or not at all. Every chunk is
//! embedded before anything is written; the write itself replaces whatever
//! the index held for the same source, so re-ingesting a file never leaves
//! stale chunks behind. Embedding failures are not retried here.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::chunk::Chunker;
use crate::embedding::EmbeddingClient;
use crate::error::{PipelineError, RagError, Stage, StageExt};
use crate::extract::extract_text;
use crate::index::VectorIndex;
use crate::models::{Document, IndexEntry};
use crate::persist::IndexStore;

/// Outcome of a successful ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub source_id: String,
    /// Chunks indexed for this document.
    pub chunk_count: usize,
    /// Chunks of an earlier version of the same source that were replaced.
    pub replaced: usize,
    /// Index size after the ingest.
    pub total_chunks: usize,
    pub ingested_at: DateTime<Utc>,
}

pub struct Ingestor {
    chunker: Chunker,
    embedder: EmbeddingClient,
    index: Arc<VectorIndex>,
    store: Option<Arc<IndexStore>>,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        embedder: EmbeddingClient,
        index: Arc<VectorIndex>,
        store: Option<Arc<IndexStore>>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
            store,
        }
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub async fn ingest(&self, document: Document) -> Result<IngestReport, PipelineError> {
        let Document {
            source_id,
            format,
            bytes,
        } = document;
        info!(source = %source_id, format = %format, bytes = bytes.len(), "Ingesting document");

        let text = {
            let source_id = source_id.clone();
            tokio::task::spawn_blocking(move || extract_text(&source_id, &format, &bytes))
                .await
                .map_err(|e| RagError::Io(std::io::Error::other(e)))
                .and_then(|extracted| extracted)
                .at(Stage::Extract)?
        };

        let chunks = self.chunker.split(&source_id, &text);
        if chunks.is_empty() {
            return Err(PipelineError::new(
                Stage::Chunk,
                RagError::EmptyDocument(source_id),
            ));
        }
        debug!(source = %source_id, chunks = chunks.len(), "chunked");

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embedder.batch_size()) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = self.embedder.embed_batch(&texts).await.map_err(|cause| {
                PipelineError::new(
                    Stage::Embed,
                    RagError::EmbeddingFailure {
                        source_id: source_id.clone(),
                        chunk_index: batch[0].index,
                        cause: Box::new(cause),
                    },
                )
            })?;
            vectors.extend(embedded);
        }

        let chunk_count = chunks.len();
        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| IndexEntry::new(chunk, embedding))
            .collect();
        let replaced = self
            .index
            .replace_source(&source_id, entries)
            .await
            .at(Stage::Index)?;

        if let Some(store) = &self.store {
            store.save(&self.index).await.at(Stage::Persist)?;
        }

        let total_chunks = self.index.len().await;
        info!(
            source = %source_id,
            chunks = chunk_count,
            replaced,
            total = total_chunks,
            "Ingested document"
        );
        Ok(IngestReport {
            source_id,
            chunk_count,
            replaced,
            total_chunks,
            ingested_at: Utc::now(),
        })
    }

    /// Read a file and ingest it with its path, as given, for the source id.
    /// Same-named files in different directories stay distinct sources.
    pub async fn ingest_path(&self, path: &Path) -> Result<IngestReport, PipelineError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(RagError::from)
            .at(Stage::Extract)?;
        let source_id = path.to_string_lossy().replace('\\', "/");
        self.ingest(Document::from_filename(&source_id, bytes)).await
    }
}
