//! Question → scored passages.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::EmbeddingClient;
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::{QueryResult, ScoredPassage};

/// Candidate pool multiplier applied when a threshold may discard hits.
const OVERFETCH: usize = 2;

#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: EmbeddingClient,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: EmbeddingClient) -> Self {
        Self { index, embedder }
    }

    /// Up to `top_k` passages scoring at least `threshold`, best first.
    ///
    /// A blank question or an empty index returns no passages without
    /// calling the embedding backend. `threshold <= 0.0` keeps every hit.
    pub async fn retrieve(&self, question: &str, top_k: usize, threshold: f32) -> Result<QueryResult, RagError> {
        if question.trim().is_empty() || top_k == 0 || self.index.is_empty().await {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed_query(question).await?;
        let pool = if threshold > 0.0 {
            top_k.saturating_mul(OVERFETCH)
        } else {
            top_k
        };
        let hits = self.index.search(&query, pool).await?;
        let candidates = hits.len();

        let passages: QueryResult = hits
            .into_iter()
            .filter(|(_, score)| threshold <= 0.0 || *score >= threshold)
            .take(top_k)
            .map(|(entry, score)| ScoredPassage {
                source_id: entry.id.source_id,
                text: entry.text,
                score,
            })
            .collect();
        debug!(candidates, kept = passages.len(), threshold, "retrieved passages");
        Ok(passages)
    }
}
