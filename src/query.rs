//! Question answering: cache check, retrieval, synthesis, cache store.

use std::sync::Arc;

use tracing::info;

use crate::cache::{question_key, Cache, Namespace};
use crate::error::{PipelineError, Stage, StageExt};
use crate::index::VectorIndex;
use crate::models::{QueryAnswer, ScoredPassage, SourceRef};
use crate::retrieve::Retriever;
use crate::synth::AnswerSynthesizer;

const PREVIEW_CHARS: usize = 200;

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub include_sources: bool,
}

pub struct QueryPipeline {
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
    cache: Arc<Cache>,
    index: Arc<VectorIndex>,
    top_k: usize,
    threshold: f32,
}

impl QueryPipeline {
    pub fn new(
        retriever: Retriever,
        synthesizer: AnswerSynthesizer,
        cache: Arc<Cache>,
        index: Arc<VectorIndex>,
        top_k: usize,
        threshold: f32,
    ) -> Self {
        Self {
            retriever,
            synthesizer,
            cache,
            index,
            top_k: top_k.max(1),
            threshold,
        }
    }

    pub fn model_name(&self) -> &str {
        self.synthesizer.model_name()
    }

    /// Answer with the configured defaults.
    pub async fn answer(&self, question: &str) -> Result<QueryAnswer, PipelineError> {
        self.answer_with(question, QueryOptions::default()).await
    }

    pub async fn answer_with(&self, question: &str, options: QueryOptions) -> Result<QueryAnswer, PipelineError> {
        let top_k = options.top_k.filter(|k| *k > 0).unwrap_or(self.top_k);
        let key = question_key(question, self.index.generation().await, top_k);

        if let Some(mut hit) = self.cache.get_json::<QueryAnswer>(Namespace::RagQuery, &key).await {
            info!(question = %preview(question, 50), "answered from cache");
            hit.cached = true;
            if !options.include_sources {
                hit.sources = None;
            }
            return Ok(hit);
        }

        let passages = self
            .retriever
            .retrieve(question, top_k, self.threshold)
            .await
            .at(Stage::Retrieve)?;
        let synthesis = self
            .synthesizer
            .synthesize(question, &passages)
            .await
            .at(Stage::Synthesize)?;

        let mut answer = QueryAnswer {
            answer: synthesis.answer,
            num_sources: passages.len(),
            cached: false,
            sources: Some(source_refs(&passages)),
        };
        if synthesis.grounded {
            self.cache.set_json(Namespace::RagQuery, &key, &answer).await;
        }
        info!(
            question = %preview(question, 50),
            sources = answer.num_sources,
            grounded = synthesis.grounded,
            "answered question"
        );

        if !options.include_sources {
            answer.sources = None;
        }
        Ok(answer)
    }
}

fn source_refs(passages: &[ScoredPassage]) -> Vec<SourceRef> {
    passages
        .iter()
        .map(|p| SourceRef {
            source_id: p.source_id.clone(),
            score: p.score,
            preview: preview(&p.text, PREVIEW_CHARS),
        })
        .collect()
}

/// First `max` characters, with `...` appended when truncated.
fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("short", 200), "short");
    }
}
