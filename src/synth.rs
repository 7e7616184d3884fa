//! Grounded answer synthesis.
//!
//! Builds a prompt that embeds the retrieved passages as numbered context
//! blocks and instructs the model to answer only from them. When retrieval
//! found nothing, the fixed [`NO_GROUNDING_ANSWER`] is returned and the model
//! is never called.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::info;

use crate::error::RagError;
use crate::generation::GenerationBackend;
use crate::models::ScoredPassage;

/// Answer given when there are no passages to ground on.
pub const NO_GROUNDING_ANSWER: &str =
    "I don't have enough information to answer this question. Please upload relevant documents first.";

/// What the model is told to say when the context is insufficient.
pub const INSUFFICIENT_CONTEXT_REPLY: &str = "I don't have enough information.";

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    /// False when the answer is the fixed no-grounding text.
    pub grounded: bool,
}

/// Render the grounding prompt. Passages must already be in descending score order.
pub fn build_prompt(question: &str, passages: &[ScoredPassage]) -> String {
    let mut context = String::new();
    for (i, p) in passages.iter().enumerate() {
        if i > 0 {
            context.push_str("\n\n");
        }
        let _ = write!(
            context,
            "[Source {}: {} | score {:.3}]\n{}",
            i + 1,
            p.source_id,
            p.score,
            p.text
        );
    }

    format!(
        "Use only the following context to answer the question. \
         If you cannot answer based on the context, say \"{}\"\n\n\
         Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        INSUFFICIENT_CONTEXT_REPLY, context, question
    )
}

pub struct AnswerSynthesizer {
    backend: Arc<dyn GenerationBackend>,
}

impl AnswerSynthesizer {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub async fn synthesize(&self, question: &str, passages: &[ScoredPassage]) -> Result<Synthesis, RagError> {
        if passages.is_empty() {
            return Ok(Synthesis {
                answer: NO_GROUNDING_ANSWER.to_string(),
                grounded: false,
            });
        }

        let prompt = build_prompt(question, passages);
        let raw = self.backend.generate(&prompt).await?;
        let answer = raw.trim();
        if answer.is_empty() {
            return Err(RagError::backend(self.backend.model_name(), "empty completion"));
        }
        info!(passages = passages.len(), "synthesized answer");
        Ok(Synthesis {
            answer: answer.to_string(),
            grounded: true,
        })
    }
}
