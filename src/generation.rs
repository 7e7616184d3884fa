//! Text generation backend used by the answer synthesizer.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::backend::{base_url, http_client, post_json, string_field};
use crate::config::GenerationConfig;
use crate::error::RagError;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn model_name(&self) -> &str;

    /// Complete `prompt` and return the raw model output.
    async fn generate(&self, prompt: &str) -> Result<String, RagError>;
}

/// Ollama `/api/generate`, non-streaming.
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", base_url(&config.url)),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, RagError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let response = post_json(&self.client, &self.model, &self.url, None, &body).await?;
        let text = string_field(&response, "response", &self.model)?;
        debug!(model = %self.model, chars = text.len(), "generation complete");
        Ok(text)
    }
}
