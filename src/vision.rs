//! Image description with content-addressed caching.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tracing::info;

use crate::backend::{base_url, http_client, post_json, string_field};
use crate::cache::{image_key, Cache, Namespace};
use crate::config::VisionConfig;
use crate::error::{PipelineError, RagError, Stage, StageExt};
use crate::models::Description;

#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn describe_image(&self, image: &[u8], prompt: &str) -> Result<String, RagError>;
}

/// Multimodal model served by Ollama `/api/generate`.
pub struct OllamaVision {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaVision {
    pub fn new(config: &VisionConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", base_url(&config.url)),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl VisionBackend for OllamaVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn describe_image(&self, image: &[u8], prompt: &str) -> Result<String, RagError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "images": [BASE64.encode(image)],
            "stream": false,
        });
        let response = post_json(&self.client, &self.model, &self.url, None, &body).await?;
        string_field(&response, "response", &self.model)
    }
}

pub struct VisionPipeline {
    backend: Arc<dyn VisionBackend>,
    cache: Arc<Cache>,
    prompt: String,
    max_image_bytes: Option<usize>,
}

impl VisionPipeline {
    pub fn new(backend: Arc<dyn VisionBackend>, cache: Arc<Cache>, prompt: impl Into<String>) -> Self {
        Self {
            backend,
            cache,
            prompt: prompt.into(),
            max_image_bytes: None,
        }
    }

    /// Reject images larger than `limit` bytes with `TooLarge`.
    pub fn with_max_image_bytes(mut self, limit: usize) -> Self {
        self.max_image_bytes = Some(limit);
        self
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Describe `image`, serving repeats of the same bytes from cache.
    pub async fn describe(&self, image: &[u8]) -> Result<Description, PipelineError> {
        if image.is_empty() {
            return Err(PipelineError::new(
                Stage::Describe,
                RagError::EmptyDocument("image has no bytes".to_string()),
            ));
        }
        if let Some(limit) = self.max_image_bytes.filter(|&l| image.len() > l) {
            return Err(PipelineError::new(
                Stage::Describe,
                RagError::TooLarge {
                    what: "image",
                    size: image.len(),
                    limit,
                },
            ));
        }

        let key = image_key(image);
        if let Some(description) = self.cache.get(Namespace::Vision, &key).await {
            return Ok(Description {
                description,
                cached: true,
            });
        }

        let raw = self
            .backend
            .describe_image(image, &self.prompt)
            .await
            .at(Stage::Describe)?;
        let description = raw.trim().to_string();
        if !description.is_empty() {
            self.cache.set(Namespace::Vision, &key, description.clone()).await;
        }
        info!(bytes = image.len(), chars = description.len(), "described image");
        Ok(Description {
            description,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::cache::MemoryCacheBackend;

    struct Canned {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VisionBackend for Canned {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn describe_image(&self, _image: &[u8], prompt: &str) -> Result<String, RagError> {
            assert_eq!(prompt, "Describe this image very precisely and in detail");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    fn pipeline(reply: &'static str) -> (VisionPipeline, Arc<Canned>, Arc<Cache>) {
        let backend = Arc::new(Canned {
            reply,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(Cache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let p = VisionPipeline::new(
            backend.clone(),
            cache.clone(),
            VisionConfig::default().prompt,
        );
        (p, backend, cache)
    }

    #[tokio::test]
    async fn second_request_is_cached() {
        let (p, backend, cache) = pipeline("A red bicycle.");
        let first = p.describe(b"png-bytes").await.unwrap();
        assert!(!first.cached);
        let second = p.describe(b"png-bytes").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.description, "A red bicycle.");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.image_keys, 1);
    }

    #[tokio::test]
    async fn empty_description_is_not_cached() {
        let (p, backend, _) = pipeline("  ");
        p.describe(b"img").await.unwrap();
        p.describe(b"img").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_image_rejected() {
        let (p, backend, _) = pipeline("x");
        let err = p.describe(b"").await.unwrap_err();
        assert_eq!(err.stage, Stage::Describe);
        assert!(matches!(err.error, RagError::EmptyDocument(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_image_rejected_before_model_call() {
        let (p, backend, _) = pipeline("A tiny dot.");
        let p = p.with_max_image_bytes(8);
        assert!(p.describe(b"12345678").await.is_ok());
        let err = p.describe(b"123456789").await.unwrap_err();
        assert_eq!(err.error.code(), "too_large");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
