//! Embedding backend abstraction and the retry-policy client.
//!
//! Defines the [`EmbeddingBackend`] trait and concrete implementations:
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are off.
//!
//! [`EmbeddingClient`] wraps a backend with the call policy:
//! - ingestion calls ([`EmbeddingClient::embed_batch`]) never retry;
//! - query calls ([`EmbeddingClient::embed_query`]) retry once after a fixed
//!   backoff, and only when the failure was `BackendUnavailable`.
//!
//! Also provides vector utilities used by the index and its persistence:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`]: decode bytes back into a `Vec<f32>`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backend::{base_url, http_client, post_json};
use crate::config::EmbeddingConfig;
use crate::error::RagError;

/// Capability: turn texts into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Declared vector dimensionality, if known up front.
    fn dims(&self) -> Option<usize>;
    /// Embed a batch; returns one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

// ============ Disabled ============

/// Backend used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingBackend for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> Option<usize> {
        None
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Err(RagError::backend("embedding", "embedding provider is disabled"))
    }
}

// ============ Ollama ============

/// Embeddings from `POST {url}/api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: Option<usize>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model,
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", base_url(&self.url));
        let json = post_json(&self.client, "ollama-embed", &url, None, &body).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, RagError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::backend("ollama-embed", "response missing embeddings array"))?;
    embeddings
        .iter()
        .map(|e| parse_vector(e, "ollama-embed"))
        .collect()
}

// ============ OpenAI ============

/// Embeddings from an OpenAI-compatible `POST {url}/v1/embeddings`.
///
/// Reads the API key from `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: Option<usize>,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model,
            dims: config.dims,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> Option<usize> {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/v1/embeddings", base_url(&self.url));
        let json = post_json(&self.client, "openai-embed", &url, Some(&self.api_key), &body).await?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, RagError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::backend("openai-embed", "response missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RagError::backend("openai-embed", "item missing embedding"))?;
        indexed.push((index, parse_vector(embedding, "openai-embed")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(value: &serde_json::Value, backend: &str) -> Result<Vec<f32>, RagError> {
    let arr = value
        .as_array()
        .ok_or_else(|| RagError::backend(backend, "embedding is not an array"))?;
    arr.iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::backend(backend, "embedding contains a non-number"))
        })
        .collect()
}

/// Create the configured [`EmbeddingBackend`].
///
/// | Config Value | Backend |
/// |-------------|---------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Client ============

/// Policy wrapper around an [`EmbeddingBackend`].
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    retry_backoff: Duration,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, batch_size: usize, retry_backoff: Duration) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            retry_backoff,
        }
    }

    pub fn from_config(backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        Self::new(
            backend,
            config.batch_size,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> Option<usize> {
        self.backend.dims()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed one batch with a single attempt. Validates the response shape.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let vectors = self.backend.embed_batch(texts).await?;
        validate_vectors(texts.len(), &vectors, self.backend.model_name())?;
        Ok(vectors)
    }

    /// Embed a query string, retrying once on `BackendUnavailable`.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let input = [text.to_string()];
        let first = self.embed_batch(&input).await;
        let vectors = match first {
            Err(e) if e.is_transient() => {
                warn!(error = %e, "query embedding failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.embed_batch(&input).await?
            }
            other => other?,
        };
        debug!(dims = vectors[0].len(), "embedded query");
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::backend(self.model_name(), "empty embedding response"))
    }
}

fn validate_vectors(expected: usize, vectors: &[Vec<f32>], backend: &str) -> Result<(), RagError> {
    if vectors.len() != expected {
        return Err(RagError::backend(
            backend,
            format!("expected {} embeddings, got {}", expected, vectors.len()),
        ));
    }
    if let Some(first) = vectors.first() {
        if first.is_empty() {
            return Err(RagError::backend(backend, "empty embedding vector"));
        }
        if vectors.iter().any(|v| v.len() != first.len()) {
            return Err(RagError::backend(backend, "inconsistent embedding lengths in batch"));
        }
    }
    Ok(())
}

/// Encode a float vector as little-endian f32 bytes.
///
/// ```rust
/// use avivo::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or a zero-norm vector.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted list of outcomes, one per call.
    struct Scripted {
        calls: AtomicUsize,
        outcomes: Mutex<Vec<Result<Vec<Vec<f32>>, RagError>>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<Vec<Vec<f32>>, RagError>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> Option<usize> {
            Some(2)
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(RagError::backend("scripted", "exhausted")))
        }
    }

    fn client(backend: Arc<Scripted>) -> EmbeddingClient {
        EmbeddingClient::new(backend, 8, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_query_retries_once_on_unavailable() {
        let backend = Scripted::new(vec![
            Err(RagError::unavailable("scripted", "timeout")),
            Ok(vec![vec![1.0, 0.0]]),
        ]);
        let v = client(backend.clone()).embed_query("hi").await.unwrap();
        assert_eq!(v, vec![1.0, 0.0]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_gives_up_after_one_retry() {
        let backend = Scripted::new(vec![
            Err(RagError::unavailable("scripted", "down")),
            Err(RagError::unavailable("scripted", "still down")),
            Ok(vec![vec![1.0, 0.0]]),
        ]);
        let err = client(backend.clone()).embed_query("hi").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_does_not_retry_malformed() {
        let backend = Scripted::new(vec![
            Err(RagError::backend("scripted", "bad json")),
            Ok(vec![vec![1.0, 0.0]]),
        ]);
        assert!(client(backend.clone()).embed_query("hi").await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_never_retries() {
        let backend = Scripted::new(vec![
            Err(RagError::unavailable("scripted", "timeout")),
            Ok(vec![vec![1.0, 0.0]]),
        ]);
        let err = client(backend.clone())
            .embed_batch(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_count_mismatch_is_backend_error() {
        let backend = Scripted::new(vec![Ok(vec![vec![1.0, 0.0]])]);
        let err = client(backend)
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::BackendError { .. }));
    }

    #[tokio::test]
    async fn test_disabled_backend_fails() {
        let c = EmbeddingClient::new(Arc::new(DisabledEmbedder), 4, Duration::ZERO);
        assert!(c.embed_query("x").await.is_err());
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 1.0], [2.0, -1.0]]});
        let v = parse_ollama_response(&json).unwrap();
        assert_eq!(v, vec![vec![0.5, 1.0], vec![2.0, -1.0]]);
        assert!(parse_ollama_response(&serde_json::json!({"oops": 1})).is_err());
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]},
        ]});
        assert_eq!(parse_openai_response(&json).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_parse_rejects_non_numbers() {
        let json = serde_json::json!({"embeddings": [[0.5, "x"]]});
        assert!(matches!(
            parse_ollama_response(&json),
            Err(RagError::BackendError { .. })
        ));
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
