//! Fake model backends shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use avivo::cache::{Cache, CacheBackend, MemoryCacheBackend, Namespace};
use avivo::config::Config;
use avivo::embedding::EmbeddingBackend;
use avivo::error::RagError;
use avivo::generation::GenerationBackend;
use avivo::service::{Backends, Services};
use avivo::vision::VisionBackend;

pub const DIMS: usize = 256;

/// Bag-of-words embedding: each lowercase word bumps one of `DIMS` buckets.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        let word = word.to_lowercase();
        let mut h: u32 = 2_166_136_261;
        for b in word.bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16_777_619);
        }
        v[(h as usize) % DIMS] += 1.0;
    }
    v
}

type EmbedFn = dyn Fn(&str) -> Vec<f32> + Send + Sync;

/// Embedder driven by a closure. Can be told to fail specific calls.
pub struct FakeEmbedder {
    embed: Box<EmbedFn>,
    pub calls: AtomicUsize,
    failures: Mutex<Vec<(usize, RagError)>>,
}

impl FakeEmbedder {
    pub fn new(embed: impl Fn(&str) -> Vec<f32> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            embed: Box::new(embed),
            calls: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn bag_of_words() -> Arc<Self> {
        Self::new(bag_of_words)
    }

    /// Make the call numbered `call` (0-based, counting from now on) fail.
    pub fn fail_call(&self, call: usize, error: RagError) {
        let base = self.calls.load(Ordering::SeqCst);
        self.failures.lock().unwrap().push((base + call, error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embed"
    }

    fn dims(&self) -> Option<usize> {
        None
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures.iter().position(|(n, _)| *n == call) {
            return Err(failures.remove(pos).1);
        }
        Ok(texts.iter().map(|t| (self.embed)(t)).collect())
    }
}

/// Generator that echoes the top passage header, recording every prompt.
pub struct FakeGenerator {
    pub prompts: Mutex<Vec<String>>,
}

impl FakeGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationBackend for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake-llm"
    }

    async fn generate(&self, prompt: &str) -> Result<String, RagError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let first_source = prompt
            .lines()
            .find(|l| l.starts_with("[Source 1:"))
            .unwrap_or("no source");
        Ok(format!("Based on {}", first_source))
    }
}

pub struct FakeVision {
    pub calls: AtomicUsize,
}

impl FakeVision {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VisionBackend for FakeVision {
    fn model_name(&self) -> &str {
        "fake-vision"
    }

    async fn describe_image(&self, image: &[u8], _prompt: &str) -> Result<String, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("An image of {} bytes", image.len()))
    }
}

/// Store that answers pings but fails every other operation.
pub struct BrokenCacheBackend;

#[async_trait]
impl CacheBackend for BrokenCacheBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, RagError> {
        Err(RagError::CacheUnavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), RagError> {
        Err(RagError::CacheUnavailable("connection refused".into()))
    }
    async fn clear_namespace(&self, _namespace: Namespace) -> Result<usize, RagError> {
        Err(RagError::CacheUnavailable("connection refused".into()))
    }
    async fn flush(&self) -> Result<(), RagError> {
        Err(RagError::CacheUnavailable("connection refused".into()))
    }
    async fn count(&self, _namespace: Option<Namespace>) -> Result<usize, RagError> {
        Err(RagError::CacheUnavailable("connection refused".into()))
    }
    async fn ping(&self) -> Result<(), RagError> {
        Ok(())
    }
}

pub fn memory_cache() -> Arc<Cache> {
    Arc::new(Cache::new(
        Arc::new(MemoryCacheBackend::new()),
        Duration::from_secs(86_400),
        Duration::from_secs(3_600),
    ))
}

/// Config with small chunks and no persistence.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.chunking.chunk_size = 200;
    config.chunking.chunk_overlap = 20;
    config.embedding.batch_size = 4;
    config.embedding.retry_backoff_ms = 1;
    config
}

pub struct Harness {
    pub services: Arc<Services>,
    pub embedder: Arc<FakeEmbedder>,
    pub generator: Arc<FakeGenerator>,
    pub vision: Arc<FakeVision>,
}

pub fn harness_with(config: Config, embedder: Arc<FakeEmbedder>, cache: Arc<Cache>) -> Harness {
    let generator = FakeGenerator::new();
    let vision = FakeVision::new();
    let services = Services::with_backends(
        config,
        Backends {
            embedding: embedder.clone(),
            generation: generator.clone(),
            vision: vision.clone(),
            cache,
        },
    )
    .unwrap();
    Harness {
        services: Arc::new(services),
        embedder,
        generator,
        vision,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), FakeEmbedder::bag_of_words(), memory_cache())
}

pub const RUST_DOC: &str = "Rust programming uses cargo to build crates. \
Cargo resolves dependencies and compiles every crate in the workspace.";

pub const PYTHON_DOC: &str = "Python machine learning relies on PyTorch tensors. \
Training loops call backward on the loss to compute gradients.";

pub const INFRA_DOC: &str = "Kubernetes schedules Docker containers onto nodes. \
Deployments roll out replicas and services expose them on the network.";
