//! TTL cache for image descriptions and RAG answers.
//!
//! Two namespaces share one store, told apart by key prefix:
//!
//! | Namespace | Prefix | Key |
//! |-----------|--------|-----|
//! | vision | `image:` | SHA-256 of the image bytes |
//! | rag-query | `rag_query:` | SHA-256 of `"{generation}:{top_k}:{normalized question}"` |
//!
//! The store sits behind [`CacheBackend`]. The [`Cache`] façade in front of
//! it counts hits and misses and never lets a store failure reach the
//! caller: a failed read is a miss, a failed write or clear is skipped, and
//! both are logged at `warn`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Vision,
    RagQuery,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Vision => "image:",
            Namespace::RagQuery => "rag_query:",
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }
}

/// Which part of the cache a clear applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Images,
    Rag,
}

impl CacheScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheScope::All => "all",
            CacheScope::Images => "images",
            CacheScope::Rag => "rag",
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(CacheScope::All),
            "images" => Ok(CacheScope::Images),
            "rag" => Ok(CacheScope::Rag),
            other => Err(format!(
                "unknown cache type '{}' (expected all, images or rag)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_keys: usize,
    pub image_keys: usize,
    pub rag_query_keys: usize,
    pub hits: u64,
    pub misses: u64,
}

// ============ Keys ============

/// Vision key: content hash of the image.
pub fn image_key(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase, trim, collapse runs of whitespace to one space.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// RAG key: hash of the corpus generation, the passage count asked for and
/// the normalized question.
pub fn question_key(question: &str, generation: u64, top_k: usize) -> String {
    let material = format!("{}:{}:{}", generation, top_k, normalize_question(question));
    hex::encode(Sha256::digest(material.as_bytes()))
}

// ============ Backend ============

/// Storage behind the cache. Keys arrive already prefixed.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, RagError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), RagError>;
    /// Remove every key in `namespace`; returns how many were removed.
    async fn clear_namespace(&self, namespace: Namespace) -> Result<usize, RagError>;
    async fn flush(&self) -> Result<(), RagError>;
    /// Live keys in `namespace`, or in the whole store for `None`.
    async fn count(&self, namespace: Option<Namespace>) -> Result<usize, RagError>;
    async fn ping(&self) -> Result<(), RagError>;
}

struct Slot {
    value: String,
    expires_at: Instant,
}

struct Slots {
    map: HashMap<String, Slot>,
    next_sweep: Instant,
}

impl Slots {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, slot| slot.expires_at > now);
        self.next_sweep = now + SWEEP_INTERVAL;
        before - self.map.len()
    }
}

/// How often `set` drops expired slots. Rag-query keys from older corpus
/// generations are never read again, so reads alone would not reclaim them.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-local backend. Expired slots read as absent; they are dropped on
/// the next read of the same key, by the sweep that `set` runs at most once
/// per minute, or by [`purge_expired`](MemoryCacheBackend::purge_expired).
pub struct MemoryCacheBackend {
    slots: RwLock<Slots>,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                map: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
        }
    }

    /// Drop every expired slot. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        self.slots.write().await.sweep(Instant::now())
    }

    /// Slots held in memory, expired or not.
    pub async fn resident(&self) -> usize {
        self.slots.read().await.map.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, RagError> {
        let now = Instant::now();
        {
            let slots = self.slots.read().await;
            match slots.map.get(key) {
                None => return Ok(None),
                Some(slot) if slot.expires_at > now => return Ok(Some(slot.value.clone())),
                Some(_) => {}
            }
        }
        let mut slots = self.slots.write().await;
        if slots.map.get(key).is_some_and(|s| s.expires_at <= now) {
            slots.map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), RagError> {
        let now = Instant::now();
        let slot = Slot {
            value,
            expires_at: now + ttl,
        };
        let mut slots = self.slots.write().await;
        if now >= slots.next_sweep {
            let dropped = slots.sweep(now);
            if dropped > 0 {
                debug!(dropped, "swept expired cache slots");
            }
        }
        slots.map.insert(key.to_string(), slot);
        Ok(())
    }

    async fn clear_namespace(&self, namespace: Namespace) -> Result<usize, RagError> {
        let mut slots = self.slots.write().await;
        let before = slots.map.len();
        slots.map.retain(|k, _| !k.starts_with(namespace.prefix()));
        Ok(before - slots.map.len())
    }

    async fn flush(&self) -> Result<(), RagError> {
        self.slots.write().await.map.clear();
        Ok(())
    }

    async fn count(&self, namespace: Option<Namespace>) -> Result<usize, RagError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        Ok(slots
            .map
            .iter()
            .filter(|(k, slot)| {
                slot.expires_at > now && namespace.map_or(true, |ns| k.starts_with(ns.prefix()))
            })
            .count())
    }

    async fn ping(&self) -> Result<(), RagError> {
        Ok(())
    }
}

// ============ Façade ============

pub struct Cache {
    backend: Option<Arc<dyn CacheBackend>>,
    enabled: AtomicBool,
    vision_ttl: Duration,
    rag_query_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, vision_ttl: Duration, rag_query_ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            enabled: AtomicBool::new(true),
            vision_ttl,
            rag_query_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that stores nothing; every lookup is a miss.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            enabled: AtomicBool::new(false),
            vision_ttl: Duration::ZERO,
            rag_query_ttl: Duration::ZERO,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build from config and ping the store. An unreachable store puts the
    /// cache into disabled mode instead of failing startup.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let backend: Arc<dyn CacheBackend> = match config.backend.as_str() {
            "memory" => Arc::new(MemoryCacheBackend::new()),
            _ => {
                info!("Cache disabled by configuration");
                return Self::disabled();
            }
        };
        Self::connect(
            backend,
            Duration::from_secs(config.vision_ttl_secs),
            Duration::from_secs(config.rag_query_ttl_secs),
        )
        .await
    }

    /// Wrap `backend`, disabling the cache if it does not answer a ping.
    pub async fn connect(backend: Arc<dyn CacheBackend>, vision_ttl: Duration, rag_query_ttl: Duration) -> Self {
        let cache = Self::new(backend.clone(), vision_ttl, rag_query_ttl);
        match backend.ping().await {
            Ok(()) => info!("Cache connected"),
            Err(e) => {
                warn!(error = %e, "Cache unavailable, running without cache");
                cache.enabled.store(false, Ordering::Relaxed);
            }
        }
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn active(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.is_enabled() {
            self.backend.as_ref()
        } else {
            None
        }
    }

    fn ttl(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::Vision => self.vision_ttl,
            Namespace::RagQuery => self.rag_query_ttl,
        }
    }

    /// Look up `key` in `namespace`. Any store failure is a miss.
    pub async fn get(&self, namespace: Namespace, key: &str) -> Option<String> {
        let backend = self.active()?;
        let full = namespace.full_key(key);
        match backend.get(&full).await {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %short(&full), "cache hit");
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %short(&full), "cache miss");
                None
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, key = %short(&full), "cache read failed");
                None
            }
        }
    }

    /// Store `value` under the namespace TTL. Failures are logged and dropped.
    pub async fn set(&self, namespace: Namespace, key: &str, value: String) {
        let Some(backend) = self.active() else {
            return;
        };
        let full = namespace.full_key(key);
        match backend.set(&full, value, self.ttl(namespace)).await {
            Ok(()) => debug!(key = %short(&full), ttl_secs = self.ttl(namespace).as_secs(), "cached"),
            Err(e) => warn!(error = %e, key = %short(&full), "cache write failed"),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let raw = self.get(namespace, key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(namespace, key, raw).await,
            Err(e) => warn!(error = %e, "cannot encode cache entry"),
        }
    }

    /// Clear `scope`. Returns false when the cache is disabled or the store failed.
    pub async fn clear(&self, scope: CacheScope) -> bool {
        let Some(backend) = self.active() else {
            return false;
        };
        let result = match scope {
            CacheScope::All => backend.flush().await.map(|_| None),
            CacheScope::Images => backend.clear_namespace(Namespace::Vision).await.map(Some),
            CacheScope::Rag => backend.clear_namespace(Namespace::RagQuery).await.map(Some),
        };
        match result {
            Ok(removed) => {
                info!(scope = %scope, removed = ?removed, "Cleared cache");
                true
            }
            Err(e) => {
                warn!(error = %e, scope = %scope, "cache clear failed");
                false
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let Some(backend) = self.active() else {
            return CacheStats {
                enabled: false,
                total_keys: 0,
                image_keys: 0,
                rag_query_keys: 0,
                hits,
                misses,
            };
        };

        let count = |ns: Option<Namespace>| async move {
            backend.count(ns).await.unwrap_or_else(|e| {
                warn!(error = %e, "cache count failed");
                0
            })
        };
        CacheStats {
            enabled: true,
            total_keys: count(None).await,
            image_keys: count(Some(Namespace::Vision)).await,
            rag_query_keys: count(Some(Namespace::RagQuery)).await,
            hits,
            misses,
        }
    }
}

fn short(key: &str) -> &str {
    let end = key.char_indices().nth(24).map(|(i, _)| i).unwrap_or(key.len());
    &key[..end]
}
