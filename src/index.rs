//! In-memory vector index (the knowledge base).
//!
//! Holds every [`IndexEntry`] in insertion order behind a tokio `RwLock`:
//! searches take the read lock and run concurrently, mutations take the write
//! lock and are applied in full before the lock is released, so a reader sees
//! either the state before a write or the state after it.
//!
//! Search is brute-force cosine similarity. Results are ordered by score,
//! descending; equal scores keep insertion order (earlier wins).
//!
//! Every successful mutation bumps [`VectorIndex::generation`], which callers
//! use as a corpus version marker.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::error::RagError;
use crate::models::{ChunkId, IndexEntry};

#[derive(Default)]
struct IndexState {
    entries: Vec<IndexEntry>,
    positions: HashMap<ChunkId, usize>,
    dims: Option<usize>,
    generation: u64,
}

impl IndexState {
    fn reindex_positions(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }

    /// Check every vector against the dimension the index will have.
    fn check_dims(&self, entries: &[IndexEntry], fixed: Option<usize>) -> Result<Option<usize>, RagError> {
        let mut expected = fixed;
        for entry in entries {
            let actual = entry.embedding.len();
            match expected {
                Some(d) if d != actual => {
                    return Err(RagError::DimensionMismatch {
                        expected: d,
                        actual,
                    })
                }
                None => expected = Some(actual),
                _ => {}
            }
        }
        Ok(expected)
    }

    /// Replace-in-place for known ids, append for new ones.
    fn upsert(&mut self, entries: Vec<IndexEntry>) {
        for entry in entries {
            match self.positions.get(&entry.id) {
                Some(&pos) => self.entries[pos] = entry,
                None => {
                    self.positions.insert(entry.id.clone(), self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
    }
}

/// Thread-safe vector index. Share it as `Arc<VectorIndex>`.
pub struct VectorIndex {
    state: RwLock<IndexState>,
    declared_dims: Option<usize>,
}

impl VectorIndex {
    /// Create an empty index. `declared_dims` pins the vector length up front;
    /// with `None` the first insert decides it.
    pub fn new(declared_dims: Option<usize>) -> Self {
        Self {
            state: RwLock::new(IndexState {
                dims: declared_dims,
                ..IndexState::default()
            }),
            declared_dims,
        }
    }

    /// Create an index pre-populated from persisted entries.
    pub fn from_entries(declared_dims: Option<usize>, entries: Vec<IndexEntry>) -> Result<Self, RagError> {
        let mut state = IndexState::default();
        state.dims = state.check_dims(&entries, declared_dims)?;
        state.upsert(entries);
        Ok(Self {
            state: RwLock::new(state),
            declared_dims,
        })
    }

    /// Insert entries; an entry whose id already exists replaces the old one
    /// in its original slot. All-or-nothing.
    pub async fn insert(&self, entries: Vec<IndexEntry>) -> Result<(), RagError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let dims = state.check_dims(&entries, state.dims)?;
        state.upsert(entries);
        state.dims = dims;
        state.generation += 1;
        Ok(())
    }

    /// Atomically drop every entry of `source_id` and append `entries`.
    ///
    /// Returns how many old entries were removed.
    pub async fn replace_source(&self, source_id: &str, entries: Vec<IndexEntry>) -> Result<usize, RagError> {
        debug_assert!(entries.iter().all(|e| e.id.source_id == source_id));
        let mut state = self.state.write().await;

        let others_remain = state.entries.iter().any(|e| e.id.source_id != source_id);
        let fixed = if others_remain { state.dims } else { self.declared_dims };
        let dims = state.check_dims(&entries, fixed)?;

        let before = state.entries.len();
        state.entries.retain(|e| e.id.source_id != source_id);
        let removed = before - state.entries.len();
        if removed > 0 {
            state.reindex_positions();
        }
        state.upsert(entries);
        state.dims = dims;
        state.generation += 1;
        Ok(removed)
    }

    /// Up to `k` entries ranked by cosine similarity to `query`.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(IndexEntry, f32)>, RagError> {
        let state = self.state.read().await;
        if k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(d) = state.dims {
            if d != query.len() {
                return Err(RagError::DimensionMismatch {
                    expected: d,
                    actual: query.len(),
                });
            }
        }

        let mut scored: Vec<(usize, f32)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(query, &e.embedding)))
            .collect();
        // Stable sort: ties keep insertion order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| (state.entries[i].clone(), score))
            .collect())
    }

    /// Remove everything. Returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = state.entries.len();
        state.entries.clear();
        state.positions.clear();
        state.dims = self.declared_dims;
        state.generation += 1;
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn dims(&self) -> Option<usize> {
        self.state.read().await.dims
    }

    /// Monotonic counter bumped by every successful mutation.
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    /// Chunk counts per source, in order of first appearance.
    pub async fn sources(&self) -> Vec<(String, usize)> {
        let state = self.state.read().await;
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for e in &state.entries {
            let count = counts.entry(e.source_id()).or_insert(0);
            if *count == 0 {
                order.push(e.source_id().to_string());
            }
            *count += 1;
        }
        order
            .into_iter()
            .map(|s| {
                let n = counts[s.as_str()];
                (s, n)
            })
            .collect()
    }

    /// Consistent copy of all entries, in insertion order.
    pub async fn snapshot(&self) -> Vec<IndexEntry> {
        self.state.read().await.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(source: &str, index: usize, v: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: ChunkId {
                source_id: source.to_string(),
                index,
            },
            embedding: v,
            text: format!("{source}-{index}"),
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let idx = VectorIndex::new(None);
        idx.insert(vec![
            entry("a", 0, vec![0.0, 1.0]),
            entry("a", 1, vec![1.0, 0.0]),
            entry("a", 2, vec![1.0, 1.0]),
        ])
        .await
        .unwrap();
        let hits = idx.search(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<usize> = hits.iter().map(|(e, _)| e.id.index).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        assert!(hits[0].1 >= hits[1].1 && hits[1].1 >= hits[2].1);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let idx = VectorIndex::new(None);
        idx.insert(vec![
            entry("b", 0, vec![2.0, 0.0]),
            entry("a", 0, vec![1.0, 0.0]),
            entry("c", 0, vec![3.0, 0.0]),
        ])
        .await
        .unwrap();
        let hits = idx.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].0.id.source_id, "b");
        assert_eq!(hits[1].0.id.source_id, "a");
    }

    #[tokio::test]
    async fn test_duplicate_id_replaces_in_place() {
        let idx = VectorIndex::new(None);
        idx.insert(vec![entry("a", 0, vec![1.0, 0.0]), entry("a", 1, vec![0.0, 1.0])])
            .await
            .unwrap();
        let mut replacement = entry("a", 0, vec![0.0, 1.0]);
        replacement.text = "new".into();
        idx.insert(vec![replacement]).await.unwrap();

        assert_eq!(idx.len().await, 2);
        let snap = idx.snapshot().await;
        assert_eq!(snap[0].text, "new");
        // Tie on [0,1]: the replaced entry kept slot 0, so it still wins.
        let hits = idx.search(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].0.text, "new");
    }

    #[tokio::test]
    async fn test_replace_source_drops_stale_chunks() {
        let idx = VectorIndex::new(None);
        idx.insert((0..5).map(|i| entry("doc", i, vec![1.0, i as f32])).collect())
            .await
            .unwrap();
        idx.insert(vec![entry("other", 0, vec![1.0, 1.0])]).await.unwrap();

        let removed = idx
            .replace_source("doc", (0..2).map(|i| entry("doc", i, vec![1.0, 0.0])).collect())
            .await
            .unwrap();
        assert_eq!(removed, 5);
        assert_eq!(idx.len().await, 3);
        assert_eq!(idx.sources().await, vec![("other".to_string(), 1), ("doc".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejects_whole_batch() {
        let idx = VectorIndex::new(None);
        idx.insert(vec![entry("a", 0, vec![1.0, 0.0])]).await.unwrap();
        let err = idx
            .insert(vec![entry("b", 0, vec![1.0, 0.0]), entry("b", 1, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(idx.len().await, 1);
    }

    #[tokio::test]
    async fn test_declared_dims_enforced() {
        let idx = VectorIndex::new(Some(3));
        assert!(idx.insert(vec![entry("a", 0, vec![1.0])]).await.is_err());
        assert!(idx.search(&[1.0, 0.0], 1).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_resets_and_bumps_generation() {
        let idx = VectorIndex::new(None);
        idx.insert(vec![entry("a", 0, vec![1.0, 0.0])]).await.unwrap();
        let before = idx.generation().await;
        assert_eq!(idx.clear().await, 1);
        assert!(idx.is_empty().await);
        assert!(idx.generation().await > before);
        assert_eq!(idx.dims().await, None);
        // A different dimension is accepted after a clear.
        idx.insert(vec![entry("a", 0, vec![1.0, 0.0, 0.0])]).await.unwrap();
    }

    #[tokio::test]
    async fn test_search_empty_index() {
        let idx = VectorIndex::new(None);
        assert!(idx.search(&[1.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_writes() {
        let idx = Arc::new(VectorIndex::new(None));
        let writer = {
            let idx = idx.clone();
            tokio::spawn(async move {
                for round in 0..20 {
                    let batch = (0..10).map(|i| entry("doc", i, vec![1.0, round as f32])).collect();
                    idx.replace_source("doc", batch).await.unwrap();
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let idx = idx.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let n = idx.search(&[1.0, 0.0], 100).await.unwrap().len();
                    assert!(n == 0 || n == 10, "observed partial write: {n}");
                    tokio::task::yield_now().await;
                }
            }));
        }
        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
