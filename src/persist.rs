//! On-disk form of the vector index.
//!
//! Two artifacts live in the index directory:
//!
//! - `vectors.bin`: magic `AVIX`, `u32` entry count, `u32` dimension, then
//!   `count × dims` little-endian `f32` values.
//! - `metadata.json`: a JSON array of `{source_id, index, text}` objects in
//!   the same order as the vectors.
//!
//! Each file is written to a `.tmp` sibling and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::RagError;
use crate::index::VectorIndex;
use crate::models::{ChunkId, IndexEntry};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const METADATA_FILE: &str = "metadata.json";
const MAGIC: &[u8; 4] = b"AVIX";
const HEADER_LEN: usize = 12;

/// Serializes saves of one index directory so the two artifacts written by
/// a save always come from the same snapshot.
pub struct IndexStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `index` and write it out.
    pub async fn save(&self, index: &VectorIndex) -> Result<(), RagError> {
        let _guard = self.lock.lock().await;
        let entries = index.snapshot().await;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || save(&dir, &entries))
            .await
            .map_err(|e| RagError::Io(std::io::Error::other(e)))?
    }

    pub fn load(&self) -> Result<Option<Vec<IndexEntry>>, RagError> {
        load(&self.dir)
    }
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    source_id: String,
    index: usize,
    text: String,
}

/// Write `entries` to `dir`, creating it if needed.
pub fn save(dir: &Path, entries: &[IndexEntry]) -> Result<(), RagError> {
    fs::create_dir_all(dir)?;

    let dims = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
    let mut vectors = Vec::with_capacity(HEADER_LEN + entries.len() * dims * 4);
    vectors.extend_from_slice(MAGIC);
    vectors.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    vectors.extend_from_slice(&(dims as u32).to_le_bytes());
    for entry in entries {
        if entry.embedding.len() != dims {
            return Err(RagError::DimensionMismatch {
                expected: dims,
                actual: entry.embedding.len(),
            });
        }
        vectors.extend_from_slice(&vec_to_blob(&entry.embedding));
    }

    let meta: Vec<EntryMeta> = entries
        .iter()
        .map(|e| EntryMeta {
            source_id: e.id.source_id.clone(),
            index: e.id.index,
            text: e.text.clone(),
        })
        .collect();
    let metadata = serde_json::to_vec(&meta)
        .map_err(|e| RagError::IndexCorrupt(format!("cannot serialize metadata: {}", e)))?;

    write_atomic(&dir.join(VECTORS_FILE), &vectors)?;
    write_atomic(&dir.join(METADATA_FILE), &metadata)?;
    info!(dir = %dir.display(), entries = entries.len(), "persisted index");
    Ok(())
}

/// Read the index from `dir`. `Ok(None)` when nothing has been saved yet.
pub fn load(dir: &Path) -> Result<Option<Vec<IndexEntry>>, RagError> {
    let vectors_path = dir.join(VECTORS_FILE);
    let metadata_path = dir.join(METADATA_FILE);
    match (vectors_path.exists(), metadata_path.exists()) {
        (false, false) => {
            debug!(dir = %dir.display(), "no persisted index");
            return Ok(None);
        }
        (true, false) => return Err(RagError::IndexCorrupt(format!("{} is missing", METADATA_FILE))),
        (false, true) => return Err(RagError::IndexCorrupt(format!("{} is missing", VECTORS_FILE))),
        (true, true) => {}
    }

    let vectors = fs::read(&vectors_path)?;
    if vectors.len() < HEADER_LEN || &vectors[..4] != MAGIC {
        return Err(RagError::IndexCorrupt(format!("{} has a bad header", VECTORS_FILE)));
    }
    let count = read_u32(&vectors[4..8]) as usize;
    let dims = read_u32(&vectors[8..12]) as usize;
    let expected_len = count
        .checked_mul(dims)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| {
            RagError::IndexCorrupt(format!(
                "{} header claims {} vectors of {} dims",
                VECTORS_FILE, count, dims
            ))
        })?;
    if vectors.len() != expected_len {
        return Err(RagError::IndexCorrupt(format!(
            "{} is {} bytes, header implies {}",
            VECTORS_FILE,
            vectors.len(),
            expected_len
        )));
    }

    let raw = fs::read(&metadata_path)?;
    let meta: Vec<EntryMeta> = serde_json::from_slice(&raw)
        .map_err(|e| RagError::IndexCorrupt(format!("{}: {}", METADATA_FILE, e)))?;
    if meta.len() != count {
        return Err(RagError::IndexCorrupt(format!(
            "{} has {} vectors but {} has {} entries",
            VECTORS_FILE,
            count,
            METADATA_FILE,
            meta.len()
        )));
    }

    let stride = dims * 4;
    let entries = meta
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            let start = HEADER_LEN + i * stride;
            IndexEntry {
                id: ChunkId {
                    source_id: m.source_id,
                    index: m.index,
                },
                embedding: blob_to_vec(&vectors[start..start + stride]),
                text: m.text,
            }
        })
        .collect::<Vec<_>>();
    info!(dir = %dir.display(), entries = entries.len(), "loaded persisted index");
    Ok(Some(entries))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RagError> {
    let mut tmp = PathBuf::from(path);
    tmp.set_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.tmp", ext),
        None => "tmp".to_string(),
    });
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<IndexEntry> {
        vec![
            IndexEntry {
                id: ChunkId {
                    source_id: "a.txt".into(),
                    index: 0,
                },
                embedding: vec![0.5, -1.0, 2.0],
                text: "first".into(),
            },
            IndexEntry {
                id: ChunkId {
                    source_id: "b.md".into(),
                    index: 3,
                },
                embedding: vec![1.0, 0.0, 0.25],
                text: "second ünïcode".into(),
            },
        ]
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, entries());
        assert!(!dir.path().join("vectors.bin.tmp").exists());
    }

    #[test]
    fn missing_artifacts_mean_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nowhere")).unwrap().is_none());
    }

    #[test]
    fn empty_index_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &[]).unwrap();
        assert_eq!(load(dir.path()).unwrap().unwrap(), Vec::<IndexEntry>::new());
    }

    #[test]
    fn count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        fs::write(
            dir.path().join(METADATA_FILE),
            r#"[{"source_id":"a.txt","index":0,"text":"only one"}]"#,
        )
        .unwrap();
        assert!(matches!(load(dir.path()), Err(RagError::IndexCorrupt(_))));
    }

    #[test]
    fn truncated_vectors_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        let path = dir.path().join(VECTORS_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(load(dir.path()), Err(RagError::IndexCorrupt(_))));
    }

    #[test]
    fn oversized_header_counts_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(dir.path().join(VECTORS_FILE), bytes).unwrap();
        assert!(matches!(load(dir.path()), Err(RagError::IndexCorrupt(_))));
    }

    #[test]
    fn one_artifact_missing_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        fs::remove_file(dir.path().join(METADATA_FILE)).unwrap();
        assert!(matches!(load(dir.path()), Err(RagError::IndexCorrupt(_))));
    }

    #[tokio::test]
    async fn store_saves_index_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().join("index"));
        let index = VectorIndex::from_entries(None, entries()).unwrap();
        store.save(&index).await.unwrap();
        let restored = VectorIndex::from_entries(None, store.load().unwrap().unwrap()).unwrap();
        assert_eq!(restored.snapshot().await, entries());
        assert_eq!(restored.dims().await, Some(3));
    }

    #[test]
    fn bad_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &entries()).unwrap();
        fs::write(dir.path().join(METADATA_FILE), "not json").unwrap();
        assert!(matches!(load(dir.path()), Err(RagError::IndexCorrupt(_))));
    }
}
