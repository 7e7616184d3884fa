//! Core data types flowing through ingestion and retrieval.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// An uploaded file awaiting ingestion. Never stored.
#[derive(Debug, Clone)]
pub struct Document {
    pub source_id: String,
    /// Lowercase file extension without the dot (`"pdf"`, `"txt"`, …).
    pub format: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(source_id: impl Into<String>, format: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source_id: source_id.into(),
            format: format.into().trim_start_matches('.').to_ascii_lowercase(),
            bytes,
        }
    }

    /// Build a document from a filename, tagging the format by its extension.
    pub fn from_filename(filename: &str, bytes: Vec<u8>) -> Self {
        let format = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        Self::new(filename, format, bytes)
    }

    /// Plain text submitted directly. Without a `source_id` the text is named
    /// `text:<hash prefix>`, so distinct submissions never replace each other.
    pub fn from_text(text: &str, source_id: Option<&str>) -> Self {
        let source_id = match source_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let digest = hex::encode(Sha256::digest(text.as_bytes()));
                format!("text:{}", &digest[..12])
            }
        };
        Self::new(source_id, "txt", text.as_bytes().to_vec())
    }
}

/// Stable address of a chunk: its source plus position within that source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub source_id: String,
    pub index: usize,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.index)
    }
}

/// A passage of document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source_id: String,
    pub index: usize,
    pub text: String,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        ChunkId {
            source_id: self.source_id.clone(),
            index: self.index,
        }
    }
}

/// A chunk together with its embedding, as held by the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: ChunkId,
    pub embedding: Vec<f32>,
    pub text: String,
}

impl IndexEntry {
    pub fn new(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: ChunkId {
                source_id: chunk.source_id,
                index: chunk.index,
            },
            embedding,
            text: chunk.text,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.id.source_id
    }
}

/// One retrieved passage with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub text: String,
    pub source_id: String,
    pub score: f32,
}

/// Retrieved passages, highest score first.
pub type QueryResult = Vec<ScoredPassage>;

/// Source attribution returned when a caller asks for sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub score: f32,
    pub preview: String,
}

/// Final answer of the query pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub num_sources: usize,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
}

/// Final output of the vision pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Description {
    pub description: String,
    pub cached: bool,
}
