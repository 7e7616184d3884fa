//! Error taxonomy for the ingestion, retrieval, and description pipelines.
//!
//! [`RagError`] classifies *what* went wrong; [`PipelineError`] adds *where*
//! (the [`Stage`] that failed) so callers and the HTTP layer can report a
//! structured failure reason. Cache failures are represented here for
//! completeness but never escape the [`cache`](crate::cache) module.

use std::fmt;

use thiserror::Error;

/// Domain errors raised by the core components.
#[derive(Debug, Error)]
pub enum RagError {
    /// No extractor is registered for the document's format tag.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Extraction produced no usable text (or the upload was empty).
    #[error("document is empty: {0}")]
    EmptyDocument(String),

    /// An upload exceeds a configured size limit.
    #[error("{what} is {size} bytes, limit is {limit}")]
    TooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    /// The backend could not be reached within the configured timeout.
    #[error("backend unavailable ({backend}): {message}")]
    BackendUnavailable { backend: String, message: String },

    /// The backend answered, but the response was unusable.
    #[error("backend error ({backend}): {message}")]
    BackendError { backend: String, message: String },

    /// Persisted index artifacts are unreadable or disagree with each other.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// The cache store is unreachable. Absorbed by the cache façade.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Embedding a chunk during ingestion failed; nothing was committed.
    #[error("embedding failed for {source_id} chunk {chunk_index}: {cause}")]
    EmbeddingFailure {
        source_id: String,
        chunk_index: usize,
        #[source]
        cause: Box<RagError>,
    },

    /// An embedding's length disagrees with the index dimension.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Chunking parameters violate `0 <= overlap < chunk_size`.
    #[error("invalid chunking parameters: chunk_size={chunk_size}, overlap={overlap}")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    pub fn unavailable(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        RagError::BackendUnavailable {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        RagError::BackendError {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether a query-time caller may retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::BackendUnavailable { .. })
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::EmptyDocument(_) => "empty_document",
            RagError::TooLarge { .. } => "too_large",
            RagError::BackendUnavailable { .. } => "backend_unavailable",
            RagError::BackendError { .. } => "backend_error",
            RagError::IndexCorrupt(_) => "index_corrupt",
            RagError::CacheUnavailable(_) => "cache_unavailable",
            RagError::EmbeddingFailure { cause, .. } => cause.code(),
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::InvalidChunking { .. } => "bad_request",
            RagError::Io(_) => "internal",
        }
    }
}

/// Pipeline step in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Chunk,
    Embed,
    Index,
    Persist,
    Retrieve,
    Synthesize,
    Describe,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
            Stage::Persist => "persist",
            Stage::Retrieve => "retrieve",
            Stage::Synthesize => "synthesize",
            Stage::Describe => "describe",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`RagError`] tagged with the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub error: RagError,
}

impl PipelineError {
    pub fn new(stage: Stage, error: RagError) -> Self {
        Self { stage, error }
    }
}

/// Attach a [`Stage`] to a `Result<_, RagError>`.
pub trait StageExt<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> StageExt<T> for Result<T, RagError> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|error| PipelineError::new(stage, error))
    }
}
