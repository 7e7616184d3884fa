//! Process-wide components, built once and shared by the CLI and the server.
//!
//! Nothing here is global: `main` builds a [`Services`] from the loaded
//! config and hands an `Arc<Services>` to whichever front end runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cache::Cache;
use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::{create_backend, EmbeddingBackend, EmbeddingClient};
use crate::error::{PipelineError, RagError, Stage, StageExt};
use crate::generation::{GenerationBackend, OllamaGenerator};
use crate::index::VectorIndex;
use crate::ingest::Ingestor;
use crate::persist::IndexStore;
use crate::query::QueryPipeline;
use crate::retrieve::Retriever;
use crate::synth::AnswerSynthesizer;
use crate::vision::{OllamaVision, VisionBackend, VisionPipeline};

/// Model backends and cache, injectable for tests.
pub struct Backends {
    pub embedding: Arc<dyn EmbeddingBackend>,
    pub generation: Arc<dyn GenerationBackend>,
    pub vision: Arc<dyn VisionBackend>,
    pub cache: Arc<Cache>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStoreStats {
    pub total_documents: usize,
    pub sources: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagStats {
    pub llm_model: String,
    pub embedding_model: String,
    pub vector_store: VectorStoreStats,
    pub top_k: usize,
    pub similarity_threshold: f32,
}

pub struct Services {
    pub config: Config,
    pub index: Arc<VectorIndex>,
    pub cache: Arc<Cache>,
    pub ingestor: Ingestor,
    pub query: QueryPipeline,
    pub vision: VisionPipeline,
    store: Option<Arc<IndexStore>>,
    embedding_model: String,
}

impl Services {
    /// Build the real backends named in `config`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let backends = Backends {
            embedding: create_backend(&config.embedding)?,
            generation: Arc::new(OllamaGenerator::new(&config.generation)?),
            vision: Arc::new(OllamaVision::new(&config.vision)?),
            cache: Arc::new(Cache::from_config(&config.cache).await),
        };
        Self::with_backends(config, backends)
    }

    /// Wire components around the given backends. Loads the persisted index
    /// when `index.path` is set.
    pub fn with_backends(config: Config, backends: Backends) -> Result<Self> {
        let store = config.index.path.clone().map(|p| Arc::new(IndexStore::new(p)));
        let dims = config.embedding.dims.or(backends.embedding.dims());

        let index = match &store {
            Some(store) => match store.load().with_context(|| {
                format!("Failed to load index from {}", store.dir().display())
            })? {
                Some(entries) => Arc::new(VectorIndex::from_entries(dims, entries)?),
                None => Arc::new(VectorIndex::new(dims)),
            },
            None => Arc::new(VectorIndex::new(dims)),
        };

        let embedder = EmbeddingClient::from_config(backends.embedding.clone(), &config.embedding);
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;
        let save_to = if config.index.persist { store.clone() } else { None };

        let ingestor = Ingestor::new(chunker, embedder.clone(), index.clone(), save_to);
        let query = QueryPipeline::new(
            Retriever::new(index.clone(), embedder.clone()),
            AnswerSynthesizer::new(backends.generation),
            backends.cache.clone(),
            index.clone(),
            config.retrieval.top_k,
            config.retrieval.similarity_threshold,
        );
        let vision = VisionPipeline::new(
            backends.vision,
            backends.cache.clone(),
            config.vision.prompt.clone(),
        )
        .with_max_image_bytes(config.vision.max_image_bytes);

        info!(
            embedding = %embedder.model_name(),
            llm = %query.model_name(),
            vision = %vision.model_name(),
            cache = backends.cache.is_enabled(),
            "Services ready"
        );

        Ok(Self {
            embedding_model: embedder.model_name().to_string(),
            config,
            index,
            cache: backends.cache,
            ingestor,
            query,
            vision,
            store,
        })
    }

    pub async fn rag_stats(&self) -> RagStats {
        RagStats {
            llm_model: self.query.model_name().to_string(),
            embedding_model: self.embedding_model.clone(),
            vector_store: VectorStoreStats {
                total_documents: self.index.len().await,
                sources: self.index.sources().await.len(),
                chunk_size: self.ingestor.chunker().chunk_size(),
                chunk_overlap: self.ingestor.chunker().overlap(),
            },
            top_k: self.config.retrieval.top_k,
            similarity_threshold: self.config.retrieval.similarity_threshold,
        }
    }

    /// Empty the knowledge base. Returns the number of chunks removed.
    pub async fn clear_knowledge_base(&self) -> Result<usize, PipelineError> {
        let removed = self.index.clear().await;
        info!(removed, "Cleared knowledge base");
        if self.config.index.persist {
            self.persist().await.at(Stage::Persist)?;
        }
        Ok(removed)
    }

    /// Write the index to disk if a path is configured.
    pub async fn persist(&self) -> Result<(), RagError> {
        match &self.store {
            Some(store) => store.save(&self.index).await,
            None => Ok(()),
        }
    }

    /// Flush state before exit.
    pub async fn shutdown(&self) -> Result<(), RagError> {
        if self.config.index.persist {
            self.persist().await?;
        }
        Ok(())
    }
}
