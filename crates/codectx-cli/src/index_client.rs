//! Index client wiring configuration to the indexing engine.
//!
//! This module builds everything one project needs from a
//! [`CodectxConfig`]:
//! - Embedding providers (primary and optional fallback)
//! - The vector store (in-memory + JSON, or Qdrant)
//! - Persisted state (manifest + BM25 in the state directory)
//! - The background coordinator and the hybrid searcher

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use codectx_config::{resolve_api_key, CodectxConfig, FallbackConfig, FusionKind, StoreBackend};
use codectx_index::session::load_state;
use codectx_index::{
    build_provider, tracer_from_config, ChatReranker, DenseRetriever, EmbeddingInfo,
    EmbeddingProvider, FusionStrategy, HybridSearcher, IndexManifest, IndexResources,
    IndexingCoordinator, IndexingRunStatus, IndexingSessionFactory, KeywordRetriever, LineChunker,
    LineChunkerConfig, MemoryVectorStore, PipelineOptions, ProjectRef, ProviderKind,
    ProviderSettings, QdrantConfig, QdrantStore, SearchConfig, SearchQueryOptions,
    SearchResultWithContext, StartOptions, StatusDisplay, VectorStore, VECTORS_FILE,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Summary printed by `codectx status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub project: String,
    pub project_id: String,
    pub state_dir: PathBuf,
    pub embedding: Option<EmbeddingInfo>,
    pub stored_chunks: usize,
    pub keyword_documents: usize,
    pub manifest: IndexManifest,
    pub run: IndexingRunStatus,
}

/// Client for indexing and searching one project.
pub struct IndexClient {
    config: CodectxConfig,
    project: ProjectRef,
    state_dir: PathBuf,
    resources: IndexResources,
    coordinator: Arc<IndexingCoordinator>,
}

impl IndexClient {
    /// Create a client for the project rooted at `root`, loading any
    /// existing state from disk.
    pub async fn new(
        config: &CodectxConfig,
        root: &Path,
        project_name: Option<String>,
        display: Arc<dyn StatusDisplay>,
    ) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Cannot resolve project root {}", root.display()))?;
        let project = ProjectRef::for_root(&root, project_name);
        let state_dir = config.state_dir_for(&root);
        info!(project = %project.name, root = %root.display(), "Initializing index client");

        let provider = build_embedding_provider(
            &config.embeddings.provider,
            ProviderSettings {
                model: config.embeddings.model.clone(),
                base_url: config.embeddings.base_url.clone(),
                api_key: resolve_api_key(&config.embeddings.api_key)
                    .context("Failed to resolve embedding API key")?,
                dimensions: config.embeddings.dimensions,
            },
        )?;
        let dimensions = provider.dimensions();

        let store: Arc<dyn VectorStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(
                MemoryVectorStore::open(&state_dir.join(VECTORS_FILE), dimensions)
                    .context("Failed to open vector store")?,
            ),
            StoreBackend::Qdrant => {
                let qdrant_config = QdrantConfig {
                    url: config.store.qdrant_url.clone(),
                    api_key: resolve_api_key(&config.store.qdrant_api_key)
                        .context("Failed to resolve Qdrant API key")?,
                    collection_name: config.store.collection.clone(),
                    dimensions,
                };
                Arc::new(
                    QdrantStore::connect(&qdrant_config)
                        .await
                        .context("Failed to connect to Qdrant")?,
                )
            }
        };

        let (keyword, manifest) =
            load_state(&state_dir).context("Failed to load index state")?;
        debug!(
            state_dir = %state_dir.display(),
            keyword_documents = keyword.len(),
            "Loaded index state"
        );

        let source = LineChunker::new(LineChunkerConfig {
            extensions: config.indexing.extensions.clone(),
            max_lines: config.indexing.max_chunk_lines,
            overlap: config.indexing.overlap_lines,
            respect_gitignore: config.indexing.respect_gitignore,
            ..Default::default()
        });
        let tracer = tracer_from_config(
            config
                .tracing
                .as_ref()
                .map(|tracing| tracing.service_name.as_str()),
        );

        let resources = IndexResources::new(Arc::new(source), provider, store)
            .with_keyword_index(Arc::new(RwLock::new(keyword)))
            .with_manifest(Arc::new(RwLock::new(manifest)))
            .with_state_dir(&state_dir)
            .with_tracer(tracer);
        let factory = Arc::new(IndexingSessionFactory::new(resources.clone()));
        let coordinator = Arc::new(IndexingCoordinator::with_display(factory, display));

        Ok(Self {
            config: config.clone(),
            project,
            state_dir,
            resources,
            coordinator,
        })
    }

    pub fn project(&self) -> &ProjectRef {
        &self.project
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn coordinator(&self) -> &Arc<IndexingCoordinator> {
        &self.coordinator
    }

    /// Pipeline settings from the `embeddings` section.
    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        let embeddings = &self.config.embeddings;
        let mut options = PipelineOptions::default()
            .with_batch_size(embeddings.batch_size)
            .with_timeout(Duration::from_millis(embeddings.timeout_ms));
        if let Some(mb) = embeddings.memory_budget_mb {
            options = options.with_memory_budget(mb.saturating_mul(1024 * 1024));
        }
        if let Some(fallback) = &embeddings.fallback {
            options = options.with_fallback(build_fallback(fallback)?);
        }
        Ok(options)
    }

    /// Start indexing in the background.
    pub fn start_index(&self, rebuild: bool) -> Result<IndexingRunStatus> {
        let options = StartOptions::new(self.project.clone())
            .with_pipeline(self.pipeline_options()?)
            .with_rebuild(rebuild);
        Ok(self.coordinator.start(options)?)
    }

    /// Build a searcher over the current index.
    pub async fn searcher(&self) -> Result<HybridSearcher> {
        let search = &self.config.search;
        let fusion = match search.fusion {
            FusionKind::Max => FusionStrategy::MaxScore,
            FusionKind::Rrf => FusionStrategy::ReciprocalRank { k: search.rrf_k },
        };
        let search_config = SearchConfig {
            limit: search.limit,
            hybrid: search.hybrid,
            fusion,
            vector_weight: search.vector_weight,
            bm25_weight: search.bm25_weight,
        };

        let indexed = self.resources.manifest.read().await.embedding.clone();
        let dense = DenseRetriever::new(self.resources.provider.clone(), self.resources.store.clone())
            .with_indexed_model(indexed)
            .with_timeout(Duration::from_millis(self.config.embeddings.timeout_ms));

        let mut searcher = HybridSearcher::new(search_config)
            .with_dense(Arc::new(dense))
            .with_keyword(Arc::new(KeywordRetriever::new(self.resources.keyword.clone())))
            .with_tracer(self.resources.tracer.clone());

        if let Some(rerank) = &search.rerank {
            let api_key =
                resolve_api_key(&rerank.api_key).context("Failed to resolve reranker API key")?;
            searcher = searcher.with_reranker(Arc::new(ChatReranker::new(
                rerank.base_url.clone(),
                rerank.model.clone(),
                api_key,
            )));
        }
        Ok(searcher)
    }

    pub async fn search(
        &self,
        query: &str,
        options: &SearchQueryOptions,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResultWithContext>> {
        let searcher = self.searcher().await?;
        let limit = limit.unwrap_or(searcher.config().limit);
        Ok(searcher.search_with_limit(query, options, limit).await?)
    }

    pub async fn summary(&self) -> Result<IndexSummary> {
        let manifest = self.resources.manifest.read().await.clone();
        Ok(IndexSummary {
            project: self.project.name.clone(),
            project_id: self.project.id.clone(),
            state_dir: self.state_dir.clone(),
            embedding: manifest.embedding.clone(),
            stored_chunks: self.resources.store.len().await?,
            keyword_documents: self.resources.keyword.read().await.len(),
            manifest,
            run: self.coordinator.get_status(),
        })
    }
}

fn build_embedding_provider(
    provider: &str,
    settings: ProviderSettings,
) -> Result<Arc<dyn EmbeddingProvider>> {
    let kind = ProviderKind::from_str(provider).map_err(anyhow::Error::msg)?;
    let settings = match kind {
        ProviderKind::OpenAi if settings.api_key.is_none() => {
            // Try common environment variables as fallback
            let api_key = std::env::var("OPENROUTER_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok();
            if api_key.is_none() {
                bail!(
                    "No API key configured. Set embeddings.api_key in config or OPENAI_API_KEY environment variable"
                );
            }
            ProviderSettings { api_key, ..settings }
        }
        _ => settings,
    };
    Ok(build_provider(kind, settings))
}

fn build_fallback(fallback: &FallbackConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    build_embedding_provider(
        &fallback.provider,
        ProviderSettings {
            model: fallback.model.clone(),
            base_url: fallback.base_url.clone(),
            api_key: resolve_api_key(&fallback.api_key)
                .context("Failed to resolve fallback API key")?,
            dimensions: fallback.dimensions,
        },
    )
    .context("Failed to build fallback embedding provider")
}
