//! Code-context indexing and hybrid search for codectx.
//!
//! This crate provides:
//! - Embedding generation with batching, timeouts, and a fallback provider
//! - A single result formatter and filter predicate shared by all retrievers
//! - Hybrid search (vector + BM25) with optional LLM reranking
//! - Vector storage in memory (JSON-persisted) or in Qdrant
//! - A background indexing coordinator with cancellable sessions

pub mod chunk;
pub mod chunker;
pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod reranker;
pub mod search;
pub mod session;
pub mod status;
pub mod store;
pub mod tracer;

// Re-exports
pub use chunk::{Chunk, EmbeddedChunk, EmbeddingInfo, Metadata};
pub use chunker::{ChunkSource, LineChunker, LineChunkerConfig, ProjectRef};
pub use coordinator::{IndexingCoordinator, IndexingRunStatus, RunOutcome, StartOptions};
pub use embeddings::{
    build_provider, EmbeddingError, EmbeddingProvider, ProviderKind, ProviderSettings,
};
pub use error::{IndexError, Result};
pub use manifest::IndexManifest;
pub use pipeline::{
    batch_size_for_budget, estimate_embedding_memory, EmbeddingPipeline, PipelineOptions,
    PipelineOutcome, PipelineStats,
};
pub use reranker::{ChatReranker, RerankResult, Reranker, RerankerDoc};
pub use search::{
    format_search_result, matches_filters, reciprocal_rank_fusion, BM25Index, DenseRetriever,
    FusionStrategy, HybridSearcher, KeywordRetriever, Retriever, SearchConfig, SearchQueryOptions,
    SearchResultWithContext,
};
pub use session::{
    IndexProgress, IndexResources, IndexStats, IndexingSession, IndexingSessionFactory, Session,
    SessionEvent, SessionFactory, SessionStatus,
};
pub use status::{NoopDisplay, StatusDisplay};
pub use store::{MemoryVectorStore, QdrantConfig, QdrantStore, VectorStore};
pub use tracer::{tracer_from_config, LogTracer, NoopTracer, Tracer};

/// Default Qdrant collection name
pub const DEFAULT_COLLECTION: &str = "codectx";

/// Default embedding dimensions (hashing model and small sentence encoders)
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Per-project state directory created under the project root
pub const STATE_DIR_NAME: &str = ".codectx";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BM25_FILE: &str = "bm25_index.json";
pub const VECTORS_FILE: &str = "vectors.json";
