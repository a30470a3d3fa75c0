//! Error taxonomy for indexing and retrieval.
//!
//! Validation failures, provider failures, and timeouts are distinct
//! variants so callers can pick a retry policy per kind. A cancelled run is
//! reported as an outcome, never as an error.

use thiserror::Error;

use crate::embeddings::EmbeddingError;
use crate::manifest::ManifestError;

/// Errors produced by the indexing engine.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Input rejected before any provider or storage call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A vector does not have the dimensionality the store or model expects.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Query-time and index-time embedding models differ.
    #[error("Embedding model mismatch: index was built with {indexed}, query uses {query}")]
    ModelMismatch { indexed: String, query: String },

    /// A provider call exceeded its time bound.
    #[error("Embedding provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    /// A provider rejected the request or returned something unusable.
    #[error("Embedding provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: EmbeddingError,
    },

    /// A batch failed on the primary provider (and on the fallback, if one
    /// was configured). `source` is the primary provider's failure.
    #[error("Batch {start}..{end} failed on '{provider}': {source}")]
    Batch {
        start: usize,
        end: usize,
        provider: String,
        #[source]
        source: Box<IndexError>,
        fallback: Option<String>,
    },

    /// `start` was called while a run is active.
    #[error("Indexing already in progress")]
    AlreadyRunning { project_name: String },

    /// Vector or keyword storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Chunk source failure.
    #[error("Chunking error: {0}")]
    Chunking(String),

    /// Reranker failure.
    #[error("Rerank error: {0}")]
    Rerank(String),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    /// True when the underlying cause is a provider timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            IndexError::Timeout { .. } => true,
            IndexError::Batch { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when the underlying cause is a provider (non-timeout) failure.
    pub fn is_provider(&self) -> bool {
        match self {
            IndexError::Provider { .. } => true,
            IndexError::Batch { source, .. } => source.is_provider(),
            _ => false,
        }
    }

    /// True for errors raised before any provider or storage call.
    pub fn is_validation(&self) -> bool {
        match self {
            IndexError::Validation(_)
            | IndexError::DimensionMismatch { .. }
            | IndexError::ModelMismatch { .. } => true,
            IndexError::Batch { source, .. } => source.is_validation(),
            _ => false,
        }
    }

    /// Whether a fallback provider should be tried for this failure.
    pub(crate) fn allows_fallback(&self) -> bool {
        self.is_timeout() || self.is_provider()
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;
