//! Vector storage.
//!
//! A [`VectorStore`] holds embedded chunks keyed by id and answers
//! similarity queries of matching dimensionality. Stores that report
//! [`VectorStore::supports_native_filtering`] evaluate
//! [`SearchQueryOptions`] themselves; their decisions must match
//! [`matches_filters`](crate::search::matches_filters) on the same data.

mod memory;
mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::{QdrantConfig, QdrantStore};

use std::collections::HashSet;

use async_trait::async_trait;

use crate::chunk::{EmbeddedChunk, Metadata};
use crate::error::{IndexError, Result};
use crate::search::SearchQueryOptions;

/// A raw similarity hit before formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHit {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: Metadata,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Configured vector dimensionality.
    fn dimensions(&self) -> usize;

    /// Whether `query` honors the filter argument itself.
    fn supports_native_filtering(&self) -> bool {
        false
    }

    /// Insert or replace chunks by id. Any vector of the wrong length fails
    /// the whole call before anything is written.
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()>;

    /// Return up to `limit` hits by descending similarity. `filter` is only
    /// passed to stores that support native filtering.
    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchQueryOptions>,
    ) -> Result<Vec<StoredHit>>;

    /// Remove chunks by id. Returns how many were removed; stores that
    /// cannot tell report the number of ids given.
    async fn remove(&self, ids: &[String]) -> Result<usize>;

    /// Remove every chunk of `project_id` whose id is not in `keep`.
    async fn retain_project(&self, project_id: &str, keep: &HashSet<String>) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Flush to durable storage, if the store has any.
    async fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Fail with a dimension mismatch if any chunk has the wrong vector length.
pub(crate) fn check_dimensions(expected: usize, chunks: &[EmbeddedChunk]) -> Result<()> {
    for chunk in chunks {
        if chunk.vector.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: chunk.vector.len(),
            });
        }
    }
    Ok(())
}
