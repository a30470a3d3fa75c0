//! In-process vector store with optional JSON persistence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{check_dimensions, StoredHit, VectorStore};
use crate::chunk::EmbeddedChunk;
use crate::error::{IndexError, Result};
use crate::search::{
    cmp_score_desc, matches_fields, normalize_metadata, NormalizedFields, SearchQueryOptions,
};

struct Entry {
    chunk: EmbeddedChunk,
    fields: NormalizedFields,
    norm: f32,
}

impl Entry {
    fn new(chunk: EmbeddedChunk) -> Self {
        let fields = normalize_metadata(Some(&chunk.chunk.metadata));
        let norm = l2_norm(&chunk.vector);
        Self {
            chunk,
            fields,
            norm,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Insertion order; ties in similarity keep this order.
    entries: Vec<Entry>,
    positions: HashMap<String, usize>,
}

impl Inner {
    fn upsert(&mut self, chunk: EmbeddedChunk) {
        match self.positions.get(chunk.id()) {
            Some(&pos) => self.entries[pos] = Entry::new(chunk),
            None => {
                self.positions.insert(chunk.id().to_string(), self.entries.len());
                self.entries.push(Entry::new(chunk));
            }
        }
    }

    fn retain(&mut self, keep: impl Fn(&Entry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.chunk.id().to_string(), i))
            .collect();
        before - self.entries.len()
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimensions: usize,
    chunks: Vec<EmbeddedChunk>,
}

/// Brute-force cosine store. Filters are evaluated natively against
/// fields extracted at insert time.
pub struct MemoryVectorStore {
    dimensions: usize,
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl MemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            path: None,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Open a store persisted at `path`, loading existing contents.
    ///
    /// A file written with a different dimensionality is a configuration
    /// error.
    pub fn open(path: &Path, dimensions: usize) -> Result<Self> {
        let mut inner = Inner::default();
        if path.exists() {
            let json = std::fs::read_to_string(path)?;
            let snapshot: Snapshot = serde_json::from_str(&json)?;
            if snapshot.dimensions != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    actual: snapshot.dimensions,
                });
            }
            check_dimensions(dimensions, &snapshot.chunks)?;
            for chunk in snapshot.chunks {
                inner.upsert(chunk);
            }
            info!(path = %path.display(), chunks = inner.entries.len(), "Loaded vector store");
        }
        Ok(Self {
            dimensions,
            path: Some(path.to_path_buf()),
            inner: RwLock::new(inner),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fetch a stored chunk by id.
    pub async fn get(&self, id: &str) -> Option<EmbeddedChunk> {
        let inner = self.inner.read().await;
        inner
            .positions
            .get(id)
            .map(|&pos| inner.entries[pos].chunk.clone())
    }
}

fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, entry: &Entry) -> f32 {
    if query_norm == 0.0 || entry.norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query
        .iter()
        .zip(&entry.chunk.vector)
        .map(|(a, b)| a * b)
        .sum();
    dot / (query_norm * entry.norm)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn supports_native_filtering(&self) -> bool {
        true
    }

    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        check_dimensions(self.dimensions, chunks)?;
        let mut inner = self.inner.write().await;
        for chunk in chunks {
            inner.upsert(chunk.clone());
        }
        debug!(count = chunks.len(), total = inner.entries.len(), "Upserted chunks");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchQueryOptions>,
    ) -> Result<Vec<StoredHit>> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        let query_norm = l2_norm(vector);
        let inner = self.inner.read().await;

        let mut scored: Vec<(f32, &Entry)> = inner
            .entries
            .iter()
            .map(|entry| (cosine(vector, query_norm, entry), entry))
            .filter(|(score, entry)| {
                filter
                    .map(|options| matches_fields(&entry.fields, *score, options))
                    .unwrap_or(true)
            })
            .collect();

        scored.sort_by(|a, b| cmp_score_desc(a.0, b.0));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| StoredHit {
                id: entry.chunk.chunk.id.clone(),
                score,
                content: entry.chunk.chunk.content.clone(),
                metadata: entry.chunk.chunk.metadata.clone(),
            })
            .collect())
    }

    async fn remove(&self, ids: &[String]) -> Result<usize> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut inner = self.inner.write().await;
        Ok(inner.retain(|entry| !ids.contains(entry.chunk.id())))
    }

    async fn retain_project(&self, project_id: &str, keep: &HashSet<String>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        Ok(inner.retain(|entry| {
            entry.fields.project_id.as_deref() != Some(project_id)
                || keep.contains(entry.chunk.id())
        }))
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.positions.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.read().await.entries.len())
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let inner = self.inner.read().await;
            let snapshot = Snapshot {
                dimensions: self.dimensions,
                chunks: inner.entries.iter().map(|e| e.chunk.clone()).collect(),
            };
            serde_json::to_string(&snapshot)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Persisted vector store");
        Ok(())
    }
}
