//! Chunk data model.
//!
//! A [`Chunk`] is the atom of indexing: a span of source text plus an open
//! metadata map. An [`EmbeddedChunk`] adds the vector and the provider/model
//! that produced it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open metadata mapping carried by chunks and search results.
pub type Metadata = serde_json::Map<String, Value>;

/// Well-known metadata keys.
pub mod keys {
    pub const FILE_PATH: &str = "filePath";
    pub const FILE_TYPE: &str = "fileType";
    pub const LANGUAGE: &str = "language";
    pub const START_LINE: &str = "startLine";
    pub const END_LINE: &str = "endLine";
    pub const PROJECT_ID: &str = "projectId";
}

/// A unit of source text with location metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// True if the content has no non-whitespace characters.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Read a string-valued metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.metadata_str(keys::PROJECT_ID)
    }
}

/// Which provider and model produced a vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingInfo {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

impl fmt::Display for EmbeddingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}d)", self.provider, self.model, self.dimensions)
    }
}

/// A chunk together with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    pub embedding: EmbeddingInfo,
}

impl EmbeddedChunk {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn dimensions(&self) -> usize {
        self.embedding.dimensions
    }
}
