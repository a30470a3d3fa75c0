//! Index manifest: which projects are indexed and with which model.
//!
//! The manifest is how query-time code learns the index-time provider and
//! model, so a mismatch is caught instead of silently comparing vectors
//! from different embedding spaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::EmbeddingInfo;
use crate::error::IndexError;

const MANIFEST_VERSION: u32 = 1;

/// Persisted index state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    /// Version of the manifest format
    pub version: u32,

    pub last_updated: Option<DateTime<Utc>>,

    /// Provider and model every stored vector was produced with.
    pub embedding: Option<EmbeddingInfo>,

    /// Indexed projects keyed by project id.
    #[serde(default)]
    pub projects: HashMap<String, ProjectState>,
}

/// State of one indexed project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectState {
    pub name: String,
    pub root: PathBuf,
    pub file_count: usize,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

impl Default for IndexManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_updated: None,
            embedding: None,
            projects: HashMap::new(),
        }
    }

    /// Load manifest from a file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(ManifestError::Io)?;
        serde_json::from_str(&content).map_err(ManifestError::Parse)
    }

    /// Load from `path`, or start empty if it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ManifestError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save manifest to a file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ManifestError::Io)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(ManifestError::Serialize)?;
        std::fs::write(path, content).map_err(ManifestError::Io)
    }

    /// Fail if `query` differs from the model the index was built with.
    ///
    /// An index with no recorded model accepts any query model.
    pub fn check_embedding(&self, query: &EmbeddingInfo) -> Result<(), IndexError> {
        match &self.embedding {
            Some(indexed) if indexed != query => Err(IndexError::ModelMismatch {
                indexed: indexed.to_string(),
                query: query.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn set_embedding(&mut self, info: EmbeddingInfo) {
        self.embedding = Some(info);
        self.last_updated = Some(Utc::now());
    }

    /// Record a completed project run.
    pub fn record_project(&mut self, project_id: &str, state: ProjectState) {
        self.projects.insert(project_id.to_string(), state);
        self.last_updated = Some(Utc::now());
    }

    pub fn remove_project(&mut self, project_id: &str) -> Option<ProjectState> {
        let removed = self.projects.remove(project_id);
        if removed.is_some() {
            self.last_updated = Some(Utc::now());
        }
        removed
    }

    /// Forget everything, including the recorded model.
    pub fn clear(&mut self) {
        self.projects.clear();
        self.embedding = None;
        self.last_updated = Some(Utc::now());
    }

    pub fn total_chunks(&self) -> usize {
        self.projects.values().map(|p| p.chunk_count).sum()
    }
}

/// Errors that can occur when working with manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(model: &str, dimensions: usize) -> EmbeddingInfo {
        EmbeddingInfo {
            provider: "ollama".to_string(),
            model: model.to_string(),
            dimensions,
        }
    }

    fn project(chunks: usize) -> ProjectState {
        ProjectState {
            name: "demo".to_string(),
            root: PathBuf::from("/src/demo"),
            file_count: 2,
            chunk_count: chunks,
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_manifest_new() {
        let manifest = IndexManifest::new();
        assert_eq!(manifest.version, 1);
        assert!(manifest.projects.is_empty());
        assert!(manifest.embedding.is_none());
        assert_eq!(manifest.total_chunks(), 0);
    }

    #[test]
    fn test_check_embedding() {
        let mut manifest = IndexManifest::new();
        assert!(manifest.check_embedding(&info("a", 384)).is_ok());

        manifest.set_embedding(info("a", 384));
        assert!(manifest.check_embedding(&info("a", 384)).is_ok());

        let err = manifest.check_embedding(&info("b", 768)).unwrap_err();
        assert!(matches!(err, IndexError::ModelMismatch { .. }));
        assert!(err.to_string().contains("ollama/a (384d)"));
    }

    #[test]
    fn test_record_and_remove_project() {
        let mut manifest = IndexManifest::new();
        manifest.record_project("p1", project(5));
        manifest.record_project("p2", project(3));
        manifest.record_project("p1", project(4));

        assert_eq!(manifest.projects.len(), 2);
        assert_eq!(manifest.total_chunks(), 7);
        assert!(manifest.last_updated.is_some());

        assert!(manifest.remove_project("p2").is_some());
        assert!(manifest.remove_project("p2").is_none());
        assert_eq!(manifest.total_chunks(), 4);
    }

    #[test]
    fn test_clear_forgets_model() {
        let mut manifest = IndexManifest::new();
        manifest.set_embedding(info("a", 384));
        manifest.record_project("p1", project(1));
        manifest.clear();
        assert!(manifest.embedding.is_none());
        assert!(manifest.projects.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("manifest.json");

        let mut manifest = IndexManifest::new();
        manifest.set_embedding(info("nomic-embed-text", 768));
        manifest.record_project("p1", project(9));
        manifest.save(&path).unwrap();

        let loaded = IndexManifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);

        let fresh = IndexManifest::load_or_default(&dir.path().join("none.json")).unwrap();
        assert_eq!(fresh.version, 1);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(IndexManifest::load(&path), Err(ManifestError::Parse(_))));
    }
}
