//! Chunk sources.
//!
//! [`ChunkSource`] is the seam between traversal/splitting and the rest of
//! the engine. [`LineChunker`] is the bundled implementation: a
//! gitignore-aware walk that cuts each text file into overlapping windows
//! of lines.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::chunk::{keys, Chunk};
use crate::error::{IndexError, Result};

/// The project being indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub name: String,
    pub id: String,
    pub root: PathBuf,
}

impl ProjectRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            root: root.into(),
        }
    }

    /// Derive name and id from the root path. The id is stable for a path.
    pub fn for_root(root: &Path, name: Option<String>) -> Self {
        let name = name.unwrap_or_else(|| {
            root.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("project")
                .to_string()
        });
        let digest = Sha256::digest(root.to_string_lossy().as_bytes());
        Self {
            name,
            id: hex::encode(&digest[..8]),
            root: root.to_path_buf(),
        }
    }
}

/// Produces the chunks of a project.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn chunks(&self, project: &ProjectRef) -> Result<Vec<Chunk>>;
}

/// Configuration for [`LineChunker`].
#[derive(Debug, Clone)]
pub struct LineChunkerConfig {
    /// File extensions to index; empty means every extension with a known
    /// language.
    pub extensions: Vec<String>,
    pub max_lines: usize,
    /// Lines shared by consecutive windows.
    pub overlap: usize,
    pub respect_gitignore: bool,
    /// Larger files are skipped.
    pub max_file_bytes: u64,
}

impl Default for LineChunkerConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            max_lines: 60,
            overlap: 10,
            respect_gitignore: true,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// Language name for a file extension.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let language = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "swift" => "swift",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "scala" => "scala",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        _ => return None,
    };
    Some(language)
}

/// Splits files into fixed windows of lines.
#[derive(Debug, Clone, Default)]
pub struct LineChunker {
    config: LineChunkerConfig,
}

impl LineChunker {
    pub fn new(config: LineChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LineChunkerConfig {
        &self.config
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        if self.config.extensions.is_empty() {
            language_for_extension(ext).is_some()
        } else {
            self.config
                .extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
        }
    }

    /// Chunk one file's content. `rel_path` is recorded as `filePath`.
    pub fn chunk_text(&self, project: &ProjectRef, rel_path: &str, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Vec::new();
        }

        let max_lines = self.config.max_lines.max(1);
        let step = max_lines.saturating_sub(self.config.overlap).max(1);
        let ext = Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + max_lines).min(lines.len());
            let text = lines[start..end].join("\n");

            if !text.trim().is_empty() {
                let id = chunk_id(&project.id, rel_path, start + 1, end, &text);
                let mut chunk = Chunk::new(id, text)
                    .with_metadata(keys::FILE_PATH, rel_path)
                    .with_metadata(keys::START_LINE, start + 1)
                    .with_metadata(keys::END_LINE, end)
                    .with_metadata(keys::PROJECT_ID, project.id.as_str());
                if let Some(ext) = &ext {
                    chunk = chunk.with_metadata(keys::FILE_TYPE, ext.as_str());
                    if let Some(language) = language_for_extension(ext) {
                        chunk = chunk.with_metadata(keys::LANGUAGE, language);
                    }
                }
                chunks.push(chunk);
            }

            if end == lines.len() {
                break;
            }
            start += step;
        }
        chunks
    }

    fn walk(&self, project: &ProjectRef) -> Result<Vec<Chunk>> {
        if !project.root.is_dir() {
            return Err(IndexError::Chunking(format!(
                "project root {} is not a directory",
                project.root.display()
            )));
        }

        let walker = WalkBuilder::new(&project.root)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .hidden(true)
            .build();

        let mut chunks = Vec::new();
        let mut files = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) || !self.accepts(path) {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > self.config.max_file_bytes)
                .unwrap_or(true)
            {
                debug!(path = %path.display(), "Skipping large file");
                continue;
            }
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping non-text file");
                    continue;
                }
            };

            let rel_path = path
                .strip_prefix(&project.root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            chunks.extend(self.chunk_text(project, &rel_path, &content));
            files += 1;
        }

        info!(project = %project.name, files, chunks = chunks.len(), "Chunked project");
        Ok(chunks)
    }
}

fn chunk_id(project_id: &str, path: &str, start: usize, end: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update([0]);
    hasher.update(path.as_bytes());
    hasher.update([0]);
    hasher.update(format!("{start}-{end}").as_bytes());
    hasher.update([0]);
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl ChunkSource for LineChunker {
    async fn chunks(&self, project: &ProjectRef) -> Result<Vec<Chunk>> {
        let chunker = self.clone();
        let project = project.clone();
        tokio::task::spawn_blocking(move || chunker.walk(&project))
            .await
            .map_err(|e| IndexError::Chunking(format!("chunking task failed: {e}")))?
    }
}
