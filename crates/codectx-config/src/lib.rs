//! Configuration for codectx.
//!
//! Settings are layered with the `config` crate: built-in defaults, then
//! `~/.config/codectx/config.toml`, then `./codectx.toml`, then
//! `CODECTX__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "CODECTX";

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "codectx.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Environment variable '{var}' not set (from config value '{value}')")]
    MissingEnvVar { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodectxConfig {
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub indexing: IndexingConfig,
    pub store: StoreConfig,
    /// Present to enable span logging.
    pub tracing: Option<TracingConfig>,
}

/// Embedding provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// "openai" (also "openrouter"), "ollama", or "hashing"
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// API key or `${ENV_VAR}` reference
    pub api_key: Option<String>,
    pub dimensions: Option<usize>,
    pub timeout_ms: u64,
    pub batch_size: usize,
    pub memory_budget_mb: Option<usize>,
    pub fallback: Option<FallbackConfig>,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: None,
            base_url: None,
            api_key: None,
            dimensions: None,
            timeout_ms: 30_000,
            batch_size: 32,
            memory_budget_mb: None,
            fallback: None,
        }
    }
}

/// Secondary provider tried when a batch fails on the primary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub dimensions: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionKind {
    /// Keep the higher score of a chunk found by both paths.
    #[default]
    Max,
    /// Weighted reciprocal rank fusion.
    Rrf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub limit: usize,
    pub hybrid: bool,
    pub fusion: FusionKind,
    pub rrf_k: f32,
    pub vector_weight: f32,
    pub bm25_weight: f32,
    pub rerank: Option<RerankConfig>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            hybrid: true,
            fusion: FusionKind::Max,
            rrf_k: 60.0,
            vector_weight: 0.7,
            bm25_weight: 0.3,
            rerank: None,
        }
    }
}

/// OpenAI-compatible chat endpoint used as a yes/no reranker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// File extensions to index; empty means every known language.
    pub extensions: Vec<String>,
    pub max_chunk_lines: usize,
    pub overlap_lines: usize,
    pub respect_gitignore: bool,
    /// State directory, relative to the project root unless absolute.
    pub state_dir: String,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            max_chunk_lines: 60,
            overlap_lines: 10,
            respect_gitignore: true,
            state_dir: ".codectx".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store persisted to the state directory.
    #[default]
    Memory,
    Qdrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection: "codectx".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub service_name: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "codectx".to_string(),
        }
    }
}

impl CodectxConfig {
    /// Load from the standard locations and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_paths())
    }

    /// Load from `paths` (later files win; missing files are skipped), then
    /// the environment.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut builder = Config::builder();
        for path in paths {
            builder = builder.add_source(File::from(path.as_path()).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("indexing.extensions"),
        );

        let config: CodectxConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let e = &self.embeddings;
        if e.batch_size == 0 {
            return Err(ConfigError::Invalid("embeddings.batch_size must be at least 1".into()));
        }
        if e.timeout_ms == 0 {
            return Err(ConfigError::Invalid("embeddings.timeout_ms must be positive".into()));
        }
        if e.dimensions == Some(0) {
            return Err(ConfigError::Invalid("embeddings.dimensions must be positive".into()));
        }

        let s = &self.search;
        if s.limit == 0 {
            return Err(ConfigError::Invalid("search.limit must be at least 1".into()));
        }
        for (name, weight) in [("vector_weight", s.vector_weight), ("bm25_weight", s.bm25_weight)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "search.{name} must be a non-negative number"
                )));
            }
        }
        if !s.rrf_k.is_finite() || s.rrf_k <= 0.0 {
            return Err(ConfigError::Invalid("search.rrf_k must be positive".into()));
        }

        let i = &self.indexing;
        if i.max_chunk_lines == 0 {
            return Err(ConfigError::Invalid("indexing.max_chunk_lines must be at least 1".into()));
        }
        if i.overlap_lines >= i.max_chunk_lines {
            return Err(ConfigError::Invalid(
                "indexing.overlap_lines must be smaller than max_chunk_lines".into(),
            ));
        }
        Ok(())
    }

    /// State directory for a project rooted at `project_root`.
    pub fn state_dir_for(&self, project_root: &Path) -> PathBuf {
        resolve_with_base(project_root, &self.indexing.state_dir)
    }
}

/// `~/.config/codectx/config.toml` followed by `./codectx.toml`.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("codectx").join("config.toml"));
    }
    paths.push(PathBuf::from(LOCAL_CONFIG_FILE));
    paths
}

/// Resolve a configured secret, expanding `${ENV_VAR}` references.
///
/// Returns `None` when nothing is configured.
pub fn resolve_api_key(value: &Option<String>) -> Result<Option<String>> {
    match value {
        Some(key) if key.starts_with("${") && key.ends_with('}') => {
            let var = &key[2..key.len() - 1];
            std::env::var(var)
                .map(Some)
                .map_err(|_| ConfigError::MissingEnvVar {
                    var: var.to_string(),
                    value: key.clone(),
                })
        }
        Some(key) if !key.is_empty() => Ok(Some(key.clone())),
        _ => Ok(None),
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(input: &str) -> PathBuf {
    let expanded = shellexpand::full(input)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| input.to_string());
    PathBuf::from(expanded)
}

/// Expand `p`, joining it onto `base` when relative.
pub fn resolve_with_base(base: &Path, p: &str) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CodectxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embeddings.provider, "hashing");
        assert_eq!(config.search.limit, 10);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.tracing.is_none());
    }

    #[test]
    fn test_resolve_api_key_direct() {
        assert_eq!(
            resolve_api_key(&Some("direct-key".to_string())).unwrap(),
            Some("direct-key".to_string())
        );
    }

    #[test]
    fn test_resolve_api_key_env_var() {
        std::env::set_var("CODECTX_TEST_KEY_31337", "from-env");
        let key = resolve_api_key(&Some("${CODECTX_TEST_KEY_31337}".to_string())).unwrap();
        assert_eq!(key, Some("from-env".to_string()));
        std::env::remove_var("CODECTX_TEST_KEY_31337");
    }

    #[test]
    fn test_resolve_api_key_missing_env() {
        let err = resolve_api_key(&Some("${CODECTX_NONEXISTENT_VAR_XYZ}".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { .. }));
    }

    #[test]
    fn test_resolve_api_key_empty() {
        assert_eq!(resolve_api_key(&Some(String::new())).unwrap(), None);
        assert_eq!(resolve_api_key(&None).unwrap(), None);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut config = CodectxConfig::default();
        config.indexing.overlap_lines = config.indexing.max_chunk_lines;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = CodectxConfig::default();
        config.embeddings.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_dir_resolution() {
        let mut config = CodectxConfig::default();
        let root = Path::new("/work/app");
        assert_eq!(config.state_dir_for(root), PathBuf::from("/work/app/.codectx"));

        config.indexing.state_dir = "/var/cache/codectx".to_string();
        assert_eq!(config.state_dir_for(root), PathBuf::from("/var/cache/codectx"));
    }
}
