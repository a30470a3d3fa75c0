//! Embedding provider trait and implementations.
//!
//! This module defines the adapter contract every embedding backend
//! implements and the concrete providers: any OpenAI-compatible HTTP API,
//! a local Ollama runtime, and an offline feature-hashing model.

mod hashing;
mod ollama;
mod openai;

pub use hashing::HashingEmbeddings;
pub use ollama::OllamaEmbeddings;
pub use openai::OpenAiEmbeddings;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::EmbeddingInfo;

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
/// The pipeline relies on nothing beyond this contract.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed multiple texts, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Whether the backend is reachable and usable right now.
    async fn is_available(&self) -> bool;

    /// Output dimensionality for a model served by this provider.
    fn model_dimensions(&self, model: &str) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Short backend identifier, e.g. "openai" or "ollama".
    fn provider_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }

    /// Dimensionality of the active model.
    fn dimensions(&self) -> usize {
        self.model_dimensions(self.model_name())
    }

    fn info(&self) -> EmbeddingInfo {
        EmbeddingInfo {
            provider: self.provider_name().to_string(),
            model: self.model_name().to_string(),
            dimensions: self.dimensions(),
        }
    }
}

/// Dimensions of well-known embedding models.
pub fn known_model_dimensions(model: &str) -> Option<usize> {
    let name = model.rsplit('/').next().unwrap_or(model);
    let name = name.split(':').next().unwrap_or(name);
    let dims = match name {
        "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
        "text-embedding-3-large" => 3072,
        "qwen3-embedding-8b" => 4096,
        "qwen3-embedding-4b" => 2560,
        "qwen3-embedding-0.6b" => 1024,
        "nomic-embed-text" | "nomic-embed-text-v1.5" => 768,
        "mxbai-embed-large" | "bge-large-en-v1.5" => 1024,
        "all-minilm" | "all-MiniLM-L6-v2" | "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "jina-embeddings-v2-base-code" => 768,
        "voyage-code-3" => 1024,
        _ => return None,
    };
    Some(dims)
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/embeddings` endpoint (OpenAI, OpenRouter, vLLM, ...).
    OpenAi,
    /// A local Ollama runtime.
    Ollama,
    /// Offline feature hashing; no model download or network.
    Hashing,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Hashing => "hashing",
        };
        f.write_str(name)
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openrouter" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            "hashing" | "local" => Ok(ProviderKind::Hashing),
            other => Err(format!("unknown embedding provider '{other}'")),
        }
    }
}

/// Settings needed to construct any provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub dimensions: Option<usize>,
}

/// Build a provider of the given kind.
pub fn build_provider(kind: ProviderKind, settings: ProviderSettings) -> Arc<dyn EmbeddingProvider> {
    match kind {
        ProviderKind::OpenAi => {
            let mut provider = OpenAiEmbeddings::new(
                settings.api_key.unwrap_or_default(),
                settings.model,
                settings.dimensions,
            );
            if let Some(url) = settings.base_url {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
        ProviderKind::Ollama => {
            let mut provider = OllamaEmbeddings::new(settings.model, settings.dimensions);
            if let Some(url) = settings.base_url {
                provider = provider.with_base_url(url);
            }
            Arc::new(provider)
        }
        ProviderKind::Hashing => Arc::new(HashingEmbeddings::new(
            settings.dimensions.unwrap_or(hashing::DEFAULT_DIMENSIONS),
        )),
    }
}
