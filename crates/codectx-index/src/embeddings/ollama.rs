//! Local Ollama embedding provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{known_model_dimensions, EmbeddingError, EmbeddingProvider};

const DEFAULT_MODEL: &str = "nomic-embed-text";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings served by a local Ollama runtime (`/api/embed`).
#[derive(Debug)]
pub struct OllamaEmbeddings {
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
}

impl OllamaEmbeddings {
    pub fn new(model: Option<String>, dimensions: Option<usize>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let dimensions = dimensions
            .or_else(|| known_model_dimensions(&model))
            .unwrap_or(768);
        Self {
            model,
            dimensions,
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!(count = texts.len(), model = %self.model, "Embedding batch via Ollama");

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::ApiError(format!(
                "Ollama returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Ok(parsed.embeddings)
    }

    async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Ollama not reachable");
                false
            }
        }
    }

    fn model_dimensions(&self, model: &str) -> usize {
        if model == self.model {
            self.dimensions
        } else {
            known_model_dimensions(model).unwrap_or(self.dimensions)
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn max_batch_size(&self) -> usize {
        16
    }
}
