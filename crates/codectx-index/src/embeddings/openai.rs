//! OpenAI-compatible `/embeddings` provider.
//!
//! Works against OpenAI, OpenRouter, and any server that speaks the same
//! request/response shape. Rate-limit responses are retried with
//! exponential backoff; every other failure is returned to the pipeline,
//! which owns timeout and fallback policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{known_model_dimensions, EmbeddingError, EmbeddingProvider};

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/embeddings";
const MAX_RETRIES: u32 = 3;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbedResponse {
    /// Vectors in input order. Servers may return items out of order.
    fn into_ordered(mut self, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.data.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {expected} embeddings, got {}",
                self.data.len()
            )));
        }
        self.data.sort_unstable_by_key(|item| item.index);
        Ok(self.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    Done(Vec<Vec<f32>>),
    /// 429 with the server's suggested wait, if any.
    Throttled(Option<u64>),
}

/// Embedding provider for OpenAI-compatible APIs.
pub struct OpenAiEmbeddings {
    api_key: String,
    model: String,
    dimensions: usize,
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for OpenAiEmbeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddings")
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbeddings {
    /// Dimensions default to the model's known size, or 1536 when unknown.
    pub fn new(api_key: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let dimensions = dimensions
            .or_else(|| known_model_dimensions(&model))
            .unwrap_or(1536);
        Self {
            api_key,
            model,
            dimensions,
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Full URL of the embeddings endpoint.
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    async fn attempt(&self, texts: &[String]) -> Result<Attempt, EmbeddingError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Ok(Attempt::Throttled(wait));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiError(format!(
                "{} returned {}: {}",
                self.base_url,
                status.as_u16(),
                body.trim()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        parsed.into_ordered(texts.len()).map(Attempt::Done)
    }

    /// Post `texts`, waiting out rate limits up to [`MAX_RETRIES`] times.
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut backoff = 1u64;
        for attempt in 0..=MAX_RETRIES {
            debug!(count = texts.len(), attempt, "Requesting embeddings");
            let wait = match self.attempt(texts).await? {
                Attempt::Done(vectors) => return Ok(vectors),
                Attempt::Throttled(wait) => wait.unwrap_or(backoff),
            };
            if attempt == MAX_RETRIES {
                return Err(EmbeddingError::RateLimited(wait));
            }
            warn!(wait_secs = wait, attempt, "Embedding endpoint throttled the request");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            backoff = backoff.saturating_mul(2);
        }
        Err(EmbeddingError::RateLimited(backoff))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        self.request(texts).await
    }

    async fn is_available(&self) -> bool {
        !self.api_key.trim().is_empty()
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
        "openai"
    }

    fn max_batch_size(&self) -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = OpenAiEmbeddings::new("test-key".to_string(), None, None);
        assert_eq!(provider.dimensions(), 1536);
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.max_batch_size(), 64);
    }

    #[test]
    fn test_provider_custom_model() {
        let provider = OpenAiEmbeddings::new(
            "test-key".to_string(),
            Some("qwen/qwen3-embedding-8b".to_string()),
            None,
        );
        assert_eq!(provider.dimensions(), 4096);

        let provider = OpenAiEmbeddings::new(
            "test-key".to_string(),
            Some("custom/model".to_string()),
            Some(1024),
        );
        assert_eq!(provider.dimensions(), 1024);
        assert_eq!(provider.model_dimensions("text-embedding-3-large"), 3072);
    }

    #[test]
    fn test_provider_with_base_url() {
        let provider = OpenAiEmbeddings::new("test-key".to_string(), None, None)
            .with_base_url("http://localhost:8080/embeddings".to_string());
        assert_eq!(provider.base_url, "http://localhost:8080/embeddings");
    }

    #[tokio::test]
    async fn test_availability_requires_key() {
        let provider = OpenAiEmbeddings::new(String::new(), None, None);
        assert!(!provider.is_available().await);
        let provider = OpenAiEmbeddings::new("sk-test".to_string(), None, None);
        assert!(provider.is_available().await);
    }

    #[test]
    fn test_response_restored_to_input_order() {
        let json = r#"{"data": [
            {"embedding": [0.4, 0.5], "index": 1},
            {"embedding": [0.1, 0.2], "index": 0}
        ]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let vectors = response.into_ordered(2).unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.4, 0.5]]);
    }

    #[test]
    fn test_response_with_missing_items_is_rejected() {
        let json = r#"{"data": [{"embedding": [0.1], "index": 0}]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            response.into_ordered(3),
            Err(EmbeddingError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let provider = OpenAiEmbeddings::new("sk-secret".to_string(), None, None);
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-secret"));
    }
}
