//! Offline feature-hashing embeddings.
//!
//! Tokens and their adjacent pairs are hashed into a fixed number of signed
//! buckets and the result is L2-normalized. Lexically similar code lands
//! close together, which makes this usable as an air-gapped default and as
//! a deterministic provider for tests.

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingProvider};

pub(crate) const DEFAULT_DIMENSIONS: usize = 384;

/// Deterministic, dependency-free embedding model.
#[derive(Debug, Clone)]
pub struct HashingEmbeddings {
    dimensions: usize,
    model: String,
}

impl HashingEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model: format!("hash-{dimensions}"),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = tokenize(text);

        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, joined.as_bytes(), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn model_dimensions(&self, model: &str) -> usize {
        model
            .strip_prefix("hash-")
            .and_then(|n| n.parse().ok())
            .unwrap_or(self.dimensions)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn max_batch_size(&self) -> usize {
        256
    }
}
