//! Reranking of merged search results.
//!
//! A [`Reranker`] returns its judgments in the order it wants results
//! presented; the hybrid searcher treats that order as final and drops
//! documents judged irrelevant.
//!
//! [`ChatReranker`] asks an OpenAI-compatible chat endpoint for a yes/no
//! judgment per document using the Qwen3-Reranker prompt layout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Result;

/// Documents are truncated to this many characters before judging.
const MAX_DOC_CHARS: usize = 2000;

const SYSTEM_PROMPT: &str =
    "Judge whether the Document meets the requirements based on the Query. Answer only \"yes\" or \"no\".";

const DEFAULT_INSTRUCTION: &str =
    "Given a code search query, retrieve relevant code snippets that answer the query";

/// A document to be reranked.
#[derive(Debug, Clone)]
pub struct RerankerDoc {
    pub id: String,
    pub content: String,
}

/// Judgment for a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    pub id: String,
    pub relevant: bool,
    /// Replacement score, if the reranker produces one.
    pub score: Option<f32>,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Judge documents against a query. The returned order is authoritative.
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<RerankResult>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Judgment {
    Relevant,
    Irrelevant,
    /// The server could not be asked or gave no usable answer.
    Unknown,
}

impl Judgment {
    /// Read a yes/no answer, ignoring any leading `<think>` block.
    fn parse(answer: &str) -> Self {
        let answer = answer.rsplit("</think>").next().unwrap_or(answer);
        let answer = answer.trim().to_lowercase();
        if answer.starts_with("yes") {
            Judgment::Relevant
        } else if answer.starts_with("no") {
            Judgment::Irrelevant
        } else {
            Judgment::Unknown
        }
    }

    /// Presentation rank: confirmed hits first, unjudged documents after.
    fn rank(self) -> u8 {
        match self {
            Judgment::Relevant => 0,
            Judgment::Unknown => 1,
            Judgment::Irrelevant => 2,
        }
    }
}

/// Yes/no reranker over an OpenAI-compatible `/v1/chat/completions`
/// endpoint (LM Studio, Ollama, vLLM, hosted APIs).
pub struct ChatReranker {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    instruction: String,
}

impl ChatReranker {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model,
            api_key,
            instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }

    pub fn with_instruction(mut self, instruction: String) -> Self {
        self.instruction = instruction;
        self
    }

    async fn judge(&self, query: &str, doc: &RerankerDoc) -> Judgment {
        let excerpt: String = doc.content.chars().take(MAX_DOC_CHARS).collect();
        let body = json!({
            "model": self.model,
            "max_tokens": 10,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": format!(
                        "<Instruct>: {}\n<Query>: {}\n<Document>: {}",
                        self.instruction, query, excerpt
                    ),
                },
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let completion = match request.send().await {
            Ok(response) => response.json::<Completion>().await,
            Err(e) => {
                warn!(doc_id = %doc.id, error = %e, "Reranker request failed");
                return Judgment::Unknown;
            }
        };

        let judgment = match completion {
            Ok(completion) => completion
                .answer()
                .map(Judgment::parse)
                .unwrap_or(Judgment::Unknown),
            Err(e) => {
                warn!(doc_id = %doc.id, error = %e, "Unreadable reranker response");
                Judgment::Unknown
            }
        };
        debug!(doc_id = %doc.id, ?judgment, "Reranker judgment");
        judgment
    }
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
    /// Some servers put the answer here when thinking mode is on.
    reasoning_content: Option<String>,
}

impl Completion {
    fn answer(&self) -> Option<&str> {
        let message = &self.choices.first()?.message;
        message
            .reasoning_content
            .as_deref()
            .or(message.content.as_deref())
    }
}

#[async_trait]
impl Reranker for ChatReranker {
    async fn rerank(&self, query: &str, documents: &[RerankerDoc]) -> Result<Vec<RerankResult>> {
        // Sequential: local inference servers handle one request at a time.
        let mut judged = Vec::with_capacity(documents.len());
        for doc in documents {
            judged.push((self.judge(query, doc).await, doc));
        }
        judged.sort_by_key(|(judgment, _)| judgment.rank());

        Ok(judged
            .into_iter()
            .map(|(judgment, doc)| RerankResult {
                id: doc.id.clone(),
                // Unjudged documents are kept.
                relevant: judgment != Judgment::Irrelevant,
                score: None,
            })
            .collect())
    }
}
