//! Hybrid search combining vector similarity and BM25.
//!
//! Each [`Retriever`] produces [`SearchResultWithContext`] records that
//! already honor the query's [`SearchQueryOptions`]. [`HybridSearcher`]
//! runs the dense and keyword retrievers, merges their results by id, and
//! optionally hands the merged list to a [`Reranker`].

pub mod bm25;
pub mod format;

pub use bm25::BM25Index;
pub use format::{
    format_search_result, matches_fields, matches_filters, normalize_metadata, LineRange,
    NormalizedFields, SearchQueryOptions, SearchResultWithContext, UNKNOWN_FILE_TYPE,
};
pub(crate) use format::cmp_score_desc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunk::EmbeddingInfo;
use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::pipeline::{embed_with_timeout, DEFAULT_TIMEOUT};
use crate::reranker::{Reranker, RerankerDoc};
use crate::store::VectorStore;
use crate::tracer::{NoopTracer, Tracer};

/// One source of search results.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` results that satisfy `options`, best first.
    async fn retrieve(
        &self,
        query: &str,
        options: &SearchQueryOptions,
        limit: usize,
    ) -> Result<Vec<SearchResultWithContext>>;
}

/// Semantic retriever: embeds the query and asks a [`VectorStore`].
pub struct DenseRetriever {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    indexed: Option<EmbeddingInfo>,
    timeout: Duration,
}

impl DenseRetriever {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            provider,
            store,
            indexed: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The provider/model the stored vectors were produced with.
    pub fn with_indexed_model(mut self, indexed: Option<EmbeddingInfo>) -> Self {
        self.indexed = indexed;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn check_model(&self) -> Result<()> {
        let query = self.provider.info();
        if let Some(indexed) = &self.indexed {
            if *indexed != query {
                return Err(IndexError::ModelMismatch {
                    indexed: indexed.to_string(),
                    query: query.to_string(),
                });
            }
        }
        if query.dimensions != self.store.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: self.store.dimensions(),
                actual: query.dimensions,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn name(&self) -> &str {
        "dense"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &SearchQueryOptions,
        limit: usize,
    ) -> Result<Vec<SearchResultWithContext>> {
        self.check_model()?;

        let texts = [query.to_string()];
        let vector = embed_with_timeout(self.provider.as_ref(), &texts, self.timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Validation("query produced no embedding".to_string()))?;

        let native = self.store.supports_native_filtering();
        let hits = self
            .store
            .query(&vector, limit, native.then_some(options))
            .await?;

        let results: Vec<SearchResultWithContext> = hits
            .into_iter()
            .map(|hit| format_search_result(&hit.id, hit.score, &hit.content, Some(&hit.metadata)))
            .filter(|result| native || matches_filters(result, options))
            .take(limit)
            .collect();

        debug!(count = results.len(), native, "Dense retrieval");
        Ok(results)
    }
}

/// Raw BM25 score that maps to 0.5 after keyword normalization.
const KEYWORD_SCORE_MIDPOINT: f64 = 2.0;

/// Keyword retriever over a shared [`BM25Index`].
///
/// Raw BM25 scores are mapped through `s / (s + KEYWORD_SCORE_MIDPOINT)`
/// into `(0, 1)`. The mapping is fixed per score, so a weak best match
/// stays weak and `minScore` can drop it.
pub struct KeywordRetriever {
    index: Arc<RwLock<BM25Index>>,
}

impl KeywordRetriever {
    pub fn new(index: Arc<RwLock<BM25Index>>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn retrieve(
        &self,
        query: &str,
        options: &SearchQueryOptions,
        limit: usize,
    ) -> Result<Vec<SearchResultWithContext>> {
        let index = self.index.read().await;
        let ranked = index.search(query, index.len());
        let results: Vec<SearchResultWithContext> = ranked
            .iter()
            .filter_map(|(id, score)| {
                let doc = index.get(id)?;
                let normalized = (score / (score + KEYWORD_SCORE_MIDPOINT)) as f32;
                Some(format_search_result(id, normalized, &doc.text, Some(&doc.metadata)))
            })
            .filter(|result| matches_filters(result, options))
            .take(limit)
            .collect();

        debug!(count = results.len(), "Keyword retrieval");
        Ok(results)
    }
}

/// How dense and keyword results are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum FusionStrategy {
    /// A chunk found by both paths keeps the higher score.
    #[default]
    MaxScore,
    /// Weighted reciprocal rank fusion; scores become RRF scores.
    ReciprocalRank { k: f32 },
}

/// Configuration for hybrid search.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Maximum number of results to return
    pub limit: usize,
    /// Run the keyword path alongside the dense path.
    pub hybrid: bool,
    pub fusion: FusionStrategy,
    /// RRF weight for the dense path.
    pub vector_weight: f32,
    /// RRF weight for the keyword path.
    pub bm25_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            hybrid: true,
            fusion: FusionStrategy::MaxScore,
            vector_weight: 0.7,
            bm25_weight: 0.3,
        }
    }
}

/// Reciprocal Rank Fusion (RRF).
///
/// RRF score = sum(weight_i / (k + rank_i)) over each ranking source.
/// Equal scores keep first-appearance order, dense before keyword.
pub fn reciprocal_rank_fusion(
    vector_results: &[(String, f32)],
    bm25_results: &[(String, f32)],
    k: f32,
    vector_weight: f32,
    bm25_weight: f32,
) -> Vec<(String, f32)> {
    let mut order: Vec<String> = Vec::new();
    let mut scores: HashMap<String, f32> = HashMap::new();

    let sources = [(vector_results, vector_weight), (bm25_results, bm25_weight)];
    for (results, weight) in sources {
        for (rank, (id, _)) in results.iter().enumerate() {
            let rrf_score = weight / (k + rank as f32 + 1.0);
            match scores.get_mut(id) {
                Some(score) => *score += rrf_score,
                None => {
                    order.push(id.clone());
                    scores.insert(id.clone(), rrf_score);
                }
            }
        }
    }

    let mut fused: Vec<(String, f32)> = order
        .into_iter()
        .map(|id| {
            let score = scores.get(&id).copied().unwrap_or_default();
            (id, score)
        })
        .collect();
    fused.sort_by(|a, b| cmp_score_desc(a.1, b.1));
    fused
}

/// Merge by id keeping the higher score; stable on ties.
fn merge_max_score(
    dense: Vec<SearchResultWithContext>,
    keyword: Vec<SearchResultWithContext>,
) -> Vec<SearchResultWithContext> {
    let mut merged: Vec<SearchResultWithContext> = Vec::with_capacity(dense.len() + keyword.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for result in dense.into_iter().chain(keyword) {
        match positions.get(&result.id) {
            Some(&pos) => {
                if cmp_score_desc(result.score, merged[pos].score).is_lt() {
                    merged[pos].score = result.score;
                }
            }
            None => {
                positions.insert(result.id.clone(), merged.len());
                merged.push(result);
            }
        }
    }

    merged.sort_by(|a, b| cmp_score_desc(a.score, b.score));
    merged
}

fn merge_rrf(
    dense: Vec<SearchResultWithContext>,
    keyword: Vec<SearchResultWithContext>,
    k: f32,
    vector_weight: f32,
    bm25_weight: f32,
) -> Vec<SearchResultWithContext> {
    let ranking = |results: &[SearchResultWithContext]| -> Vec<(String, f32)> {
        results.iter().map(|r| (r.id.clone(), r.score)).collect()
    };
    let fused = reciprocal_rank_fusion(
        &ranking(&dense),
        &ranking(&keyword),
        k,
        vector_weight,
        bm25_weight,
    );

    let mut by_id: HashMap<String, SearchResultWithContext> = HashMap::new();
    for result in keyword.into_iter().chain(dense) {
        by_id.insert(result.id.clone(), result);
    }

    fused
        .into_iter()
        .filter_map(|(id, score)| {
            let mut result = by_id.remove(&id)?;
            result.score = score;
            Some(result)
        })
        .collect()
}

/// Composes dense and keyword retrievers under one result contract.
pub struct HybridSearcher {
    dense: Option<Arc<dyn Retriever>>,
    keyword: Option<Arc<dyn Retriever>>,
    reranker: Option<Arc<dyn Reranker>>,
    config: SearchConfig,
    tracer: Arc<dyn Tracer>,
}

impl HybridSearcher {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            dense: None,
            keyword: None,
            reranker: None,
            config,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_dense(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.dense = Some(retriever);
        self
    }

    pub fn with_keyword(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.keyword = Some(retriever);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search with the configured result limit.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchQueryOptions,
    ) -> Result<Vec<SearchResultWithContext>> {
        self.search_with_limit(query, options, self.config.limit).await
    }

    /// Run every configured retriever, merge, rerank, and truncate.
    ///
    /// `minScore` applies to retriever scores; with reciprocal rank fusion
    /// the returned scores are RRF scores.
    pub async fn search_with_limit(
        &self,
        query: &str,
        options: &SearchQueryOptions,
        limit: usize,
    ) -> Result<Vec<SearchResultWithContext>> {
        if query.trim().is_empty() {
            return Err(IndexError::Validation("query must not be empty".to_string()));
        }
        options.validate()?;

        let use_keyword = self.keyword.is_some() && (self.config.hybrid || self.dense.is_none());
        if self.dense.is_none() && !use_keyword {
            return Err(IndexError::Validation(
                "no retrievers configured".to_string(),
            ));
        }

        let mut span = self.tracer.span("search");
        span.record("limit", limit);

        // Over-fetch so merging and reranking have candidates to work with.
        let fetch_limit = limit.saturating_mul(3).max(limit);

        let dense_fut = async {
            match &self.dense {
                Some(retriever) => retriever.retrieve(query, options, fetch_limit).await,
                None => Ok(Vec::new()),
            }
        };
        let keyword_fut = async {
            match &self.keyword {
                Some(retriever) if use_keyword => {
                    retriever.retrieve(query, options, fetch_limit).await
                }
                _ => Ok(Vec::new()),
            }
        };
        let (dense, keyword) = tokio::join!(dense_fut, keyword_fut);
        let (dense, keyword) = match (dense, keyword) {
            (Ok(d), Ok(k)) => (d, k),
            (Err(e), _) | (_, Err(e)) => {
                span.finish(false);
                return Err(e);
            }
        };

        span.record("dense", dense.len());
        span.record("keyword", keyword.len());
        debug!(dense = dense.len(), keyword = keyword.len(), "Merging retriever results");

        let mut merged = match self.config.fusion {
            FusionStrategy::MaxScore => merge_max_score(dense, keyword),
            FusionStrategy::ReciprocalRank { k } => merge_rrf(
                dense,
                keyword,
                k,
                self.config.vector_weight,
                self.config.bm25_weight,
            ),
        };

        if let Some(reranker) = &self.reranker {
            merged = match self.rerank(reranker.as_ref(), query, merged).await {
                Ok(reranked) => reranked,
                Err(e) => {
                    span.finish(false);
                    return Err(e);
                }
            };
        }

        merged.truncate(limit);
        span.record("results", merged.len());
        span.finish(true);
        Ok(merged)
    }

    async fn rerank(
        &self,
        reranker: &dyn Reranker,
        query: &str,
        candidates: Vec<SearchResultWithContext>,
    ) -> Result<Vec<SearchResultWithContext>> {
        let docs: Vec<RerankerDoc> = candidates
            .iter()
            .map(|r| RerankerDoc {
                id: r.id.clone(),
                content: r.content.clone(),
            })
            .collect();
        let judgments = reranker.rerank(query, &docs).await?;

        let mut by_id: HashMap<String, SearchResultWithContext> = candidates
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let reranked: Vec<SearchResultWithContext> = judgments
            .into_iter()
            .filter(|j| j.relevant)
            .filter_map(|j| {
                let mut result = by_id.remove(&j.id)?;
                if let Some(score) = j.score {
                    result.score = score;
                }
                Some(result)
            })
            .collect();

        debug!(kept = reranked.len(), total = docs.len(), "Reranked results");
        Ok(reranked)
    }
}
