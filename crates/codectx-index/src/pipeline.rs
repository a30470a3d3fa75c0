//! Embedding pipeline.
//!
//! Turns chunks into [`EmbeddedChunk`]s in bounded batches. Each provider
//! call is raced against a timeout; a batch that fails on the primary
//! provider is retried once, whole, on the fallback provider. Completed
//! batches are handed to a [`BatchSink`] as soon as they are ready so a
//! caller can persist incrementally.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, EmbeddedChunk};
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::error::{IndexError, Result};
use crate::tracer::{NoopTracer, Tracer};

/// Default number of chunks per provider call.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default bound on a single provider call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives `(completed, total)` after each batch.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options controlling a pipeline run.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Upper bound on chunks per provider call.
    pub batch_size: usize,
    /// Bound on each provider call.
    pub timeout: Duration,
    /// Provider to retry a failed batch on.
    pub fallback: Option<Arc<dyn EmbeddingProvider>>,
    /// Optional peak-memory budget in bytes used to shrink batches.
    pub memory_budget: Option<usize>,
    pub progress: Option<ProgressCallback>,
    /// Checked between batches; cancels the in-flight batch.
    pub cancel: Option<CancellationToken>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
            fallback: None,
            memory_budget: None,
            progress: None,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field(
                "fallback",
                &self.fallback.as_ref().map(|p| p.info().to_string()),
            )
            .field("memory_budget", &self.memory_budget)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

impl PipelineOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn EmbeddingProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IndexError::Validation(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(IndexError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Destination for completed batches.
#[async_trait]
pub trait BatchSink: Send {
    async fn accept(&mut self, batch: Vec<EmbeddedChunk>) -> Result<()>;
}

#[async_trait]
impl BatchSink for Vec<EmbeddedChunk> {
    async fn accept(&mut self, mut batch: Vec<EmbeddedChunk>) -> Result<()> {
        self.append(&mut batch);
        Ok(())
    }
}

/// Counters for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Chunks embedded and accepted by the sink.
    pub chunks: usize,
    pub batches: usize,
    /// Batches that were embedded by the fallback provider.
    pub fallback_batches: usize,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed(PipelineStats),
    /// Cancellation was observed; the in-flight batch was discarded.
    Cancelled(PipelineStats),
}

impl PipelineOutcome {
    pub fn stats(&self) -> &PipelineStats {
        match self {
            PipelineOutcome::Completed(stats) | PipelineOutcome::Cancelled(stats) => stats,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineOutcome::Cancelled(_))
    }
}

/// Embeds chunks with one primary provider and an optional fallback.
pub struct EmbeddingPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    options: PipelineOptions,
    tracer: Arc<dyn Tracer>,
}

impl EmbeddingPipeline {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, options: PipelineOptions) -> Self {
        Self {
            provider,
            options,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Batch size after applying provider limits and the memory budget.
    pub fn effective_batch_size(&self, chunks: &[Chunk]) -> usize {
        let mut size = self
            .options
            .batch_size
            .min(self.provider.max_batch_size().max(1));
        if let Some(budget) = self.options.memory_budget {
            size = size.min(batch_size_for_budget(
                chunks,
                self.provider.dimensions(),
                budget,
            ));
        }
        size.max(1)
    }

    /// Embed a single chunk.
    pub async fn embed_chunk(&self, chunk: &Chunk) -> Result<EmbeddedChunk> {
        let mut embedded = self.embed_chunks(std::slice::from_ref(chunk)).await?;
        embedded.pop().ok_or_else(|| {
            IndexError::Validation(format!("chunk '{}' was not embedded", chunk.id))
        })
    }

    /// Embed all chunks and return them in input order.
    ///
    /// If the options carry a cancellation token that fires, only the
    /// batches completed before cancellation are returned; use [`run`] to
    /// tell the two outcomes apart.
    ///
    /// [`run`]: EmbeddingPipeline::run
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<EmbeddedChunk>> {
        let mut collected = Vec::with_capacity(chunks.len());
        self.run(chunks, &mut collected).await?;
        Ok(collected)
    }

    /// Embed `chunks` batch by batch, handing each completed batch to `sink`.
    ///
    /// Fails fast on the first batch that cannot be embedded; nothing from
    /// that batch reaches the sink. A fallback whose dimensions differ from
    /// the primary's is rejected before any provider is called.
    pub async fn run(&self, chunks: &[Chunk], sink: &mut dyn BatchSink) -> Result<PipelineOutcome> {
        self.options.validate()?;
        self.check_fallback_dimensions()?;
        validate_chunks(chunks)?;

        let total = chunks.len();
        let mut stats = PipelineStats::default();

        if total == 0 {
            self.report(0, 0);
            return Ok(PipelineOutcome::Completed(stats));
        }

        let batch_size = self.effective_batch_size(chunks);
        debug!(
            total,
            batch_size,
            provider = %self.provider.info(),
            "Starting embedding run"
        );

        for (i, batch) in chunks.chunks(batch_size).enumerate() {
            let start = i * batch_size;

            if self.is_cancelled() {
                info!(completed = stats.chunks, total, "Embedding cancelled between batches");
                return Ok(PipelineOutcome::Cancelled(stats));
            }

            let result = match &self.options.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            info!(start, end = start + batch.len(), "Discarding in-flight batch after cancellation");
                            return Ok(PipelineOutcome::Cancelled(stats));
                        }
                        result = self.embed_batch(batch, start) => result,
                    }
                }
                None => self.embed_batch(batch, start).await,
            };

            let (embedded, used_fallback) = result?;
            let end = start + batch.len();
            let producer = match (&self.options.fallback, used_fallback) {
                (Some(fallback), true) => fallback.provider_name().to_string(),
                _ => self.provider.provider_name().to_string(),
            };
            sink.accept(embedded)
                .await
                .map_err(|source| IndexError::Batch {
                    start,
                    end,
                    provider: producer,
                    source: Box::new(source),
                    fallback: None,
                })?;

            stats.chunks += batch.len();
            stats.batches += 1;
            if used_fallback {
                stats.fallback_batches += 1;
            }
            self.report(stats.chunks, total);
        }

        Ok(PipelineOutcome::Completed(stats))
    }

    /// A fallback must produce vectors the primary's consumers can store.
    fn check_fallback_dimensions(&self) -> Result<()> {
        let Some(fallback) = &self.options.fallback else {
            return Ok(());
        };
        let expected = self.provider.dimensions();
        let actual = fallback.dimensions();
        if actual != expected {
            return Err(IndexError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    fn report(&self, completed: usize, total: usize) {
        if let Some(progress) = &self.options.progress {
            progress(completed, total);
        }
    }

    /// Embed one batch, retrying once on the fallback provider.
    ///
    /// Returns the embedded chunks and whether the fallback produced them.
    async fn embed_batch(&self, batch: &[Chunk], start: usize) -> Result<(Vec<EmbeddedChunk>, bool)> {
        let end = start + batch.len();
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

        let mut span = self.tracer.span("pipeline.batch");
        span.record("start", start);
        span.record("end", end);
        span.record("provider", self.provider.provider_name());

        let primary_err = match self.embed_with(self.provider.as_ref(), batch, &texts).await {
            Ok(embedded) => {
                span.finish(true);
                return Ok((embedded, false));
            }
            Err(err) => err,
        };

        let batch_error = |source: IndexError, fallback: Option<String>| IndexError::Batch {
            start,
            end,
            provider: self.provider.provider_name().to_string(),
            source: Box::new(source),
            fallback,
        };

        let fallback = match &self.options.fallback {
            Some(fallback) if primary_err.allows_fallback() => fallback,
            _ => {
                span.finish(false);
                return Err(batch_error(primary_err, None));
            }
        };

        warn!(
            start,
            end,
            primary = %self.provider.info(),
            fallback = %fallback.info(),
            error = %primary_err,
            "Primary embedding provider failed, retrying batch on fallback"
        );
        span.record("fallback", fallback.provider_name());

        match self.embed_with(fallback.as_ref(), batch, &texts).await {
            Ok(embedded) => {
                span.finish(true);
                Ok((embedded, true))
            }
            Err(fallback_err) => {
                span.finish(false);
                Err(batch_error(
                    primary_err,
                    Some(format!("{}: {}", fallback.provider_name(), fallback_err)),
                ))
            }
        }
    }

    async fn embed_with(
        &self,
        provider: &dyn EmbeddingProvider,
        batch: &[Chunk],
        texts: &[String],
    ) -> Result<Vec<EmbeddedChunk>> {
        let vectors = embed_with_timeout(provider, texts, self.options.timeout).await?;
        let info = provider.info();
        Ok(batch
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk {
                chunk: chunk.clone(),
                vector,
                embedding: info.clone(),
            })
            .collect())
    }
}

/// Call `provider.embed` under `timeout` and check the response shape.
pub(crate) async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let name = provider.provider_name().to_string();
    let vectors = match tokio::time::timeout(timeout, provider.embed(texts)).await {
        Ok(Ok(vectors)) => vectors,
        Ok(Err(source)) => return Err(IndexError::Provider { provider: name, source }),
        Err(_) => {
            return Err(IndexError::Timeout {
                provider: name,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    if vectors.len() != texts.len() {
        return Err(IndexError::Provider {
            provider: name,
            source: EmbeddingError::InvalidResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )),
        });
    }

    let expected = provider.dimensions();
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: bad.len(),
        });
    }

    Ok(vectors)
}

/// Reject chunks with empty or whitespace-only content.
pub fn validate_chunks(chunks: &[Chunk]) -> Result<()> {
    if let Some(blank) = chunks.iter().find(|c| c.is_blank()) {
        return Err(IndexError::Validation(format!(
            "chunk '{}' has empty content",
            blank.id
        )));
    }
    Ok(())
}

/// Advisory estimate of the bytes needed to hold `chunks` once embedded at
/// `dimensions`.
pub fn estimate_embedding_memory(chunks: &[Chunk], dimensions: usize) -> usize {
    let per_vector = dimensions * std::mem::size_of::<f32>();
    let overhead = std::mem::size_of::<EmbeddedChunk>();
    chunks
        .iter()
        .map(|chunk| {
            let metadata = serde_json::to_vec(&chunk.metadata)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
            chunk.id.len() + chunk.content.len() + metadata + per_vector + overhead
        })
        .sum()
}

/// Largest batch size whose estimated footprint fits `budget_bytes`.
///
/// Always at least 1.
pub fn batch_size_for_budget(chunks: &[Chunk], dimensions: usize, budget_bytes: usize) -> usize {
    let per_chunk = if chunks.is_empty() {
        dimensions * std::mem::size_of::<f32>() + std::mem::size_of::<EmbeddedChunk>()
    } else {
        estimate_embedding_memory(chunks, dimensions).div_ceil(chunks.len())
    };
    (budget_bytes / per_chunk.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedProvider {
        dims: usize,
        calls: AtomicUsize,
        max_batch: usize,
    }

    impl FixedProvider {
        fn new(dims: usize) -> Self {
            Self {
                dims,
                calls: AtomicUsize::new(0),
                max_batch: 32,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.1; self.dims]).collect())
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_dimensions(&self, _model: &str) -> usize {
            self.dims
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn provider_name(&self) -> &str {
            "mock"
        }

        fn max_batch_size(&self) -> usize {
            self.max_batch
        }
    }

    /// Succeeds for the first `succeed` calls, then returns an API error.
    struct FailingProvider {
        dims: usize,
        succeed: usize,
        calls: AtomicUsize,
        name: &'static str,
    }

    impl FailingProvider {
        fn new(name: &'static str, dims: usize, succeed: usize) -> Self {
            Self {
                dims,
                succeed,
                calls: AtomicUsize::new(0),
                name,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.succeed {
                return Err(EmbeddingError::ApiError("502 Bad Gateway".to_string()));
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dims]).collect())
        }

        async fn is_available(&self) -> bool {
            false
        }

        fn model_dimensions(&self, _model: &str) -> usize {
            self.dims
        }

        fn model_name(&self) -> &str {
            "failing"
        }

        fn provider_name(&self) -> &str {
            self.name
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl BatchSink for RejectingSink {
        async fn accept(&mut self, _batch: Vec<EmbeddedChunk>) -> Result<()> {
            Err(IndexError::Storage("disk full".to_string()))
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(format!("c{i}"), format!("fn item_{i}() {{}}")))
            .collect()
    }

    #[tokio::test]
    async fn test_every_vector_has_provider_dimensions() {
        let pipeline = EmbeddingPipeline::new(Arc::new(FixedProvider::new(384)), PipelineOptions::default());
        let embedded = pipeline.embed_chunks(&chunks(70)).await.unwrap();
        assert_eq!(embedded.len(), 70);
        assert!(embedded.iter().all(|e| e.vector.len() == 384 && e.dimensions() == 384));
        assert_eq!(embedded[69].id(), "c69");
    }

    #[tokio::test]
    async fn test_blank_chunk_rejected_before_provider_call() {
        let provider = Arc::new(FixedProvider::new(8));
        let pipeline = EmbeddingPipeline::new(provider.clone(), PipelineOptions::default());
        let mut input = chunks(3);
        input.push(Chunk::new("blank", "  \n "));

        let err = pipeline.embed_chunks(&input).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("blank"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_final() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = PipelineOptions::default()
            .with_batch_size(4)
            .with_progress(Arc::new(move |done, total| sink.lock().unwrap().push((done, total))));
        let pipeline = EmbeddingPipeline::new(Arc::new(FixedProvider::new(4)), options);

        pipeline.embed_chunks(&chunks(10)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(4, 10), (8, 10), (10, 10)]);
    }

    #[tokio::test]
    async fn test_batch_size_capped_by_provider() {
        let provider = Arc::new(FixedProvider {
            dims: 4,
            calls: AtomicUsize::new(0),
            max_batch: 5,
        });
        let pipeline = EmbeddingPipeline::new(provider.clone(), PipelineOptions::default().with_batch_size(100));
        pipeline.embed_chunks(&chunks(12)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_input_reports_zero_of_zero() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = PipelineOptions::default()
            .with_progress(Arc::new(move |done, total| sink.lock().unwrap().push((done, total))));
        let pipeline = EmbeddingPipeline::new(Arc::new(FixedProvider::new(4)), options);

        let embedded = pipeline.embed_chunks(&[]).await.unwrap();
        assert!(embedded.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_validation_error() {
        let pipeline = EmbeddingPipeline::new(
            Arc::new(FixedProvider::new(4)),
            PipelineOptions::default().with_batch_size(0),
        );
        assert!(pipeline.embed_chunks(&chunks(1)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let provider = Arc::new(FixedProvider::new(4));
        let pipeline = EmbeddingPipeline::new(
            provider.clone(),
            PipelineOptions::default().with_cancellation(token),
        );
        let mut sink = Vec::new();
        let outcome = pipeline.run(&chunks(5), &mut sink).await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(sink.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_memory_estimate_scales_with_dimensions() {
        let input = chunks(10);
        let small = estimate_embedding_memory(&input, 384);
        let large = estimate_embedding_memory(&input, 1536);
        assert!(large > small);
        assert!(small >= 10 * 384 * 4);
        assert_eq!(estimate_embedding_memory(&[], 384), 0);
    }

    #[test]
    fn test_batch_size_for_budget() {
        let input = chunks(10);
        let per_chunk = estimate_embedding_memory(&input, 384).div_ceil(10);
        assert_eq!(batch_size_for_budget(&input, 384, per_chunk * 3), 3);
        assert_eq!(batch_size_for_budget(&input, 384, 1), 1);
    }

    #[tokio::test]
    async fn test_provider_error_falls_back_for_that_batch_only() {
        let primary = Arc::new(FailingProvider::new("primary", 8, 1));
        let fallback = Arc::new(FixedProvider::new(8));
        let pipeline = EmbeddingPipeline::new(
            primary.clone(),
            PipelineOptions::default()
                .with_batch_size(2)
                .with_fallback(fallback.clone()),
        );

        let mut sink = Vec::new();
        let outcome = pipeline.run(&chunks(4), &mut sink).await.unwrap();

        assert_eq!(
            outcome,
            PipelineOutcome::Completed(PipelineStats {
                chunks: 4,
                batches: 2,
                fallback_batches: 1,
            })
        );
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
        let providers: Vec<&str> = sink.iter().map(|e| e.embedding.provider.as_str()).collect();
        assert_eq!(providers, vec!["primary", "primary", "mock", "mock"]);
        assert!(sink.iter().all(|e| e.vector.len() == 8));
    }

    #[tokio::test]
    async fn test_primary_and_fallback_failing_is_batch_provider_error() {
        let fallback = Arc::new(FailingProvider::new("backup", 8, 0));
        let pipeline = EmbeddingPipeline::new(
            Arc::new(FailingProvider::new("primary", 8, 0)),
            PipelineOptions::default()
                .with_batch_size(2)
                .with_fallback(fallback.clone()),
        );

        let err = pipeline.embed_chunks(&chunks(4)).await.unwrap_err();
        match &err {
            IndexError::Batch {
                start,
                end,
                provider,
                fallback,
                ..
            } => {
                assert_eq!((*start, *end), (0, 2));
                assert_eq!(provider, "primary");
                assert!(fallback.as_deref().is_some_and(|f| f.starts_with("backup")));
            }
            other => panic!("expected batch error, got {other:?}"),
        }
        assert!(err.is_provider());
        assert!(!err.is_timeout());
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_error_without_fallback_is_provider_kind() {
        let pipeline = EmbeddingPipeline::new(
            Arc::new(FailingProvider::new("primary", 8, 0)),
            PipelineOptions::default(),
        );
        let err = pipeline.embed_chunk(&chunks(1)[0]).await.unwrap_err();
        assert!(err.is_provider());
        assert!(!err.is_timeout());
        assert!(matches!(err, IndexError::Batch { fallback: None, .. }));
    }

    #[tokio::test]
    async fn test_fallback_dimensions_checked_before_any_call() {
        let primary = Arc::new(FailingProvider::new("primary", 16, 1));
        let fallback = Arc::new(FixedProvider::new(32));
        let pipeline = EmbeddingPipeline::new(
            primary.clone(),
            PipelineOptions::default()
                .with_batch_size(2)
                .with_fallback(fallback.clone()),
        );

        let err = pipeline.embed_chunks(&chunks(4)).await.unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 16, actual: 32 }));
        assert!(err.is_validation());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_reports_batch_range() {
        let pipeline = EmbeddingPipeline::new(
            Arc::new(FixedProvider::new(4)),
            PipelineOptions::default().with_batch_size(3),
        );
        let err = pipeline.run(&chunks(5), &mut RejectingSink).await.unwrap_err();
        match err {
            IndexError::Batch {
                start,
                end,
                provider,
                source,
                ..
            } => {
                assert_eq!((start, end), (0, 3));
                assert_eq!(provider, "mock");
                assert!(matches!(*source, IndexError::Storage(_)));
            }
            other => panic!("expected batch error, got {other:?}"),
        }
    }
}
