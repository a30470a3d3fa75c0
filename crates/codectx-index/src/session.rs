//! Indexing sessions.
//!
//! A [`Session`] performs one chunk → embed → persist run and reports
//! everything it does as [`SessionEvent`]s on a channel. Exactly one
//! terminal event (`Cancelled`, `Completed`, or `Error`) ends every run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{keys, EmbeddedChunk};
use crate::chunker::{ChunkSource, ProjectRef};
use crate::coordinator::StartOptions;
use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::manifest::{IndexManifest, ProjectState};
use crate::pipeline::{BatchSink, EmbeddingPipeline, PipelineOptions, PipelineOutcome};
use crate::search::BM25Index;
use crate::store::VectorStore;
use crate::tracer::{NoopTracer, Tracer};
use crate::{BM25_FILE, MANIFEST_FILE};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Cancelled,
    Completed,
    Error,
}

/// Progress within the current stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexProgress {
    pub stage: String,
    pub completed: usize,
    pub total: usize,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub files_processed: usize,
    pub chunks_embedded: usize,
    pub batches: usize,
    /// Batches embedded by the fallback provider.
    pub fallback_batches: usize,
    /// Chunks dropped because they no longer exist in the project.
    pub stale_removed: usize,
    pub duration_ms: u64,
}

/// Events a session reports, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Stage(String),
    Progress(IndexProgress),
    /// Cancellation was honored; `embedded` chunks were persisted first.
    Cancelled { embedded: usize },
    Completed(IndexStats),
    Error(String),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Cancelled { .. } | SessionEvent::Completed(_) | SessionEvent::Error(_)
        )
    }
}

/// One cancellable indexing run.
#[async_trait]
pub trait Session: Send + Sync {
    /// Perform the run. Returns after the terminal event has been sent.
    async fn run(&self);

    /// Request cooperative cancellation. Safe to call at any time.
    fn cancel(&self);

    fn is_running(&self) -> bool;

    fn status(&self) -> SessionStatus;
}

/// Builds sessions for the coordinator. Creating a session must not start
/// any work.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        options: &StartOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>>;
}

/// Everything a run reads from or writes to.
#[derive(Clone)]
pub struct IndexResources {
    pub source: Arc<dyn ChunkSource>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub store: Arc<dyn VectorStore>,
    pub keyword: Arc<RwLock<BM25Index>>,
    pub manifest: Arc<RwLock<IndexManifest>>,
    /// Where the manifest and keyword index are saved; `None` keeps them in
    /// memory only.
    pub state_dir: Option<PathBuf>,
    pub tracer: Arc<dyn Tracer>,
}

impl IndexResources {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            source,
            provider,
            store,
            keyword: Arc::new(RwLock::new(BM25Index::new())),
            manifest: Arc::new(RwLock::new(IndexManifest::new())),
            state_dir: None,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_keyword_index(mut self, keyword: Arc<RwLock<BM25Index>>) -> Self {
        self.keyword = keyword;
        self
    }

    pub fn with_manifest(mut self, manifest: Arc<RwLock<IndexManifest>>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    fn state_path(&self, file: &str) -> Option<PathBuf> {
        self.state_dir.as_deref().map(|dir| dir.join(file))
    }

    /// Flush the store, keyword index, and manifest.
    pub async fn persist(&self) -> Result<()> {
        self.store.persist().await?;

        let (Some(bm25_path), Some(manifest_path)) =
            (self.state_path(BM25_FILE), self.state_path(MANIFEST_FILE))
        else {
            return Ok(());
        };
        if let Some(dir) = &self.state_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.keyword.read().await.save(&bm25_path)?;
        self.manifest.read().await.save(&manifest_path)?;
        debug!(dir = ?self.state_dir, "Persisted index state");
        Ok(())
    }
}

/// Creates [`IndexingSession`]s over shared resources.
#[derive(Clone)]
pub struct IndexingSessionFactory {
    resources: IndexResources,
}

impl IndexingSessionFactory {
    pub fn new(resources: IndexResources) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &IndexResources {
        &self.resources
    }
}

impl SessionFactory for IndexingSessionFactory {
    fn create(
        &self,
        options: &StartOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(IndexingSession::new(
            options.clone(),
            self.resources.clone(),
            events,
        )))
    }
}

enum RunResult {
    Completed(IndexStats),
    Cancelled { embedded: usize },
}

/// Writes each completed batch to the vector store and keyword index.
struct StoreSink<'a> {
    store: &'a dyn VectorStore,
    keyword: &'a RwLock<BM25Index>,
    /// Ids this run introduced; removed again if the run fails.
    added: Vec<String>,
}

impl<'a> StoreSink<'a> {
    fn new(store: &'a dyn VectorStore, keyword: &'a RwLock<BM25Index>) -> Self {
        Self {
            store,
            keyword,
            added: Vec::new(),
        }
    }

    /// Drop every chunk this run introduced. Chunks that already existed
    /// keep their refreshed vectors; ids are content-derived, so their text
    /// is unchanged.
    async fn roll_back(&mut self) -> Result<usize> {
        if self.added.is_empty() {
            return Ok(0);
        }
        let removed = self.store.remove(&self.added).await?;
        let mut keyword = self.keyword.write().await;
        for id in self.added.drain(..) {
            keyword.remove_document(&id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl BatchSink for StoreSink<'_> {
    async fn accept(&mut self, batch: Vec<EmbeddedChunk>) -> Result<()> {
        self.store.upsert(&batch).await?;
        let mut keyword = self.keyword.write().await;
        for embedded in &batch {
            if keyword.get(embedded.id()).is_none() {
                self.added.push(embedded.id().to_string());
            }
            keyword.add_chunk(&embedded.chunk);
        }
        Ok(())
    }
}

/// The standard chunk → embed → persist session.
pub struct IndexingSession {
    project: ProjectRef,
    pipeline: PipelineOptions,
    rebuild: bool,
    resources: IndexResources,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    status: Mutex<SessionStatus>,
}

impl IndexingSession {
    pub fn new(
        options: StartOptions,
        resources: IndexResources,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            project: options.project,
            pipeline: options.pipeline,
            rebuild: options.rebuild,
            resources,
            events,
            cancel: CancellationToken::new(),
            status: Mutex::new(SessionStatus::Idle),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }

    fn stage(&self, stage: &str) {
        debug!(project = %self.project.name, stage, "Indexing stage");
        self.emit(SessionEvent::Stage(stage.to_string()));
    }

    async fn execute(&self, started: Instant) -> Result<RunResult> {
        let resources = &self.resources;

        self.stage("chunking");
        let chunks = resources.source.chunks(&self.project).await?;
        if self.cancel.is_cancelled() {
            return Ok(RunResult::Cancelled { embedded: 0 });
        }

        let files: HashSet<&str> = chunks
            .iter()
            .filter_map(|c| c.metadata_str(keys::FILE_PATH))
            .collect();
        let files_processed = files.len();

        let info = resources.provider.info();
        let store_dimensions = resources.store.dimensions();
        let fallback_dimensions = self.pipeline.fallback.as_ref().map(|f| f.dimensions());
        for actual in std::iter::once(info.dimensions).chain(fallback_dimensions) {
            if actual != store_dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: store_dimensions,
                    actual,
                });
            }
        }

        {
            let mut manifest = resources.manifest.write().await;
            if self.rebuild {
                info!(project = %self.project.name, "Rebuilding index from scratch");
                manifest.clear();
                resources.store.clear().await?;
                resources.keyword.write().await.clear();
            } else {
                manifest.check_embedding(&info)?;
            }
            if !chunks.is_empty() {
                manifest.set_embedding(info.clone());
            }
        }

        self.stage("embedding");
        let events = self.events.clone();
        let caller_progress = self.pipeline.progress.clone();
        let options = self
            .pipeline
            .clone()
            .with_cancellation(self.cancel.clone())
            .with_progress(Arc::new(move |completed, total| {
                let _ = events.send(SessionEvent::Progress(IndexProgress {
                    stage: "embedding".to_string(),
                    completed,
                    total,
                }));
                if let Some(progress) = &caller_progress {
                    progress(completed, total);
                }
            }));
        let pipeline = EmbeddingPipeline::new(resources.provider.clone(), options)
            .with_tracer(resources.tracer.clone());

        let mut sink = StoreSink::new(resources.store.as_ref(), resources.keyword.as_ref());
        let outcome = match pipeline.run(&chunks, &mut sink).await {
            Ok(outcome) => outcome,
            Err(err) => {
                match sink.roll_back().await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(removed, "Rolled back chunks written by the failed run")
                    }
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "Failed to roll back the failed run")
                    }
                }
                return Err(err);
            }
        };
        let stats = match outcome {
            PipelineOutcome::Cancelled(stats) => {
                resources.persist().await?;
                return Ok(RunResult::Cancelled {
                    embedded: stats.chunks,
                });
            }
            PipelineOutcome::Completed(stats) => stats,
        };
        if stats.fallback_batches > 0 {
            warn!(
                batches = stats.fallback_batches,
                "Some batches were embedded by the fallback provider"
            );
        }

        self.stage("finalizing");
        let keep: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let mut stale_removed = resources
            .store
            .retain_project(&self.project.id, &keep)
            .await?;
        stale_removed = stale_removed.max(
            resources
                .keyword
                .write()
                .await
                .retain_project(&self.project.id, &keep),
        );

        resources.manifest.write().await.record_project(
            &self.project.id,
            ProjectState {
                name: self.project.name.clone(),
                root: self.project.root.clone(),
                file_count: files_processed,
                chunk_count: chunks.len(),
                indexed_at: Utc::now(),
            },
        );
        resources.persist().await?;

        Ok(RunResult::Completed(IndexStats {
            files_processed,
            chunks_embedded: stats.chunks,
            batches: stats.batches,
            fallback_batches: stats.fallback_batches,
            stale_removed,
            duration_ms: started.elapsed().as_millis() as u64,
        }))
    }
}

#[async_trait]
impl Session for IndexingSession {
    async fn run(&self) {
        self.set_status(SessionStatus::Running);
        let started = Instant::now();
        let mut span = self.resources.tracer.span("index.run");
        span.record("project", &self.project.name);

        info!(project = %self.project.name, root = %self.project.root.display(), "Indexing started");

        match self.execute(started).await {
            Ok(RunResult::Completed(stats)) => {
                info!(
                    project = %self.project.name,
                    files = stats.files_processed,
                    chunks = stats.chunks_embedded,
                    duration_ms = stats.duration_ms,
                    "Indexing completed"
                );
                span.finish(true);
                self.set_status(SessionStatus::Completed);
                self.emit(SessionEvent::Completed(stats));
            }
            Ok(RunResult::Cancelled { embedded }) => {
                info!(project = %self.project.name, embedded, "Indexing cancelled");
                span.finish(true);
                self.set_status(SessionStatus::Cancelled);
                self.emit(SessionEvent::Cancelled { embedded });
            }
            Err(e) => {
                error!(project = %self.project.name, error = %e, "Indexing failed");
                span.finish(false);
                self.set_status(SessionStatus::Error);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Load the persisted keyword index and manifest from `state_dir`.
pub fn load_state(state_dir: &Path) -> Result<(BM25Index, IndexManifest)> {
    let keyword = BM25Index::load_or_default(&state_dir.join(BM25_FILE))?;
    let manifest = IndexManifest::load_or_default(&state_dir.join(MANIFEST_FILE))?;
    Ok((keyword, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::embeddings::HashingEmbeddings;
    use crate::embeddings::EmbeddingError;
    use crate::search::SearchQueryOptions;
    use crate::store::{MemoryVectorStore, StoredHit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource(Vec<Chunk>);

    #[async_trait]
    impl ChunkSource for StaticSource {
        async fn chunks(&self, _project: &ProjectRef) -> Result<Vec<Chunk>> {
            Ok(self.0.clone())
        }
    }

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk::new(id, text)
            .with_metadata(keys::FILE_PATH, format!("{id}.rs"))
            .with_metadata(keys::PROJECT_ID, "p1")
    }

    fn resources(chunks: Vec<Chunk>, dims: usize) -> IndexResources {
        IndexResources::new(
            Arc::new(StaticSource(chunks)),
            Arc::new(HashingEmbeddings::new(dims)),
            Arc::new(MemoryVectorStore::new(dims)),
        )
    }

    fn options() -> StartOptions {
        StartOptions::new(ProjectRef::new("demo", "p1", "/tmp/demo"))
    }

    /// Hashing provider that starts failing after `succeed` calls. It
    /// reports the hashing model so the manifest check passes.
    struct FlakyProvider {
        inner: HashingEmbeddings,
        succeed: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.succeed {
                return Err(EmbeddingError::ApiError("503 Service Unavailable".to_string()));
            }
            self.inner.embed(texts).await
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_dimensions(&self, model: &str) -> usize {
            self.inner.model_dimensions(model)
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn provider_name(&self) -> &str {
            self.inner.provider_name()
        }
    }

    /// Memory store that counts flushes.
    struct CountingStore {
        inner: MemoryVectorStore,
        persists: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for CountingStore {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
            self.inner.upsert(chunks).await
        }

        async fn query(
            &self,
            vector: &[f32],
            limit: usize,
            filter: Option<&SearchQueryOptions>,
        ) -> Result<Vec<StoredHit>> {
            self.inner.query(vector, limit, filter).await
        }

        async fn remove(&self, ids: &[String]) -> Result<usize> {
            self.inner.remove(ids).await
        }

        async fn retain_project(&self, project_id: &str, keep: &HashSet<String>) -> Result<usize> {
            self.inner.retain_project(project_id, keep).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }

        async fn persist(&self) -> Result<()> {
            self.persists.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run_to_end(session: &IndexingSession, rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        session.run().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_run_emits_stages_progress_and_completion() {
        let res = resources(vec![chunk("a", "fn a() {}"), chunk("b", "fn b() {}")], 32);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = IndexingSession::new(options(), res.clone(), tx);
        assert_eq!(session.status(), SessionStatus::Idle);

        let events = run_to_end(&session, &mut rx).await;

        assert_eq!(events[0], SessionEvent::Stage("chunking".to_string()));
        assert!(events.contains(&SessionEvent::Progress(IndexProgress {
            stage: "embedding".to_string(),
            completed: 2,
            total: 2,
        })));
        match events.last().unwrap() {
            SessionEvent::Completed(stats) => {
                assert_eq!(stats.chunks_embedded, 2);
                assert_eq!(stats.files_processed, 2);
            }
            other => panic!("unexpected terminal event {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(res.store.len().await.unwrap(), 2);
        assert_eq!(res.keyword.read().await.len(), 2);
        assert!(res.manifest.read().await.embedding.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_run_reports_cancelled() {
        let res = resources(vec![chunk("a", "fn a() {}")], 16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = IndexingSession::new(options(), res.clone(), tx);
        session.cancel();

        let events = run_to_end(&session, &mut rx).await;
        assert_eq!(events.last(), Some(&SessionEvent::Cancelled { embedded: 0 }));
        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert_eq!(res.store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_error_event() {
        let res = IndexResources::new(
            Arc::new(StaticSource(vec![chunk("a", "x")])),
            Arc::new(HashingEmbeddings::new(8)),
            Arc::new(MemoryVectorStore::new(16)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = IndexingSession::new(options(), res, tx);

        let events = run_to_end(&session, &mut rx).await;
        match events.last() {
            Some(SessionEvent::Error(message)) => assert!(message.contains("Dimension mismatch")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_reindex_drops_stale_chunks() {
        let res = resources(vec![chunk("a", "fn a() {}"), chunk("b", "fn b() {}")], 16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        IndexingSession::new(options(), res.clone(), tx.clone()).run().await;

        let second = IndexResources {
            source: Arc::new(StaticSource(vec![chunk("a", "fn a() {}")])),
            ..res.clone()
        };
        let session = IndexingSession::new(options(), second, tx);
        session.run().await;

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(SessionEvent::Completed(stats)) => assert_eq!(stats.stale_removed, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(res.store.len().await.unwrap(), 1);
        assert!(res.keyword.read().await.get("b").is_none());
    }

    #[tokio::test]
    async fn test_persist_and_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let res = resources(vec![chunk("a", "fn alpha() {}")], 16).with_state_dir(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        IndexingSession::new(options(), res, tx).run().await;

        let (keyword, manifest) = load_state(dir.path()).unwrap();
        assert_eq!(keyword.len(), 1);
        assert_eq!(manifest.projects["p1"].chunk_count, 1);
        assert_eq!(manifest.embedding.unwrap().model, "hash-16");
    }

    #[tokio::test]
    async fn test_failed_run_rolls_back_and_never_persists() {
        let store = Arc::new(CountingStore {
            inner: MemoryVectorStore::new(16),
            persists: AtomicUsize::new(0),
        });
        let keyword = Arc::new(RwLock::new(BM25Index::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = IndexResources::new(
            Arc::new(StaticSource(vec![chunk("a", "fn a() {}")])),
            Arc::new(HashingEmbeddings::new(16)),
            store.clone(),
        )
        .with_keyword_index(keyword.clone());
        IndexingSession::new(options(), first.clone(), tx.clone()).run().await;
        while rx.try_recv().is_ok() {}
        assert_eq!(store.persists.load(Ordering::SeqCst), 1);

        // "a" and "b" land in the first batch, then the provider fails.
        let provider = Arc::new(FlakyProvider {
            inner: HashingEmbeddings::new(16),
            succeed: 1,
            calls: AtomicUsize::new(0),
        });
        let second = IndexResources {
            source: Arc::new(StaticSource(vec![
                chunk("a", "fn a() {}"),
                chunk("b", "fn b() {}"),
                chunk("c", "fn c() {}"),
                chunk("d", "fn d() {}"),
            ])),
            provider: provider.clone(),
            ..first
        };
        let start = options().with_pipeline(PipelineOptions::default().with_batch_size(2));
        let session = IndexingSession::new(start, second, tx);
        let events = run_to_end(&session, &mut rx).await;

        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        match events.last() {
            Some(SessionEvent::Error(message)) => {
                assert!(message.contains("Batch 2..4"));
                assert!(message.contains("503"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.persists.load(Ordering::SeqCst), 1);

        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.inner.get("a").await.is_some());
        assert!(keyword.read().await.get("a").is_some());
        assert!(keyword.read().await.get("b").is_none());
    }

    #[tokio::test]
    async fn test_fallback_with_wrong_dimensions_fails_before_embedding() {
        let res = resources(vec![chunk("a", "fn a() {}")], 16);
        let start = options().with_pipeline(
            PipelineOptions::default().with_fallback(Arc::new(HashingEmbeddings::new(32))),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = IndexingSession::new(start, res.clone(), tx);

        let events = run_to_end(&session, &mut rx).await;
        match events.last() {
            Some(SessionEvent::Error(message)) => {
                assert_eq!(message, "Dimension mismatch: expected 16, got 32")
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Progress(_))));
        assert_eq!(res.store.len().await.unwrap(), 0);
        assert!(res.manifest.read().await.embedding.is_none());
    }
}
