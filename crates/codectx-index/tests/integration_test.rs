//! Integration tests for codectx-index.
//!
//! These exercise the engine end to end with the offline hashing provider
//! and the in-memory vector store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::RwLock;

use codectx_index::chunk::keys;
use codectx_index::embeddings::{EmbeddingError, HashingEmbeddings};
use codectx_index::search::format_search_result;
use codectx_index::{
    BM25Index, Chunk, ChunkSource, DenseRetriever, EmbeddedChunk, EmbeddingPipeline,
    EmbeddingProvider, HybridSearcher, IndexResources, IndexingCoordinator,
    IndexingSessionFactory, KeywordRetriever, LineChunker, MemoryVectorStore, PipelineOptions,
    ProjectRef, RunOutcome, SearchConfig, SearchQueryOptions, StartOptions, VectorStore,
};

const DIMS: usize = 384;

struct StaticSource(Vec<Chunk>);

#[async_trait]
impl ChunkSource for StaticSource {
    async fn chunks(&self, _project: &ProjectRef) -> codectx_index::Result<Vec<Chunk>> {
        Ok(self.0.clone())
    }
}

/// Hashing provider that sleeps before every call and counts calls.
struct SlowProvider {
    inner: HashingEmbeddings,
    delay: Duration,
    calls: AtomicUsize,
    name: &'static str,
}

impl SlowProvider {
    fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            inner: HashingEmbeddings::new(DIMS),
            delay,
            calls: AtomicUsize::new(0),
            name,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn model_dimensions(&self, _model: &str) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_name(&self) -> &str {
        self.name
    }
}

fn chunk(id: &str, file: &str, project: &str, content: &str) -> Chunk {
    Chunk::new(id, content)
        .with_metadata(keys::FILE_PATH, file)
        .with_metadata(keys::PROJECT_ID, project)
        .with_metadata(keys::START_LINE, 1)
        .with_metadata(keys::END_LINE, 3)
}

fn many_chunks(n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|i| {
            chunk(
                &format!("c{i}"),
                &format!("src/f{i}.rs"),
                "p1",
                &format!("fn function_{i}() -> u32 {{ {i} }}"),
            )
        })
        .collect()
}

fn coordinator_with(
    chunks: Vec<Chunk>,
    provider: Arc<dyn EmbeddingProvider>,
) -> (IndexingCoordinator, IndexResources) {
    let resources = IndexResources::new(
        Arc::new(StaticSource(chunks)),
        provider,
        Arc::new(MemoryVectorStore::new(DIMS)),
    );
    let factory = Arc::new(IndexingSessionFactory::new(resources.clone()));
    (IndexingCoordinator::new(factory), resources)
}

async fn wait_idle(coordinator: &IndexingCoordinator) {
    tokio::time::timeout(Duration::from_secs(10), coordinator.wait_idle())
        .await
        .expect("indexing run did not finish");
}

#[tokio::test]
async fn test_every_vector_has_store_dimensions() {
    let pipeline = EmbeddingPipeline::new(
        Arc::new(HashingEmbeddings::new(DIMS)),
        PipelineOptions::default().with_batch_size(4),
    );
    let embedded = pipeline.embed_chunks(&many_chunks(10)).await.unwrap();

    assert_eq!(embedded.len(), 10);
    for e in &embedded {
        assert_eq!(e.vector.len(), DIMS);
        assert_eq!(e.embedding.dimensions, DIMS);
    }
    let ids: Vec<&str> = embedded.iter().map(EmbeddedChunk::id).collect();
    assert_eq!(ids[0], "c0");
    assert_eq!(ids[9], "c9");
}

#[tokio::test]
async fn test_status_is_running_as_soon_as_start_returns() {
    let (coordinator, _) = coordinator_with(many_chunks(3), Arc::new(HashingEmbeddings::new(DIMS)));

    coordinator
        .start(StartOptions::new(ProjectRef::new("alpha", "p1", "/tmp/alpha")))
        .unwrap();
    let status = coordinator.get_status();
    assert!(status.running);
    assert_eq!(status.project_name.as_deref(), Some("alpha"));

    wait_idle(&coordinator).await;
    assert!(!coordinator.get_status().running);
    assert!(matches!(coordinator.last_outcome(), Some(RunOutcome::Completed(_))));
}

#[tokio::test]
async fn test_second_start_fails_then_cancel_allows_restart() {
    let provider = Arc::new(SlowProvider::new("slow", Duration::from_millis(100)));
    let (coordinator, resources) = coordinator_with(many_chunks(20), provider);
    let options = StartOptions::new(ProjectRef::new("alpha", "p1", "/tmp/alpha"))
        .with_pipeline(PipelineOptions::default().with_batch_size(1));

    assert!(!coordinator.cancel());
    coordinator.start(options.clone()).unwrap();
    let before = coordinator.get_status();

    let err = coordinator.start(options.clone()).unwrap_err();
    assert_eq!(err.to_string(), "Indexing already in progress");
    assert_eq!(coordinator.get_status(), before);

    assert!(coordinator.cancel());
    assert!(coordinator.cancel());
    wait_idle(&coordinator).await;

    match coordinator.last_outcome() {
        Some(RunOutcome::Cancelled { embedded }) => {
            assert!(embedded < 20);
            assert_eq!(resources.store.len().await.unwrap(), embedded);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }

    coordinator.start(options).unwrap();
    assert!(coordinator.get_status().running);
    coordinator.cancel();
    wait_idle(&coordinator).await;
}

#[tokio::test]
async fn test_end_to_end_min_score_filters_and_orders() {
    let chunks = vec![
        chunk("auth", "src/auth.rs", "p1", "fn authenticate(user: &User, password: &str) -> bool"),
        chunk("db", "src/db.rs", "p1", "fn open_connection(url: &str) -> Connection"),
        chunk("http", "src/http.rs", "p1", "fn handle_request(req: Request) -> Response"),
    ];
    let (coordinator, resources) = coordinator_with(chunks, Arc::new(HashingEmbeddings::new(DIMS)));
    coordinator
        .start(StartOptions::new(ProjectRef::new("demo", "p1", "/tmp/demo")))
        .unwrap();
    wait_idle(&coordinator).await;
    assert_eq!(resources.store.len().await.unwrap(), 3);

    let searcher = HybridSearcher::new(SearchConfig::default())
        .with_dense(Arc::new(
            DenseRetriever::new(resources.provider.clone(), resources.store.clone())
                .with_indexed_model(resources.manifest.read().await.embedding.clone()),
        ))
        .with_keyword(Arc::new(KeywordRetriever::new(resources.keyword.clone())));

    let options = SearchQueryOptions::new().with_min_score(0.9);
    let results = searcher
        .search("fn authenticate(user: &User, password: &str) -> bool", &options)
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].id, "auth");
    assert!(results.iter().all(|r| r.score >= 0.9));
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(results[0].file_path, "src/auth.rs");
    assert_eq!(results[0].file_type, "rs");
}

#[tokio::test]
async fn test_native_filter_matches_post_filter() {
    let provider = HashingEmbeddings::new(DIMS);
    let store = MemoryVectorStore::new(DIMS);
    let dataset = vec![
        chunk("a", "src/a.rs", "p1", "fn parse_config() {}").with_metadata(keys::LANGUAGE, "rust"),
        chunk("b", "lib/b.py", "p1", "def parse_config(): pass").with_metadata(keys::LANGUAGE, "python"),
        chunk("c", "src/c.rs", "p2", "fn load_config() {}").with_metadata(keys::LANGUAGE, "rust"),
        chunk("d", "README", "p2", "configuration notes"),
        Chunk::new("e", "orphan chunk without metadata about config"),
    ];
    let pipeline = EmbeddingPipeline::new(Arc::new(provider.clone()), PipelineOptions::default());
    store.upsert(&pipeline.embed_chunks(&dataset).await.unwrap()).await.unwrap();

    let query = provider.embed_text("parse config");
    let unfiltered = store.query(&query, 100, None).await.unwrap();

    let option_sets = vec![
        SearchQueryOptions::new(),
        SearchQueryOptions::new().with_file_type("rs"),
        SearchQueryOptions::new().with_file_type("unknown"),
        SearchQueryOptions::new().with_language("python"),
        SearchQueryOptions::new().with_project_ids(["p2"]),
        SearchQueryOptions::new().with_project_ids(Vec::<String>::new()),
        SearchQueryOptions::new().with_min_score(0.3),
        SearchQueryOptions::new()
            .with_file_type("rs")
            .with_language("rust")
            .with_project_ids(["p1", "p2"])
            .with_min_score(0.1),
    ];

    for options in &option_sets {
        let native: HashSet<String> = store
            .query(&query, 100, Some(options))
            .await
            .unwrap()
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        let post: HashSet<String> = unfiltered
            .iter()
            .map(|hit| format_search_result(&hit.id, hit.score, &hit.content, Some(&hit.metadata)))
            .filter(|result| codectx_index::matches_filters(result, options))
            .map(|result| result.id)
            .collect();
        assert_eq!(native, post, "filter decisions differ for {options:?}");
    }
}

#[test]
fn test_format_is_total_without_metadata() {
    let result = format_search_result("x", 0.5, "body", None);
    assert_eq!(result.id, "x");
    assert_eq!(result.file_path, "");
    assert_eq!(result.file_type, "unknown");
    assert_eq!(result.language, None);
    assert_eq!((result.line_range.start, result.line_range.end), (0, 0));
    assert!(codectx_index::matches_filters(&result, &SearchQueryOptions::new()));
}

#[tokio::test]
async fn test_timeout_is_reported_as_timeout() {
    let pipeline = EmbeddingPipeline::new(
        Arc::new(SlowProvider::new("slow", Duration::from_millis(500))),
        PipelineOptions::default().with_timeout(Duration::from_millis(20)),
    );
    let err = pipeline.embed_chunks(&many_chunks(2)).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!err.is_provider());
}

#[tokio::test]
async fn test_fallback_invoked_once_per_batch() {
    let fallback = Arc::new(SlowProvider::new("fallback", Duration::ZERO));
    let pipeline = EmbeddingPipeline::new(
        Arc::new(SlowProvider::new("slow", Duration::from_millis(500))),
        PipelineOptions::default()
            .with_batch_size(2)
            .with_timeout(Duration::from_millis(20))
            .with_fallback(fallback.clone()),
    );

    let embedded = pipeline.embed_chunks(&many_chunks(5)).await.unwrap();
    assert_eq!(embedded.len(), 5);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
    assert!(embedded.iter().all(|e| e.embedding.provider == "fallback"));
}

#[tokio::test]
async fn test_index_real_directory_and_search_keywords() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/lib.rs"),
        "pub fn tokenize_input(s: &str) -> Vec<String> {\n    s.split_whitespace().map(String::from).collect()\n}\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("src/util.py"), "def render_page():\n    return '<html>'\n").unwrap();

    let keyword = Arc::new(RwLock::new(BM25Index::new()));
    let resources = IndexResources::new(
        Arc::new(LineChunker::default()),
        Arc::new(HashingEmbeddings::new(DIMS)),
        Arc::new(MemoryVectorStore::new(DIMS)),
    )
    .with_keyword_index(keyword.clone())
    .with_state_dir(dir.path().join(".codectx"));
    let coordinator = IndexingCoordinator::new(Arc::new(IndexingSessionFactory::new(resources)));

    coordinator
        .start(StartOptions::new(ProjectRef::for_root(dir.path(), None)))
        .unwrap();
    wait_idle(&coordinator).await;
    match coordinator.last_outcome() {
        Some(RunOutcome::Completed(stats)) => assert_eq!(stats.files_processed, 2),
        other => panic!("expected completion, got {other:?}"),
    }

    let searcher = HybridSearcher::new(SearchConfig::default())
        .with_keyword(Arc::new(KeywordRetriever::new(keyword)));
    let results = searcher
        .search("tokenize_input", &SearchQueryOptions::new().with_language("rust"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file_path, "src/lib.rs");

    assert!(dir.path().join(".codectx/manifest.json").exists());
    assert!(dir.path().join(".codectx/bm25_index.json").exists());
}
