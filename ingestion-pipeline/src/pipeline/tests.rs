use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

use common::backends::embedding::HashedEmbeddingBackend;
use common::backends::testing::ScriptedLlmBackend;
use common::backends::BackendRegistry;
use common::prompts::PromptRegistry;
use common::storage::db::SurrealDbClient;
use common::storage::vector::{
    CollectionInfo, CollectionSpec, PayloadFilter, ScoredChunk, ScrollRequest, ScrollResponse,
    SurrealVectorStore, VectorSearchRequest, VectorStore,
};
use crate::chunker::ChunkerConfig;

/// Wraps the real store and records every upsert so tests can assert on write
/// counts and ordering.
struct RecordingVectorStore {
    inner: SurrealVectorStore,
    upsert_calls: AtomicUsize,
    stored_chunk_indices: std::sync::Mutex<Vec<usize>>,
}

impl RecordingVectorStore {
    fn new(inner: SurrealVectorStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            upsert_calls: AtomicUsize::new(0),
            stored_chunk_indices: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn upsert_count(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    fn stored_indices(&self) -> Vec<usize> {
        lock(&self.stored_chunk_indices).clone()
    }
}

#[async_trait]
impl VectorStore for RecordingVectorStore {
    async fn collection_exists(&self, collection: &str) -> Result<bool, AppError> {
        self.inner.collection_exists(collection).await
    }

    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), AppError> {
        self.inner.create_collection(collection, spec).await
    }

    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, AppError> {
        self.inner.get_collection_info(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), AppError> {
        self.inner.drop_collection(collection).await
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), AppError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut indices = lock(&self.stored_chunk_indices);
            for point in &points {
                indices.push(
                    point
                        .payload
                        .split
                        .map_or(point.payload.chunk_index, |s| s.chunk_index_global),
                );
            }
        }
        self.inner.upsert(collection, points).await
    }

    async fn search(
        &self,
        collection: &str,
        request: VectorSearchRequest,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        self.inner.search(collection, request).await
    }

    async fn scroll(
        &self,
        collection: &str,
        request: ScrollRequest,
    ) -> Result<ScrollResponse, AppError> {
        self.inner.scroll(collection, request).await
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<Chunk>, AppError> {
        self.inner.retrieve(collection, ids).await
    }

    async fn set_payload(
        &self,
        collection: &str,
        ids: &[String],
        patch: serde_json::Value,
    ) -> Result<(), AppError> {
        self.inner.set_payload(collection, ids, patch).await
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), AppError> {
        self.inner.delete(collection, ids).await
    }

    async fn set_hnsw_enabled(&self, collection: &str, enabled: bool) -> Result<(), AppError> {
        self.inner.set_hnsw_enabled(collection, enabled).await
    }
}

/// Delegating services wrapper counting contextualized calls.
struct CountingServices {
    inner: Arc<DefaultPipelineServices>,
    contextualized_calls: AtomicUsize,
    token_limit: usize,
}

#[async_trait]
impl PipelineServices for CountingServices {
    fn text_model_name(&self) -> String {
        self.inner.text_model_name()
    }

    fn text_dimension(&self) -> usize {
        self.inner.text_dimension()
    }

    fn contextualized_available(&self) -> bool {
        self.inner.contextualized_available()
    }

    fn contextualized_token_limit(&self) -> usize {
        self.token_limit
    }

    fn code_embedding_available(&self) -> bool {
        self.inner.code_embedding_available()
    }

    async fn embed_snippet(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.inner.embed_snippet(text).await
    }

    async fn embed_contextualized(
        &self,
        chunks: &[String],
    ) -> Result<Option<Vec<Vec<f32>>>, AppError> {
        self.contextualized_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_contextualized(chunks).await
    }

    async fn embed_code(&self, text: &str) -> Result<Option<Vec<f32>>, AppError> {
        self.inner.embed_code(text).await
    }

    async fn generate_qntm_keys(
        &self,
        text: &str,
        existing_keys: &[String],
        context: QntmContext,
    ) -> QntmKeys {
        self.inner
            .generate_qntm_keys(text, existing_keys, context)
            .await
    }
}

struct Fixture {
    pipeline: IngestPipeline,
    events: EventBus,
    recorder: Arc<RecordingVectorStore>,
    services: Arc<CountingServices>,
    root: tempfile::TempDir,
}

async fn fixture_with(
    tuning: IngestTuning,
    llm: Option<Arc<ScriptedLlmBackend>>,
    token_limit: Option<usize>,
) -> Fixture {
    let db = Arc::new(
        SurrealDbClient::memory("pipe_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");

    let recorder = RecordingVectorStore::new(SurrealVectorStore::new(Arc::clone(&db)));
    let storage = StorageService::new(recorder.clone(), None, None);

    let mut registry = BackendRegistry::new();
    let hashed = Arc::new(HashedEmbeddingBackend::new(8));
    registry.register_text_embedding(hashed.clone());
    registry.register_contextualized_embedding(hashed);
    if let Some(llm) = llm {
        registry.register_json_completion(llm);
    }

    let inner = DefaultPipelineServices::new(
        Arc::new(registry),
        Arc::new(PromptRegistry::with_defaults()),
        token_limit.unwrap_or(100_000),
    );
    let services = Arc::new(CountingServices {
        inner,
        contextualized_calls: AtomicUsize::new(0),
        token_limit: token_limit.unwrap_or(100_000),
    });

    let events = EventBus::default();
    let pipeline = IngestPipeline::new(
        services.clone(),
        storage,
        FileTracker::new(db),
        events.clone(),
        PauseController::new(),
        None,
        tuning,
    );

    Fixture {
        pipeline,
        events,
        recorder,
        services,
        root: tempfile::tempdir().expect("tempdir"),
    }
}

fn small_chunk_tuning() -> IngestTuning {
    IngestTuning {
        chunker: ChunkerConfig {
            min_chars: 4,
            target_min_chars: 4,
            target_max_chars: 16,
        },
        batch_timeout: Duration::from_millis(200),
        ..IngestTuning::default()
    }
}

fn write_file(root: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = root.path().join(name);
    std::fs::write(&path, contents).expect("write fixture file");
    path
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<AtlasEvent>) -> Vec<AtlasEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    events
}

fn params_for(fixture: &Fixture, files: &[&Path]) -> IngestParams {
    IngestParams::new(
        files.iter().map(|p| p.to_path_buf()).collect(),
        fixture.root.path().to_path_buf(),
    )
}

#[tokio::test]
async fn fresh_markdown_ingest_emits_the_canonical_sequence() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let path = write_file(&fixture.root, "a.md", "# Head\n\npara one\n\npara two");
    let mut rx = fixture.events.subscribe();

    let report = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("ingest");

    assert_eq!(report.files_processed, 1);
    assert!(report.chunks_stored >= 2, "report: {report:?}");
    assert!(report.errors.is_empty());

    let events = drain_events(&mut rx);
    let shape: Vec<&'static str> = events
        .iter()
        .map(|event| match event {
            AtlasEvent::IngestStarted { .. } => "started",
            AtlasEvent::FileStarted { .. } => "file.started",
            AtlasEvent::ChunkEmbedded { .. } => "chunk.embedded",
            AtlasEvent::ChunkStored { .. } => "chunk.stored",
            AtlasEvent::FileCompleted { .. } => "file.completed",
            AtlasEvent::IngestCompleted { .. } => "completed",
            _ => "other",
        })
        .collect();

    let n = report.chunks_stored;
    let mut expected = vec!["started", "file.started"];
    expected.extend(std::iter::repeat("chunk.embedded").take(n));
    expected.extend(std::iter::repeat("chunk.stored").take(n));
    expected.push("file.completed");
    expected.push("completed");
    assert_eq!(shape, expected);

    // file.started carries the chunk count and chunk.stored order follows
    // chunk_index.
    match &events[1] {
        AtlasEvent::FileStarted { path, chunks } => {
            assert_eq!(path, "a.md");
            assert_eq!(*chunks, n);
        }
        other => panic!("expected file.started, got {other:?}"),
    }
    let indices = fixture.recorder.stored_indices();
    assert!(indices.windows(2).all(|w| w[0] <= w[1]), "{indices:?}");
}

#[tokio::test]
async fn unchanged_reingest_writes_nothing() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let path = write_file(&fixture.root, "a.md", "# Head\n\npara one\n\npara two");

    let first = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("first ingest");
    assert!(first.chunks_stored >= 2);
    let upserts_after_first = fixture.recorder.upsert_count();

    let mut rx = fixture.events.subscribe();
    let second = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("second ingest");

    assert_eq!(second.chunks_stored, 0);
    assert_eq!(second.skipped_files, 1);
    assert!(second.errors.is_empty());
    // Zero upserts observed by the storage layer for the second run.
    assert_eq!(fixture.recorder.upsert_count(), upserts_after_first);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        AtlasEvent::FileSkipped { reason, .. } if reason == "unchanged"
    )));
}

#[tokio::test]
async fn chunk_ids_are_the_pure_identity_function() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let path = write_file(&fixture.root, "stable.md", "alpha one\n\nbeta two\n\ngamma three");
    let mut rx = fixture.events.subscribe();

    fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("ingest");

    let events = drain_events(&mut rx);
    let stored_ids: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            AtlasEvent::ChunkStored { chunk_id: id, path, .. } => {
                assert_eq!(path, "stable.md");
                Some(id.clone())
            }
            _ => None,
        })
        .collect();

    assert!(!stored_ids.is_empty());
    for (i, id) in stored_ids.iter().enumerate() {
        assert_eq!(id, &chunk_id("stable.md", i));
    }
}

#[tokio::test]
async fn large_document_split_makes_one_contextualized_call_per_subdocument() {
    // ~60 chunks of ~25 tokens with a 260-token window: 6+ sub-documents,
    // each embedded with exactly one contextualized call.
    let tuning = IngestTuning {
        chunker: ChunkerConfig {
            min_chars: 4,
            target_min_chars: 40,
            target_max_chars: 100,
        },
        batch_timeout: Duration::from_millis(200),
        ..IngestTuning::default()
    };
    let fixture = fixture_with(tuning, None, Some(260)).await;

    let body: String = (0..60)
        .map(|i| format!("paragraph number {i} with several filler words in it\n\n"))
        .collect();
    let path = write_file(&fixture.root, "big.txt", &body);

    let report = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("ingest");
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(report.chunks_stored > 10);

    // Global indices form a contiguous ordered run 0..n-1.
    let indices = fixture.recorder.stored_indices();
    assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>());

    // One contextualized call per sub-document, never per chunk.
    let calls = fixture.services.contextualized_calls.load(Ordering::SeqCst);
    assert!(calls > 1, "expected a split into several sub-documents");
    assert!(
        calls < report.chunks_stored,
        "contextualized calls ({calls}) must be far fewer than chunks ({})",
        report.chunks_stored
    );

    // Stored chunks carry split metadata referencing their sub-document.
    let collection = fixture.pipeline.collection();
    let stored = fixture
        .recorder
        .scroll(
            &collection,
            ScrollRequest {
                filter: PayloadFilter::default(),
                limit: 200,
                offset: 0,
                with_vector: None,
            },
        )
        .await
        .expect("scroll");
    let with_split = stored
        .items
        .iter()
        .filter(|item| item.chunk.split.is_some())
        .count();
    assert_eq!(with_split, stored.items.len());
    let split_total = stored.items[0].chunk.split.expect("split meta").split_total;
    assert_eq!(calls, split_total);
}

#[tokio::test]
async fn qntm_keys_land_on_stored_chunks() {
    let llm = ScriptedLlmBackend::new(vec![
        serde_json::json!({"keys": ["notes.alpha"], "reasoning": "r"}),
        serde_json::json!({"keys": ["notes.beta"], "reasoning": "r"}),
        serde_json::json!({"keys": ["notes.gamma"], "reasoning": "r"}),
        serde_json::json!({"keys": ["notes.delta"], "reasoning": "r"}),
    ]);
    let fixture = fixture_with(small_chunk_tuning(), Some(llm), None).await;
    let path = write_file(&fixture.root, "k.md", "first part\n\nsecond part");

    let report = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("ingest");
    assert!(report.chunks_stored >= 1);

    let collection = fixture.pipeline.collection();
    let stored = fixture
        .recorder
        .scroll(
            &collection,
            ScrollRequest {
                filter: PayloadFilter::default(),
                limit: 50,
                offset: 0,
                with_vector: None,
            },
        )
        .await
        .expect("scroll");
    assert!(stored
        .items
        .iter()
        .all(|item| !item.chunk.qntm_keys.is_empty()));
}

#[tokio::test]
async fn qntm_failures_do_not_fail_the_file() {
    // No LLM registered at all: every key generation degrades to empty.
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let path = write_file(&fixture.root, "nollm.md", "some text\n\nmore text");

    let report = fixture
        .pipeline
        .run(params_for(&fixture, &[&path]))
        .await
        .expect("ingest");
    assert!(report.errors.is_empty());
    assert!(report.chunks_stored >= 1);
}

#[tokio::test]
async fn path_outside_root_is_rejected() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let outside = tempfile::tempdir().expect("tempdir");
    let stray = write_file_at(outside.path(), "stray.md", "outside content");

    let result = fixture.pipeline.run(params_for(&fixture, &[&stray])).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn unreadable_file_is_collected_not_fatal() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let good = write_file(&fixture.root, "good.md", "perfectly fine text");
    let bad = fixture.root.path().join("bad.md");
    std::fs::write(&bad, [0xff, 0xfe, 0x00, 0x81]).expect("write binary");

    let report = fixture
        .pipeline
        .run(params_for(&fixture, &[&good, &bad]))
        .await
        .expect("ingest survives");

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].file, "bad.md");
    assert!(report.chunks_stored >= 1);
}

#[tokio::test]
async fn paused_pipeline_stores_nothing_until_resumed() {
    let fixture = fixture_with(small_chunk_tuning(), None, None).await;
    let path = write_file(&fixture.root, "p.md", "pause me\n\nplease now");

    let pause = PauseController::new();
    let pipeline = IngestPipeline::new(
        Arc::new(CountingServices {
            inner: DefaultPipelineServices::new(
                {
                    let mut registry = BackendRegistry::new();
                    let hashed = Arc::new(HashedEmbeddingBackend::new(8));
                    registry.register_text_embedding(hashed);
                    Arc::new(registry)
                },
                Arc::new(PromptRegistry::with_defaults()),
                100_000,
            ),
            contextualized_calls: AtomicUsize::new(0),
            token_limit: 100_000,
        }),
        StorageService::new(fixture.recorder.clone(), None, None),
        FileTracker::new(Arc::new(
            SurrealDbClient::memory("pause_ns", &Uuid::new_v4().to_string())
                .await
                .expect("db"),
        )),
        fixture.events.clone(),
        pause.clone(),
        None,
        small_chunk_tuning(),
    );

    pause.pause();
    let params = IngestParams::new(vec![path], fixture.root.path().to_path_buf());
    let handle = tokio::spawn(async move { pipeline.run(params).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        fixture.recorder.upsert_count(),
        0,
        "no batch may reach the store while paused"
    );
    assert!(!handle.is_finished());

    pause.resume();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("completes after resume")
        .expect("join")
        .expect("ingest");
    assert!(report.chunks_stored >= 1);
}

fn write_file_at(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture file");
    path
}
