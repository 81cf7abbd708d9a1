use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use common::backends::embedding::HashedEmbeddingBackend;
use common::backends::BackendRegistry;
use common::error::AppError;
use common::events::{AtlasEvent, EventBus};
use common::prompts::PromptRegistry;
use common::storage::db::SurrealDbClient;
use common::storage::store::StorageService;
use common::storage::vector::SurrealVectorStore;
use consolidation_engine::{ConsolidationEngine, ConsolidationTuning};
use ingestion_pipeline::chunker::ChunkerConfig;
use ingestion_pipeline::pipeline::{
    DefaultPipelineServices, IngestPipeline, IngestTuning, PipelineServices, QntmContext,
    QntmKeys,
};
use ingestion_pipeline::tracker::FileTracker;
use ingestion_pipeline::PauseController;
use retrieval_pipeline::SearchService;

use crate::router::DaemonRouter;
use crate::rpc::{JsonRpcRequest, APP_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::server::DaemonServer;
use crate::state::DaemonState;

/// Delegating services with an artificial delay per embedding, so tests can
/// observe and stop a task mid-flight.
struct SlowServices {
    inner: Arc<DefaultPipelineServices>,
    delay: Duration,
}

#[async_trait::async_trait]
impl PipelineServices for SlowServices {
    fn text_model_name(&self) -> String {
        self.inner.text_model_name()
    }

    fn text_dimension(&self) -> usize {
        self.inner.text_dimension()
    }

    fn contextualized_available(&self) -> bool {
        false
    }

    fn contextualized_token_limit(&self) -> usize {
        self.inner.contextualized_token_limit()
    }

    fn code_embedding_available(&self) -> bool {
        false
    }

    async fn embed_snippet(&self, text: &str) -> Result<Vec<f32>, AppError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_snippet(text).await
    }

    async fn embed_contextualized(
        &self,
        _chunks: &[String],
    ) -> Result<Option<Vec<Vec<f32>>>, AppError> {
        Ok(None)
    }

    async fn embed_code(&self, _text: &str) -> Result<Option<Vec<f32>>, AppError> {
        Ok(None)
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
    router: Arc<DaemonRouter>,
    events: EventBus,
    root: tempfile::TempDir,
}

async fn fixture(embed_delay: Option<Duration>) -> Fixture {
    let db = Arc::new(
        SurrealDbClient::memory("daemon_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");

    let storage = StorageService::new(
        Arc::new(SurrealVectorStore::new(Arc::clone(&db))),
        None,
        None,
    );

    let mut registry = BackendRegistry::new();
    let hashed = Arc::new(HashedEmbeddingBackend::new(8));
    registry.register_text_embedding(hashed.clone());
    registry.register_contextualized_embedding(hashed);
    let registry = Arc::new(registry);
    let prompts = Arc::new(PromptRegistry::with_defaults());

    let inner = DefaultPipelineServices::new(
        Arc::clone(&registry),
        Arc::clone(&prompts),
        100_000,
    );
    let services: Arc<dyn PipelineServices> = match embed_delay {
        Some(delay) => Arc::new(SlowServices { inner, delay }),
        None => inner,
    };

    let events = EventBus::default();
    let tuning = IngestTuning {
        chunker: ChunkerConfig {
            min_chars: 4,
            target_min_chars: 4,
            target_max_chars: 16,
        },
        batch_timeout: Duration::from_millis(100),
        ..IngestTuning::default()
    };

    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&services),
        storage.clone(),
        FileTracker::new(Arc::clone(&db)),
        events.clone(),
        PauseController::new(),
        None,
        tuning,
    ));

    let search = Arc::new(SearchService::new(
        storage.clone(),
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&prompts),
        events.clone(),
    ));

    let engine = ConsolidationEngine::new(
        storage,
        db,
        registry,
        prompts,
        events.clone(),
        ConsolidationTuning::default(),
    );

    let root = tempfile::tempdir().expect("tempdir");
    let router = DaemonRouter::new(
        pipeline,
        search,
        engine,
        services,
        Arc::new(DaemonState::new()),
        events.clone(),
        root.path().to_path_buf(),
    );

    Fixture {
        router,
        events,
        root,
    }
}

fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(serde_json::json!(1)),
        method: method.to_string(),
        params,
    }
}

fn write_file(root: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = root.path().join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

#[tokio::test]
async fn ingest_then_search_through_the_router() {
    let fixture = fixture(None).await;
    write_file(&fixture.root, "a.md", "daemon test one\n\ndaemon test two");

    let response = fixture
        .router
        .handle(request(
            "atlas.ingest",
            serde_json::json!({"paths": ["a.md"]}),
        ))
        .await
        .expect("response");
    assert!(response.error.is_none(), "{:?}", response.error);
    let result = response.result.expect("result");
    assert!(result["chunksStored"].as_u64().unwrap_or(0) >= 1);
    assert_eq!(result["filesProcessed"], 1);
    assert_eq!(result["errors"].as_array().map(Vec::len), Some(0));

    let response = fixture
        .router
        .handle(request(
            "atlas.search",
            serde_json::json!({"query": "daemon test", "limit": 5}),
        ))
        .await
        .expect("response");
    assert!(response.error.is_none(), "{:?}", response.error);
    let rows = response.result.expect("rows");
    let rows = rows.as_array().expect("array");
    assert!(!rows.is_empty());
    for row in rows {
        let score = row["score"].as_f64().expect("score");
        assert!((0.0..=1.0).contains(&score));
        assert!(row["file_path"].is_string());
        assert!(row["created_at"].is_string());
        assert!(row["qntm_keys"].is_array());
    }
}

#[tokio::test]
async fn ingest_start_stop_lifecycle() {
    let fixture = fixture(Some(Duration::from_millis(150))).await;
    // Enough paragraphs that embedding takes a while.
    let body: String = (0..20).map(|i| format!("slow paragraph {i}\n\n")).collect();
    write_file(&fixture.root, "slow.md", &body);

    let response = fixture
        .router
        .handle(request(
            "atlas.ingest.start",
            serde_json::json!({"paths": ["slow.md"]}),
        ))
        .await
        .expect("response");
    let task_id = response.result.expect("result")["taskId"]
        .as_str()
        .expect("task id")
        .to_string();

    // Stop within ~100ms of starting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rx = fixture.events.subscribe();
    let response = fixture
        .router
        .handle(request(
            "atlas.ingest.stop",
            serde_json::json!({"taskId": task_id}),
        ))
        .await
        .expect("response");
    assert!(response.error.is_none(), "{:?}", response.error);
    let stopped = response.result.expect("stopped record");
    assert_eq!(stopped["status"], "stopped");
    assert!(stopped["completedAt"].is_string());

    // No chunk.stored events after the stop.
    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, AtlasEvent::ChunkStored { .. }),
            "chunk.stored after stop"
        );
    }

    // Status returns exactly one record for the task.
    let response = fixture
        .router
        .handle(request(
            "atlas.ingest.status",
            serde_json::json!({"taskId": task_id}),
        ))
        .await
        .expect("response");
    let records = response.result.expect("records");
    assert_eq!(records.as_array().map(Vec::len), Some(1));
    assert_eq!(records[0]["status"], "stopped");
}

#[tokio::test]
async fn stopping_an_unknown_task_is_an_error() {
    let fixture = fixture(None).await;
    let response = fixture
        .router
        .handle(request(
            "atlas.ingest.stop",
            serde_json::json!({"taskId": "nope"}),
        ))
        .await
        .expect("response");
    let error = response.error.expect("error");
    assert_eq!(error.code, APP_ERROR);
    assert!(error.message.contains("nope"));
}

#[tokio::test]
async fn consolidate_start_reports_contention() {
    let fixture = fixture(None).await;
    fixture
        .router
        .state()
        .try_acquire_consolidation("existing-task")
        .expect("acquire");

    let response = fixture
        .router
        .handle(request("atlas.consolidate.start", serde_json::json!({})))
        .await
        .expect("response");
    let result = response.result.expect("result");
    assert_eq!(result["locked"], false);
    assert_eq!(result["taskId"], "existing-task");
    assert_eq!(result["message"], "already running");

    // The synchronous variant refuses outright while locked.
    let response = fixture
        .router
        .handle(request("atlas.consolidate", serde_json::json!({})))
        .await
        .expect("response");
    let error = response.error.expect("error");
    assert_eq!(error.code, APP_ERROR);
    assert!(error.message.contains("already running"));
}

#[tokio::test]
async fn consolidate_status_reflects_the_lock() {
    let fixture = fixture(None).await;

    let response = fixture
        .router
        .handle(request("atlas.consolidate.status", serde_json::json!({})))
        .await
        .expect("response");
    assert_eq!(response.result.expect("result")["locked"], false);

    fixture
        .router
        .state()
        .try_acquire_consolidation("t9")
        .expect("acquire");
    let response = fixture
        .router
        .handle(request("atlas.consolidate.status", serde_json::json!({})))
        .await
        .expect("response");
    let result = response.result.expect("result");
    assert_eq!(result["locked"], true);
    assert_eq!(result["taskId"], "t9");
}

#[tokio::test]
async fn unknown_methods_and_bad_params_map_to_rpc_errors() {
    let fixture = fixture(None).await;

    let response = fixture
        .router
        .handle(request("atlas.does.not.exist", serde_json::json!({})))
        .await
        .expect("response");
    assert_eq!(response.error.expect("error").code, METHOD_NOT_FOUND);

    let response = fixture
        .router
        .handle(request(
            "atlas.search",
            serde_json::json!({"limit": "not a number"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.error.expect("error").code, INVALID_PARAMS);

    let response = fixture
        .router
        .handle(request(
            "atlas.search",
            serde_json::json!({"query": "x", "temperature": "plasma"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.error.expect("error").code, INVALID_PARAMS);
}

#[tokio::test]
async fn qntm_generate_answers_even_without_an_llm() {
    let fixture = fixture(None).await;
    let response = fixture
        .router
        .handle(request(
            "atlas.qntm.generate",
            serde_json::json!({"text": "some chunk", "existingKeys": []}),
        ))
        .await
        .expect("response");
    assert!(response.error.is_none());
    let result = response.result.expect("result");
    assert_eq!(result["keys"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn notifications_get_no_response() {
    let fixture = fixture(None).await;
    let response = fixture
        .router
        .handle(JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "atlas.consolidate.status".to_string(),
            params: serde_json::json!({}),
        })
        .await;
    assert!(response.is_none());
}

#[tokio::test]
async fn connection_speaks_line_delimited_jsonrpc_and_events() {
    let fixture = fixture(None).await;
    let server = DaemonServer::new(Arc::clone(&fixture.router));

    let (client, server_side) = tokio::io::duplex(16 * 1024);
    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        server_clone.handle_connection(server_side).await;
    });

    let (read_half, mut write_half) = tokio::io::split(client);
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":42,\"method\":\"atlas.consolidate.status\",\"params\":{}}\n")
        .await
        .expect("write request");

    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("response in time")
        .expect("io")
        .expect("line");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json");
    assert_eq!(response["id"], 42);
    assert_eq!(response["result"]["locked"], false);

    // Events arrive as atlas.event notifications.
    fixture.events.emit(AtlasEvent::DaemonStopping);
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("notification in time")
        .expect("io")
        .expect("line");
    let notification: serde_json::Value = serde_json::from_str(&line).expect("json");
    assert_eq!(notification["method"], "atlas.event");
    assert_eq!(notification["params"]["type"], "daemon.stopping");

    // Garbage input produces a parse error, not a dropped connection.
    write_half
        .write_all(b"this is not json\n")
        .await
        .expect("write garbage");
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("error in time")
        .expect("io")
        .expect("line");
    let response: serde_json::Value = serde_json::from_str(&line).expect("json");
    assert_eq!(response["error"]["code"], -32700);
}
