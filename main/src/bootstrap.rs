use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use common::backends::embedding::build_text_embedding;
use common::backends::llm::build_llm_backend;
use common::backends::{BackendRegistry, BackendSpec};
use common::error::AppError;
use common::events::EventBus;
use common::prompts::PromptRegistry;
use common::storage::cache::SurrealCache;
use common::storage::db::SurrealDbClient;
use common::storage::fulltext::SurrealFullTextIndex;
use common::storage::store::StorageService;
use common::storage::vector::SurrealVectorStore;
use common::utils::config::{get_config, AppConfig};
use consolidation_engine::{ConsolidationEngine, ConsolidationTuning};
use ingestion_pipeline::pipeline::{DefaultPipelineServices, PipelineServices};
use ingestion_pipeline::tracker::FileTracker;
use ingestion_pipeline::{IngestPipeline, IngestTuning, PauseController};
use retrieval_pipeline::reranking::RerankerPool;
use retrieval_pipeline::SearchService;

/// CLI flags layered over the file/environment configuration.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub db_url: Option<String>,
    pub voyage_key: Option<String>,
    pub ollama_url: Option<String>,
    pub embedding: Option<String>,
    pub llm: Option<String>,
    pub force_reranker: bool,
    pub jobs: Option<usize>,
}

/// Everything a command needs, wired once per process.
pub struct AppContext {
    pub config: AppConfig,
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageService,
    pub registry: Arc<BackendRegistry>,
    pub prompts: Arc<PromptRegistry>,
    pub services: Arc<dyn PipelineServices>,
    pub tracker: FileTracker,
    pub events: EventBus,
    pub pause: PauseController,
    pub search: Arc<SearchService>,
    pub engine: Arc<ConsolidationEngine>,
    pub tuning: IngestTuning,
}

impl AppContext {
    /// Pipeline without a watchdog, for one-shot CLI runs.
    pub fn pipeline(&self) -> Arc<IngestPipeline> {
        self.pipeline_with_watchdog(None)
    }

    pub fn pipeline_with_watchdog(
        &self,
        watchdog: Option<Arc<ingestion_pipeline::ConsolidationWatchdog>>,
    ) -> Arc<IngestPipeline> {
        Arc::new(IngestPipeline::new(
            Arc::clone(&self.services),
            self.storage.clone(),
            self.tracker.clone(),
            self.events.clone(),
            self.pause.clone(),
            watchdog,
            self.tuning.clone(),
        ))
    }

    /// Collection for the configured text-embedding dimension.
    pub fn collection(&self) -> Result<String, AppError> {
        Ok(common::storage::store::collection_name(
            self.registry.text_embedding()?.dimension(),
        ))
    }
}

/// Resolve the data directory; the literal default moves under the XDG data
/// home when one exists.
pub fn resolve_data_dir(config: &AppConfig) -> PathBuf {
    if config.data_dir == "./data" {
        if let Some(base) = dirs::data_local_dir() {
            return base.join("atlas");
        }
    }
    PathBuf::from(&config.data_dir)
}

/// Where the daemon listens (and clients connect).
pub fn daemon_socket(config: &AppConfig) -> PathBuf {
    match &config.daemon_socket {
        Some(path) => PathBuf::from(path),
        None => resolve_data_dir(config).join("atlas.sock"),
    }
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, AppError> {
    let mut config =
        get_config().map_err(|err| AppError::Configuration(err.to_string()))?;

    if let Some(db_url) = &overrides.db_url {
        config.surrealdb_address = db_url.clone();
    }
    if let Some(voyage_key) = &overrides.voyage_key {
        config.voyage_key = Some(voyage_key.clone());
    }
    if let Some(ollama_url) = &overrides.ollama_url {
        config.ollama_url = ollama_url.clone();
    }
    if let Some(embedding) = &overrides.embedding {
        config.embedding_backend = embedding.clone();
    }
    if let Some(llm) = &overrides.llm {
        config.llm_backend = llm.clone();
    }
    if overrides.force_reranker {
        config.reranking_enabled = true;
    }

    Ok(config)
}

pub async fn build_context(overrides: &CliOverrides) -> Result<AppContext, AppError> {
    let config = load_config(overrides)?;
    build_context_with_config(config, overrides).await
}

pub async fn build_context_with_config(
    config: AppConfig,
    overrides: &CliOverrides,
) -> Result<AppContext, AppError> {
    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let storage = StorageService::new(
        Arc::new(SurrealVectorStore::new(Arc::clone(&db))),
        Some(Arc::new(SurrealFullTextIndex::new(Arc::clone(&db)))),
        Some(Arc::new(SurrealCache::new(Arc::clone(&db)))),
    );

    let registry = Arc::new(build_registry(&config).await?);
    let prompts = Arc::new(PromptRegistry::with_defaults());
    prompts.validate()?;

    let services: Arc<dyn PipelineServices> = DefaultPipelineServices::new(
        Arc::clone(&registry),
        Arc::clone(&prompts),
        config.contextualized_safe_token_limit,
    );

    let events = EventBus::default();
    let pause = PauseController::new();
    let tracker = FileTracker::new(Arc::clone(&db));

    let mut tuning = IngestTuning::default();
    if let Some(jobs) = overrides.jobs {
        tuning.embed_concurrency = jobs.max(1);
        tuning.qntm_policy.max = tuning.qntm_policy.max.max(jobs);
    }

    let search = Arc::new(SearchService::new(
        storage.clone(),
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&prompts),
        events.clone(),
    ));

    let engine = ConsolidationEngine::new(
        storage.clone(),
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&prompts),
        events.clone(),
        ConsolidationTuning::default(),
    );

    Ok(AppContext {
        config,
        db,
        storage,
        registry,
        prompts,
        services,
        tracker,
        events,
        pause,
        search,
        engine,
        tuning,
    })
}

async fn build_registry(config: &AppConfig) -> Result<BackendRegistry, AppError> {
    let mut registry = BackendRegistry::new();

    let embedding_spec: BackendSpec = config.embedding_backend.parse()?;
    let handles = build_text_embedding(&embedding_spec, config).await?;
    info!(
        provider = %embedding_spec.provider,
        dimension = handles.text.dimension(),
        "text embedding backend ready"
    );
    registry.register_text_embedding(handles.text);
    if let Some(contextualized) = handles.contextualized {
        registry.register_contextualized_embedding(contextualized);
    }

    // A dedicated code-embedding spec wins over the text backend's code
    // capability.
    if let Some(code_spec) = &config.code_embedding_backend {
        let code_spec: BackendSpec = code_spec.parse()?;
        let code_handles = build_text_embedding(&code_spec, config).await?;
        match code_handles.code {
            Some(code) => registry.register_code_embedding(code),
            None => warn!(
                provider = %code_spec.provider,
                "configured code-embedding backend has no code capability"
            ),
        }
    } else if let Some(code) = handles.code {
        registry.register_code_embedding(code);
    }

    let llm_spec: BackendSpec = config.llm_backend.parse()?;
    match build_llm_backend(&llm_spec, config) {
        Ok(llm) => registry.register_json_completion(llm),
        Err(err) => warn!(error = %err, "llm backend unavailable; key generation and consolidation will degrade"),
    }

    match RerankerPool::maybe_from_config(config) {
        Ok(Some(pool)) => registry.register_reranker(pool),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "reranker pool failed to initialise"),
    }

    Ok(registry)
}
