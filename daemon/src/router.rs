use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use common::error::AppError;
use common::events::EventBus;
use common::storage::types::chunk::{ContentType, Temperature};
use consolidation_engine::{ConsolidateParams, ConsolidationEngine};
use ingestion_pipeline::pipeline::{IngestParams, IngestPipeline, PipelineServices, QntmContext};
use retrieval_pipeline::timeline::{Granularity, TimelineParams};
use retrieval_pipeline::{SearchParams, SearchService};

use crate::dto::{
    CausalLinkDto, ConsolidateParamsDto, ConsolidateResultDto, ConsolidateStartResultDto,
    FileErrorDto, IngestParamsDto, IngestResultDto, IngestStartParamsDto, QntmGenerateParamsDto,
    QntmGenerateResultDto, SearchParamsDto, SearchResultDto, TaskRecordDto, TaskStatusParamsDto,
    TaskStopParamsDto, TimelineChunkDto, TimelineParamsDto, TimelineResultDto,
};
use crate::rpc::{
    JsonRpcRequest, JsonRpcResponse, APP_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use crate::state::{DaemonState, IngestionTask, TaskStatus};

/// JSON-RPC dispatch. Validates params against the DTO schema, forwards every
/// field to the service layer and serialises the full canonical result back.
pub struct DaemonRouter {
    pipeline: Arc<IngestPipeline>,
    search: Arc<SearchService>,
    engine: Arc<ConsolidationEngine>,
    services: Arc<dyn PipelineServices>,
    state: Arc<DaemonState>,
    events: EventBus,
    root_dir: PathBuf,
}

impl DaemonRouter {
    pub fn new(
        pipeline: Arc<IngestPipeline>,
        search: Arc<SearchService>,
        engine: Arc<ConsolidationEngine>,
        services: Arc<dyn PipelineServices>,
        state: Arc<DaemonState>,
        events: EventBus,
        root_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            search,
            engine,
            services,
            state,
            events,
            root_dir,
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle one request. Notifications (no id) are processed but answered
    /// with nothing.
    #[instrument(skip_all, fields(method = %request.method))]
    pub async fn handle(self: &Arc<Self>, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let outcome = self.dispatch(&request.method, request.params).await;

        let id = id?;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(RouterError::InvalidParams(message)) => {
                JsonRpcResponse::failure(id, INVALID_PARAMS, message)
            }
            Err(RouterError::MethodNotFound(method)) => JsonRpcResponse::failure(
                id,
                METHOD_NOT_FOUND,
                format!("unknown method {method}"),
            ),
            Err(RouterError::App(err)) => {
                JsonRpcResponse::failure(id, APP_ERROR, err.to_string())
            }
        })
    }

    async fn dispatch(
        self: &Arc<Self>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RouterError> {
        match method {
            "atlas.ingest" => {
                let dto: IngestParamsDto = parse_params(params)?;
                let report = self
                    .pipeline
                    .run(self.ingest_params_from(&dto)?)
                    .await
                    .map_err(RouterError::App)?;
                encode(IngestResultDto::from(report))
            }
            "atlas.search" => {
                let dto: SearchParamsDto = parse_params(params)?;
                let hits = self
                    .search
                    .search(search_params_from(&dto)?)
                    .await
                    .map_err(RouterError::App)?;
                let rows: Vec<SearchResultDto> = hits
                    .iter()
                    .map(|hit| SearchResultDto::from_hit(hit.score, &hit.chunk))
                    .collect();
                encode(rows)
            }
            "atlas.timeline" => {
                let dto: TimelineParamsDto = parse_params(params)?;
                let result = self
                    .search
                    .timeline(timeline_params_from(&dto)?)
                    .await
                    .map_err(RouterError::App)?;

                let chunks: Vec<TimelineChunkDto> = result
                    .chunks
                    .into_iter()
                    .map(|entry| TimelineChunkDto {
                        bucket: entry.bucket.map(|b| b.to_rfc3339()),
                        id: entry.chunk.id.clone(),
                        text: entry.chunk.text.clone(),
                        file_path: entry.chunk.source.file_path.clone(),
                        created_at: entry.chunk.created_at.to_rfc3339(),
                        qntm_keys: entry.chunk.qntm_keys.clone(),
                        consolidation_level: entry.chunk.consolidation_level,
                        causal_links: if dto.include_causal_links.unwrap_or(false) {
                            Some(
                                entry
                                    .causal_links
                                    .iter()
                                    .map(|link| CausalLinkDto {
                                        from_chunk: link.from_chunk.clone(),
                                        to_chunk: link.to_chunk.clone(),
                                        relation: serde_json::to_value(link.relation)
                                            .ok()
                                            .and_then(|v| {
                                                v.as_str().map(|s| s.to_string())
                                            })
                                            .unwrap_or_default(),
                                        confidence: link.confidence,
                                        inferred_by: link.inferred_by.clone(),
                                    })
                                    .collect(),
                            )
                        } else {
                            None
                        },
                    })
                    .collect();

                encode(TimelineResultDto {
                    chunks,
                    total: result.total,
                })
            }
            "atlas.consolidate" => {
                let dto: ConsolidateParamsDto = parse_params(params)?;
                let task_id = Uuid::new_v4().to_string();
                if let Err(holder) = self.state.try_acquire_consolidation(&task_id) {
                    return Err(RouterError::App(AppError::Locked(format!(
                        "consolidation already running under task {holder}"
                    ))));
                }
                let result = self.engine.run(consolidate_params_from(&dto)).await;
                self.state.release_consolidation();
                encode(ConsolidateResultDto::from(result.map_err(RouterError::App)?))
            }
            "atlas.qntm.generate" => {
                let dto: QntmGenerateParamsDto = parse_params(params)?;
                let context = dto.context.unwrap_or(crate::dto::QntmContextDto {
                    file_name: None,
                    chunk_index: None,
                    total_chunks: None,
                });
                let keys = self
                    .services
                    .generate_qntm_keys(
                        &dto.text,
                        &dto.existing_keys,
                        QntmContext {
                            file_name: context.file_name.unwrap_or_else(|| "(ad-hoc)".into()),
                            chunk_index: context.chunk_index.unwrap_or(0),
                            total_chunks: context.total_chunks.unwrap_or(1),
                        },
                    )
                    .await;
                encode(QntmGenerateResultDto {
                    keys: keys.keys,
                    reasoning: keys.reasoning,
                })
            }
            "atlas.ingest.start" => {
                let dto: IngestStartParamsDto = parse_params(params)?;
                let task = self.start_ingest_task(&dto);
                encode(serde_json::json!({ "taskId": task.id }))
            }
            "atlas.ingest.status" => {
                let dto: TaskStatusParamsDto = parse_params(params)?;
                let tasks: Vec<TaskRecordDto> = match dto.task_id {
                    Some(task_id) => {
                        let task = self.state.get_task(&task_id).ok_or_else(|| {
                            RouterError::App(AppError::NotFound(format!(
                                "ingestion task {task_id}"
                            )))
                        })?;
                        vec![task_dto(&task)]
                    }
                    None => self.state.list_tasks().iter().map(task_dto).collect(),
                };
                encode(tasks)
            }
            "atlas.ingest.stop" => {
                let dto: TaskStopParamsDto = parse_params(params)?;
                let task = self
                    .state
                    .stop_task(&dto.task_id)
                    .map_err(RouterError::App)?;
                info!(task_id = %task.id, "ingestion task stopped");
                encode(task_dto(&task))
            }
            "atlas.consolidate.start" => {
                let dto: ConsolidateParamsDto = parse_params(params)?;
                let task_id = Uuid::new_v4().to_string();
                match self.state.try_acquire_consolidation(&task_id) {
                    Err(existing) => encode(ConsolidateStartResultDto {
                        locked: false,
                        task_id: Some(existing),
                        message: Some("already running".to_string()),
                    }),
                    Ok(()) => {
                        let engine = Arc::clone(&self.engine);
                        let state = Arc::clone(&self.state);
                        let params = consolidate_params_from(&dto);
                        tokio::spawn(async move {
                            if let Err(err) = engine.run(params).await {
                                warn!(error = %err, "background consolidation failed");
                            }
                            state.release_consolidation();
                        });
                        encode(ConsolidateStartResultDto {
                            locked: true,
                            task_id: Some(task_id),
                            message: None,
                        })
                    }
                }
            }
            "atlas.consolidate.status" => {
                let lock = self.state.consolidation_lock();
                encode(serde_json::json!({
                    "locked": lock.locked,
                    "taskId": lock.task_id,
                    "startedAt": lock.started_at.map(|at| at.to_rfc3339()),
                }))
            }
            "atlas.daemon.status" => {
                let lock = self.state.consolidation_lock();
                encode(serde_json::json!({
                    "tasks": self.state.list_tasks().len(),
                    "consolidationLocked": lock.locked,
                    "watches": self.state.watches().len(),
                }))
            }
            "atlas.daemon.stop" => {
                use common::events::AtlasEvent;
                self.events.emit(AtlasEvent::DaemonStopping);
                self.state.request_shutdown();
                encode(serde_json::json!({ "stopping": true }))
            }
            other => Err(RouterError::MethodNotFound(other.to_string())),
        }
    }

    fn ingest_params_from(&self, dto: &IngestParamsDto) -> Result<IngestParams, RouterError> {
        let root_dir = dto
            .root_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root_dir.clone());
        let mut params = IngestParams::new(
            dto.paths.iter().map(PathBuf::from).collect(),
            root_dir,
        );
        params.recursive = dto.recursive.unwrap_or(false);
        params.verbose = dto.verbose.unwrap_or(false);
        params.existing_keys = dto.existing_keys.clone().unwrap_or_default();
        params.use_hnsw_toggle = dto.use_hnsw_toggle.unwrap_or(true);
        params.allow_consolidation = dto.allow_consolidation.unwrap_or(true);
        params.consolidation_threshold = dto.consolidation_threshold;
        Ok(params)
    }

    fn start_ingest_task(self: &Arc<Self>, dto: &IngestStartParamsDto) -> IngestionTask {
        let watching = dto.watch.unwrap_or(false);
        let task = self.state.create_task(dto.paths.clone(), watching);

        if watching {
            for path in &dto.paths {
                self.state.register_watch(path.clone(), task.id.clone());
            }
        }

        let mut params = IngestParams::new(
            dto.paths.iter().map(PathBuf::from).collect(),
            self.root_dir.clone(),
        );
        params.recursive = dto.recursive.unwrap_or(false);

        let router = Arc::clone(self);
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            match router.pipeline.run(params).await {
                Ok(report) => {
                    router.state.update_task(&task_id, |task| {
                        task.files_processed = report.files_processed;
                        task.chunks_stored = report.chunks_stored;
                        task.errors = report.errors.clone();
                        task.completed_at = Some(Utc::now());
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::Completed;
                        }
                    });
                }
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "background ingest failed");
                    router.state.update_task(&task_id, |task| {
                        task.errors.push(ingestion_pipeline::pipeline::FileError {
                            file: "<pipeline>".to_string(),
                            error: err.to_string(),
                        });
                        task.completed_at = Some(Utc::now());
                        task.status = TaskStatus::Failed;
                    });
                }
            }
        });
        self.state.register_handle(&task.id, handle);
        task
    }
}

enum RouterError {
    InvalidParams(String),
    MethodNotFound(String),
    App(AppError),
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, RouterError> {
    serde_json::from_value(params)
        .map_err(|err| RouterError::InvalidParams(format!("invalid params: {err}")))
}

fn encode<T: serde::Serialize>(value: T) -> Result<serde_json::Value, RouterError> {
    serde_json::to_value(value)
        .map_err(|err| RouterError::App(AppError::InternalError(err.to_string())))
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, RouterError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| RouterError::InvalidParams(format!("{field}: {err}")))
}

fn search_params_from(dto: &SearchParamsDto) -> Result<SearchParams, RouterError> {
    let mut params = SearchParams::new(dto.query.clone());
    if let Some(limit) = dto.limit {
        params.limit = limit;
    }
    if let Some(since) = &dto.since {
        params.since = Some(parse_datetime(since, "since")?);
    }
    if let Some(until) = &dto.until {
        params.until = Some(parse_datetime(until, "until")?);
    }
    params.qntm_key = dto.qntm_key.clone();
    params.rerank = dto.rerank.unwrap_or(false);
    params.rerank_top_k = dto.rerank_top_k;
    params.expand_query = dto.expand_query.unwrap_or(false);
    params.hybrid_search = dto.hybrid_search.unwrap_or(false);
    params.consolidation_level = dto.consolidation_level;
    params.agent_role = dto.agent_role.clone();
    if let Some(content_type) = &dto.content_type {
        params.content_type = Some(match content_type.as_str() {
            "text" => ContentType::Text,
            "code" => ContentType::Code,
            "media" => ContentType::Media,
            other => {
                return Err(RouterError::InvalidParams(format!(
                    "unknown content type: {other}"
                )))
            }
        });
    }
    if let Some(temperature) = &dto.temperature {
        params.temperature = Some(
            temperature
                .parse::<Temperature>()
                .map_err(|err| RouterError::InvalidParams(err.to_string()))?,
        );
    }
    Ok(params)
}

fn timeline_params_from(dto: &TimelineParamsDto) -> Result<TimelineParams, RouterError> {
    let mut params = TimelineParams::new(parse_datetime(&dto.since, "since")?);
    if let Some(until) = &dto.until {
        params.until = Some(parse_datetime(until, "until")?);
    }
    if let Some(limit) = dto.limit {
        params.limit = limit;
    }
    params.timeline_id = dto.timeline_id.clone();
    params.qntm_key = dto.qntm_key.clone();
    params.include_causal_links = dto.include_causal_links.unwrap_or(false);
    if let Some(granularity) = &dto.granularity {
        params.granularity = Some(match granularity.as_str() {
            "hour" => Granularity::Hour,
            "day" => Granularity::Day,
            other => {
                return Err(RouterError::InvalidParams(format!(
                    "unknown granularity: {other}"
                )))
            }
        });
    }
    Ok(params)
}

fn consolidate_params_from(dto: &ConsolidateParamsDto) -> ConsolidateParams {
    ConsolidateParams {
        dry_run: dto.dry_run.unwrap_or(false),
        threshold: dto.threshold,
        batch_size: dto.batch_size,
        limit: dto.limit,
        qntm_key_filter: dto.qntm_key_filter.clone(),
        consolidation_level: dto.consolidation_level.unwrap_or(0),
        continuous: dto.continuous.unwrap_or(false),
        poll_interval_ms: dto.poll_interval_ms,
    }
}

fn task_dto(task: &IngestionTask) -> TaskRecordDto {
    TaskRecordDto {
        task_id: task.id.clone(),
        started_at: task.started_at,
        completed_at: task.completed_at,
        paths: task.paths.clone(),
        watching: task.watching,
        files_processed: task.files_processed,
        chunks_stored: task.chunks_stored,
        errors: task
            .errors
            .iter()
            .cloned()
            .map(FileErrorDto::from)
            .collect(),
        status: task.status.as_str().to_string(),
    }
}
