mod config;
mod services;

pub use config::{FileError, IngestParams, IngestReport, IngestTuning};
pub use services::{DefaultPipelineServices, PipelineServices, QntmContext, QntmKeys};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use chrono::Utc;
use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use common::error::AppError;
use common::events::{AtlasEvent, ErrorPhase, EventBus};
use common::storage::store::{collection_name, StorageService};
use common::storage::types::chunk::{
    chunk_id, Chunk, ContentType, EmbeddingMeta, EmbeddingStrategy, SourceMeta,
};
use common::storage::types::source_record::ChunkRecord;
use common::storage::vector::Point;
use common::utils::hash::sha256_hex;

use crate::chunker::{apply_context_window, split_text, PendingChunk};
use crate::pause::PauseController;
use crate::stream_ops::{adaptive_parallel, batch, parallel};
use crate::tracker::{FileTracker, IngestionReason};
use crate::watchdog::ConsolidationWatchdog;

/// Transforms a set of input paths into persisted chunks, idempotently and
/// with bounded resource usage. Stages compose the stream operators: chunking
/// feeds order-preserving parallel embedding, adaptive-parallel key
/// generation, then batched upserts gated by the consolidation pause flag.
pub struct IngestPipeline {
    services: Arc<dyn PipelineServices>,
    storage: StorageService,
    tracker: FileTracker,
    events: EventBus,
    pause: PauseController,
    watchdog: Option<Arc<ConsolidationWatchdog>>,
    tuning: IngestTuning,
}

/// One chunk travelling through the enrichment stages.
struct WorkItem {
    rel_path: String,
    pending: PendingChunk,
    /// All chunk texts of this item's sub-document, shared so the
    /// contextualized call happens once per sub-document.
    siblings: Arc<Vec<String>>,
    source: SourceMeta,
}

struct EnrichedChunk {
    item: WorkItem,
    text_vector: Vec<f32>,
    code_vector: Option<Vec<f32>>,
    strategy: EmbeddingStrategy,
}

struct KeyedChunk {
    enriched: EnrichedChunk,
    keys: QntmKeys,
}

struct FileProgress {
    abs_path: PathBuf,
    content_hash: String,
    expected: usize,
    stored: usize,
    failed: usize,
    records: Vec<ChunkRecord>,
}

#[derive(Default)]
struct RunState {
    files: HashMap<String, FileProgress>,
    files_processed: usize,
    chunks_stored: usize,
    skipped_files: usize,
    errors: Vec<FileError>,
}

enum PreparedFile {
    Skipped { reason: IngestionReason },
    Empty { content_hash: String },
    Ready {
        content_hash: String,
        items: Vec<WorkItem>,
    },
}

type ContextCache = Arc<tokio::sync::Mutex<HashMap<(String, usize), Arc<OnceCell<Option<Arc<Vec<Vec<f32>>>>>>>>>;

impl IngestPipeline {
    pub fn new(
        services: Arc<dyn PipelineServices>,
        storage: StorageService,
        tracker: FileTracker,
        events: EventBus,
        pause: PauseController,
        watchdog: Option<Arc<ConsolidationWatchdog>>,
        tuning: IngestTuning,
    ) -> Self {
        Self {
            services,
            storage,
            tracker,
            events,
            pause,
            watchdog,
            tuning,
        }
    }

    pub fn collection(&self) -> String {
        collection_name(self.services.text_dimension())
    }

    /// Run one ingest. Per-file failures are collected and the run continues;
    /// a pipeline-level failure aborts the current batch and lands in the
    /// report under the `<pipeline>` pseudo-file.
    #[tracing::instrument(skip_all, fields(paths = params.paths.len()))]
    pub async fn run(&self, params: IngestParams) -> Result<IngestReport, AppError> {
        let started = Instant::now();
        let files = expand_paths(&params)?;

        self.events.emit(AtlasEvent::IngestStarted {
            task_id: None,
            files: files.len(),
        });

        if let (Some(threshold), Some(watchdog)) =
            (params.consolidation_threshold, self.watchdog.as_ref())
        {
            watchdog.set_threshold(threshold);
        }

        let collection = self.collection();
        let mut vectors: BTreeMap<String, usize> = BTreeMap::new();
        vectors.insert("text".to_string(), self.services.text_dimension());
        if self.services.code_embedding_available() {
            vectors.insert("code".to_string(), self.services.text_dimension());
        }
        self.storage.ensure_collection(&collection, vectors).await?;

        let state = Arc::new(std::sync::Mutex::new(RunState::default()));

        let use_toggle =
            params.use_hnsw_toggle && files.len() > self.tuning.hnsw_disable_threshold;
        let outcome = if use_toggle {
            self.storage
                .with_hnsw_disabled(&collection, || {
                    self.process_files(&collection, files, &params, Arc::clone(&state))
                })
                .await
        } else {
            self.process_files(&collection, files, &params, Arc::clone(&state))
                .await
        };

        if let Err(err) = outcome {
            warn!(error = %err, "ingest pipeline aborted");
            self.events.emit(AtlasEvent::IngestError {
                phase: ErrorPhase::Store,
                message: err.to_string(),
                file: None,
            });
            lock(&state).errors.push(FileError {
                file: "<pipeline>".to_string(),
                error: err.to_string(),
            });
        }

        let state = lock(&state);
        let report = IngestReport {
            files_processed: state.files_processed,
            chunks_stored: state.chunks_stored,
            skipped_files: state.skipped_files,
            errors: state.errors.clone(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        drop(state);

        self.events.emit(AtlasEvent::IngestCompleted {
            files_processed: report.files_processed,
            chunks_stored: report.chunks_stored,
            skipped: report.skipped_files,
            errors: report.errors.len(),
        });

        info!(
            files = report.files_processed,
            chunks = report.chunks_stored,
            skipped = report.skipped_files,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "ingest run finished"
        );

        Ok(report)
    }

    async fn process_files(
        &self,
        collection: &str,
        files: Vec<(PathBuf, String)>,
        params: &IngestParams,
        state: Arc<std::sync::Mutex<RunState>>,
    ) -> Result<(), AppError> {
        let verbose = params.verbose;
        let allow_consolidation = params.allow_consolidation;
        let chunk_stream = self.chunk_stream(files, Arc::clone(&state));

        let context_cache: ContextCache = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let services = Arc::clone(&self.services);
        let events = self.events.clone();
        let embedded = parallel(
            chunk_stream,
            move |item| {
                let services = Arc::clone(&services);
                let cache = Arc::clone(&context_cache);
                let events = events.clone();
                async move { embed_item(services, cache, events, item).await }
            },
            self.tuning.embed_concurrency,
        );

        // Embedding failures abort the chunk; the file continues.
        let state_for_embed = Arc::clone(&state);
        let events_for_embed = self.events.clone();
        let embedded_ok = embedded.filter_map(move |result| {
            let state = Arc::clone(&state_for_embed);
            let events = events_for_embed.clone();
            async move {
                match result {
                    Ok(enriched) => Some(enriched),
                    Err((rel_path, err)) => {
                        events.emit(AtlasEvent::IngestError {
                            phase: ErrorPhase::Embed,
                            message: err.to_string(),
                            file: Some(rel_path.clone()),
                        });
                        let mut state = lock(&state);
                        if let Some(progress) = state.files.get_mut(&rel_path) {
                            progress.failed += 1;
                        }
                        state.errors.push(FileError {
                            file: rel_path,
                            error: err.to_string(),
                        });
                        None
                    }
                }
            }
        });

        let services = Arc::clone(&self.services);
        let existing_keys: Arc<Vec<String>> = Arc::new(params.existing_keys.clone());
        let keyed = adaptive_parallel(
            embedded_ok,
            move |enriched: EnrichedChunk| {
                let services = Arc::clone(&services);
                let existing_keys = Arc::clone(&existing_keys);
                async move {
                    let keys = services
                        .generate_qntm_keys(
                            &enriched.item.pending.text,
                            &existing_keys,
                            QntmContext {
                                file_name: enriched.item.source.file_name.clone(),
                                chunk_index: enriched.item.pending.chunk_index,
                                total_chunks: enriched.item.pending.total_chunks,
                            },
                        )
                        .await;
                    KeyedChunk { enriched, keys }
                }
            },
            self.tuning.qntm_policy,
        );

        let batches = batch(keyed, self.tuning.batch_size, self.tuning.batch_timeout);
        pin_mut!(batches);

        while let Some(group) = batches.next().await {
            // Consolidation gating: no batch enters the upsert stage while the
            // watchdog holds the pause flag.
            self.pause.wait_until_resumed().await;
            let guard = self.pause.begin_upsert(group.len());

            let model = self.services.text_model_name();
            let points: Vec<(String, Point)> = group
                .into_iter()
                .map(|keyed| {
                    let rel = keyed.enriched.item.rel_path.clone();
                    (rel, build_point(keyed, &model))
                })
                .collect();

            let upsert_result = self
                .storage
                .upsert_chunks(collection, points.iter().map(|(_, p)| p.clone()).collect())
                .await;
            drop(guard);

            match upsert_result {
                Ok(()) => {
                    self.acknowledge_batch(points, &state, verbose, allow_consolidation)
                        .await?
                }
                Err(err) => {
                    // The batch is lost; every file with a chunk in it is
                    // marked failed and the run continues.
                    warn!(error = %err, "upsert batch failed");
                    self.events.emit(AtlasEvent::IngestError {
                        phase: ErrorPhase::Store,
                        message: err.to_string(),
                        file: None,
                    });
                    let mut state = lock(&state);
                    let mut seen: Vec<String> = Vec::new();
                    for (rel_path, point) in points {
                        if let Some(progress) = state.files.get_mut(&rel_path) {
                            progress.failed += 1;
                        }
                        if !seen.contains(&rel_path) {
                            seen.push(rel_path.clone());
                            state.errors.push(FileError {
                                file: rel_path,
                                error: format!("batch upsert failed: {err}"),
                            });
                        }
                        debug!(chunk_id = %point.id, "chunk dropped with failed batch");
                    }
                }
            }
        }

        Ok(())
    }

    /// Per-point bookkeeping after a successful upsert: stored events, file
    /// completion, tracker records and the watchdog counter.
    async fn acknowledge_batch(
        &self,
        points: Vec<(String, Point)>,
        state: &Arc<std::sync::Mutex<RunState>>,
        verbose: bool,
        allow_consolidation: bool,
    ) -> Result<(), AppError> {
        let mut completions: Vec<(String, PathBuf, String, Vec<ChunkRecord>)> = Vec::new();

        {
            let mut state = lock(state);
            for (rel_path, point) in &points {
                state.chunks_stored += 1;
                if verbose {
                    info!(chunk_id = %point.id, path = %rel_path, "chunk stored");
                } else {
                    debug!(chunk_id = %point.id, path = %rel_path, "chunk stored");
                }
                self.events.emit(AtlasEvent::ChunkStored {
                    chunk_id: point.id.clone(),
                    path: rel_path.clone(),
                    at: Utc::now(),
                });

                if let Some(progress) = state.files.get_mut(rel_path) {
                    progress.stored += 1;
                    progress.records.push(ChunkRecord::new(
                        &progress.abs_path.to_string_lossy(),
                        point.payload.split.map_or(point.payload.chunk_index, |s| {
                            s.chunk_index_global
                        }),
                        sha256_hex(point.payload.text.as_bytes()),
                        point.id.clone(),
                    ));

                    if progress.failed == 0 && progress.stored == progress.expected {
                        completions.push((
                            rel_path.clone(),
                            progress.abs_path.clone(),
                            progress.content_hash.clone(),
                            std::mem::take(&mut progress.records),
                        ));
                    }
                }
            }
        }

        for (rel_path, abs_path, content_hash, records) in completions {
            let chunk_count = records.len();
            self.tracker
                .record_ingestion(&abs_path, content_hash, records)
                .await?;
            {
                let mut state = lock(state);
                state.files_processed += 1;
            }
            self.events.emit(AtlasEvent::FileCompleted {
                path: rel_path,
                chunks: chunk_count,
            });
            if allow_consolidation {
                if let Some(watchdog) = &self.watchdog {
                    watchdog.record_ingestion(1);
                }
            }
        }

        Ok(())
    }

    /// Sequentially prepares files and yields their chunks; the downstream
    /// operators overlap files on their own.
    fn chunk_stream(
        &self,
        files: Vec<(PathBuf, String)>,
        state: Arc<std::sync::Mutex<RunState>>,
    ) -> impl Stream<Item = WorkItem> + '_ {
        let events = self.events.clone();
        stream! {
            for (abs_path, rel_path) in files {
                match self.prepare_file(&abs_path, &rel_path).await {
                    Ok(PreparedFile::Skipped { reason }) => {
                        events.emit(AtlasEvent::FileSkipped {
                            path: rel_path.clone(),
                            reason: reason.as_str().to_string(),
                        });
                        let mut state = lock(&state);
                        state.skipped_files += 1;
                        if reason == IngestionReason::Unchanged {
                            state.files_processed += 1;
                        }
                    }
                    Ok(PreparedFile::Empty { content_hash }) => {
                        // Nothing chunkable, but the source is now tracked.
                        events.emit(AtlasEvent::FileStarted {
                            path: rel_path.clone(),
                            chunks: 0,
                        });
                        if let Err(err) = self
                            .tracker
                            .record_ingestion(&abs_path, content_hash, Vec::new())
                            .await
                        {
                            lock(&state).errors.push(FileError {
                                file: rel_path.clone(),
                                error: err.to_string(),
                            });
                            continue;
                        }
                        lock(&state).files_processed += 1;
                        events.emit(AtlasEvent::FileCompleted {
                            path: rel_path.clone(),
                            chunks: 0,
                        });
                    }
                    Ok(PreparedFile::Ready { content_hash, items }) => {
                        events.emit(AtlasEvent::FileStarted {
                            path: rel_path.clone(),
                            chunks: items.len(),
                        });
                        lock(&state).files.insert(
                            rel_path.clone(),
                            FileProgress {
                                abs_path: abs_path.clone(),
                                content_hash,
                                expected: items.len(),
                                stored: 0,
                                failed: 0,
                                records: Vec::new(),
                            },
                        );
                        for item in items {
                            yield item;
                        }
                    }
                    Err(err) => {
                        events.emit(AtlasEvent::IngestError {
                            phase: ErrorPhase::Read,
                            message: err.to_string(),
                            file: Some(rel_path.clone()),
                        });
                        lock(&state).errors.push(FileError {
                            file: rel_path.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    async fn prepare_file(
        &self,
        abs_path: &Path,
        rel_path: &str,
    ) -> Result<PreparedFile, AppError> {
        let decision = self.tracker.needs_ingestion(abs_path).await?;
        if !decision.needs {
            return Ok(PreparedFile::Skipped {
                reason: decision.reason,
            });
        }
        let content_hash = decision
            .content_hash
            .ok_or_else(|| AppError::InternalError("tracker omitted content hash".into()))?;

        let extension = abs_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let content_type = ContentType::from_extension(&extension);
        if content_type == ContentType::Media {
            // No multimodal embedding is wired up; media files are ignored
            // rather than failed.
            return Ok(PreparedFile::Skipped {
                reason: IngestionReason::Ignored,
            });
        }

        let text = tokio::fs::read_to_string(abs_path).await?;
        let chunks = split_text(&text, content_type, &extension, &self.tuning.chunker)?;
        if chunks.is_empty() {
            return Ok(PreparedFile::Empty { content_hash });
        }

        let pending = apply_context_window(chunks, self.services.contextualized_token_limit());

        // Group sibling texts per sub-document for the contextualized calls.
        let mut sibling_groups: HashMap<usize, Arc<Vec<String>>> = HashMap::new();
        for split_index in pending
            .iter()
            .map(|p| p.split.map_or(0, |s| s.split_index))
            .collect::<std::collections::BTreeSet<_>>()
        {
            let texts: Vec<String> = pending
                .iter()
                .filter(|p| p.split.map_or(0, |s| s.split_index) == split_index)
                .map(|p| p.text.clone())
                .collect();
            sibling_groups.insert(split_index, Arc::new(texts));
        }

        let file_name = abs_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel_path.to_string());
        let source = SourceMeta {
            file_path: rel_path.to_string(),
            file_name,
            extension,
            content_type,
        };

        let items = pending
            .into_iter()
            .map(|pending| {
                let split_index = pending.split.map_or(0, |s| s.split_index);
                WorkItem {
                    rel_path: rel_path.to_string(),
                    siblings: Arc::clone(
                        sibling_groups
                            .get(&split_index)
                            .unwrap_or(&Arc::new(Vec::new())),
                    ),
                    pending,
                    source: source.clone(),
                }
            })
            .collect();

        Ok(PreparedFile::Ready {
            content_hash,
            items,
        })
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Embed one chunk: contextualized with per-sub-document single-flight when
/// available, snippet otherwise; plus a code vector for code chunks when a
/// code backend is registered.
async fn embed_item(
    services: Arc<dyn PipelineServices>,
    cache: ContextCache,
    events: EventBus,
    item: WorkItem,
) -> Result<EnrichedChunk, (String, AppError)> {
    let rel = item.rel_path.clone();
    let mut strategy = EmbeddingStrategy::Snippet;
    let mut text_vector: Option<Vec<f32>> = None;

    if services.contextualized_available() {
        let key = (
            item.rel_path.clone(),
            item.pending.split.map_or(0, |s| s.split_index),
        );
        let cell = {
            let mut map = cache.lock().await;
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(OnceCell::new())))
        };

        let siblings = Arc::clone(&item.siblings);
        let services_for_cell = Arc::clone(&services);
        let vectors = cell
            .get_or_init(|| async move {
                match services_for_cell.embed_contextualized(&siblings).await {
                    Ok(Some(vectors)) => Some(Arc::new(vectors)),
                    Ok(None) => None,
                    Err(err) => {
                        // Contextualized configured but unavailable: fall back
                        // to snippet embedding for this sub-document.
                        warn!(error = %err, "contextualized embedding failed; falling back to snippet");
                        None
                    }
                }
            })
            .await;

        if let Some(vectors) = vectors {
            if let Some(vector) = vectors.get(item.pending.chunk_index) {
                text_vector = Some(vector.clone());
                strategy = EmbeddingStrategy::Contextualized;
            }
        }
    }

    let text_vector = match text_vector {
        Some(vector) => vector,
        None => services
            .embed_snippet(&item.pending.text)
            .await
            .map_err(|err| (rel.clone(), err))?,
    };

    let code_vector = if item.source.content_type == ContentType::Code {
        match services.embed_code(&item.pending.text).await {
            Ok(vector) => vector,
            Err(err) => {
                // Degrade to text-only rather than losing the chunk.
                warn!(file = %rel, error = %err, "code embedding failed; storing text vector only");
                None
            }
        }
    } else {
        None
    };

    events.emit(AtlasEvent::ChunkEmbedded {
        chunk_id: chunk_id(&item.source.file_path, item.pending.identity_index()),
        path: rel,
    });

    Ok(EnrichedChunk {
        item,
        text_vector,
        code_vector,
        strategy,
    })
}

fn build_point(keyed: KeyedChunk, model: &str) -> Point {
    let KeyedChunk { enriched, keys } = keyed;
    let EnrichedChunk {
        item,
        text_vector,
        code_vector,
        strategy,
    } = enriched;

    let mut chunk = Chunk::new(
        item.source.clone(),
        item.pending.text.clone(),
        item.pending.chunk_index,
        item.pending.total_chunks,
        EmbeddingMeta {
            model: model.to_string(),
            strategy,
        },
    );
    // Identity uses the global index for split files.
    chunk.id = chunk_id(&item.source.file_path, item.pending.identity_index());
    chunk.split = item.pending.split;
    chunk.qntm_keys = keys.keys;

    let mut vectors = HashMap::new();
    vectors.insert("text".to_string(), text_vector);
    if let Some(code_vector) = code_vector {
        vectors.insert("code".to_string(), code_vector);
    }
    chunk.vector_names = {
        let mut names: Vec<String> = vectors.keys().cloned().collect();
        names.sort();
        names
    };

    Point {
        id: chunk.id.clone(),
        vectors,
        payload: chunk,
    }
}

/// Resolve input paths under the declared root; paths outside it are
/// rejected. Directories expand to their files, recursively on request.
fn expand_paths(params: &IngestParams) -> Result<Vec<(PathBuf, String)>, AppError> {
    let root = params
        .root_dir
        .canonicalize()
        .map_err(|err| AppError::Validation(format!("root_dir unusable: {err}")))?;

    let mut out: Vec<(PathBuf, String)> = Vec::new();
    for path in &params.paths {
        let abs = if path.is_absolute() {
            path.clone()
        } else {
            root.join(path)
        };
        let abs = abs
            .canonicalize()
            .map_err(|err| AppError::Validation(format!("{}: {err}", path.display())))?;

        if !abs.starts_with(&root) {
            return Err(AppError::Validation(format!(
                "{} is outside the ingest root {}",
                abs.display(),
                root.display()
            )));
        }

        if abs.is_dir() {
            collect_dir(&abs, &root, params.recursive, &mut out)?;
        } else {
            push_file(abs, &root, &mut out);
        }
    }

    out.sort_by(|a, b| a.1.cmp(&b.1));
    out.dedup_by(|a, b| a.1 == b.1);
    Ok(out)
}

fn collect_dir(
    dir: &Path,
    root: &Path,
    recursive: bool,
    out: &mut Vec<(PathBuf, String)>,
) -> Result<(), AppError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_dir(&path, root, recursive, out)?;
            }
        } else {
            push_file(path, root, out);
        }
    }
    Ok(())
}

fn push_file(abs: PathBuf, root: &Path, out: &mut Vec<(PathBuf, String)>) {
    let rel = abs
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| abs.to_string_lossy().into_owned());
    out.push((abs, rel));
}

#[cfg(test)]
mod tests;
