use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which pipeline stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    Read,
    Embed,
    Qntm,
    Store,
}

/// Everything Atlas announces to subscribers, serialised on the wire as
/// `{"type": "...", "data": {...}}` inside an `atlas.event` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AtlasEvent {
    #[serde(rename = "ingest.started")]
    IngestStarted {
        task_id: Option<String>,
        files: usize,
    },
    #[serde(rename = "ingest.file.started")]
    FileStarted { path: String, chunks: usize },
    #[serde(rename = "ingest.file.skipped")]
    FileSkipped { path: String, reason: String },
    #[serde(rename = "ingest.chunk.embedded")]
    ChunkEmbedded { chunk_id: String, path: String },
    #[serde(rename = "ingest.chunk.stored")]
    ChunkStored {
        chunk_id: String,
        path: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "ingest.file.completed")]
    FileCompleted { path: String, chunks: usize },
    #[serde(rename = "ingest.completed")]
    IngestCompleted {
        files_processed: usize,
        chunks_stored: usize,
        skipped: usize,
        errors: usize,
    },
    #[serde(rename = "ingest.error")]
    IngestError {
        phase: ErrorPhase,
        message: String,
        file: Option<String>,
    },

    #[serde(rename = "search.started")]
    SearchStarted { query: String },
    #[serde(rename = "search.activated")]
    SearchActivated { chunk_ids: Vec<String> },
    #[serde(rename = "search.completed")]
    SearchCompleted { results: usize, duration_ms: u64 },
    #[serde(rename = "search.error")]
    SearchError { message: String },

    #[serde(rename = "consolidate.triggered")]
    ConsolidateTriggered {
        task_id: String,
        ingested_since_last: u64,
    },
    #[serde(rename = "consolidate.pair.merged")]
    ConsolidatePairMerged {
        kept: String,
        absorbed: String,
        consolidation_type: String,
    },
    #[serde(rename = "consolidate.completed")]
    ConsolidateCompleted {
        consolidations_performed: usize,
        chunks_absorbed: usize,
        candidates_evaluated: usize,
    },
    #[serde(rename = "consolidate.error")]
    ConsolidateError { message: String },

    #[serde(rename = "watch.file.changed")]
    WatchFileChanged { path: String },
    #[serde(rename = "watch.ingest.queued")]
    WatchIngestQueued { path: String, task_id: String },

    #[serde(rename = "session.compacting")]
    SessionCompacting { session_id: String },
    #[serde(rename = "session.ended")]
    SessionEnded { session_id: String },
    #[serde(rename = "session.ingested")]
    SessionIngested { session_id: String, chunks: usize },
    #[serde(rename = "session.error")]
    SessionError { session_id: String, message: String },

    #[serde(rename = "health.checked")]
    HealthChecked { ok: usize, errors: usize },
    #[serde(rename = "deps.missing")]
    DepsMissing { missing: Vec<String> },
    #[serde(rename = "daemon.started")]
    DaemonStarted { socket: String },
    #[serde(rename = "daemon.stopping")]
    DaemonStopping,
}

/// Fan-out handle for `atlas.*` events. Cloneable; subscribing is cheap and a
/// subscriber that lags simply misses events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AtlasEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    /// Emit an event. Nobody listening is not an error.
    pub fn emit(&self, event: AtlasEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AtlasEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
