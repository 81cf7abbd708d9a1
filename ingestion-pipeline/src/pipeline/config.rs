use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::chunker::ChunkerConfig;
use crate::stream_ops::AdaptivePolicy;

#[derive(Debug, Clone)]
pub struct IngestTuning {
    /// Concurrent embedding calls.
    pub embed_concurrency: usize,
    /// Adaptive concurrency policy for QNTM key generation.
    pub qntm_policy: AdaptivePolicy,
    /// Upsert batch bounds.
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// File count above which the HNSW index is dropped for the run.
    pub hnsw_disable_threshold: usize,
    pub chunker: ChunkerConfig,
}

impl Default for IngestTuning {
    fn default() -> Self {
        Self {
            embed_concurrency: 3,
            qntm_policy: AdaptivePolicy::default(),
            batch_size: 50,
            batch_timeout: Duration::from_secs(15),
            hnsw_disable_threshold: 64,
            chunker: ChunkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestParams {
    pub paths: Vec<PathBuf>,
    pub recursive: bool,
    /// Paths outside this root are rejected; relative paths inside it carry
    /// display and identity.
    pub root_dir: PathBuf,
    /// Seed vocabulary for QNTM key generation.
    pub existing_keys: Vec<String>,
    pub use_hnsw_toggle: bool,
    /// Per-chunk progress at info level instead of debug.
    pub verbose: bool,
    /// When false this run does not feed the consolidation watchdog.
    pub allow_consolidation: bool,
    /// Per-run override of the watchdog trigger threshold.
    pub consolidation_threshold: Option<u64>,
}

impl IngestParams {
    pub fn new(paths: Vec<PathBuf>, root_dir: PathBuf) -> Self {
        Self {
            paths,
            recursive: false,
            root_dir,
            existing_keys: Vec::new(),
            use_hnsw_toggle: true,
            verbose: false,
            allow_consolidation: true,
            consolidation_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files_processed: usize,
    pub chunks_stored: usize,
    pub skipped_files: usize,
    pub errors: Vec<FileError>,
    pub duration_ms: u64,
}
