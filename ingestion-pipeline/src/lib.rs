pub mod chunker;
pub mod pause;
pub mod pipeline;
pub mod stream_ops;
pub mod tracker;
pub mod watchdog;

pub use pause::PauseController;
pub use pipeline::{
    DefaultPipelineServices, FileError, IngestParams, IngestPipeline, IngestReport, IngestTuning,
    PipelineServices,
};
pub use tracker::{FileTracker, IngestionDecision, IngestionReason, TrackerStats};
pub use watchdog::{
    ConsolidationOutcome, ConsolidationRunner, ConsolidationWatchdog, WatchdogConfig,
};
