pub mod classify;
pub mod engine;
pub mod vacuum;

pub use classify::{Classification, KeepChoice};
pub use engine::{
    CandidatePreview, ConsolidateParams, ConsolidateReport, ConsolidationEngine,
    ConsolidationTuning,
};
pub use vacuum::{vacuum_chunks, VacuumParams, VacuumReport, DEFAULT_GRACE_DAYS};
