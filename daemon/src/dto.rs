//! Wire DTOs. Every canonical field of the service types appears here and
//! round-trips unchanged; the router never drops a field in either direction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::storage::types::chunk::Chunk;
use ingestion_pipeline::pipeline::{FileError, IngestReport};
use consolidation_engine::{CandidatePreview, ConsolidateReport};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestParamsDto {
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_keys: Option<Vec<String>>,
    #[serde(rename = "useHNSWToggle", skip_serializing_if = "Option::is_none")]
    pub use_hnsw_toggle: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_consolidation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation_threshold: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileErrorDto {
    pub file: String,
    pub error: String,
}

impl From<FileError> for FileErrorDto {
    fn from(value: FileError) -> Self {
        Self {
            file: value.file,
            error: value.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResultDto {
    pub files_processed: usize,
    pub chunks_stored: usize,
    pub errors: Vec<FileErrorDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_files: Option<usize>,
}

impl From<IngestReport> for IngestResultDto {
    fn from(report: IngestReport) -> Self {
        Self {
            files_processed: report.files_processed,
            chunks_stored: report.chunks_stored,
            errors: report.errors.into_iter().map(FileErrorDto::from).collect(),
            duration_ms: Some(report.duration_ms),
            peak_memory_bytes: None,
            skipped_files: Some(report.skipped_files),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchParamsDto {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qntm_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_top_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand_query: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,
}

/// Search result rows keep the storage-level snake_case names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResultDto {
    pub id: String,
    pub text: String,
    pub file_path: String,
    pub chunk_index: usize,
    pub score: f32,
    pub created_at: String,
    pub qntm_keys: Vec<String>,
}

impl SearchResultDto {
    pub fn from_hit(score: f32, chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            text: chunk.text.clone(),
            file_path: chunk.source.file_path.clone(),
            chunk_index: chunk.chunk_index,
            score,
            created_at: chunk.created_at.to_rfc3339(),
            qntm_keys: chunk.qntm_keys.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidateParamsDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qntm_key_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePreviewDto {
    pub first: String,
    pub second: String,
    pub similarity: f32,
}

impl From<CandidatePreview> for CandidatePreviewDto {
    fn from(value: CandidatePreview) -> Self {
        Self {
            first: value.first,
            second: value.second,
            similarity: value.similarity,
        }
    }
}

/// Deliberately excludes legacy `rounds`/`maxLevel`/`levelStats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidateResultDto {
    pub consolidations_performed: usize,
    pub chunks_absorbed: usize,
    pub candidates_evaluated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_breakdown: Option<std::collections::HashMap<String, usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<CandidatePreviewDto>>,
}

impl From<ConsolidateReport> for ConsolidateResultDto {
    fn from(report: ConsolidateReport) -> Self {
        Self {
            consolidations_performed: report.consolidations_performed,
            chunks_absorbed: report.chunks_absorbed,
            candidates_evaluated: report.candidates_evaluated,
            type_breakdown: if report.type_breakdown.is_empty() {
                None
            } else {
                Some(report.type_breakdown)
            },
            duration_ms: Some(report.duration_ms),
            preview: report
                .preview
                .map(|pairs| pairs.into_iter().map(CandidatePreviewDto::from).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QntmContextDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QntmGenerateParamsDto {
    pub text: String,
    #[serde(default)]
    pub existing_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<QntmContextDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QntmGenerateResultDto {
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineParamsDto {
    pub since: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qntm_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_causal_links: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CausalLinkDto {
    pub from_chunk: String,
    pub to_chunk: String,
    pub relation: String,
    pub confidence: f32,
    pub inferred_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineChunkDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    pub id: String,
    pub text: String,
    pub file_path: String,
    pub created_at: String,
    pub qntm_keys: Vec<String>,
    pub consolidation_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causal_links: Option<Vec<CausalLinkDto>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineResultDto {
    pub chunks: Vec<TimelineChunkDto>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestStartParamsDto {
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusParamsDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStopParamsDto {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecordDto {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub paths: Vec<String>,
    pub watching: bool,
    pub files_processed: usize,
    pub chunks_stored: usize,
    pub errors: Vec<FileErrorDto>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidateStartResultDto {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
