use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::types::surreal_serde;
use crate::utils::hash::sha256_hex;

/// Separator between path and index when deriving a chunk identifier.
const ID_SEPARATOR: char = '\u{1f}';
const ID_LEN: usize = 32;

/// Stable chunk identifier, a pure function of (relative path, chunk index).
///
/// Two ingests of the same unchanged file produce identical identifiers.
pub fn chunk_id(relative_path: &str, chunk_index: usize) -> String {
    let mut input = String::with_capacity(relative_path.len() + 24);
    input.push_str(relative_path);
    input.push(ID_SEPARATOR);
    input.push_str(&chunk_index.to_string());
    let mut digest = sha256_hex(input.as_bytes());
    digest.truncate(ID_LEN);
    digest
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Code,
    Media,
}

impl ContentType {
    /// Detect content type from a file extension.
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "rs" | "py" | "js" | "ts" | "tsx" | "jsx" | "go" | "java" | "c" | "h" | "cpp"
            | "hpp" | "cs" | "rb" | "php" | "swift" | "kt" | "scala" | "sh" | "bash" | "zsh"
            | "sql" | "toml" | "yaml" | "yml" | "json" | "xml" | "html" | "css" | "nix" => {
                Self::Code
            }
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "mp3" | "wav" | "mp4" | "mov" => {
                Self::Media
            }
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStrategy {
    Snippet,
    Contextualized,
    Code,
    Multimodal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationType {
    DuplicateWork,
    SequentialIteration,
    ContextualConvergence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationDirection {
    Forward,
    Backward,
    Convergent,
    #[default]
    Unknown,
}

/// Where a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMeta {
    /// Path relative to the ingest root, used for display and identity.
    pub file_path: String,
    pub file_name: String,
    pub extension: String,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingMeta {
    pub model: String,
    pub strategy: EmbeddingStrategy,
}

/// Present when a file exceeded the contextualized backend's window and was
/// split into sub-documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitMeta {
    pub split_index: usize,
    pub split_total: usize,
    pub chunk_index_global: usize,
}

/// Set only once a chunk has been through consolidation (level >= 1), plus
/// the provenance appended to level-0 keepers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConsolidationMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation_type: Option<ConsolidationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<ConsolidationDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abstraction_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub occurrence_timestamps: Vec<DateTime<Utc>>,
}

/// A piece of text extracted from a source file, with everything the store
/// persists as the point payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    pub id: String,
    pub text: String,
    pub source: SourceMeta,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub char_count: usize,
    #[serde(with = "surreal_serde::datetime")]
    pub created_at: DateTime<Utc>,
    pub importance: Importance,
    pub consolidation_level: u8,
    pub embedding: EmbeddingMeta,
    /// Vector names actually stored for this point.
    pub vector_names: Vec<String>,
    pub qntm_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub split: Option<SplitMeta>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub consolidation: Option<ConsolidationMeta>,
    /// Parent chunk identifiers forming the provenance DAG.
    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(with = "surreal_serde::option_datetime", default)]
    pub last_reprocessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reprocess_count: u32,
    #[serde(default)]
    pub access_count: u32,
    #[serde(with = "surreal_serde::option_datetime", default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub superseded_by: Option<String>,
    #[serde(with = "surreal_serde::option_datetime", default)]
    pub deletion_marked_at: Option<DateTime<Utc>>,
}

impl Chunk {
    /// Build a fresh level-0 chunk for newly ingested text.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: SourceMeta,
        text: String,
        chunk_index: usize,
        total_chunks: usize,
        embedding: EmbeddingMeta,
    ) -> Self {
        let char_count = text.chars().count();
        Self {
            id: chunk_id(&source.file_path, chunk_index),
            text,
            source,
            chunk_index,
            total_chunks,
            char_count,
            created_at: Utc::now(),
            importance: Importance::Normal,
            consolidation_level: 0,
            embedding,
            vector_names: Vec::new(),
            qntm_keys: Vec::new(),
            split: None,
            consolidation: None,
            parents: Vec::new(),
            last_reprocessed_at: None,
            reprocess_count: 0,
            access_count: 0,
            last_accessed_at: None,
            deletion_eligible: false,
            superseded_by: None,
            deletion_marked_at: None,
        }
    }

    /// Raise the consolidation level. Levels never decrease; a lower target is
    /// an invariant violation.
    pub fn promote_level(&mut self, level: u8) -> Result<(), AppError> {
        if level < self.consolidation_level {
            return Err(AppError::InternalError(format!(
                "consolidation level may not decrease ({} -> {level}) for chunk {}",
                self.consolidation_level, self.id
            )));
        }
        self.consolidation_level = level;
        Ok(())
    }

    /// Soft-delete: excluded from default search, scannable until vacuumed.
    pub fn mark_deletion_eligible(&mut self, superseded_by: Option<String>) {
        self.deletion_eligible = true;
        self.superseded_by = superseded_by;
        self.deletion_marked_at = Some(Utc::now());
    }

    /// Hotness bucket derived from access counters and recency.
    pub fn temperature(&self, now: DateTime<Utc>) -> Temperature {
        let reference = self.last_accessed_at.unwrap_or(self.created_at);
        if self.access_count >= 5 || now - reference < Duration::days(2) {
            Temperature::Hot
        } else if now - reference < Duration::days(14) {
            Temperature::Warm
        } else {
            Temperature::Cold
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

impl std::str::FromStr for Temperature {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            other => Err(AppError::Validation(format!(
                "unknown temperature bucket: {other}"
            ))),
        }
    }
}
