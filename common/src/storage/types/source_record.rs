use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::types::{surreal_serde, StoredObject};

/// One ingested file, keyed by its absolute path.
///
/// The tracker does not store vectors; it only asserts identity and
/// supersession. A source owns its chunk records exclusively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    pub id: String,
    /// Absolute path; duplicated from the record key so queries can bind it.
    pub path: String,
    pub content_hash: String,
    #[serde(with = "surreal_serde::datetime")]
    pub modified_at: DateTime<Utc>,
    #[serde(with = "surreal_serde::datetime")]
    pub ingested_at: DateTime<Utc>,
}

impl StoredObject for SourceRecord {
    fn table_name() -> &'static str {
        "source"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

/// One chunk of a tracked source. Superseded rows keep their timestamp until
/// a vacuum removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    pub id: String,
    pub source_path: String,
    pub chunk_index: usize,
    pub content_hash: String,
    pub chunk_id: String,
    #[serde(with = "surreal_serde::option_datetime", default)]
    pub superseded_at: Option<DateTime<Utc>>,
}

impl StoredObject for ChunkRecord {
    fn table_name() -> &'static str {
        "chunk_record"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl ChunkRecord {
    // Row ids are fresh per ingest; a superseded row and its replacement share
    // a chunk_id but never a row id.
    pub fn new(source_path: &str, chunk_index: usize, content_hash: String, chunk_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_path: source_path.to_string(),
            chunk_index,
            content_hash,
            chunk_id,
            superseded_at: None,
        }
    }
}
