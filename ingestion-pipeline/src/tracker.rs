use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::source_record::{ChunkRecord, SourceRecord};
use common::storage::types::StoredObject;
use common::utils::hash::sha256_hex;

/// Extensions the tracker refuses outright; nothing useful can be chunked
/// from them.
const IGNORED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "o", "bin", "zip", "tar", "gz", "xz", "zst", "7z",
    "class", "pyc", "wasm", "ico", "woff", "woff2", "ttf", "otf", "pdf",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionReason {
    New,
    ContentChanged,
    Unchanged,
    Ignored,
}

impl IngestionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::ContentChanged => "content-changed",
            Self::Unchanged => "unchanged",
            Self::Ignored => "ignored",
        }
    }
}

#[derive(Debug)]
pub struct IngestionDecision {
    pub needs: bool,
    pub reason: IngestionReason,
    /// The file's content hash, when the file was readable.
    pub content_hash: Option<String>,
    /// Active chunk records for an already-tracked source.
    pub existing: Option<Vec<ChunkRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub sources: u64,
    pub active_chunks: u64,
    pub superseded_chunks: u64,
}

/// Content-addressed record of what has been ingested. The tracker never
/// stores vectors; it only asserts identity and supersession. Writes are
/// serialised by the database; callers treat it as linearisable.
#[derive(Clone)]
pub struct FileTracker {
    db: Arc<SurrealDbClient>,
}

impl FileTracker {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    fn source_id(path: &str) -> String {
        let mut id = sha256_hex(path.as_bytes());
        id.truncate(32);
        id
    }

    /// Compare the file's current content hash against the stored one.
    /// A concurrent modification during hashing is acceptable; at worst the
    /// next ingest re-indexes once.
    pub async fn needs_ingestion(&self, path: &Path) -> Result<IngestionDecision, AppError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if IGNORED_EXTENSIONS.contains(&extension.as_str()) {
            return Ok(IngestionDecision {
                needs: false,
                reason: IngestionReason::Ignored,
                content_hash: None,
                existing: None,
            });
        }

        let bytes = tokio::fs::read(path).await?;
        let content_hash = sha256_hex(&bytes);
        let path_str = path.to_string_lossy().into_owned();

        let existing: Option<SourceRecord> =
            self.db.get_item(&Self::source_id(&path_str)).await?;

        match existing {
            None => Ok(IngestionDecision {
                needs: true,
                reason: IngestionReason::New,
                content_hash: Some(content_hash),
                existing: None,
            }),
            Some(record) if record.content_hash == content_hash => {
                let chunks = self.active_chunks(&path_str).await?;
                Ok(IngestionDecision {
                    needs: false,
                    reason: IngestionReason::Unchanged,
                    content_hash: Some(content_hash),
                    existing: Some(chunks),
                })
            }
            Some(_) => {
                let chunks = self.active_chunks(&path_str).await?;
                Ok(IngestionDecision {
                    needs: true,
                    reason: IngestionReason::ContentChanged,
                    content_hash: Some(content_hash),
                    existing: Some(chunks),
                })
            }
        }
    }

    /// Upsert the source record, mark the previous chunk rows superseded with
    /// a timestamp, and store the new chunk list.
    pub async fn record_ingestion(
        &self,
        path: &Path,
        content_hash: String,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), AppError> {
        let path_str = path.to_string_lossy().into_owned();
        let modified_at = file_mtime(path).unwrap_or_else(Utc::now);

        self.db
            .client
            .query(format!(
                "UPDATE {} SET superseded_at = time::now() \
                 WHERE source_path = $path AND superseded_at = NONE;",
                ChunkRecord::table_name()
            ))
            .bind(("path", path_str.clone()))
            .await?
            .check()?;

        for chunk in chunks {
            self.db.store_item(chunk).await?;
        }

        self.db
            .upsert_item(SourceRecord {
                id: Self::source_id(&path_str),
                path: path_str.clone(),
                content_hash,
                modified_at,
                ingested_at: Utc::now(),
            })
            .await?;

        debug!(path = %path_str, "ingestion recorded");
        Ok(())
    }

    /// Superseded chunk rows old enough for removal under `grace`.
    pub async fn vacuum_preview(&self, grace: Duration) -> Result<u64, AppError> {
        let cutoff: surrealdb::sql::Datetime = (Utc::now() - grace).into();

        #[derive(Deserialize)]
        struct CountRow {
            total: u64,
        }

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT count() AS total FROM {} \
                 WHERE superseded_at != NONE AND superseded_at <= $cutoff GROUP ALL;",
                ChunkRecord::table_name()
            ))
            .bind(("cutoff", cutoff))
            .await?;
        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.total))
    }

    /// Remove superseded chunk rows older than `grace`. Returns the number
    /// removed.
    pub async fn vacuum(&self, grace: Duration) -> Result<u64, AppError> {
        let cutoff: surrealdb::sql::Datetime = (Utc::now() - grace).into();
        let removable = self.vacuum_preview(grace).await?;

        if removable > 0 {
            self.db
                .client
                .query(format!(
                    "DELETE {} WHERE superseded_at != NONE AND superseded_at <= $cutoff;",
                    ChunkRecord::table_name()
                ))
                .bind(("cutoff", cutoff))
                .await?
                .check()?;
        }

        Ok(removable)
    }

    pub async fn stats(&self) -> Result<TrackerStats, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            total: u64,
        }

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT count() AS total FROM {} GROUP ALL;",
                SourceRecord::table_name()
            ))
            .query(format!(
                "SELECT count() AS total FROM {} WHERE superseded_at = NONE GROUP ALL;",
                ChunkRecord::table_name()
            ))
            .query(format!(
                "SELECT count() AS total FROM {} WHERE superseded_at != NONE GROUP ALL;",
                ChunkRecord::table_name()
            ))
            .await?;

        let sources: Option<CountRow> = response.take(0)?;
        let active: Option<CountRow> = response.take(1)?;
        let superseded: Option<CountRow> = response.take(2)?;

        Ok(TrackerStats {
            sources: sources.map_or(0, |r| r.total),
            active_chunks: active.map_or(0, |r| r.total),
            superseded_chunks: superseded.map_or(0, |r| r.total),
        })
    }

    async fn active_chunks(&self, path: &str) -> Result<Vec<ChunkRecord>, AppError> {
        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT * FROM {} \
                 WHERE source_path = $path AND superseded_at = NONE \
                 ORDER BY chunk_index ASC;",
                ChunkRecord::table_name()
            ))
            .bind(("path", path.to_string()))
            .await?;
        let chunks: Vec<ChunkRecord> = response.take(0)?;
        Ok(chunks)
    }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
