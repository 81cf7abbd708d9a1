use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::chunk::Chunk;
use crate::storage::types::surreal_serde;

const QNTM_KEYS_KEY: &str = "qntm_keys";
const STATS_KEY: &str = "stats";

/// Optional KV tier. Reads degrade to `None` on any failure; writes are
/// fire-and-forget. Nothing in the ingest or search path may fail because the
/// cache is down.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_qntm_keys(&self) -> Option<Vec<String>>;
    async fn set_qntm_keys(&self, keys: &[String]);
    async fn invalidate_qntm_keys(&self);

    async fn get_chunk(&self, id: &str) -> Option<Chunk>;
    async fn set_chunk(&self, chunk: &Chunk, ttl: Duration);
    async fn invalidate_chunk(&self, id: &str);
    async fn mget(&self, ids: &[String]) -> Vec<Option<Chunk>>;
    async fn mset(&self, chunks: &[Chunk], ttl: Duration);

    async fn get_stats(&self) -> Option<serde_json::Value>;
    async fn set_stats(&self, stats: &serde_json::Value);

    async fn health_check(&self) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRow {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    id: String,
    /// JSON-encoded payload; opaque to the store.
    value: String,
    #[serde(with = "surreal_serde::option_datetime", default)]
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// Cache entries live in the `cache_entry` table next to everything else.
pub struct SurrealCache {
    db: Arc<SurrealDbClient>,
}

impl SurrealCache {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    async fn read(&self, key: &str) -> Option<String> {
        let row: Option<CacheRow> = match self.db.client.select(("cache_entry", key)).await {
            Ok(row) => row,
            Err(err) => {
                warn!(key, error = %err, "cache read failed");
                return None;
            }
        };
        let row = row?;

        if let Some(expires_at) = row.expires_at {
            if expires_at <= Utc::now() {
                // Expired entry; drop opportunistically.
                let _: Result<Option<CacheRow>, _> =
                    self.db.client.delete(("cache_entry", key)).await;
                return None;
            }
        }
        Some(row.value)
    }

    async fn write(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|delta| Utc::now() + delta)
        });
        let row = CacheRow {
            id: key.to_string(),
            value,
            expires_at,
        };
        let result: Result<Option<CacheRow>, _> = self
            .db
            .client
            .upsert(("cache_entry", key))
            .content(row)
            .await;
        if let Err(err) = result {
            warn!(key, error = %err, "cache write failed");
        }
    }

    async fn remove(&self, key: &str) {
        let result: Result<Option<CacheRow>, _> =
            self.db.client.delete(("cache_entry", key)).await;
        if let Err(err) = result {
            warn!(key, error = %err, "cache invalidation failed");
        }
    }

    fn chunk_key(id: &str) -> String {
        format!("chunk_{id}")
    }
}

#[async_trait]
impl Cache for SurrealCache {
    async fn get_qntm_keys(&self) -> Option<Vec<String>> {
        let raw = self.read(QNTM_KEYS_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(keys) => Some(keys),
            Err(err) => {
                warn!(error = %err, "cached qntm keys failed to decode");
                None
            }
        }
    }

    async fn set_qntm_keys(&self, keys: &[String]) {
        match serde_json::to_string(keys) {
            Ok(encoded) => self.write(QNTM_KEYS_KEY, encoded, None).await,
            Err(err) => warn!(error = %err, "qntm keys failed to encode"),
        }
    }

    async fn invalidate_qntm_keys(&self) {
        self.remove(QNTM_KEYS_KEY).await;
    }

    async fn get_chunk(&self, id: &str) -> Option<Chunk> {
        let raw = self.read(&Self::chunk_key(id)).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn set_chunk(&self, chunk: &Chunk, ttl: Duration) {
        match serde_json::to_string(chunk) {
            Ok(encoded) => self.write(&Self::chunk_key(&chunk.id), encoded, Some(ttl)).await,
            Err(err) => warn!(chunk_id = %chunk.id, error = %err, "chunk failed to encode"),
        }
    }

    async fn invalidate_chunk(&self, id: &str) {
        self.remove(&Self::chunk_key(id)).await;
    }

    async fn mget(&self, ids: &[String]) -> Vec<Option<Chunk>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_chunk(id).await);
        }
        out
    }

    async fn mset(&self, chunks: &[Chunk], ttl: Duration) {
        for chunk in chunks {
            self.set_chunk(chunk, ttl).await;
        }
    }

    async fn get_stats(&self) -> Option<serde_json::Value> {
        let raw = self.read(STATS_KEY).await?;
        serde_json::from_str(&raw).ok()
    }

    async fn set_stats(&self, stats: &serde_json::Value) {
        match serde_json::to_string(stats) {
            Ok(encoded) => self.write(STATS_KEY, encoded, None).await,
            Err(err) => warn!(error = %err, "stats failed to encode"),
        }
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.db.client.query("RETURN 1;").await?.check()?;
        Ok(())
    }
}
