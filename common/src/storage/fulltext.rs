use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::surreal_serde;

/// Transparent batching threshold for `index`.
const INDEX_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct FullTextDoc {
    pub id: String,
    pub text: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FullTextQuery {
    pub query: String,
    pub limit: usize,
    pub highlight: bool,
}

#[derive(Debug, Clone)]
pub struct FullTextHit {
    pub id: String,
    /// Normalised to [0,1] over the returned set.
    pub score: f32,
    pub highlight: Option<String>,
}

/// Optional keyword tier. Scores surfaced from here are always in [0,1].
#[async_trait]
pub trait FullTextIndex: Send + Sync {
    async fn create_index(&self, collection: &str) -> Result<(), AppError>;
    async fn index(&self, collection: &str, docs: Vec<FullTextDoc>) -> Result<(), AppError>;
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), AppError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), AppError>;
    async fn search(
        &self,
        collection: &str,
        query: FullTextQuery,
    ) -> Result<Vec<FullTextHit>, AppError>;
    async fn health_check(&self) -> Result<(), AppError>;
}

/// BM25 search over a `{collection}_fts` table.
pub struct SurrealFullTextIndex {
    db: Arc<SurrealDbClient>,
}

impl SurrealFullTextIndex {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    fn table(collection: &str) -> String {
        format!("{collection}_fts")
    }
}

#[async_trait]
impl FullTextIndex for SurrealFullTextIndex {
    async fn create_index(&self, collection: &str) -> Result<(), AppError> {
        let table = Self::table(collection);
        let snowball_sql = format!(
            "DEFINE ANALYZER IF NOT EXISTS atlas_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii, snowball(english);
             DEFINE INDEX IF NOT EXISTS idx_{table}_text ON TABLE {table} FIELDS text SEARCH ANALYZER atlas_fts_analyzer BM25 HIGHLIGHTS;"
        );

        if let Err(err) = self.db.client.query(snowball_sql).await {
            // Fall back to ascii-only analyzer when snowball is unavailable in the build.
            debug!(error = %err, "snowball analyzer unavailable, falling back to ascii");
            let fallback_sql = format!(
                "DEFINE ANALYZER OVERWRITE atlas_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii;
                 DEFINE INDEX IF NOT EXISTS idx_{table}_text ON TABLE {table} FIELDS text SEARCH ANALYZER atlas_fts_analyzer BM25 HIGHLIGHTS;"
            );
            self.db.client.query(fallback_sql).await?.check()?;
        }

        Ok(())
    }

    async fn index(&self, collection: &str, docs: Vec<FullTextDoc>) -> Result<(), AppError> {
        let table = Self::table(collection);
        for batch in docs.chunks(INDEX_BATCH) {
            let mut query = self.db.client.query("BEGIN TRANSACTION;");
            let mut binds: Vec<(String, String)> = Vec::new();
            let mut date_binds: Vec<(String, surrealdb::sql::Datetime)> = Vec::new();

            for (i, doc) in batch.iter().enumerate() {
                query = query.query(format!(
                    "UPSERT type::thing('{table}', $ft_id_{i}) SET \
                        text = $ft_text_{i}, \
                        file_path = $ft_path_{i}, \
                        created_at = $ft_created_{i};"
                ));
                binds.push((format!("ft_id_{i}"), doc.id.clone()));
                binds.push((format!("ft_text_{i}"), doc.text.clone()));
                binds.push((format!("ft_path_{i}"), doc.file_path.clone()));
                date_binds.push((format!("ft_created_{i}"), doc.created_at.into()));
            }

            query = query.query("COMMIT TRANSACTION;");
            for (name, value) in binds {
                query = query.bind((name, value));
            }
            for (name, value) in date_binds {
                query = query.bind((name, value));
            }
            query.await?.check()?;
        }
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), AppError> {
        let table = Self::table(collection);
        self.db
            .client
            .query(format!("UPDATE type::thing('{table}', $id) MERGE $patch;"))
            .bind(("id", id.to_string()))
            .bind(("patch", patch))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AppError> {
        let table = Self::table(collection);
        self.db
            .client
            .query(format!("DELETE type::thing('{table}', $id);"))
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: FullTextQuery,
    ) -> Result<Vec<FullTextHit>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
            id: String,
            score: f32,
            highlight: Option<String>,
        }

        let table = Self::table(collection);
        let limit = query.limit.max(1);
        let highlight_sql = if query.highlight {
            "search::highlight('**', '**', 0) AS highlight"
        } else {
            "NONE AS highlight"
        };

        let sql = format!(
            "SELECT id, \
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score, \
                {highlight_sql} \
             FROM {table} \
             WHERE text @0@ $terms \
             ORDER BY score DESC \
             LIMIT {limit};"
        );

        let mut response = self
            .db
            .client
            .query(&sql)
            .bind(("terms", query.query.clone()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;
        response = response.check().map_err(AppError::Database)?;

        let rows: Vec<Row> = response.take(0)?;

        // BM25 scores are unbounded; normalise over the returned set.
        let raw: Vec<f32> = rows.iter().map(|r| r.score).collect();
        let normalised = min_max_normalize(&raw);

        Ok(rows
            .into_iter()
            .zip(normalised)
            .map(|(row, score)| FullTextHit {
                id: row.id,
                score,
                highlight: row.highlight,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.db.client.query("RETURN 1;").await?.check()?;
        Ok(())
    }
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for s in scores {
        if !s.is_finite() {
            continue;
        }
        min = min.min(*s);
        max = max.max(*s);
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                ((score - min) / (max - min)).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}
