use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::storage::types::chunk::{Chunk, ContentType};
use crate::storage::types::{surreal_serde, StoredObject};

/// Candidate pool width for the HNSW KNN operator.
const KNN_EF: usize = 100;

/// A point to upsert: one payload plus one vector per named modality.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vectors: HashMap<String, Vec<f32>>,
    pub payload: Chunk,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub score: f32,
    pub chunk: Chunk,
}

/// Server-side payload filter. Empty means "everything".
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub qntm_key: Option<String>,
    pub content_type: Option<ContentType>,
    pub consolidation_level: Option<u8>,
    /// `Some(false)` excludes soft-deleted chunks (the default search
    /// behaviour); `None` scans everything.
    pub deletion_eligible: Option<bool>,
}

impl PayloadFilter {
    pub fn is_empty(&self) -> bool {
        self.since.is_none()
            && self.until.is_none()
            && self.qntm_key.is_none()
            && self.content_type.is_none()
            && self.consolidation_level.is_none()
            && self.deletion_eligible.is_none()
    }

    /// Render WHERE conditions with `prefix` in front of payload fields
    /// ("point." when querying through a vector table).
    fn conditions(&self, prefix: &str) -> (Vec<String>, Vec<(String, BindValue)>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if let Some(since) = self.since {
            clauses.push(format!("{prefix}created_at >= $f_since"));
            binds.push(("f_since".to_string(), BindValue::Datetime(since.into())));
        }
        if let Some(until) = self.until {
            clauses.push(format!("{prefix}created_at <= $f_until"));
            binds.push(("f_until".to_string(), BindValue::Datetime(until.into())));
        }
        if let Some(key) = &self.qntm_key {
            clauses.push(format!("$f_qntm INSIDE {prefix}qntm_keys"));
            binds.push(("f_qntm".to_string(), BindValue::Text(key.clone())));
        }
        if let Some(content_type) = self.content_type {
            clauses.push(format!("{prefix}source.content_type = $f_ct"));
            let tag = match content_type {
                ContentType::Text => "text",
                ContentType::Code => "code",
                ContentType::Media => "media",
            };
            binds.push(("f_ct".to_string(), BindValue::Text(tag.to_string())));
        }
        if let Some(level) = self.consolidation_level {
            clauses.push(format!("{prefix}consolidation_level = $f_level"));
            binds.push(("f_level".to_string(), BindValue::Int(i64::from(level))));
        }
        if let Some(eligible) = self.deletion_eligible {
            clauses.push(format!("{prefix}deletion_eligible = $f_del"));
            binds.push(("f_del".to_string(), BindValue::Bool(eligible)));
        }

        (clauses, binds)
    }
}

#[derive(Debug, Clone)]
enum BindValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Datetime(surrealdb::sql::Datetime),
}

#[derive(Debug, Clone)]
pub struct VectorSearchRequest {
    pub vector: Vec<f32>,
    pub vector_name: String,
    pub limit: usize,
    pub filter: PayloadFilter,
    pub score_threshold: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ScrollRequest {
    pub filter: PayloadFilter,
    pub limit: usize,
    pub offset: usize,
    /// Also return this named vector for each chunk.
    pub with_vector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScrollItem {
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ScrollResponse {
    pub items: Vec<ScrollItem>,
    pub next_offset: Option<usize>,
}

/// Named-vector collection layout: name -> dimension. Distance is cosine.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub vectors: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub points_count: u64,
    pub vectors: BTreeMap<String, usize>,
    pub hnsw_enabled: bool,
}

/// The mandatory storage tier. Named vectors let one point host several
/// modalities; a search names which vector to query.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> Result<bool, AppError>;
    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), AppError>;
    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, AppError>;
    async fn drop_collection(&self, collection: &str) -> Result<(), AppError>;

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), AppError>;
    async fn search(
        &self,
        collection: &str,
        request: VectorSearchRequest,
    ) -> Result<Vec<ScoredChunk>, AppError>;
    async fn scroll(
        &self,
        collection: &str,
        request: ScrollRequest,
    ) -> Result<ScrollResponse, AppError>;
    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<Chunk>, AppError>;
    async fn set_payload(
        &self,
        collection: &str,
        ids: &[String],
        patch: serde_json::Value,
    ) -> Result<(), AppError>;
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), AppError>;

    /// Toggle the HNSW indexes; a no-op for stores without the capability.
    async fn set_hnsw_enabled(&self, collection: &str, enabled: bool) -> Result<(), AppError>;
}

/// Collection bookkeeping row. One per collection, keyed by collection name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct CollectionMeta {
    #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
    id: String,
    vectors: BTreeMap<String, usize>,
    hnsw_enabled: bool,
}

impl StoredObject for CollectionMeta {
    fn table_name() -> &'static str {
        "collection_meta"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

/// SurrealDB-backed vector store. A collection `atlas_{dim}d` maps onto a
/// payload table of the same name plus one `{collection}_vec_{name}` table per
/// named vector, each carrying its own HNSW index.
pub struct SurrealVectorStore {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    fn vec_table(collection: &str, vector_name: &str) -> String {
        format!("{collection}_vec_{vector_name}")
    }

    fn index_name(collection: &str, vector_name: &str) -> String {
        format!("idx_{collection}_{vector_name}")
    }

    async fn meta(&self, collection: &str) -> Result<CollectionMeta, AppError> {
        self.db
            .get_item::<CollectionMeta>(collection)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("collection {collection}")))
    }

    async fn define_hnsw_index(
        &self,
        collection: &str,
        vector_name: &str,
        dimension: usize,
    ) -> Result<(), AppError> {
        let table = Self::vec_table(collection, vector_name);
        let index = Self::index_name(collection, vector_name);
        self.db
            .client
            .query(format!(
                "DEFINE INDEX OVERWRITE {index} ON TABLE {table} FIELDS embedding HNSW DIMENSION {dimension};"
            ))
            .await?
            .check()?;
        Ok(())
    }

    async fn remove_hnsw_index(
        &self,
        collection: &str,
        vector_name: &str,
    ) -> Result<(), AppError> {
        let table = Self::vec_table(collection, vector_name);
        let index = Self::index_name(collection, vector_name);
        self.db
            .client
            .query(format!("REMOVE INDEX IF EXISTS {index} ON TABLE {table};"))
            .await?
            .check()?;
        Ok(())
    }

    fn apply_binds<'r>(
        mut query: surrealdb::method::Query<'r, surrealdb::engine::any::Any>,
        binds: Vec<(String, BindValue)>,
    ) -> surrealdb::method::Query<'r, surrealdb::engine::any::Any> {
        for (name, value) in binds {
            query = match value {
                BindValue::Text(v) => query.bind((name, v)),
                BindValue::Int(v) => query.bind((name, v)),
                BindValue::Bool(v) => query.bind((name, v)),
                BindValue::Datetime(v) => query.bind((name, v)),
            };
        }
        query
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn collection_exists(&self, collection: &str) -> Result<bool, AppError> {
        Ok(self
            .db
            .get_item::<CollectionMeta>(collection)
            .await?
            .is_some())
    }

    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), AppError> {
        for (vector_name, dimension) in &spec.vectors {
            self.define_hnsw_index(collection, vector_name, *dimension)
                .await?;
        }

        self.db
            .client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_{collection}_created ON TABLE {collection} FIELDS created_at;"
            ))
            .await?
            .check()?;

        self.db
            .upsert_item(CollectionMeta {
                id: collection.to_string(),
                vectors: spec.vectors.clone(),
                hnsw_enabled: true,
            })
            .await?;

        Ok(())
    }

    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, AppError> {
        let meta = self.meta(collection).await?;

        #[derive(Deserialize)]
        struct CountRow {
            total: u64,
        }

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT count() AS total FROM {collection} GROUP ALL;"
            ))
            .await?;
        let row: Option<CountRow> = response.take(0)?;

        Ok(CollectionInfo {
            points_count: row.map_or(0, |r| r.total),
            vectors: meta.vectors,
            hnsw_enabled: meta.hnsw_enabled,
        })
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), AppError> {
        let meta = self.meta(collection).await?;
        for vector_name in meta.vectors.keys() {
            let table = Self::vec_table(collection, vector_name);
            self.db
                .client
                .query(format!("REMOVE TABLE IF EXISTS {table};"))
                .await?
                .check()?;
        }
        self.db
            .client
            .query(format!("REMOVE TABLE IF EXISTS {collection};"))
            .await?
            .check()?;
        self.db.delete_item::<CollectionMeta>(collection).await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> Result<(), AppError> {
        if points.is_empty() {
            return Ok(());
        }

        // One transaction per batch so a point and its vectors land together.
        let mut query = self.db.client.query("BEGIN TRANSACTION;");
        let mut binds: Vec<(String, BindValue)> = Vec::new();
        let mut payload_binds: Vec<(String, Chunk)> = Vec::new();
        let mut vector_binds: Vec<(String, Vec<f32>)> = Vec::new();

        for (i, point) in points.iter().enumerate() {
            let id_bind = format!("pt_id_{i}");
            let chunk_bind = format!("pt_chunk_{i}");
            query = query.query(format!(
                "UPSERT type::thing('{collection}', ${id_bind}) CONTENT ${chunk_bind};"
            ));
            binds.push((id_bind, BindValue::Text(point.id.clone())));
            payload_binds.push((chunk_bind, point.payload.clone()));

            for (vector_name, embedding) in &point.vectors {
                let table = Self::vec_table(collection, vector_name);
                let vec_bind = format!("vec_{i}_{vector_name}");
                let vid_bind = format!("vec_id_{i}_{vector_name}");
                query = query.query(format!(
                    "UPSERT type::thing('{table}', ${vid_bind}) SET \
                        point = type::thing('{collection}', ${vid_bind}), \
                        embedding = ${vec_bind};"
                ));
                binds.push((vid_bind, BindValue::Text(point.id.clone())));
                vector_binds.push((vec_bind, embedding.clone()));
            }
        }

        query = query.query("COMMIT TRANSACTION;");
        query = Self::apply_binds(query, binds);
        for (name, chunk) in payload_binds {
            query = query.bind((name, chunk));
        }
        for (name, embedding) in vector_binds {
            query = query.bind((name, embedding));
        }

        let response = query.await?;
        response.check()?;

        debug!(collection, points = points.len(), "vector batch upserted");
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        request: VectorSearchRequest,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            point: Chunk,
            score: f32,
        }

        let meta = self.meta(collection).await?;
        let table = Self::vec_table(collection, &request.vector_name);
        let limit = request.limit.max(1);
        // Over-fetch under filters; conditions prune index candidates.
        let knn_take = if request.filter.is_empty() {
            limit
        } else {
            limit.saturating_mul(4)
        };

        let (clauses, binds) = request.filter.conditions("point.");
        let filter_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", clauses.join(" AND "))
        };

        // Brute-force scan while the HNSW index is dropped.
        let sql = if meta.hnsw_enabled {
            format!(
                "SELECT point, vector::similarity::cosine(embedding, $embedding) AS score \
                 FROM {table} \
                 WHERE embedding <|{knn_take},{KNN_EF}|> $embedding{filter_sql} \
                 ORDER BY score DESC LIMIT {limit} FETCH point;"
            )
        } else {
            format!(
                "SELECT point, vector::similarity::cosine(embedding, $embedding) AS score \
                 FROM {table} \
                 WHERE true{filter_sql} \
                 ORDER BY score DESC LIMIT {limit} FETCH point;"
            )
        };

        let mut query = self
            .db
            .client
            .query(sql)
            .bind(("embedding", request.vector.clone()));
        query = Self::apply_binds(query, binds);

        let mut response = query.await?;
        let rows: Vec<Row> = response.take(0)?;

        let threshold = request.score_threshold.unwrap_or(f32::MIN);
        Ok(rows
            .into_iter()
            .filter(|row| row.score >= threshold)
            .map(|row| ScoredChunk {
                id: row.point.id.clone(),
                score: row.score.clamp(0.0, 1.0),
                chunk: row.point,
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        request: ScrollRequest,
    ) -> Result<ScrollResponse, AppError> {
        let (clauses, binds) = request.filter.conditions("");
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        let limit = request.limit.max(1);
        let offset = request.offset;

        let sql = format!(
            "SELECT * FROM {collection} {where_sql}ORDER BY created_at ASC LIMIT {limit} START {offset};"
        );

        let mut query = self.db.client.query(sql);
        query = Self::apply_binds(query, binds);
        let mut response = query.await?;
        let chunks: Vec<Chunk> = response.take(0)?;

        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        if let Some(vector_name) = &request.with_vector {
            #[derive(Deserialize)]
            struct VecRow {
                #[serde(deserialize_with = "surreal_serde::deserialize_flexible_id")]
                id: String,
                embedding: Vec<f32>,
            }

            let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
            if !ids.is_empty() {
                let table = Self::vec_table(collection, vector_name);
                let mut vec_response = self
                    .db
                    .client
                    .query(format!(
                        "SELECT id, embedding FROM {table} WHERE record::id(id) INSIDE $ids;"
                    ))
                    .bind(("ids", ids))
                    .await?;
                let rows: Vec<VecRow> = vec_response.take(0)?;
                for row in rows {
                    vectors.insert(row.id, row.embedding);
                }
            }
        }

        let fetched = chunks.len();
        let items = chunks
            .into_iter()
            .map(|chunk| {
                let vector = vectors.remove(&chunk.id);
                ScrollItem { chunk, vector }
            })
            .collect();

        let next_offset = if fetched == limit {
            Some(offset.saturating_add(limit))
        } else {
            None
        };

        Ok(ScrollResponse { items, next_offset })
    }

    async fn retrieve(&self, collection: &str, ids: &[String]) -> Result<Vec<Chunk>, AppError> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            let chunk: Option<Chunk> = self.db.client.select((collection, id.as_str())).await?;
            if let Some(chunk) = chunk {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn set_payload(
        &self,
        collection: &str,
        ids: &[String],
        patch: serde_json::Value,
    ) -> Result<(), AppError> {
        for id in ids {
            self.db
                .client
                .query(format!(
                    "UPDATE type::thing('{collection}', $id) MERGE $patch;"
                ))
                .bind(("id", id.clone()))
                .bind(("patch", patch.clone()))
                .await?
                .check()?;
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), AppError> {
        let meta = self.meta(collection).await?;
        for id in ids {
            let mut query = self.db.client.query("BEGIN TRANSACTION;").query(format!(
                "DELETE type::thing('{collection}', $id);"
            ));
            for vector_name in meta.vectors.keys() {
                let table = Self::vec_table(collection, vector_name);
                query = query.query(format!("DELETE type::thing('{table}', $id);"));
            }
            query = query.query("COMMIT TRANSACTION;");
            query.bind(("id", id.clone())).await?.check()?;
        }
        Ok(())
    }

    async fn set_hnsw_enabled(&self, collection: &str, enabled: bool) -> Result<(), AppError> {
        let mut meta = self.meta(collection).await?;
        if meta.hnsw_enabled == enabled {
            return Ok(());
        }

        for (vector_name, dimension) in meta.vectors.clone() {
            if enabled {
                self.define_hnsw_index(collection, &vector_name, dimension)
                    .await?;
            } else {
                self.remove_hnsw_index(collection, &vector_name).await?;
            }
        }

        meta.hnsw_enabled = enabled;
        self.db.upsert_item(meta).await?;
        debug!(collection, enabled, "hnsw indexes toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::chunk::{
        Chunk, EmbeddingMeta, EmbeddingStrategy, SourceMeta,
    };
    use uuid::Uuid;

    fn test_chunk(path: &str, index: usize, text: &str) -> Chunk {
        Chunk::new(
            SourceMeta {
                file_path: path.to_string(),
                file_name: path.to_string(),
                extension: "md".to_string(),
                content_type: ContentType::Text,
            },
            text.to_string(),
            index,
            2,
            EmbeddingMeta {
                model: "hashed".to_string(),
                strategy: EmbeddingStrategy::Snippet,
            },
        )
    }

    fn point(chunk: Chunk, embedding: Vec<f32>) -> Point {
        let mut vectors = HashMap::new();
        vectors.insert("text".to_string(), embedding);
        Point {
            id: chunk.id.clone(),
            vectors,
            payload: chunk,
        }
    }

    async fn store_with_collection(dimension: usize) -> (SurrealVectorStore, String) {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        let store = SurrealVectorStore::new(Arc::new(db));
        let collection = format!("atlas_{dimension}d");
        let mut vectors = BTreeMap::new();
        vectors.insert("text".to_string(), dimension);
        store
            .create_collection(&collection, &CollectionSpec { vectors })
            .await
            .expect("create collection");
        (store, collection)
    }

    #[tokio::test]
    async fn upsert_search_roundtrip() {
        let (store, collection) = store_with_collection(3).await;

        let chunk_a = test_chunk("a.md", 0, "alpha");
        let chunk_b = test_chunk("a.md", 1, "beta");
        store
            .upsert(
                &collection,
                vec![
                    point(chunk_a.clone(), vec![1.0, 0.0, 0.0]),
                    point(chunk_b.clone(), vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .expect("upsert");

        let results = store
            .search(
                &collection,
                VectorSearchRequest {
                    vector: vec![0.0, 1.0, 0.0],
                    vector_name: "text".to_string(),
                    limit: 2,
                    filter: PayloadFilter::default(),
                    score_threshold: None,
                },
            )
            .await
            .expect("search");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, chunk_b.id);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn filter_excludes_deletion_eligible() {
        let (store, collection) = store_with_collection(3).await;

        let keep = test_chunk("k.md", 0, "keep");
        let mut gone = test_chunk("g.md", 0, "gone");
        gone.mark_deletion_eligible(Some(keep.id.clone()));

        store
            .upsert(
                &collection,
                vec![
                    point(keep.clone(), vec![1.0, 0.0, 0.0]),
                    point(gone.clone(), vec![0.9, 0.1, 0.0]),
                ],
            )
            .await
            .expect("upsert");

        let results = store
            .search(
                &collection,
                VectorSearchRequest {
                    vector: vec![1.0, 0.0, 0.0],
                    vector_name: "text".to_string(),
                    limit: 5,
                    filter: PayloadFilter {
                        deletion_eligible: Some(false),
                        ..PayloadFilter::default()
                    },
                    score_threshold: None,
                },
            )
            .await
            .expect("search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, keep.id);
    }

    #[tokio::test]
    async fn scroll_pages_in_created_at_order() {
        let (store, collection) = store_with_collection(3).await;

        let mut points = Vec::new();
        for i in 0..5 {
            let mut chunk = test_chunk("s.md", i, "scroll me");
            chunk.created_at = chrono::Utc::now() + chrono::Duration::seconds(i as i64);
            points.push(point(chunk, vec![0.5, 0.5, 0.0]));
        }
        store.upsert(&collection, points).await.expect("upsert");

        let first = store
            .scroll(
                &collection,
                ScrollRequest {
                    filter: PayloadFilter::default(),
                    limit: 3,
                    offset: 0,
                    with_vector: None,
                },
            )
            .await
            .expect("scroll");
        assert_eq!(first.items.len(), 3);
        assert_eq!(first.next_offset, Some(3));

        let second = store
            .scroll(
                &collection,
                ScrollRequest {
                    filter: PayloadFilter::default(),
                    limit: 3,
                    offset: 3,
                    with_vector: None,
                },
            )
            .await
            .expect("scroll page 2");
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.next_offset, None);

        let mut seen: Vec<usize> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|item| item.chunk.chunk_index)
            .collect();
        seen.dedup();
        assert_eq!(seen.len(), 5, "pages must not overlap");
    }

    #[tokio::test]
    async fn retrieve_and_set_payload() {
        let (store, collection) = store_with_collection(3).await;

        let chunk = test_chunk("r.md", 0, "retrieve me");
        store
            .upsert(&collection, vec![point(chunk.clone(), vec![1.0, 0.0, 0.0])])
            .await
            .expect("upsert");

        store
            .set_payload(
                &collection,
                &[chunk.id.clone()],
                serde_json::json!({"access_count": 3}),
            )
            .await
            .expect("set payload");

        let fetched = store
            .retrieve(&collection, &[chunk.id.clone()])
            .await
            .expect("retrieve");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].access_count, 3);
        assert_eq!(fetched[0].text, "retrieve me");
    }

    #[tokio::test]
    async fn hnsw_toggle_keeps_search_working() {
        let (store, collection) = store_with_collection(3).await;

        let chunk = test_chunk("h.md", 0, "toggled");
        store
            .upsert(&collection, vec![point(chunk.clone(), vec![0.0, 0.0, 1.0])])
            .await
            .expect("upsert");

        store
            .set_hnsw_enabled(&collection, false)
            .await
            .expect("disable");
        let info = store
            .get_collection_info(&collection)
            .await
            .expect("info");
        assert!(!info.hnsw_enabled);

        // Brute-force path still answers.
        let results = store
            .search(
                &collection,
                VectorSearchRequest {
                    vector: vec![0.0, 0.0, 1.0],
                    vector_name: "text".to_string(),
                    limit: 1,
                    filter: PayloadFilter::default(),
                    score_threshold: None,
                },
            )
            .await
            .expect("search without index");
        assert_eq!(results.len(), 1);

        store
            .set_hnsw_enabled(&collection, true)
            .await
            .expect("re-enable");
        let info = store.get_collection_info(&collection).await.expect("info");
        assert!(info.hnsw_enabled);
        assert_eq!(info.points_count, 1);
    }

    #[tokio::test]
    async fn delete_removes_point_and_vectors() {
        let (store, collection) = store_with_collection(3).await;

        let chunk = test_chunk("d.md", 0, "delete me");
        store
            .upsert(&collection, vec![point(chunk.clone(), vec![1.0, 0.0, 0.0])])
            .await
            .expect("upsert");

        store
            .delete(&collection, &[chunk.id.clone()])
            .await
            .expect("delete");

        let fetched = store
            .retrieve(&collection, &[chunk.id.clone()])
            .await
            .expect("retrieve");
        assert!(fetched.is_empty());

        let results = store
            .search(
                &collection,
                VectorSearchRequest {
                    vector: vec![1.0, 0.0, 0.0],
                    vector_name: "text".to_string(),
                    limit: 5,
                    filter: PayloadFilter::default(),
                    score_threshold: None,
                },
            )
            .await
            .expect("search");
        assert!(results.is_empty());
    }
}
