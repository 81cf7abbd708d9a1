use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::AppError;
use crate::storage::cache::Cache;
use crate::storage::fulltext::{FullTextDoc, FullTextHit, FullTextIndex, FullTextQuery};
use crate::storage::vector::{
    CollectionInfo, CollectionSpec, PayloadFilter, Point, ScoredChunk, ScrollRequest,
    ScrollResponse, VectorSearchRequest, VectorStore,
};
use crate::storage::types::chunk::Chunk;

/// How long warmed chunks linger in the cache tier.
const CHUNK_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Collection name for a given text-embedding dimension, letting multiple
/// dimensions coexist side by side.
pub fn collection_name(dimension: usize) -> String {
    format!("atlas_{dimension}d")
}

/// Facade over the mandatory vector tier and the optional full-text and cache
/// tiers. Writes past the vector tier are best-effort: only a vector-store
/// failure aborts a batch.
#[derive(Clone)]
pub struct StorageService {
    vector: Arc<dyn VectorStore>,
    fulltext: Option<Arc<dyn FullTextIndex>>,
    cache: Option<Arc<dyn Cache>>,
}

impl StorageService {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        fulltext: Option<Arc<dyn FullTextIndex>>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        Self {
            vector,
            fulltext,
            cache,
        }
    }

    pub fn vector(&self) -> &Arc<dyn VectorStore> {
        &self.vector
    }

    pub fn fulltext(&self) -> Option<&Arc<dyn FullTextIndex>> {
        self.fulltext.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    /// Create the collection (and its full-text index) when missing.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        vectors: BTreeMap<String, usize>,
    ) -> Result<(), AppError> {
        if !self.vector.collection_exists(collection).await? {
            self.vector
                .create_collection(collection, &CollectionSpec { vectors })
                .await?;
        }
        if let Some(fulltext) = &self.fulltext {
            fulltext.create_index(collection).await?;
        }
        Ok(())
    }

    /// Dual write: vector store first (mandatory), then full-text and cache
    /// warming, both best-effort with logged failures.
    pub async fn upsert_chunks(
        &self,
        collection: &str,
        points: Vec<Point>,
    ) -> Result<(), AppError> {
        let docs: Vec<FullTextDoc> = points
            .iter()
            .map(|point| FullTextDoc {
                id: point.id.clone(),
                text: point.payload.text.clone(),
                file_path: point.payload.source.file_path.clone(),
                created_at: point.payload.created_at,
            })
            .collect();
        let chunks: Vec<Chunk> = points.iter().map(|p| p.payload.clone()).collect();

        self.vector.upsert(collection, points).await?;

        if let Some(fulltext) = &self.fulltext {
            if let Err(err) = fulltext.index(collection, docs).await {
                warn!(collection, error = %err, "full-text indexing failed; vector tier is authoritative");
            }
        }
        if let Some(cache) = &self.cache {
            cache.mset(&chunks, CHUNK_CACHE_TTL).await;
        }

        Ok(())
    }

    pub async fn search(
        &self,
        collection: &str,
        request: VectorSearchRequest,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        self.vector.search(collection, request).await
    }

    pub async fn fulltext_search(
        &self,
        collection: &str,
        query: FullTextQuery,
    ) -> Result<Option<Vec<FullTextHit>>, AppError> {
        match &self.fulltext {
            Some(fulltext) => Ok(Some(fulltext.search(collection, query).await?)),
            None => Ok(None),
        }
    }

    pub async fn scroll(
        &self,
        collection: &str,
        request: ScrollRequest,
    ) -> Result<ScrollResponse, AppError> {
        self.vector.scroll(collection, request).await
    }

    /// Retrieve by ids, preferring the cache tier when present.
    pub async fn retrieve(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<Chunk>, AppError> {
        let mut found: Vec<Chunk> = Vec::with_capacity(ids.len());
        let mut missing: Vec<String> = Vec::new();

        if let Some(cache) = &self.cache {
            for (id, cached) in ids.iter().zip(cache.mget(ids).await) {
                match cached {
                    Some(chunk) => found.push(chunk),
                    None => missing.push(id.clone()),
                }
            }
        } else {
            missing = ids.to_vec();
        }

        if !missing.is_empty() {
            let fetched = self.vector.retrieve(collection, &missing).await?;
            if let Some(cache) = &self.cache {
                cache.mset(&fetched, CHUNK_CACHE_TTL).await;
            }
            found.extend(fetched);
        }

        Ok(found)
    }

    pub async fn set_payload(
        &self,
        collection: &str,
        ids: &[String],
        patch: serde_json::Value,
    ) -> Result<(), AppError> {
        self.vector.set_payload(collection, ids, patch).await?;
        // Patched payloads invalidate any warmed copies.
        if let Some(cache) = &self.cache {
            for id in ids {
                cache.invalidate_chunk(id).await;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), AppError> {
        self.vector.delete(collection, ids).await?;
        if let Some(fulltext) = &self.fulltext {
            for id in ids {
                if let Err(err) = fulltext.delete(collection, id).await {
                    warn!(collection, id, error = %err, "full-text delete failed");
                }
            }
        }
        Ok(())
    }

    pub async fn collection_info(&self, collection: &str) -> Result<CollectionInfo, AppError> {
        self.vector.get_collection_info(collection).await
    }

    pub async fn drop_collection(&self, collection: &str) -> Result<(), AppError> {
        self.vector.drop_collection(collection).await
    }

    pub async fn set_hnsw_enabled(
        &self,
        collection: &str,
        enabled: bool,
    ) -> Result<(), AppError> {
        self.vector.set_hnsw_enabled(collection, enabled).await
    }

    /// Run `action` with the HNSW indexes dropped, re-enabling them afterwards
    /// even when the action fails. A no-op for stores without the toggle.
    pub async fn with_hnsw_disabled<F, Fut, T>(
        &self,
        collection: &str,
        action: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.vector.set_hnsw_enabled(collection, false).await?;
        debug!(collection, "hnsw disabled for bulk operation");

        let outcome = action().await;

        if let Err(err) = self.vector.set_hnsw_enabled(collection, true).await {
            warn!(collection, error = %err, "failed to re-enable hnsw indexes");
            if outcome.is_ok() {
                return Err(err);
            }
        }

        outcome
    }

    /// Scroll every chunk matching `filter`, following pagination.
    pub async fn scroll_all(
        &self,
        collection: &str,
        filter: PayloadFilter,
        page_size: usize,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let response = self
                .vector
                .scroll(
                    collection,
                    ScrollRequest {
                        filter: filter.clone(),
                        limit: page_size,
                        offset,
                        with_vector: None,
                    },
                )
                .await?;
            out.extend(response.items.into_iter().map(|item| item.chunk));
            match response.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::SurrealDbClient;
    use crate::storage::types::chunk::{
        ContentType, EmbeddingMeta, EmbeddingStrategy, SourceMeta,
    };
    use crate::storage::vector::SurrealVectorStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_point(path: &str, index: usize, embedding: Vec<f32>) -> Point {
        let chunk = Chunk::new(
            SourceMeta {
                file_path: path.to_string(),
                file_name: path.to_string(),
                extension: "md".to_string(),
                content_type: ContentType::Text,
            },
            format!("chunk {index} of {path}"),
            index,
            1,
            EmbeddingMeta {
                model: "hashed".to_string(),
                strategy: EmbeddingStrategy::Snippet,
            },
        );
        let mut vectors = HashMap::new();
        vectors.insert("text".to_string(), embedding);
        Point {
            id: chunk.id.clone(),
            vectors,
            payload: chunk,
        }
    }

    async fn service() -> (StorageService, String) {
        let db = Arc::new(
            SurrealDbClient::memory("store_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("schema");

        let service = StorageService::new(
            Arc::new(SurrealVectorStore::new(Arc::clone(&db))),
            Some(Arc::new(crate::storage::fulltext::SurrealFullTextIndex::new(
                Arc::clone(&db),
            ))),
            Some(Arc::new(crate::storage::cache::SurrealCache::new(db))),
        );

        let collection = collection_name(3);
        let mut vectors = BTreeMap::new();
        vectors.insert("text".to_string(), 3usize);
        service
            .ensure_collection(&collection, vectors)
            .await
            .expect("ensure collection");
        (service, collection)
    }

    #[tokio::test]
    async fn dual_write_lands_in_all_tiers() {
        let (service, collection) = service().await;

        let point = test_point("dual.md", 0, vec![1.0, 0.0, 0.0]);
        let id = point.id.clone();
        service
            .upsert_chunks(&collection, vec![point])
            .await
            .expect("upsert");

        let dense = service
            .search(
                &collection,
                VectorSearchRequest {
                    vector: vec![1.0, 0.0, 0.0],
                    vector_name: "text".to_string(),
                    limit: 1,
                    filter: PayloadFilter::default(),
                    score_threshold: None,
                },
            )
            .await
            .expect("vector search");
        assert_eq!(dense.len(), 1);
        assert_eq!(dense[0].id, id);

        let keyword = service
            .fulltext_search(
                &collection,
                FullTextQuery {
                    query: "chunk".to_string(),
                    limit: 5,
                    highlight: false,
                },
            )
            .await
            .expect("fts search")
            .expect("fts tier configured");
        assert!(keyword.iter().any(|hit| hit.id == id));

        let cached = service
            .retrieve(&collection, &[id.clone()])
            .await
            .expect("retrieve");
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn with_hnsw_disabled_restores_index_state() {
        let (service, collection) = service().await;

        let result = service
            .with_hnsw_disabled(&collection, || async {
                let info = service.collection_info(&collection).await?;
                assert!(!info.hnsw_enabled);
                Ok(42)
            })
            .await
            .expect("bulk action");
        assert_eq!(result, 42);

        let info = service
            .collection_info(&collection)
            .await
            .expect("collection info");
        assert!(info.hnsw_enabled);
    }

    #[tokio::test]
    async fn scroll_all_follows_pagination() {
        let (service, collection) = service().await;

        let points: Vec<Point> = (0..7)
            .map(|i| test_point("scroll.md", i, vec![0.3, 0.3, 0.4]))
            .collect();
        service
            .upsert_chunks(&collection, points)
            .await
            .expect("upsert");

        let all = service
            .scroll_all(&collection, PayloadFilter::default(), 3)
            .await
            .expect("scroll all");
        assert_eq!(all.len(), 7);
    }
}
