pub mod reranking;
pub mod scoring;
pub mod timeline;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use common::backends::BackendRegistry;
use common::error::AppError;
use common::events::{AtlasEvent, EventBus};
use common::prompts::{PromptRegistry, RenderTarget, QUERY_EXPANSION};
use common::storage::db::SurrealDbClient;
use common::storage::fulltext::FullTextQuery;
use common::storage::store::{collection_name, StorageService};
use common::storage::types::chunk::{Chunk, ContentType, Temperature};
use common::storage::vector::{PayloadFilter, VectorSearchRequest};

use crate::scoring::{clamp_unit, reciprocal_rank_fusion, sort_scored_desc};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub qntm_key: Option<String>,
    pub rerank: bool,
    /// Candidates handed to the reranker; defaults to three times `limit`.
    pub rerank_top_k: Option<usize>,
    pub expand_query: bool,
    pub hybrid_search: bool,
    pub consolidation_level: Option<u8>,
    pub content_type: Option<ContentType>,
    pub agent_role: Option<String>,
    pub temperature: Option<Temperature>,
    /// Soft-deleted chunks stay hidden unless explicitly requested.
    pub include_deletion_eligible: bool,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_SEARCH_LIMIT,
            since: None,
            until: None,
            qntm_key: None,
            rerank: false,
            rerank_top_k: None,
            expand_query: false,
            hybrid_search: false,
            consolidation_level: None,
            content_type: None,
            agent_role: None,
            temperature: None,
            include_deletion_eligible: false,
        }
    }

    fn fetch_limit(&self) -> usize {
        if self.rerank {
            self.rerank_top_k
                .unwrap_or_else(|| self.limit.saturating_mul(3))
                .max(1)
        } else {
            self.limit.max(1)
        }
    }

    fn payload_filter(&self) -> PayloadFilter {
        PayloadFilter {
            since: self.since,
            until: self.until,
            qntm_key: self.qntm_key.clone(),
            content_type: self.content_type,
            consolidation_level: self.consolidation_level,
            deletion_eligible: if self.include_deletion_eligible {
                None
            } else {
                Some(false)
            },
        }
    }
}

/// One surfaced hit. Scores are always in [0,1] and result lists are sorted
/// strictly descending; both are contract-level obligations.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub chunk: Chunk,
}

pub struct SearchService {
    storage: StorageService,
    db: Arc<SurrealDbClient>,
    registry: Arc<BackendRegistry>,
    prompts: Arc<PromptRegistry>,
    events: EventBus,
}

impl SearchService {
    pub fn new(
        storage: StorageService,
        db: Arc<SurrealDbClient>,
        registry: Arc<BackendRegistry>,
        prompts: Arc<PromptRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            db,
            registry,
            prompts,
            events,
        }
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub fn collection(&self) -> Result<String, AppError> {
        Ok(collection_name(self.registry.text_embedding()?.dimension()))
    }

    #[instrument(skip_all, fields(limit = params.limit, rerank = params.rerank))]
    pub async fn search(&self, params: SearchParams) -> Result<Vec<SearchHit>, AppError> {
        let started = Instant::now();
        self.events.emit(AtlasEvent::SearchStarted {
            query: params.query.clone(),
        });

        let result = self.search_inner(&params).await;
        match &result {
            Ok(hits) => {
                self.events.emit(AtlasEvent::SearchCompleted {
                    results: hits.len(),
                    duration_ms: u64::try_from(started.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            Err(err) => {
                self.events.emit(AtlasEvent::SearchError {
                    message: err.to_string(),
                });
            }
        }
        result
    }

    async fn search_inner(&self, params: &SearchParams) -> Result<Vec<SearchHit>, AppError> {
        let collection = self.collection()?;
        let embedder = self.registry.text_embedding()?;
        let fetch_limit = params.fetch_limit();
        let filter = params.payload_filter();

        // 1. Optional query expansion; failures fall back to the bare query.
        let variants = if params.expand_query {
            self.expand_query(&params.query).await
        } else {
            Vec::new()
        };
        let mut queries = vec![params.query.clone()];
        queries.extend(variants);

        // 2. Dense search per variant, merged by maximum score per chunk.
        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        for query in &queries {
            let vector = embedder.embed_text(query).await?;
            let hits = self
                .storage
                .search(
                    &collection,
                    VectorSearchRequest {
                        vector,
                        vector_name: "text".to_string(),
                        limit: fetch_limit,
                        filter: filter.clone(),
                        score_threshold: None,
                    },
                )
                .await?;
            for hit in hits {
                merged
                    .entry(hit.id.clone())
                    .and_modify(|existing| {
                        if hit.score > existing.score {
                            existing.score = hit.score;
                        }
                    })
                    .or_insert(SearchHit {
                        score: hit.score,
                        chunk: hit.chunk,
                    });
            }
        }

        let mut candidates: Vec<SearchHit> = merged.into_values().collect();
        sort_scored_desc(&mut candidates, |hit| hit.score, |hit| hit.chunk.id.as_str());

        // 3. Optional hybrid merge through reciprocal-rank fusion.
        if params.hybrid_search {
            if let Some(keyword_hits) = self
                .storage
                .fulltext_search(
                    &collection,
                    FullTextQuery {
                        query: params.query.clone(),
                        limit: fetch_limit,
                        highlight: false,
                    },
                )
                .await?
            {
                let dense_ranking: Vec<String> =
                    candidates.iter().map(|hit| hit.chunk.id.clone()).collect();
                let keyword_ranking: Vec<String> =
                    keyword_hits.iter().map(|hit| hit.id.clone()).collect();

                // Hydrate keyword-only hits so fusion can surface them.
                let missing: Vec<String> = keyword_ranking
                    .iter()
                    .filter(|id| !dense_ranking.contains(id))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    for chunk in self.storage.retrieve(&collection, &missing).await? {
                        if !params.include_deletion_eligible && chunk.deletion_eligible {
                            continue;
                        }
                        candidates.push(SearchHit { score: 0.0, chunk });
                    }
                }

                let fused = reciprocal_rank_fusion(&[dense_ranking, keyword_ranking]);
                for hit in &mut candidates {
                    hit.score = fused.get(&hit.chunk.id).copied().unwrap_or(0.0);
                }
                sort_scored_desc(&mut candidates, |hit| hit.score, |hit| hit.chunk.id.as_str());
            }
        }

        candidates.truncate(fetch_limit);

        // 4. Optional rerank replaces scores with normalised reranker scores.
        if params.rerank && !candidates.is_empty() {
            if let Some(reranker) = self.registry.reranker() {
                let documents: Vec<String> =
                    candidates.iter().map(|hit| hit.chunk.text.clone()).collect();
                match reranker.rerank(&params.query, &documents).await {
                    Ok(scores) if scores.len() == candidates.len() => {
                        for (hit, score) in candidates.iter_mut().zip(scores) {
                            hit.score = clamp_unit(score);
                        }
                        sort_scored_desc(&mut candidates, |hit| hit.score, |hit| hit.chunk.id.as_str());
                    }
                    Ok(_) => warn!("reranker returned a mismatched score count; keeping dense scores"),
                    Err(err) => warn!(error = %err, "rerank failed; keeping dense scores"),
                }
            } else {
                debug!("rerank requested but no reranking backend is registered");
            }
        }

        // 5. Client-side filters for derived fields.
        if let Some(temperature) = params.temperature {
            let now = Utc::now();
            candidates.retain(|hit| hit.chunk.temperature(now) == temperature);
        }

        candidates.truncate(params.limit.max(1));
        for hit in &mut candidates {
            hit.score = clamp_unit(hit.score);
        }

        self.record_access(&collection, &candidates).await;
        Ok(candidates)
    }

    /// Ask the LLM for 2-4 alternative phrasings. Best-effort.
    async fn expand_query(&self, query: &str) -> Vec<String> {
        let backend = match self.registry.json_completion() {
            Ok(backend) => backend,
            Err(_) => return Vec::new(),
        };

        let target = RenderTarget {
            provider: backend.name().to_string(),
            model_family: backend.model_family(),
            capabilities: backend.capabilities().to_vec(),
        };
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("query", query.to_string());

        let prompt = match self.prompts.render(QUERY_EXPANSION, &target, &vars) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(error = %err, "query expansion prompt failed to render");
                return Vec::new();
            }
        };

        #[derive(Deserialize)]
        struct Parsed {
            variants: Vec<String>,
        }

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "variants": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["variants"],
            "additionalProperties": false
        });

        match backend
            .complete_json(
                "You rephrase search queries without changing their meaning.",
                &prompt,
                "query_variants",
                schema,
            )
            .await
            .and_then(|value| {
                serde_json::from_value::<Parsed>(value)
                    .map_err(|e| AppError::LLMParsing(e.to_string()))
            }) {
            Ok(parsed) => parsed.variants.into_iter().take(4).collect(),
            Err(err) => {
                warn!(error = %err, "query expansion failed; searching with the bare query");
                Vec::new()
            }
        }
    }

    /// Bump access counters on surfaced chunks; feeds the temperature
    /// buckets. Fire-and-forget.
    async fn record_access(&self, collection: &str, hits: &[SearchHit]) {
        if hits.is_empty() {
            return;
        }
        let now = Utc::now().to_rfc3339();
        let ids: Vec<String> = hits.iter().map(|hit| hit.chunk.id.clone()).collect();

        for hit in hits {
            let patch = serde_json::json!({
                "access_count": hit.chunk.access_count + 1,
                "last_accessed_at": now,
            });
            if let Err(err) = self
                .storage
                .set_payload(collection, std::slice::from_ref(&hit.chunk.id), patch)
                .await
            {
                warn!(error = %err, "access tracking write failed");
                break;
            }
        }

        self.events
            .emit(AtlasEvent::SearchActivated { chunk_ids: ids });
    }
}

#[cfg(test)]
mod tests;
