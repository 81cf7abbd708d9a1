use super::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Timelike};
use uuid::Uuid;

use common::backends::embedding::HashedEmbeddingBackend;
use common::backends::testing::{OverlapReranker, ScriptedLlmBackend};
use common::backends::CanEmbedText;
use common::storage::cache::SurrealCache;
use common::storage::fulltext::SurrealFullTextIndex;
use common::storage::types::chunk::{EmbeddingMeta, EmbeddingStrategy, SourceMeta};
use common::storage::vector::{Point, SurrealVectorStore};
use crate::timeline::{Granularity, TimelineParams};

const DIM: usize = 16;

struct Harness {
    service: SearchService,
    storage: StorageService,
    collection: String,
    embedder: Arc<HashedEmbeddingBackend>,
    reranker: Arc<OverlapReranker>,
}

async fn harness(llm: Option<Arc<ScriptedLlmBackend>>) -> Harness {
    let db = Arc::new(
        SurrealDbClient::memory("search_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");

    let storage = StorageService::new(
        Arc::new(SurrealVectorStore::new(Arc::clone(&db))),
        Some(Arc::new(SurrealFullTextIndex::new(Arc::clone(&db)))),
        Some(Arc::new(SurrealCache::new(Arc::clone(&db)))),
    );

    let embedder = Arc::new(HashedEmbeddingBackend::new(DIM));
    let reranker = OverlapReranker::new();

    let mut registry = BackendRegistry::new();
    registry.register_text_embedding(embedder.clone());
    registry.register_reranker(reranker.clone());
    if let Some(llm) = llm {
        registry.register_json_completion(llm);
    }

    let collection = collection_name(DIM);
    let mut vectors = BTreeMap::new();
    vectors.insert("text".to_string(), DIM);
    storage
        .ensure_collection(&collection, vectors)
        .await
        .expect("ensure collection");

    let service = SearchService::new(
        storage.clone(),
        db,
        Arc::new(registry),
        Arc::new(common::prompts::PromptRegistry::with_defaults()),
        EventBus::default(),
    );

    Harness {
        service,
        storage,
        collection,
        embedder,
        reranker,
    }
}

async fn seed(harness: &Harness, path: &str, index: usize, text: &str) -> Chunk {
    seed_with(harness, path, index, text, |_| {}).await
}

async fn seed_with(
    harness: &Harness,
    path: &str,
    index: usize,
    text: &str,
    mutate: impl FnOnce(&mut Chunk),
) -> Chunk {
    let mut chunk = Chunk::new(
        SourceMeta {
            file_path: path.to_string(),
            file_name: path.to_string(),
            extension: "md".to_string(),
            content_type: ContentType::Text,
        },
        text.to_string(),
        index,
        1,
        EmbeddingMeta {
            model: "hashed".to_string(),
            strategy: EmbeddingStrategy::Snippet,
        },
    );
    mutate(&mut chunk);

    let vector = harness.embedder.embed_text(text).await.expect("embed");
    let mut vectors = std::collections::HashMap::new();
    vectors.insert("text".to_string(), vector);
    harness
        .storage
        .upsert_chunks(
            &harness.collection,
            vec![Point {
                id: chunk.id.clone(),
                vectors,
                payload: chunk.clone(),
            }],
        )
        .await
        .expect("seed chunk");
    chunk
}

#[tokio::test]
async fn scores_are_unit_bounded_and_strictly_sorted() {
    let harness = harness(None).await;
    seed(&harness, "auth.md", 0, "authentication token refresh flow").await;
    seed(&harness, "auth.md", 1, "session cookie middleware details").await;
    seed(&harness, "db.md", 0, "database migration checklist").await;

    let hits = harness
        .service
        .search(SearchParams::new("authentication token"))
        .await
        .expect("search");

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn limit_truncates_results() {
    let harness = harness(None).await;
    for i in 0..8 {
        seed(&harness, "many.md", i, &format!("note number {i} about rust")).await;
    }

    let mut params = SearchParams::new("rust note");
    params.limit = 3;
    let hits = harness.service.search(params).await.expect("search");
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn deletion_eligible_chunks_are_hidden_by_default() {
    let harness = harness(None).await;
    let keep = seed(&harness, "k.md", 0, "shared topic text").await;
    let gone = seed_with(&harness, "g.md", 0, "shared topic text two", |chunk| {
        chunk.mark_deletion_eligible(None);
    })
    .await;

    let hits = harness
        .service
        .search(SearchParams::new("shared topic"))
        .await
        .expect("search");
    assert!(hits.iter().any(|h| h.chunk.id == keep.id));
    assert!(hits.iter().all(|h| h.chunk.id != gone.id));

    let mut params = SearchParams::new("shared topic");
    params.include_deletion_eligible = true;
    let hits = harness.service.search(params).await.expect("search");
    assert!(hits.iter().any(|h| h.chunk.id == gone.id));
}

#[tokio::test]
async fn qntm_key_filter_is_exact() {
    let harness = harness(None).await;
    seed_with(&harness, "a.md", 0, "first about deployment", |chunk| {
        chunk.qntm_keys = vec!["ops.deploy".to_string()];
    })
    .await;
    seed_with(&harness, "b.md", 0, "second about deployment", |chunk| {
        chunk.qntm_keys = vec!["ops.rollback".to_string()];
    })
    .await;

    let mut params = SearchParams::new("deployment");
    params.qntm_key = Some("ops.deploy".to_string());
    let hits = harness.service.search(params).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.qntm_keys, vec!["ops.deploy"]);
}

#[tokio::test]
async fn rerank_with_temperature_filter_matches_the_contract() {
    let harness = harness(None).await;
    let now = Utc::now();

    // Hot chunks: accessed often. Cold chunks: untouched for a month.
    for i in 0..6 {
        seed_with(
            &harness,
            "hot.md",
            i,
            &format!("authentication handler variant {i}"),
            |chunk| {
                chunk.access_count = 6;
            },
        )
        .await;
    }
    for i in 0..6 {
        seed_with(
            &harness,
            "cold.md",
            i,
            &format!("authentication archive entry {i}"),
            |chunk| {
                chunk.created_at = now - Duration::days(40);
            },
        )
        .await;
    }

    let mut params = SearchParams::new("authentication");
    params.limit = 5;
    params.rerank = true;
    params.rerank_top_k = Some(15);
    params.temperature = Some(Temperature::Hot);

    let hits = harness.service.search(params).await.expect("search");

    assert!(hits.len() <= 5);
    assert!(!hits.is_empty());
    assert!(hits
        .iter()
        .all(|h| h.chunk.temperature(Utc::now()) == Temperature::Hot));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));

    // One rerank call, with at most rerank_top_k candidates.
    let calls = harness.reranker.recorded_calls().await;
    assert_eq!(calls.len(), 1);
    assert!(calls[0] <= 15);
}

#[tokio::test]
async fn rerank_output_never_exceeds_input() {
    let harness = harness(None).await;
    seed(&harness, "one.md", 0, "lonely chunk about reranking").await;

    let mut params = SearchParams::new("reranking");
    params.limit = 10;
    params.rerank = true;
    params.rerank_top_k = Some(30);
    let hits = harness.service.search(params).await.expect("search");
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn hybrid_search_fuses_keyword_hits() {
    let harness = harness(None).await;
    seed(&harness, "x.md", 0, "vector spaces and embeddings").await;
    seed(&harness, "y.md", 0, "embeddings with keyword overlap galore").await;
    seed(&harness, "z.md", 0, "completely unrelated gardening notes").await;

    let mut params = SearchParams::new("embeddings keyword");
    params.hybrid_search = true;
    let hits = harness.service.search(params).await.expect("search");

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    // The chunk matching in both modalities leads.
    assert_eq!(hits[0].chunk.source.file_path, "y.md");
}

#[tokio::test]
async fn query_expansion_uses_the_llm_and_survives_failure() {
    let llm = ScriptedLlmBackend::new(vec![serde_json::json!({
        "variants": ["token auth", "login session handling"]
    })]);
    let harness = harness(Some(llm.clone())).await;
    seed(&harness, "a.md", 0, "token auth internals").await;

    let mut params = SearchParams::new("authentication");
    params.expand_query = true;
    let hits = harness.service.search(params).await.expect("search");
    assert!(!hits.is_empty());
    assert_eq!(llm.call_count().await, 1);

    // Script exhausted: expansion fails, search still answers.
    let mut params = SearchParams::new("authentication");
    params.expand_query = true;
    let hits = harness.service.search(params).await.expect("search");
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn search_bumps_access_counters() {
    let harness = harness(None).await;
    let chunk = seed(&harness, "acc.md", 0, "access tracked chunk").await;

    harness
        .service
        .search(SearchParams::new("access tracked"))
        .await
        .expect("search");

    let stored = harness
        .storage
        .vector()
        .retrieve(&harness.collection, &[chunk.id.clone()])
        .await
        .expect("retrieve");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].access_count, 1);
    assert!(stored[0].last_accessed_at.is_some());
}

#[tokio::test]
async fn timeline_windows_orders_and_buckets() {
    let harness = harness(None).await;
    let now = Utc::now();

    seed_with(&harness, "t.md", 0, "old entry", |chunk| {
        chunk.created_at = now - Duration::days(10);
    })
    .await;
    seed_with(&harness, "t.md", 1, "recent entry one", |chunk| {
        chunk.created_at = now - Duration::hours(5);
    })
    .await;
    seed_with(&harness, "t.md", 2, "recent entry two", |chunk| {
        chunk.created_at = now - Duration::hours(1);
    })
    .await;

    let mut params = TimelineParams::new(now - Duration::days(1));
    params.granularity = Some(Granularity::Day);
    let result = harness.service.timeline(params).await.expect("timeline");

    assert_eq!(result.total, 2);
    assert_eq!(result.chunks.len(), 2);
    // Ascending created_at, each with a day bucket.
    assert!(result.chunks[0].chunk.created_at <= result.chunks[1].chunk.created_at);
    for entry in &result.chunks {
        let bucket = entry.bucket.expect("bucketed");
        assert_eq!(bucket.time().hour(), 0);
    }
}

#[tokio::test]
async fn timeline_filters_by_qntm_prefix() {
    let harness = harness(None).await;
    let now = Utc::now();

    seed_with(&harness, "p.md", 0, "project alpha kickoff", |chunk| {
        chunk.qntm_keys = vec!["proj.alpha.kickoff".to_string()];
        chunk.created_at = now - Duration::hours(2);
    })
    .await;
    seed_with(&harness, "p.md", 1, "project beta kickoff", |chunk| {
        chunk.qntm_keys = vec!["proj.beta.kickoff".to_string()];
        chunk.created_at = now - Duration::hours(2);
    })
    .await;

    let mut params = TimelineParams::new(now - Duration::days(1));
    params.timeline_id = Some("proj.alpha".to_string());
    let result = harness.service.timeline(params).await.expect("timeline");

    assert_eq!(result.chunks.len(), 1);
    assert!(result.chunks[0].chunk.qntm_keys[0].starts_with("proj.alpha"));
}
