use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use common::backends::{BackendRegistry, Capability};
use common::error::AppError;
use common::events::{AtlasEvent, EventBus};
use common::prompts::{
    PromptRegistry, RenderTarget, CONSOLIDATION_CLASSIFY, CONSOLIDATION_CLASSIFY_L2,
};
use common::storage::db::SurrealDbClient;
use common::storage::store::{collection_name, StorageService};
use common::storage::types::causal_link::{CausalLink, CausalRelation};
use common::storage::types::chunk::{
    Chunk, ConsolidationDirection, ConsolidationMeta, ConsolidationType, EmbeddingMeta,
    EmbeddingStrategy,
};
use common::storage::vector::{
    PayloadFilter, Point, ScrollRequest, VectorSearchRequest,
};
use ingestion_pipeline::watchdog::{ConsolidationOutcome, ConsolidationRunner};

use crate::classify::{
    classification_schema, parse_classification, Classification, KeepChoice,
};

/// The highest consolidation level; domain summaries do not merge further.
const MAX_LEVEL: u8 = 3;

#[derive(Debug, Clone)]
pub struct ConsolidationTuning {
    /// Cosine similarity floor for candidate pairs.
    pub similarity_threshold: f32,
    /// Neighbours fetched per scanned chunk.
    pub knn_limit: usize,
    /// Hard cap on candidate pairs per pass.
    pub candidate_limit: usize,
    pub scroll_page: usize,
}

impl Default for ConsolidationTuning {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            knn_limit: 5,
            candidate_limit: 200,
            scroll_page: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidateParams {
    pub dry_run: bool,
    /// Override for the similarity threshold.
    pub threshold: Option<f32>,
    /// Scroll page override.
    pub batch_size: Option<usize>,
    /// Cap on pairs evaluated this pass.
    pub limit: Option<usize>,
    pub qntm_key_filter: Option<String>,
    /// Level whose chunks are scanned; higher levels emerge by re-running
    /// against level 1 and 2.
    pub consolidation_level: u8,
    /// Keep running passes until one performs no merges.
    pub continuous: bool,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePreview {
    pub first: String,
    pub second: String,
    pub similarity: f32,
}

/// The result contract. Deliberately free of speculative fields: no rounds,
/// no per-level stats.
#[derive(Debug, Clone, Default)]
pub struct ConsolidateReport {
    pub consolidations_performed: usize,
    pub chunks_absorbed: usize,
    pub candidates_evaluated: usize,
    pub type_breakdown: HashMap<String, usize>,
    pub duration_ms: u64,
    pub preview: Option<Vec<CandidatePreview>>,
}

/// Hierarchical deduplication and abstraction over stored chunks: KNN
/// candidate discovery, LLM classification, then merge/supersede with
/// soft deletes and provenance links.
pub struct ConsolidationEngine {
    storage: StorageService,
    db: Arc<SurrealDbClient>,
    registry: Arc<BackendRegistry>,
    prompts: Arc<PromptRegistry>,
    events: EventBus,
    tuning: ConsolidationTuning,
}

struct CandidatePair {
    first: Chunk,
    second: Chunk,
    similarity: f32,
}

impl ConsolidationEngine {
    pub fn new(
        storage: StorageService,
        db: Arc<SurrealDbClient>,
        registry: Arc<BackendRegistry>,
        prompts: Arc<PromptRegistry>,
        events: EventBus,
        tuning: ConsolidationTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            db,
            registry,
            prompts,
            events,
            tuning,
        })
    }

    fn collection(&self) -> Result<String, AppError> {
        Ok(collection_name(
            self.registry.text_embedding()?.dimension(),
        ))
    }

    /// Run one pass, or, with `continuous`, repeat passes until one performs
    /// no merges (bounded so a convergent store terminates).
    pub async fn run(&self, params: ConsolidateParams) -> Result<ConsolidateReport, AppError> {
        if !params.continuous {
            return self.run_pass(&params).await;
        }

        const MAX_CONTINUOUS_PASSES: usize = 16;
        let poll = std::time::Duration::from_millis(params.poll_interval_ms.unwrap_or(1_000));
        let started = Instant::now();
        let mut aggregate = ConsolidateReport::default();

        for _ in 0..MAX_CONTINUOUS_PASSES {
            let pass = self.run_pass(&params).await?;
            aggregate.consolidations_performed += pass.consolidations_performed;
            aggregate.chunks_absorbed += pass.chunks_absorbed;
            aggregate.candidates_evaluated += pass.candidates_evaluated;
            for (key, value) in pass.type_breakdown {
                *aggregate.type_breakdown.entry(key).or_insert(0) += value;
            }
            if pass.consolidations_performed == 0 || params.dry_run {
                aggregate.preview = pass.preview;
                break;
            }
            tokio::time::sleep(poll).await;
        }

        aggregate.duration_ms = elapsed_ms(started);
        Ok(aggregate)
    }

    #[instrument(skip_all, fields(dry_run = params.dry_run, level = params.consolidation_level))]
    async fn run_pass(&self, params: &ConsolidateParams) -> Result<ConsolidateReport, AppError> {
        let started = Instant::now();
        let collection = self.collection()?;
        let threshold = params
            .threshold
            .unwrap_or(self.tuning.similarity_threshold);
        let pair_limit = params
            .limit
            .unwrap_or(self.tuning.candidate_limit)
            .min(self.tuning.candidate_limit)
            .max(1);

        let candidates = self
            .discover_candidates(&collection, params, threshold, pair_limit)
            .await?;
        info!(
            candidates = candidates.len(),
            threshold, "consolidation candidates discovered"
        );

        if params.dry_run {
            let preview = candidates
                .iter()
                .map(|pair| CandidatePreview {
                    first: pair.first.id.clone(),
                    second: pair.second.id.clone(),
                    similarity: pair.similarity,
                })
                .collect();
            return Ok(ConsolidateReport {
                candidates_evaluated: candidates.len(),
                duration_ms: elapsed_ms(started),
                preview: Some(preview),
                ..ConsolidateReport::default()
            });
        }

        let mut report = ConsolidateReport::default();
        // Chunks already absorbed this pass must not be merged twice.
        let mut consumed: BTreeSet<String> = BTreeSet::new();

        for pair in candidates {
            if consumed.contains(&pair.first.id) || consumed.contains(&pair.second.id) {
                continue;
            }
            report.candidates_evaluated += 1;

            let classification = match self.classify(&pair, params.consolidation_level).await {
                Ok(classification) => classification,
                Err(err) => {
                    // Transport-level failure: skip the pair rather than
                    // merging on a guess.
                    warn!(error = %err, "classification call failed; skipping pair");
                    continue;
                }
            };

            let type_tag = match classification.consolidation_type {
                ConsolidationType::DuplicateWork => "duplicate_work",
                ConsolidationType::SequentialIteration => "sequential_iteration",
                ConsolidationType::ContextualConvergence => "contextual_convergence",
            };

            match self
                .merge_pair(&collection, &pair, &classification, &mut consumed)
                .await
            {
                Ok(absorbed) => {
                    report.consolidations_performed += 1;
                    report.chunks_absorbed += absorbed;
                    *report
                        .type_breakdown
                        .entry(type_tag.to_string())
                        .or_insert(0) += 1;
                }
                Err(err) => {
                    warn!(error = %err, "merge failed for candidate pair");
                    self.events.emit(AtlasEvent::ConsolidateError {
                        message: err.to_string(),
                    });
                }
            }
        }

        report.duration_ms = elapsed_ms(started);
        self.events.emit(AtlasEvent::ConsolidateCompleted {
            consolidations_performed: report.consolidations_performed,
            chunks_absorbed: report.chunks_absorbed,
            candidates_evaluated: report.candidates_evaluated,
        });

        Ok(report)
    }

    /// Scroll the collection and KNN each eligible chunk against its peers.
    /// Pairs are canonicalised to (min, max) so each shows up once.
    async fn discover_candidates(
        &self,
        collection: &str,
        params: &ConsolidateParams,
        threshold: f32,
        pair_limit: usize,
    ) -> Result<Vec<CandidatePair>, AppError> {
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        let mut pairs: Vec<CandidatePair> = Vec::new();
        let mut offset = 0;
        let page_size = params.batch_size.unwrap_or(self.tuning.scroll_page).max(1);

        let scan_filter = PayloadFilter {
            consolidation_level: Some(params.consolidation_level),
            deletion_eligible: Some(false),
            qntm_key: params.qntm_key_filter.clone(),
            ..PayloadFilter::default()
        };

        'scan: loop {
            let page = self
                .storage
                .scroll(
                    collection,
                    ScrollRequest {
                        filter: scan_filter.clone(),
                        limit: page_size,
                        offset,
                        with_vector: Some("text".to_string()),
                    },
                )
                .await?;

            for item in &page.items {
                let Some(vector) = item.vector.clone() else {
                    continue;
                };

                let neighbours = self
                    .storage
                    .search(
                        collection,
                        VectorSearchRequest {
                            vector,
                            vector_name: "text".to_string(),
                            // One extra so the chunk itself can be dropped.
                            limit: self.tuning.knn_limit + 1,
                            filter: PayloadFilter {
                                consolidation_level: Some(params.consolidation_level),
                                deletion_eligible: Some(false),
                                ..PayloadFilter::default()
                            },
                            score_threshold: Some(threshold),
                        },
                    )
                    .await?;

                for neighbour in neighbours {
                    if neighbour.id == item.chunk.id {
                        continue;
                    }
                    let key = canonical_pair(&item.chunk.id, &neighbour.id);
                    if !seen.insert(key) {
                        continue;
                    }
                    let (first, second) = if item.chunk.id <= neighbour.id {
                        (item.chunk.clone(), neighbour.chunk)
                    } else {
                        (neighbour.chunk, item.chunk.clone())
                    };
                    pairs.push(CandidatePair {
                        first,
                        second,
                        similarity: neighbour.score,
                    });
                    if pairs.len() >= pair_limit {
                        break 'scan;
                    }
                }
            }

            match page.next_offset {
                Some(next) => offset = next,
                None => break,
            }
        }

        Ok(pairs)
    }

    async fn classify(
        &self,
        pair: &CandidatePair,
        level: u8,
    ) -> Result<Classification, AppError> {
        let backend = self
            .registry
            .json_completion_for(Capability::JsonCompletion)?;

        let prompt_id = if level == 0 {
            CONSOLIDATION_CLASSIFY
        } else {
            CONSOLIDATION_CLASSIFY_L2
        };

        let target = RenderTarget {
            provider: backend.name().to_string(),
            model_family: backend.model_family(),
            capabilities: backend.capabilities().to_vec(),
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("first_text", pair.first.text.clone());
        vars.insert("second_text", pair.second.text.clone());
        vars.insert("first_keys", pair.first.qntm_keys.join(", "));
        vars.insert("second_keys", pair.second.qntm_keys.join(", "));
        if level == 0 {
            vars.insert("first_created", pair.first.created_at.to_rfc3339());
            vars.insert("second_created", pair.second.created_at.to_rfc3339());
        } else {
            vars.insert("first_level", pair.first.consolidation_level.to_string());
            vars.insert("second_level", pair.second.consolidation_level.to_string());
        }

        let prompt = self.prompts.render(prompt_id, &target, &vars)?;

        match backend
            .complete_json(
                "You classify relationships between stored memory chunks.",
                &prompt,
                "consolidation_classification",
                classification_schema(),
            )
            .await
        {
            Ok(value) => Ok(parse_classification(value)),
            Err(AppError::LLMParsing(reason)) => {
                debug!(%reason, "classification parse failure; fallback applied");
                Ok(Classification::fallback())
            }
            Err(err) => Err(err),
        }
    }

    /// Apply the merge rules. Returns how many chunks were absorbed.
    async fn merge_pair(
        &self,
        collection: &str,
        pair: &CandidatePair,
        classification: &Classification,
        consumed: &mut BTreeSet<String>,
    ) -> Result<usize, AppError> {
        match (classification.consolidation_type, classification.keep) {
            (ConsolidationType::DuplicateWork, KeepChoice::First) => {
                self.absorb(collection, &pair.first, &pair.second, classification, None)
                    .await?;
                consumed.insert(pair.second.id.clone());
                Ok(1)
            }
            (ConsolidationType::DuplicateWork, KeepChoice::Second) => {
                self.absorb(collection, &pair.second, &pair.first, classification, None)
                    .await?;
                consumed.insert(pair.first.id.clone());
                Ok(1)
            }
            (ConsolidationType::SequentialIteration, keep) => {
                // Direction says which chunk is the later state.
                let (keeper, earlier) = match (classification.direction, keep) {
                    (ConsolidationDirection::Backward, _) => (&pair.first, &pair.second),
                    (ConsolidationDirection::Forward, _) => (&pair.second, &pair.first),
                    (_, KeepChoice::Second) => (&pair.second, &pair.first),
                    _ => (&pair.first, &pair.second),
                };
                let promote_to = keeper.consolidation_level.max(1);
                self.absorb(
                    collection,
                    keeper,
                    earlier,
                    classification,
                    Some(promote_to),
                )
                .await?;
                consumed.insert(earlier.id.clone());
                Ok(1)
            }
            (ConsolidationType::ContextualConvergence, _)
            | (ConsolidationType::DuplicateWork, KeepChoice::Merge) => {
                self.synthesise(collection, pair, classification).await?;
                consumed.insert(pair.first.id.clone());
                consumed.insert(pair.second.id.clone());
                Ok(2)
            }
        }
    }

    /// Keep `winner`, soft-delete `loser`, union keys and extend provenance.
    async fn absorb(
        &self,
        collection: &str,
        winner: &Chunk,
        loser: &Chunk,
        classification: &Classification,
        promote_to: Option<u8>,
    ) -> Result<(), AppError> {
        let mut keys = winner.qntm_keys.clone();
        for key in &loser.qntm_keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut parents = winner.parents.clone();
        if !parents.contains(&loser.id) {
            parents.push(loser.id.clone());
        }

        let mut winner_patch = serde_json::json!({
            "qntm_keys": keys,
            "parents": parents,
        });

        if let Some(level) = promote_to {
            // Guard the monotonicity invariant before writing anything.
            let mut promoted = winner.clone();
            promoted.promote_level(level)?;
            winner_patch["consolidation_level"] = serde_json::json!(level);
            winner_patch["consolidation"] = serde_json::to_value(ConsolidationMeta {
                consolidation_type: Some(classification.consolidation_type),
                direction: Some(classification.direction),
                abstraction_score: None,
                reasoning: Some(classification.reasoning.clone()),
                occurrence_timestamps: vec![winner.created_at, loser.created_at],
            })
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        }

        self.storage
            .set_payload(collection, std::slice::from_ref(&winner.id), winner_patch)
            .await?;

        let loser_patch = serde_json::json!({
            "deletion_eligible": true,
            "superseded_by": winner.id,
            "deletion_marked_at": Utc::now().to_rfc3339(),
        });
        self.storage
            .set_payload(collection, std::slice::from_ref(&loser.id), loser_patch)
            .await?;

        self.db
            .store_item(CausalLink::new(
                winner.id.clone(),
                loser.id.clone(),
                CausalRelation::Supersedes,
                0.9,
                "consolidation-engine".to_string(),
            ))
            .await?;

        self.events.emit(AtlasEvent::ConsolidatePairMerged {
            kept: winner.id.clone(),
            absorbed: loser.id.clone(),
            consolidation_type: match classification.consolidation_type {
                ConsolidationType::DuplicateWork => "duplicate_work".to_string(),
                ConsolidationType::SequentialIteration => "sequential_iteration".to_string(),
                ConsolidationType::ContextualConvergence => {
                    "contextual_convergence".to_string()
                }
            },
        });

        Ok(())
    }

    /// Create a new higher-level chunk whose text synthesises both sources;
    /// both become deletion-eligible with the new chunk as their successor.
    async fn synthesise(
        &self,
        collection: &str,
        pair: &CandidatePair,
        classification: &Classification,
    ) -> Result<(), AppError> {
        let level = pair
            .first
            .consolidation_level
            .max(pair.second.consolidation_level)
            .saturating_add(1)
            .min(MAX_LEVEL);

        let text = format!("{}\n\n{}", pair.first.text, pair.second.text);
        let embedder = self.registry.text_embedding()?;
        let vector = embedder.embed_text(&text).await?;

        let mut chunk = Chunk::new(
            pair.first.source.clone(),
            text,
            pair.first.chunk_index,
            pair.first.total_chunks,
            EmbeddingMeta {
                model: embedder.model_name(),
                strategy: EmbeddingStrategy::Snippet,
            },
        );
        // Synthetic chunks are not file-addressed; they get a fresh identity.
        chunk.id = Uuid::new_v4().simple().to_string();
        chunk.consolidation_level = level;
        chunk.parents = vec![pair.first.id.clone(), pair.second.id.clone()];
        chunk.qntm_keys = {
            let mut keys = pair.first.qntm_keys.clone();
            for key in &pair.second.qntm_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            keys
        };
        chunk.consolidation = Some(ConsolidationMeta {
            consolidation_type: Some(classification.consolidation_type),
            direction: Some(classification.direction),
            abstraction_score: Some(pair.similarity.clamp(0.0, 1.0)),
            reasoning: Some(classification.reasoning.clone()),
            occurrence_timestamps: vec![pair.first.created_at, pair.second.created_at],
        });
        chunk.vector_names = vec!["text".to_string()];

        let mut vectors = HashMap::new();
        vectors.insert("text".to_string(), vector);
        self.storage
            .upsert_chunks(
                collection,
                vec![Point {
                    id: chunk.id.clone(),
                    vectors,
                    payload: chunk.clone(),
                }],
            )
            .await?;

        for source in [&pair.first, &pair.second] {
            let patch = serde_json::json!({
                "deletion_eligible": true,
                "superseded_by": chunk.id,
                "deletion_marked_at": Utc::now().to_rfc3339(),
            });
            self.storage
                .set_payload(collection, std::slice::from_ref(&source.id), patch)
                .await?;
            self.db
                .store_item(CausalLink::new(
                    chunk.id.clone(),
                    source.id.clone(),
                    CausalRelation::DerivedFrom,
                    0.9,
                    "consolidation-engine".to_string(),
                ))
                .await?;
        }

        self.events.emit(AtlasEvent::ConsolidatePairMerged {
            kept: chunk.id,
            absorbed: format!("{},{}", pair.first.id, pair.second.id),
            consolidation_type: "contextual_convergence".to_string(),
        });

        Ok(())
    }
}

#[async_trait]
impl ConsolidationRunner for ConsolidationEngine {
    async fn run_bounded(&self, max_pairs: usize) -> Result<ConsolidationOutcome, AppError> {
        let report = self
            .run(ConsolidateParams {
                limit: Some(max_pairs),
                ..ConsolidateParams::default()
            })
            .await?;
        Ok(ConsolidationOutcome {
            consolidations_performed: report.consolidations_performed,
            chunks_absorbed: report.chunks_absorbed,
            candidates_evaluated: report.candidates_evaluated,
        })
    }
}

fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
