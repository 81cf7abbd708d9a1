use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use common::error::AppError;
use common::storage::types::causal_link::CausalLink;
use common::storage::types::chunk::Chunk;
use common::storage::types::StoredObject;
use common::storage::vector::PayloadFilter;

use crate::SearchService;

pub const DEFAULT_TIMELINE_LIMIT: usize = 100;
const SCROLL_PAGE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

#[derive(Debug, Clone)]
pub struct TimelineParams {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    /// Matches chunks whose qntm keys start with this prefix; a coarse
    /// grouping handle for related work.
    pub timeline_id: Option<String>,
    pub qntm_key: Option<String>,
    pub include_causal_links: bool,
    pub granularity: Option<Granularity>,
}

impl TimelineParams {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            since,
            until: None,
            limit: DEFAULT_TIMELINE_LIMIT,
            timeline_id: None,
            qntm_key: None,
            include_causal_links: false,
            granularity: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    /// Bucket start when a granularity was requested.
    pub bucket: Option<DateTime<Utc>>,
    pub chunk: Chunk,
    pub causal_links: Vec<CausalLink>,
}

#[derive(Debug, Clone)]
pub struct TimelineResult {
    pub chunks: Vec<TimelineEntry>,
    pub total: usize,
}

impl SearchService {
    /// Chronological scan: chunks created inside the window, ordered by
    /// `created_at`, bucketed after the scan when a granularity is given.
    #[instrument(skip_all, fields(limit = params.limit))]
    pub async fn timeline(&self, params: TimelineParams) -> Result<TimelineResult, AppError> {
        let collection = self.collection()?;

        let filter = PayloadFilter {
            since: Some(params.since),
            until: params.until,
            qntm_key: params.qntm_key.clone(),
            deletion_eligible: Some(false),
            ..PayloadFilter::default()
        };

        let mut chunks = self
            .storage()
            .scroll_all(&collection, filter, SCROLL_PAGE)
            .await?;

        if let Some(timeline_id) = &params.timeline_id {
            chunks.retain(|chunk| {
                chunk
                    .qntm_keys
                    .iter()
                    .any(|key| key.starts_with(timeline_id.as_str()))
            });
        }

        let total = chunks.len();
        chunks.truncate(params.limit.max(1));

        let mut entries = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let causal_links = if params.include_causal_links {
                self.causal_links_for(&chunk.id).await?
            } else {
                Vec::new()
            };
            entries.push(TimelineEntry {
                bucket: params
                    .granularity
                    .map(|granularity| bucket_start(chunk.created_at, granularity)),
                chunk,
                causal_links,
            });
        }

        Ok(TimelineResult {
            chunks: entries,
            total,
        })
    }

    async fn causal_links_for(&self, chunk_id: &str) -> Result<Vec<CausalLink>, AppError> {
        let mut response = self
            .db()
            .client
            .query(format!(
                "SELECT * FROM {} WHERE from_chunk = $id OR to_chunk = $id;",
                CausalLink::table_name()
            ))
            .bind(("id", chunk_id.to_string()))
            .await?;
        let links: Vec<CausalLink> = response.take(0)?;
        Ok(links)
    }
}

fn bucket_start(at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => Utc
            .with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0)
            .single()
            .unwrap_or(at),
        Granularity::Day => Utc
            .with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
            .single()
            .unwrap_or(at),
    }
}
