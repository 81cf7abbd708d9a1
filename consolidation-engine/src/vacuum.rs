use chrono::{Duration, Utc};
use tracing::{info, instrument};

use common::error::AppError;
use common::storage::store::StorageService;
use common::storage::vector::PayloadFilter;

/// Days a soft-deleted chunk survives before vacuum may remove it.
pub const DEFAULT_GRACE_DAYS: i64 = 14;

#[derive(Debug, Clone)]
pub struct VacuumParams {
    /// Bypass the grace period.
    pub force: bool,
    /// Report candidates without mutating anything.
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub grace: Duration,
}

impl Default for VacuumParams {
    fn default() -> Self {
        Self {
            force: false,
            dry_run: false,
            limit: None,
            grace: Duration::days(DEFAULT_GRACE_DAYS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Chunks eligible under the given parameters.
    pub candidates: usize,
    pub deleted: usize,
    pub candidate_ids: Vec<String>,
}

/// Hard-delete chunks whose `deletion_eligible` flag has aged past the grace
/// period. A chunk is only removed when `deletion_marked_at + grace <= now`
/// or `force` is set.
#[instrument(skip_all, fields(dry_run = params.dry_run, force = params.force))]
pub async fn vacuum_chunks(
    storage: &StorageService,
    collection: &str,
    params: &VacuumParams,
) -> Result<VacuumReport, AppError> {
    let filter = PayloadFilter {
        deletion_eligible: Some(true),
        ..PayloadFilter::default()
    };
    let marked = storage.scroll_all(collection, filter, 200).await?;

    let now = Utc::now();
    let mut candidate_ids: Vec<String> = marked
        .into_iter()
        .filter(|chunk| {
            if params.force {
                return true;
            }
            match chunk.deletion_marked_at {
                Some(marked_at) => marked_at + params.grace <= now,
                // Eligible but never stamped: leave it for a later pass.
                None => false,
            }
        })
        .map(|chunk| chunk.id)
        .collect();

    if let Some(limit) = params.limit {
        candidate_ids.truncate(limit);
    }

    let report = VacuumReport {
        candidates: candidate_ids.len(),
        deleted: if params.dry_run {
            0
        } else {
            candidate_ids.len()
        },
        candidate_ids: candidate_ids.clone(),
    };

    if !params.dry_run && !candidate_ids.is_empty() {
        storage.delete(collection, &candidate_ids).await?;
    }

    info!(
        candidates = report.candidates,
        deleted = report.deleted,
        "vacuum finished"
    );
    Ok(report)
}
