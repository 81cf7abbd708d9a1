use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::error::AppError;
use common::events::{AtlasEvent, EventBus};
use ingestion_pipeline::{IngestParams, IngestPipeline};

/// Watch `roots` and ingest files as they appear or change. Runs until the
/// task is cancelled.
pub async fn run_watch(
    pipeline: Arc<IngestPipeline>,
    events: EventBus,
    roots: Vec<PathBuf>,
    pattern: Option<String>,
) -> Result<(), AppError> {
    let (tx, mut rx) = mpsc::channel::<Event>(256);

    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |result| {
        match result {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(err) => warn!(error = %err, "file watcher error"),
        }
    })
    .map_err(|err| AppError::InternalError(format!("watcher init failed: {err}")))?;

    let mut canonical_roots = Vec::with_capacity(roots.len());
    for root in &roots {
        let canonical = root.canonicalize()?;
        watcher
            .watch(&canonical, RecursiveMode::Recursive)
            .map_err(|err| {
                AppError::Validation(format!("cannot watch {}: {err}", canonical.display()))
            })?;
        info!(path = %canonical.display(), "watching");
        canonical_roots.push(canonical);
    }

    while let Some(event) = rx.recv().await {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }

        for path in event.paths {
            if !path.is_file() {
                continue;
            }
            if !matches_pattern(&path, pattern.as_deref()) {
                continue;
            }
            let Some(root) = canonical_roots
                .iter()
                .find(|root| path.starts_with(root))
                .cloned()
            else {
                continue;
            };

            events.emit(AtlasEvent::WatchFileChanged {
                path: path.display().to_string(),
            });

            debug!(path = %path.display(), "change detected; ingesting");
            let mut params = IngestParams::new(vec![path.clone()], root);
            params.use_hnsw_toggle = false;
            match pipeline.run(params).await {
                Ok(report) => {
                    debug!(
                        path = %path.display(),
                        chunks = report.chunks_stored,
                        skipped = report.skipped_files,
                        "watch ingest finished"
                    );
                }
                Err(err) => warn!(path = %path.display(), error = %err, "watch ingest failed"),
            }
        }
    }

    Ok(())
}

fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.starts_with('.') {
        return false;
    }
    match pattern {
        Some(pattern) => name.contains(pattern),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern(Path::new("/x/notes.md"), None));
        assert!(matches_pattern(Path::new("/x/notes.md"), Some(".md")));
        assert!(!matches_pattern(Path::new("/x/notes.md"), Some(".rs")));
        assert!(!matches_pattern(Path::new("/x/.hidden.md"), None));
    }
}
