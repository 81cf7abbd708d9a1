use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::warn;

use common::error::AppError;
use common::events::AtlasEvent;
use common::storage::types::chunk::{ContentType, Temperature};
use consolidation_engine::{vacuum_chunks, ConsolidateParams, VacuumParams};
use ingestion_pipeline::IngestParams;
use retrieval_pipeline::timeline::TimelineParams;
use retrieval_pipeline::SearchParams;

use crate::bootstrap::AppContext;
use crate::cli::{
    ConsolidateArgs, IngestArgs, SearchArgs, StoreCommand, TemperatureArg, TimelineArgs,
    TrackingCommand,
};

fn parse_date(raw: &str, flag: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Validation(format!("--{flag} expects ISO-8601: {err}")))
}

fn snippet(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    let mut out: String = flat.chars().take(max).collect();
    if flat.chars().count() > max {
        out.push('…');
    }
    out
}

pub async fn ingest(ctx: &AppContext, args: IngestArgs) -> Result<i32, AppError> {
    let root_dir = std::env::current_dir()?;
    let pipeline = ctx.pipeline();

    // Progress printer; dropped (and thereby stopped) once the run finishes.
    let progress = if args.quiet {
        None
    } else {
        let mut rx = ctx.events.subscribe();
        Some(tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    AtlasEvent::FileSkipped { path, reason } => {
                        println!("- {path} ({reason})");
                    }
                    AtlasEvent::FileCompleted { path, chunks } => {
                        println!("+ {path} ({chunks} chunks)");
                    }
                    AtlasEvent::IngestError { file, message, .. } => {
                        println!("! {}: {message}", file.unwrap_or_else(|| "<run>".into()));
                    }
                    _ => {}
                }
            }
        }))
    };

    let mut params = IngestParams::new(
        args.paths.iter().map(PathBuf::from).collect(),
        root_dir,
    );
    params.recursive = args.recursive;
    params.verbose = !args.quiet;

    let report = pipeline.run(params).await?;
    if let Some(progress) = progress {
        progress.abort();
    }

    println!(
        "{} files, {} chunks stored, {} skipped, {} errors in {} ms",
        report.files_processed,
        report.chunks_stored,
        report.skipped_files,
        report.errors.len(),
        report.duration_ms
    );
    for error in &report.errors {
        eprintln!("error: {}: {}", error.file, error.error);
    }

    Ok(i32::from(!report.errors.is_empty()))
}

pub async fn search(ctx: &AppContext, args: SearchArgs) -> Result<i32, AppError> {
    let mut params = SearchParams::new(args.query.clone());
    params.limit = args.limit;
    if let Some(since) = &args.since {
        params.since = Some(parse_date(since, "since")?);
    }
    params.qntm_key = args.qntm_key.clone();
    params.rerank = args.rerank || args.reranker;
    params.consolidation_level = args.consolidation_level;
    params.agent_role = args.agent_role.clone();
    if let Some(content_type) = &args.content_type {
        params.content_type = Some(match content_type.as_str() {
            "text" => ContentType::Text,
            "code" => ContentType::Code,
            "media" => ContentType::Media,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown content type: {other}"
                )))
            }
        });
    }
    params.temperature = args.temperature.map(|t| match t {
        TemperatureArg::Hot => Temperature::Hot,
        TemperatureArg::Warm => Temperature::Warm,
        TemperatureArg::Cold => Temperature::Cold,
    });

    let hits = ctx.search.search(params).await?;
    if hits.is_empty() {
        println!("no results");
        return Ok(0);
    }

    for hit in &hits {
        println!(
            "{:.3}  {}#{}  {}",
            hit.score,
            hit.chunk.source.file_path,
            hit.chunk.chunk_index,
            snippet(&hit.chunk.text, 100)
        );
        if !hit.chunk.qntm_keys.is_empty() {
            println!("       keys: {}", hit.chunk.qntm_keys.join(", "));
        }
    }
    Ok(0)
}

pub async fn timeline(ctx: &AppContext, args: TimelineArgs) -> Result<i32, AppError> {
    let mut params = TimelineParams::new(parse_date(&args.since, "since")?);
    params.limit = args.limit;

    let result = ctx.search.timeline(params).await?;
    for entry in &result.chunks {
        println!(
            "{}  {}#{}  {}",
            entry.chunk.created_at.format("%Y-%m-%d %H:%M"),
            entry.chunk.source.file_path,
            entry.chunk.chunk_index,
            snippet(&entry.chunk.text, 80)
        );
    }
    println!("{} of {} chunks", result.chunks.len(), result.total);
    Ok(0)
}

pub async fn consolidate(ctx: &AppContext, args: ConsolidateArgs) -> Result<i32, AppError> {
    let report = ctx
        .engine
        .run(ConsolidateParams {
            dry_run: args.dry_run,
            threshold: args.threshold,
            ..ConsolidateParams::default()
        })
        .await?;

    if let Some(preview) = &report.preview {
        println!("{} candidate pairs:", preview.len());
        for pair in preview {
            println!("  {} <-> {} ({:.3})", pair.first, pair.second, pair.similarity);
        }
        return Ok(0);
    }

    println!(
        "{} consolidations, {} chunks absorbed, {} candidates evaluated in {} ms",
        report.consolidations_performed,
        report.chunks_absorbed,
        report.candidates_evaluated,
        report.duration_ms
    );
    if !report.type_breakdown.is_empty() {
        let breakdown: BTreeMap<_, _> = report.type_breakdown.iter().collect();
        for (kind, count) in breakdown {
            println!("  {kind}: {count}");
        }
    }
    Ok(0)
}

pub async fn store(ctx: &AppContext, command: StoreCommand) -> Result<i32, AppError> {
    let collection = ctx.collection()?;
    match command {
        StoreCommand::Drop { yes } => {
            if !yes {
                eprintln!("refusing to drop {collection} without --yes");
                return Ok(1);
            }
            ctx.storage.drop_collection(&collection).await?;
            println!("dropped {collection}");
            Ok(0)
        }
        StoreCommand::Hnsw { state } => {
            let enabled = state == "on";
            ctx.storage.set_hnsw_enabled(&collection, enabled).await?;
            println!("hnsw {state} for {collection}");
            Ok(0)
        }
        StoreCommand::Vacuum {
            force,
            dry_run,
            limit,
        } => {
            let report = vacuum_chunks(
                &ctx.storage,
                &collection,
                &VacuumParams {
                    force,
                    dry_run,
                    limit,
                    grace: chrono::Duration::days(ctx.config.vacuum_grace_days),
                },
            )
            .await?;
            if dry_run {
                println!("{} chunks eligible for deletion", report.candidates);
                for id in &report.candidate_ids {
                    println!("  {id}");
                }
            } else {
                println!("deleted {} chunks", report.deleted);
            }
            Ok(0)
        }
    }
}

pub async fn tracking(ctx: &AppContext, command: TrackingCommand) -> Result<i32, AppError> {
    match command {
        TrackingCommand::Status => {
            let stats = ctx.tracker.stats().await?;
            println!(
                "{} sources, {} active chunks, {} superseded",
                stats.sources, stats.active_chunks, stats.superseded_chunks
            );
            Ok(0)
        }
        TrackingCommand::Vacuum { dry_run } => {
            let grace = chrono::Duration::days(ctx.config.vacuum_grace_days);
            if dry_run {
                let removable = ctx.tracker.vacuum_preview(grace).await?;
                println!("{removable} superseded records eligible for removal");
            } else {
                let removed = ctx.tracker.vacuum(grace).await?;
                println!("removed {removed} superseded records");
            }
            Ok(0)
        }
        TrackingCommand::Check { path } => {
            let path = PathBuf::from(path);
            match ctx.tracker.needs_ingestion(&path).await {
                Ok(decision) => {
                    println!(
                        "{}: {} (needs ingestion: {})",
                        path.display(),
                        decision.reason.as_str(),
                        decision.needs
                    );
                    if let Some(existing) = decision.existing {
                        println!("  {} active chunk records", existing.len());
                    }
                    Ok(0)
                }
                Err(err) => {
                    warn!(error = %err, "tracking check failed");
                    eprintln!("{}: {err}", path.display());
                    Ok(1)
                }
            }
        }
    }
}
