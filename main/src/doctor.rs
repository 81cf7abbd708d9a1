use futures::future::join_all;

use crate::bootstrap::{resolve_data_dir, AppContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Ok,
    Warning,
    Error,
    NotConfigured,
}

impl ProbeStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::NotConfigured => "not configured",
        }
    }
}

#[derive(Debug)]
pub struct Probe {
    pub name: String,
    pub status: ProbeStatus,
    pub detail: String,
}

fn probe(name: &str, status: ProbeStatus, detail: impl Into<String>) -> Probe {
    Probe {
        name: name.to_string(),
        status,
        detail: detail.into(),
    }
}

/// Probe every external collaborator and report readiness. Returns the
/// process exit code: non-zero when any probe errored.
pub async fn run(ctx: &AppContext) -> i32 {
    let mut probes: Vec<Probe> = Vec::new();

    // Environment.
    let data_dir = resolve_data_dir(&ctx.config);
    match std::fs::create_dir_all(&data_dir) {
        Ok(()) => probes.push(probe(
            "data directory",
            ProbeStatus::Ok,
            data_dir.display().to_string(),
        )),
        Err(err) => probes.push(probe(
            "data directory",
            ProbeStatus::Error,
            format!("{}: {err}", data_dir.display()),
        )),
    }

    // Vector store reachability and collection stats.
    match ctx.collection() {
        Ok(collection) => match ctx.storage.vector().collection_exists(&collection).await {
            Ok(true) => match ctx.storage.collection_info(&collection).await {
                Ok(info) => probes.push(probe(
                    "vector store",
                    ProbeStatus::Ok,
                    format!(
                        "{collection}: {} points, hnsw {}",
                        info.points_count,
                        if info.hnsw_enabled { "on" } else { "off" }
                    ),
                )),
                Err(err) => {
                    probes.push(probe("vector store", ProbeStatus::Error, err.to_string()))
                }
            },
            Ok(false) => probes.push(probe(
                "vector store",
                ProbeStatus::Warning,
                format!("{collection} absent (nothing ingested yet)"),
            )),
            Err(err) => probes.push(probe("vector store", ProbeStatus::Error, err.to_string())),
        },
        Err(err) => probes.push(probe("vector store", ProbeStatus::Error, err.to_string())),
    }

    // Tracker.
    match ctx.tracker.stats().await {
        Ok(stats) => probes.push(probe(
            "file tracker",
            ProbeStatus::Ok,
            format!(
                "{} sources, {} active chunks, {} superseded",
                stats.sources, stats.active_chunks, stats.superseded_chunks
            ),
        )),
        Err(err) => probes.push(probe("file tracker", ProbeStatus::Error, err.to_string())),
    }

    // Full-text and cache tiers.
    match ctx.storage.fulltext() {
        Some(fulltext) => match fulltext.health_check().await {
            Ok(()) => probes.push(probe("full-text index", ProbeStatus::Ok, "reachable")),
            Err(err) => {
                probes.push(probe("full-text index", ProbeStatus::Error, err.to_string()))
            }
        },
        None => probes.push(probe(
            "full-text index",
            ProbeStatus::NotConfigured,
            "hybrid search disabled",
        )),
    }
    match ctx.storage.cache() {
        Some(cache) => match cache.health_check().await {
            Ok(()) => probes.push(probe("cache", ProbeStatus::Ok, "reachable")),
            Err(err) => probes.push(probe("cache", ProbeStatus::Error, err.to_string())),
        },
        None => probes.push(probe("cache", ProbeStatus::NotConfigured, "no cache tier")),
    }

    // Models: probe every registered backend in parallel.
    probes.extend(probe_backends(ctx).await);

    // Configuration.
    probes.push(probe(
        "configuration",
        ProbeStatus::Ok,
        format!(
            "embedding={} llm={}",
            ctx.config.embedding_backend, ctx.config.llm_backend
        ),
    ));

    let mut ok = 0usize;
    let mut warnings = 0usize;
    let mut errors = 0usize;
    let mut not_configured = 0usize;
    for p in &probes {
        match p.status {
            ProbeStatus::Ok => ok += 1,
            ProbeStatus::Warning => warnings += 1,
            ProbeStatus::Error => errors += 1,
            ProbeStatus::NotConfigured => not_configured += 1,
        }
        println!("{:<18} {:<14} {}", p.name, p.status.label(), p.detail);
    }
    println!();
    println!(
        "summary: {ok} ok, {warnings} warning, {errors} error, {not_configured} not configured"
    );

    let missing: Vec<String> = probes
        .iter()
        .filter(|p| p.status == ProbeStatus::Error)
        .map(|p| p.name.clone())
        .collect();
    if !missing.is_empty() {
        ctx.events
            .emit(common::events::AtlasEvent::DepsMissing { missing });
    }
    ctx.events
        .emit(common::events::AtlasEvent::HealthChecked { ok, errors });

    i32::from(errors > 0)
}

async fn probe_backends(ctx: &AppContext) -> Vec<Probe> {
    use std::pin::Pin;

    let mut futures: Vec<Pin<Box<dyn std::future::Future<Output = Probe> + Send>>> = Vec::new();

    if let Ok(backend) = ctx.registry.text_embedding() {
        futures.push(Box::pin(availability_probe(
            "text embedding",
            backend.name().to_string(),
            async move { backend.is_available().await },
        )));
    }
    if let Some(backend) = ctx.registry.code_embedding() {
        futures.push(Box::pin(availability_probe(
            "code embedding",
            backend.name().to_string(),
            async move { backend.is_available().await },
        )));
    }
    if let Some(backend) = ctx.registry.contextualized_embedding() {
        futures.push(Box::pin(availability_probe(
            "contextualized embedding",
            backend.name().to_string(),
            async move { backend.is_available().await },
        )));
    }
    if let Ok(backend) = ctx.registry.json_completion() {
        futures.push(Box::pin(availability_probe(
            "llm",
            backend.name().to_string(),
            async move { backend.is_available().await },
        )));
    }
    if let Some(backend) = ctx.registry.reranker() {
        futures.push(Box::pin(availability_probe(
            "reranker",
            backend.name().to_string(),
            async move { backend.is_available().await },
        )));
    }

    let mut probes = join_all(futures).await;

    // Configured-but-missing model families.
    if ctx.registry.text_embedding().is_err() {
        probes.push(probe(
            "text embedding",
            ProbeStatus::Error,
            format!("{} configured but unavailable", ctx.config.embedding_backend),
        ));
    }
    if ctx.registry.json_completion().is_err() {
        probes.push(probe(
            "llm",
            ProbeStatus::Error,
            format!("{} configured but unavailable", ctx.config.llm_backend),
        ));
    }
    if ctx.config.code_embedding_backend.is_some() && ctx.registry.code_embedding().is_none() {
        probes.push(probe(
            "code embedding",
            ProbeStatus::Error,
            "configured but missing",
        ));
    }
    if ctx.registry.reranker().is_none() {
        probes.push(probe(
            "reranker",
            ProbeStatus::NotConfigured,
            "rerank requests will keep dense scores",
        ));
    }

    probes
}

async fn availability_probe(
    name: &'static str,
    backend_name: String,
    check: impl std::future::Future<Output = bool>,
) -> Probe {
    if check.await {
        probe(name, ProbeStatus::Ok, backend_name)
    } else {
        probe(name, ProbeStatus::Error, format!("{backend_name} unreachable"))
    }
}
