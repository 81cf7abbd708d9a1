use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use common::backends::{BackendIdentity, CanRerank, Capability, LatencyClass};
use common::error::AppError;
use common::utils::config::AppConfig;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Pool of local fastembed rerank engines. Model instances are expensive, so
/// a small fixed pool is built at startup and leased per request; the
/// semaphore enforces back-pressure.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    capabilities: Vec<Capability>,
}

impl RerankerPool {
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking pool size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            capabilities: vec![Capability::Reranking],
        }))
    }

    /// Initialize a pool from application configuration; `None` when
    /// reranking is disabled.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        let init_options = build_rerank_init_options(config)?;
        Self::new_with_options(pool_size, init_options).map(Some)
    }

    async fn checkout(&self) -> Result<(OwnedSemaphorePermit, Arc<Mutex<TextRerank>>), AppError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool closed".into()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = self
            .engines
            .get(idx)
            .cloned()
            .ok_or_else(|| AppError::InternalError("reranker pool index out of range".into()))?;
        Ok((permit, engine))
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn build_rerank_init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = config
        .fastembed_cache_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| env::var("FASTEMBED_CACHE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            Path::new(&config.data_dir)
                .join("fastembed")
                .join("reranker")
        });
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;

    Ok(options)
}

#[async_trait]
impl BackendIdentity for RerankerPool {
    fn name(&self) -> &str {
        "fastembed-reranker"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn latency_class(&self) -> LatencyClass {
        LatencyClass::Local
    }

    async fn is_available(&self) -> bool {
        !self.engines.is_empty()
    }
}

#[async_trait]
impl CanRerank for RerankerPool {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let (_permit, engine) = self.checkout().await?;
        let mut guard = engine.lock().await;
        let results = guard
            .rerank(
                query,
                documents.iter().map(String::as_str).collect::<Vec<_>>(),
                false,
                None,
            )
            .map_err(|e| AppError::InternalError(format!("rerank failed: {e}")))?;

        // fastembed returns results best-first with raw logit scores; map them
        // back to input order and squash into [0,1].
        let mut raw = vec![0.0f32; documents.len()];
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for result in &results {
            if let Some(slot) = raw.get_mut(result.index) {
                *slot = result.score;
                min = min.min(result.score);
                max = max.max(result.score);
            }
        }

        if !min.is_finite() || !max.is_finite() || (max - min).abs() < f32::EPSILON {
            return Ok(vec![1.0; documents.len()]);
        }

        Ok(raw
            .into_iter()
            .map(|score| ((score - min) / (max - min)).clamp(0.0, 1.0))
            .collect())
    }
}
