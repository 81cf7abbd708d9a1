use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use common::error::AppError;

use crate::pause::PauseController;

/// Pairs evaluated per automatic consolidation pass.
pub const BOUNDED_PASS_PAIRS: usize = 50;

/// What a bounded consolidation pass reports back to the watchdog.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationOutcome {
    pub consolidations_performed: usize,
    pub chunks_absorbed: usize,
    pub candidates_evaluated: usize,
}

/// The watchdog triggers passes through this seam so it never depends on the
/// engine crate directly.
#[async_trait]
pub trait ConsolidationRunner: Send + Sync {
    async fn run_bounded(&self, max_pairs: usize) -> Result<ConsolidationOutcome, AppError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    /// Documents ingested since the last pass before a new one triggers.
    pub threshold: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            threshold: 100,
        }
    }
}

/// Periodic scheduler owning the ingest pause flag. On each tick, when enough
/// documents have landed since the last pass: pause ingestion, drain in-flight
/// upserts, run a bounded pass, release, snapshot the counter. Pass errors are
/// logged and the loop continues.
pub struct ConsolidationWatchdog {
    pause: PauseController,
    config: WatchdogConfig,
    runner: Arc<dyn ConsolidationRunner>,
    threshold: AtomicU64,
    current_count: AtomicU64,
    last_consolidation_count: AtomicU64,
    consolidating: AtomicBool,
}

impl ConsolidationWatchdog {
    pub fn new(
        pause: PauseController,
        config: WatchdogConfig,
        runner: Arc<dyn ConsolidationRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pause,
            threshold: AtomicU64::new(config.threshold),
            config,
            runner,
            current_count: AtomicU64::new(0),
            last_consolidation_count: AtomicU64::new(0),
            consolidating: AtomicBool::new(false),
        })
    }

    /// Runtime override; ingest runs may carry their own trigger threshold.
    pub fn set_threshold(&self, threshold: u64) {
        self.threshold.store(threshold.max(1), Ordering::SeqCst);
    }

    pub fn pause_controller(&self) -> &PauseController {
        &self.pause
    }

    /// Called by the ingest pipeline after each successful batch.
    pub fn record_ingestion(&self, count: u64) {
        self.current_count.fetch_add(count, Ordering::SeqCst);
    }

    pub fn ingested_since_last(&self) -> u64 {
        self.current_count
            .load(Ordering::SeqCst)
            .saturating_sub(self.last_consolidation_count.load(Ordering::SeqCst))
    }

    /// Run the poll loop until cancelled (drop the owning task to stop).
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One scheduling decision. Public so tests and the manual trigger share
    /// the exact same path.
    pub async fn tick(&self) {
        if self.ingested_since_last() < self.threshold.load(Ordering::SeqCst) {
            return;
        }
        self.trigger().await;
    }

    /// Manual trigger; serialised against the automatic one by the same flag.
    pub async fn force_trigger(&self) {
        self.trigger().await;
    }

    async fn trigger(&self) {
        if self
            .consolidating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("consolidation already in progress; skipping trigger");
            return;
        }

        let snapshot = self.current_count.load(Ordering::SeqCst);
        info!(
            ingested_since_last = self.ingested_since_last(),
            "consolidation watchdog triggered"
        );

        self.pause.pause();
        self.pause.drain().await;

        match self.runner.run_bounded(BOUNDED_PASS_PAIRS).await {
            Ok(outcome) => {
                info!(
                    consolidations = outcome.consolidations_performed,
                    absorbed = outcome.chunks_absorbed,
                    evaluated = outcome.candidates_evaluated,
                    "bounded consolidation pass finished"
                );
            }
            Err(err) => {
                error!(error = %err, "bounded consolidation pass failed");
            }
        }

        self.pause.resume();
        self.last_consolidation_count
            .store(snapshot, Ordering::SeqCst);
        self.consolidating.store(false, Ordering::SeqCst);
    }
}
