use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::debug;

/// Message-passing seam between the watchdog and the ingest pipeline.
///
/// The watchdog sets and clears the pause flag; the pipeline awaits it before
/// every upsert batch and accounts its in-flight writes so the watchdog can
/// drain to zero before scanning. Neither side owns the other.
#[derive(Clone)]
pub struct PauseController {
    inner: Arc<PauseInner>,
}

struct PauseInner {
    paused: watch::Sender<bool>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl PauseController {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(PauseInner {
                paused,
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn pause(&self) {
        let was_paused = self.inner.paused.send_replace(true);
        if !was_paused {
            debug!("ingest pause flag set");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.send_replace(false) {
            debug!("ingest pause flag cleared");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Block until the pause flag is clear. Returns immediately when not
    /// paused.
    pub async fn wait_until_resumed(&self) {
        let mut receiver = self.inner.paused.subscribe();
        // wait_for checks the current value first, so no wakeup is lost.
        let _ = receiver.wait_for(|paused| !*paused).await;
    }

    /// Account `count` writes as in flight until the returned guard drops.
    pub fn begin_upsert(&self, count: usize) -> InFlightGuard {
        self.inner.in_flight.fetch_add(count, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
            count,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until the number of in-flight upserts reaches zero.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    inner: Arc<PauseInner>,
    count: usize,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self.inner.in_flight.fetch_sub(self.count, Ordering::SeqCst);
        if previous.saturating_sub(self.count) == 0 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_until_resumed_passes_when_not_paused() {
        let pause = PauseController::new();
        tokio::time::timeout(Duration::from_millis(50), pause.wait_until_resumed())
            .await
            .expect("must not block when unpaused");
    }

    #[tokio::test]
    async fn wait_until_resumed_blocks_until_resume() {
        let pause = PauseController::new();
        pause.pause();
        assert!(pause.is_paused());

        let waiter = {
            let pause = pause.clone();
            tokio::spawn(async move {
                pause.wait_until_resumed().await;
            })
        };

        // Still blocked after a short wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pause.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("released after resume")
            .expect("join");
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_guards() {
        let pause = PauseController::new();
        let guard = pause.begin_upsert(3);
        assert_eq!(pause.in_flight(), 3);

        let drainer = {
            let pause = pause.clone();
            tokio::spawn(async move {
                pause.drain().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_millis(200), drainer)
            .await
            .expect("drained after guard drop")
            .expect("join");
        assert_eq!(pause.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let pause = PauseController::new();
        tokio::time::timeout(Duration::from_millis(50), pause.drain())
            .await
            .expect("no in-flight writes to wait for");
    }
}
