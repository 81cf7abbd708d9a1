//! Generic async operators the ingest pipeline is composed from.
//!
//! All three are hot (items flow as they arrive), finite (they terminate with
//! their source) and cancellation-safe: dropping the output stream cancels
//! in-flight futures at their next await boundary. None of them log item data.

mod pressure;

pub use pressure::{ProcPressureSampler, Pressure, PressureSampler};

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use async_stream::stream;
use futures::stream::FuturesOrdered;
use futures::{Stream, StreamExt};
use tracing::debug;

/// Run at most `concurrency` invocations of `f` over `source`, preserving the
/// input order on output. Back-pressures the source while all workers are
/// busy.
pub fn parallel<S, F, Fut, T, U>(source: S, f: F, concurrency: usize) -> impl Stream<Item = U>
where
    S: Stream<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = U>,
{
    source.map(f).buffered(concurrency.max(1))
}

/// Group items into batches of up to `max_size`, flushing early when
/// `timeout` has elapsed since the first item of a pending group or when the
/// source ends. A group is never split downstream.
pub fn batch<S, T>(source: S, max_size: usize, timeout: Duration) -> impl Stream<Item = Vec<T>>
where
    S: Stream<Item = T>,
{
    let max_size = max_size.max(1);
    stream! {
        let mut source = pin!(source);
        let mut pending: Vec<T> = Vec::new();
        let mut deadline: Option<tokio::time::Instant> = None;

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, source.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        // Timer fired with a partial group pending.
                        if !pending.is_empty() {
                            yield std::mem::take(&mut pending);
                        }
                        deadline = None;
                        continue;
                    }
                },
                None => source.next().await,
            };

            match next {
                Some(item) => {
                    if pending.is_empty() {
                        deadline = Some(tokio::time::Instant::now() + timeout);
                    }
                    pending.push(item);
                    if pending.len() >= max_size {
                        yield std::mem::take(&mut pending);
                        deadline = None;
                    }
                }
                None => {
                    if !pending.is_empty() {
                        yield std::mem::take(&mut pending);
                    }
                    break;
                }
            }
        }
    }
}

/// Concurrency bounds and sampling cadence for [`adaptive_parallel`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub interval: Duration,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            initial: 2,
            min: 1,
            max: 8,
            interval: Duration::from_secs(5),
        }
    }
}

impl AdaptivePolicy {
    fn floor(&self) -> usize {
        self.min.max(1)
    }

    fn clamp(&self, value: usize) -> usize {
        value.clamp(self.floor(), self.max.max(self.floor()))
    }
}

/// Like [`parallel`], but periodically samples system pressure and adjusts the
/// concurrency within `[min, max]`. Adjustments are additive (one at a time)
/// and the limit never drops below 1, so the operator cannot deadlock.
pub fn adaptive_parallel<S, F, Fut, T, U>(
    source: S,
    f: F,
    policy: AdaptivePolicy,
) -> impl Stream<Item = U>
where
    S: Stream<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = U>,
{
    adaptive_parallel_with_sampler(source, f, policy, ProcPressureSampler::default())
}

/// Sampler-injectable variant used by tests.
pub fn adaptive_parallel_with_sampler<S, F, Fut, T, U, P>(
    source: S,
    mut f: F,
    policy: AdaptivePolicy,
    sampler: P,
) -> impl Stream<Item = U>
where
    S: Stream<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = U>,
    P: PressureSampler,
{
    stream! {
        let mut source = pin!(source.fuse());
        let mut in_flight: FuturesOrdered<Fut> = FuturesOrdered::new();
        let mut limit = policy.clamp(policy.initial);
        let mut source_done = false;

        let mut ticker = tokio::time::interval(policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; swallow it.
        ticker.tick().await;

        loop {
            let want_more = !source_done && in_flight.len() < limit;

            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    let previous = limit;
                    limit = match sampler.sample() {
                        Some(Pressure::High) => policy.clamp(limit.saturating_sub(1)),
                        Some(Pressure::Low) => policy.clamp(limit.saturating_add(1)),
                        Some(Pressure::Steady) | None => limit,
                    };
                    if limit != previous {
                        debug!(previous, current = limit, "adaptive concurrency adjusted");
                    }
                }
                item = source.next(), if want_more => {
                    match item {
                        Some(item) => in_flight.push_back(f(item)),
                        None => source_done = true,
                    }
                }
                Some(done) = in_flight.next() => {
                    yield done;
                }
                else => {
                    if source_done && in_flight.is_empty() {
                        break;
                    }
                }
            }
        }
    }
}
