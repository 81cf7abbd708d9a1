use std::thread::available_parallelism;

/// Coarse system pressure classification driving adaptive concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Low,
    Steady,
    High,
}

/// Samples current pressure. `None` means "could not tell"; the operator
/// keeps its current concurrency in that case.
pub trait PressureSampler: Send + 'static {
    fn sample(&self) -> Option<Pressure>;
}

impl<F> PressureSampler for F
where
    F: Fn() -> Option<Pressure> + Send + 'static,
{
    fn sample(&self) -> Option<Pressure> {
        self()
    }
}

/// Reads `/proc/loadavg` and `/proc/meminfo`. On platforms without procfs the
/// sampler returns `None` and the concurrency stays put.
#[derive(Debug, Clone, Default)]
pub struct ProcPressureSampler;

impl ProcPressureSampler {
    fn load_per_core() -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
        let one_minute: f64 = raw.split_whitespace().next()?.parse().ok()?;
        let cores = available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        Some(one_minute / cores)
    }

    fn memory_available_ratio() -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb: Option<f64> = None;
        let mut available_kb: Option<f64> = None;

        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = rest.trim().split_whitespace().next()?.parse().ok();
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = rest.trim().split_whitespace().next()?.parse().ok();
            }
            if total_kb.is_some() && available_kb.is_some() {
                break;
            }
        }

        let total = total_kb?;
        if total <= 0.0 {
            return None;
        }
        Some(available_kb? / total)
    }
}

impl PressureSampler for ProcPressureSampler {
    fn sample(&self) -> Option<Pressure> {
        let load = Self::load_per_core()?;
        let memory = Self::memory_available_ratio()?;

        if load > 0.9 || memory < 0.15 {
            Some(Pressure::High)
        } else if load < 0.5 && memory > 0.3 {
            Some(Pressure::Low)
        } else {
            Some(Pressure::Steady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_sampler_never_panics() {
        // On Linux this reads real procfs; elsewhere it returns None. Either
        // way the call must be infallible.
        let _ = ProcPressureSampler.sample();
    }

    #[test]
    fn closure_samplers_work() {
        let sampler = || Some(Pressure::High);
        assert_eq!(PressureSampler::sample(&sampler), Some(Pressure::High));
    }
}
