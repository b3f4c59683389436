//! Per-test execution metrics
//!
//! Every worker owns one [`MetricsRegistry`]. An [`ExecutionMetrics`] guard
//! wraps each test: it counts the run on creation and records duration,
//! memory, performance score and outcome exactly once when finished.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use parabank_common::WorkerId;

use crate::error::E2eResult;
use crate::pushgateway::MetricsEmitter;

pub const DURATION_BUCKETS: [f64; 9] = [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
pub const PERFORMANCE_BUCKETS: [f64; 5] = [20.0, 40.0, 60.0, 80.0, 100.0];

/// Final classification of one test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    /// Failed attempt that will be retried
    Rerun,
    /// Server fault on a login-dependent test; reported as skipped
    ConditionalPass,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::Rerun => "rerun",
            Outcome::ConditionalPass => "conditional_pass",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a recorded status plus the failure flag to an outcome.
///
/// An explicit status always wins; without one the failure flag decides.
pub fn classify(status: Option<Outcome>, failed: bool) -> Outcome {
    match status {
        Some(Outcome::Passed) => Outcome::Passed,
        Some(Outcome::Failed) => Outcome::Failed,
        Some(Outcome::Skipped) => Outcome::Skipped,
        Some(Outcome::Rerun) => Outcome::Rerun,
        Some(Outcome::ConditionalPass) => Outcome::ConditionalPass,
        None if failed => Outcome::Failed,
        None => Outcome::Passed,
    }
}

/// Linear score: 100 at zero seconds, 0 at 100 seconds and beyond
pub fn performance_score(duration_secs: f64) -> f64 {
    (100.0 - duration_secs).clamp(0.0, 100.0)
}

/// Resident set size of this process, if the platform reports it
pub fn process_rss_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new().with_memory(),
    );
    system.process(pid).map(|p| p.memory())
}

/// Collectors for one worker, registered under fixed names
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub runs: IntCounter,
    pub passes: IntCounter,
    pub failures: IntCounter,
    pub skipped: IntCounter,
    pub reruns: IntCounter,
    pub duration: Histogram,
    pub memory: IntGauge,
    pub performance: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> E2eResult<Self> {
        let registry = Registry::new();

        let runs = IntCounter::new("test_runs_total", "Total number of test runs")?;
        let passes = IntCounter::new("test_passes_total", "Total number of passed tests")?;
        let failures = IntCounter::new("test_failures_total", "Total number of failed tests")?;
        let skipped = IntCounter::new("test_skipped_total", "Total number of skipped tests")?;
        let reruns = IntCounter::new("test_reruns_total", "Total number of test reruns")?;
        let duration = Histogram::with_opts(
            HistogramOpts::new("test_duration_seconds", "Test execution duration in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        let memory = IntGauge::new("test_memory_usage_bytes", "Memory usage during test execution")?;
        let performance = Histogram::with_opts(
            HistogramOpts::new("test_performance_score", "Test performance score (0-100)")
                .buckets(PERFORMANCE_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(reruns.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(memory.clone()))?;
        registry.register(Box::new(performance.clone()))?;

        Ok(Self {
            registry,
            runs,
            passes,
            failures,
            skipped,
            reruns,
            duration,
            memory,
            performance,
        })
    }

    /// Bump the counter matching `outcome`
    pub fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Passed => self.passes.inc(),
            Outcome::Failed => self.failures.inc(),
            Outcome::Skipped | Outcome::ConditionalPass => self.skipped.inc(),
            Outcome::Rerun => self.reruns.inc(),
        }
    }

    /// Prometheus text exposition of every collector
    pub fn encode(&self) -> E2eResult<String> {
        let families = self.registry.gather();
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Measures a single test.
///
/// Created at test start; the run counter increments immediately. Call
/// [`finish`](Self::finish) with the failure flag. A guard dropped without
/// finishing records a failure so the run never goes unaccounted.
pub struct ExecutionMetrics {
    name: String,
    registry: MetricsRegistry,
    emitter: Option<Arc<MetricsEmitter>>,
    worker: WorkerId,
    started: Instant,
    status: Option<Outcome>,
    finished: bool,
}

impl ExecutionMetrics {
    pub fn start(
        name: impl Into<String>,
        registry: &MetricsRegistry,
        emitter: Option<Arc<MetricsEmitter>>,
        worker: WorkerId,
    ) -> Self {
        registry.runs.inc();
        Self {
            name: name.into(),
            registry: registry.clone(),
            emitter,
            worker,
            started: Instant::now(),
            status: None,
            finished: false,
        }
    }

    /// Record the outcome the hooks decided on; consulted by [`finish`](Self::finish)
    pub fn set_status(&mut self, outcome: Outcome) {
        self.status = Some(outcome);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&mut self, failed: bool) -> Outcome {
        self.finished = true;
        let secs = self.started.elapsed().as_secs_f64();
        self.registry.duration.observe(secs);
        self.registry.performance.observe(performance_score(secs));
        match process_rss_bytes() {
            Some(bytes) => self.registry.memory.set(bytes.min(i64::MAX as u64) as i64),
            None => debug!("Process memory unavailable for {}", self.name),
        }

        let outcome = classify(self.status, failed);
        self.registry.record_outcome(outcome);
        debug!("{} finished as {} in {:.2}s", self.name, outcome, secs);
        outcome
    }

    /// Record duration, memory, score and outcome, then push best-effort
    pub async fn finish(mut self, failed: bool) -> Outcome {
        let outcome = self.record(failed);
        if let Some(emitter) = &self.emitter {
            let key = self.worker.grouping_key();
            emitter.push_metrics(&self.registry, Some(&key)).await;
        }
        outcome
    }
}

impl Drop for ExecutionMetrics {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("{} ended without a recorded outcome, counting it as failed", self.name);
        self.record(true);

        let Some(emitter) = self.emitter.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let key = self.worker.grouping_key();
                handle.spawn(async move {
                    emitter.push_metrics(&registry, Some(&key)).await;
                });
            }
            Err(_) => debug!("No runtime available to push metrics for {}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, false, Outcome::Passed ; "no status passes")]
    #[test_case(None, true, Outcome::Failed ; "no status failed")]
    #[test_case(Some(Outcome::Skipped), true, Outcome::Skipped ; "skip wins")]
    #[test_case(Some(Outcome::Rerun), true, Outcome::Rerun ; "rerun")]
    #[test_case(Some(Outcome::ConditionalPass), true, Outcome::ConditionalPass ; "conditional")]
    #[test_case(Some(Outcome::Failed), false, Outcome::Failed ; "explicit failure")]
    #[test_case(Some(Outcome::Passed), true, Outcome::Passed ; "explicit pass wins over flag")]
    fn test_classify(status: Option<Outcome>, failed: bool, expected: Outcome) {
        assert_eq!(classify(status, failed), expected);
    }

    #[test_case(0.0, 100.0)]
    #[test_case(12.5, 87.5)]
    #[test_case(100.0, 0.0)]
    #[test_case(250.0, 0.0)]
    fn test_performance_score(secs: f64, expected: f64) {
        assert_eq!(performance_score(secs), expected);
    }

    #[test]
    fn test_registry_exposes_all_names() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_outcome(Outcome::Passed);
        registry.duration.observe(1.2);
        let text = registry.encode().unwrap();
        for name in [
            "test_runs_total",
            "test_passes_total",
            "test_failures_total",
            "test_skipped_total",
            "test_reruns_total",
            "test_duration_seconds_bucket",
            "test_memory_usage_bytes",
            "test_performance_score_bucket",
        ] {
            assert!(text.contains(name), "missing {name}");
        }
        assert!(text.contains("test_passes_total 1"));
    }

    #[test]
    fn test_conditional_pass_counts_as_skipped() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_outcome(Outcome::ConditionalPass);
        assert_eq!(registry.skipped.get(), 1);
        assert_eq!(registry.passes.get(), 0);
        assert_eq!(registry.failures.get(), 0);
    }

    #[test]
    fn test_dropped_guard_records_failure() {
        let registry = MetricsRegistry::new().unwrap();
        {
            let _guard = ExecutionMetrics::start("abandoned", &registry, None, WorkerId::Master);
        }
        assert_eq!(registry.runs.get(), 1);
        assert_eq!(registry.failures.get(), 1);
        assert_eq!(registry.duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_finish_records_once() {
        let registry = MetricsRegistry::new().unwrap();
        let mut guard = ExecutionMetrics::start("login", &registry, None, WorkerId::Master);
        guard.set_status(Outcome::Skipped);
        let outcome = guard.finish(false).await;
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(registry.runs.get(), 1);
        assert_eq!(registry.skipped.get(), 1);
        assert_eq!(registry.failures.get(), 0);
        assert_eq!(registry.duration.get_sample_count(), 1);
        assert_eq!(registry.performance.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_failure_status_is_kept() {
        let registry = MetricsRegistry::new().unwrap();
        let mut guard = ExecutionMetrics::start("transfer", &registry, None, WorkerId::Master);
        guard.set_status(Outcome::Failed);
        assert_eq!(guard.finish(false).await, Outcome::Failed);
        assert_eq!(registry.failures.get(), 1);
        assert_eq!(registry.passes.get(), 0);
    }
}
