//! Observability infrastructure for the benchmarks
//!
//! Provides:
//! - Prometheus metrics about the benchmark itself (poll tick duration, overruns, rows, command failures)
//! - Structured logging of experiment lifecycle events with tracing

use prometheus::{register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for the duration of one poll tick (in seconds)
const POLL_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Option<BenchMetricsInner>> = OnceLock::new();

struct BenchMetricsInner {
    poll_duration_seconds: Histogram,
    poll_overruns: IntCounter,
    rows_sampled: IntCounter,
    command_failures: IntCounter,
}

impl BenchMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            poll_duration_seconds: register_histogram!(
                "mk8s_bench_poll_duration_seconds",
                "Time spent sampling all metrics in one poll tick",
                POLL_BUCKETS.to_vec()
            )?,

            poll_overruns: register_int_counter!(
                "mk8s_bench_poll_overruns_total",
                "Poll ticks whose sampling took longer than the poll period"
            )?,

            rows_sampled: register_int_counter!(
                "mk8s_bench_rows_sampled_total",
                "Metric rows collected across all metrics"
            )?,

            command_failures: register_int_counter!(
                "mk8s_bench_command_failures_total",
                "Remote commands that exited with a non-zero status"
            )?,
        })
    }
}

/// Benchmark self-metrics
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct BenchMetrics {
    _private: (),
}

impl Default for BenchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BenchMetrics {
    /// Create a new metrics handle (registers the global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match BenchMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register benchmark metrics, self-metrics disabled");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&BenchMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn observe_poll_duration(&self, duration_secs: f64) {
        if let Some(inner) = self.inner() {
            inner.poll_duration_seconds.observe(duration_secs);
        }
    }

    pub fn inc_poll_overruns(&self) {
        if let Some(inner) = self.inner() {
            inner.poll_overruns.inc();
        }
    }

    pub fn add_rows_sampled(&self, rows: u64) {
        if let Some(inner) = self.inner() {
            inner.rows_sampled.inc_by(rows);
        }
    }

    pub fn inc_command_failures(&self) {
        if let Some(inner) = self.inner() {
            inner.command_failures.inc();
        }
    }

    /// Ticks sampled so far, as observed by the poll duration histogram
    pub fn poll_ticks(&self) -> u64 {
        self.inner()
            .map(|inner| inner.poll_duration_seconds.get_sample_count())
            .unwrap_or_default()
    }

    pub fn poll_overruns(&self) -> u64 {
        self.inner().map(|inner| inner.poll_overruns.get()).unwrap_or_default()
    }

    pub fn rows_sampled(&self) -> u64 {
        self.inner().map(|inner| inner.rows_sampled.get()).unwrap_or_default()
    }

    pub fn command_failures(&self) -> u64 {
        self.inner()
            .map(|inner| inner.command_failures.get())
            .unwrap_or_default()
    }

    /// Log a one-line summary of the self-metrics
    pub fn log_summary(&self) {
        info!(
            poll_ticks = self.poll_ticks(),
            poll_overruns = self.poll_overruns(),
            rows_sampled = self.rows_sampled(),
            command_failures = self.command_failures(),
            "Benchmark metrics summary"
        );
    }
}

/// Render the default registry in the Prometheus text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        warn!(error = %e, "Failed to encode benchmark metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Structured logger for experiment events
///
/// Emits one event per lifecycle step so runs can be followed in JSON logs.
#[derive(Clone)]
pub struct StructuredLogger {
    experiment: String,
}

impl StructuredLogger {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
        }
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn log_experiment_started(&self, cluster: &str, run_id: &str) {
        info!(
            event = "experiment_started",
            experiment = %self.experiment,
            cluster = %cluster,
            run_id = %run_id,
            "Starting experiment"
        );
    }

    pub fn log_workload_started(&self, workload: &str, namespace: &str, duration_secs: u64) {
        info!(
            event = "workload_started",
            experiment = %self.experiment,
            workload = %workload,
            namespace = %namespace,
            duration_secs = duration_secs,
            "Running workload"
        );
    }

    pub fn log_workload_finished(&self, workload: &str, elapsed: &str) {
        info!(
            event = "workload_finished",
            experiment = %self.experiment,
            workload = %workload,
            elapsed = %elapsed,
            "Workload finished"
        );
    }

    pub fn log_teardown(&self, skipped: bool) {
        if skipped {
            info!(
                event = "teardown_skipped",
                experiment = %self.experiment,
                "Skipping teardown"
            );
        } else {
            info!(
                event = "teardown",
                experiment = %self.experiment,
                "Tearing down experiment"
            );
        }
    }

    pub fn log_interrupted(&self) {
        warn!(
            event = "experiment_interrupted",
            experiment = %self.experiment,
            "Experiment cancelled"
        );
    }

    pub fn log_experiment_failed(&self, error: &anyhow::Error) {
        error!(
            event = "experiment_failed",
            experiment = %self.experiment,
            error = %format!("{:#}", error),
            "Experiment failed"
        );
    }

    pub fn log_experiment_finished(&self, data_dir: &str) {
        info!(
            event = "experiment_finished",
            experiment = %self.experiment,
            data_dir = %data_dir,
            "Experiment finished"
        );
    }
}
