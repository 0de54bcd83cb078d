//! Metrics collection loop
//!
//! Samples a set of metrics from a background task at a fixed poll period.
//! Any sampling failure ends the task and is handed back by [`MetricsCollector::stop`].

use super::{MetricError, SharedMetric};
use crate::observability::BenchMetrics;
use crate::utils::pp_duration;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default poll period between two samples
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("sampling metric {metric} failed: {source}")]
    Sampling {
        metric: String,
        #[source]
        source: MetricError,
    },

    #[error("metrics collection task panicked")]
    Panicked,

    #[error("failed to create metrics directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dump metric {metric}: {source}")]
    Dump {
        metric: String,
        #[source]
        source: MetricError,
    },
}

/// Configuration for the collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Time between the start of two consecutive samples
    pub poll_period: Duration,
    /// Directory the metric files are appended to; no dump when unset
    pub store_at: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_period: DEFAULT_POLL_PERIOD,
            store_at: None,
        }
    }
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<u64, CollectorError>>,
}

/// Collects a set of metrics in a background task
///
/// Lifecycle is `start` then `stop`, once per workload. `stop` joins the
/// task, dumps every metric to `store_at` and clears the in-memory samples.
/// Starting with no metrics is a no-op and never spawns a task.
pub struct MetricsCollector {
    metrics: Vec<SharedMetric>,
    config: CollectorConfig,
    running: Option<RunningTask>,
    stats: BenchMetrics,
}

impl MetricsCollector {
    pub fn new(metrics: Vec<SharedMetric>, config: CollectorConfig) -> Self {
        Self {
            metrics,
            config,
            running: None,
            stats: BenchMetrics::new(),
        }
    }

    pub fn builder() -> MetricsCollectorBuilder {
        MetricsCollectorBuilder::new()
    }

    pub fn metrics(&self) -> &[SharedMetric] {
        &self.metrics
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Whether a background task is currently spawned
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the background task
    ///
    /// Returns false without spawning anything if there are no metrics or the
    /// collector is already running.
    pub fn start(&mut self) -> bool {
        if self.metrics.is_empty() || self.running.is_some() {
            return false;
        }

        info!(
            metrics = self.metrics.len(),
            poll_period_ms = self.config.poll_period.as_millis() as u64,
            "Starting collection of metrics"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(
            self.metrics.clone(),
            self.config.poll_period,
            shutdown_rx,
            self.stats.clone(),
        ));

        self.running = Some(RunningTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the background task, then dump and clear every metric
    ///
    /// A sampling failure captured by the task is returned here, after the
    /// rows collected before the failure have been dumped.
    pub async fn stop(&mut self) -> Result<(), CollectorError> {
        let Some(task) = self.running.take() else {
            return Ok(());
        };

        info!("Stopping collection of metrics");
        // The task may already have exited after a failure
        let _ = task.shutdown_tx.send(true);

        let failure = match task.handle.await {
            Ok(Ok(ticks)) => {
                debug!(ticks, "Metrics collection task finished");
                None
            }
            Ok(Err(e)) => Some(e),
            Err(join_err) => {
                error!(error = %join_err, "Metrics collection task did not finish");
                Some(CollectorError::Panicked)
            }
        };

        let dumped = self.dump().await;
        self.clear().await;

        match (failure, dumped) {
            (Some(failure), Err(dump_err)) => {
                error!(error = %dump_err, "Failed to dump metrics after collection failure");
                Err(failure)
            }
            (Some(failure), Ok(())) => Err(failure),
            (None, dumped) => dumped,
        }
    }

    /// Run `work` while collecting, stopping the collector on every exit path
    ///
    /// A sampling failure takes precedence over the outcome of `work`.
    pub async fn collect_during<F, T>(&mut self, work: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.start();
        let outcome = work.await;
        let stopped = self.stop().await;

        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(work_err), Ok(())) => Err(work_err),
            (Ok(_), Err(collector_err)) => Err(collector_err.into()),
            (Err(work_err), Err(collector_err)) => {
                error!(error = %work_err, "Workload failed while metrics collection failed");
                Err(collector_err.into())
            }
        }
    }

    /// Append every metric to its file under `store_at`, creating the directory
    pub async fn dump(&self) -> Result<(), CollectorError> {
        let Some(store_at) = &self.config.store_at else {
            warn!("Skipping metrics dump: store_at not specified");
            return Ok(());
        };

        info!(path = %store_at.display(), "Saving metrics data");
        std::fs::create_dir_all(store_at).map_err(|source| CollectorError::CreateDir {
            path: store_at.clone(),
            source,
        })?;

        for metric in &self.metrics {
            let metric = metric.lock().await;
            metric.dump(store_at).map_err(|source| CollectorError::Dump {
                metric: metric.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Drop the in-memory samples of every metric
    pub async fn clear(&self) {
        for metric in &self.metrics {
            metric.lock().await.clear();
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if let Some(task) = self.running.take() {
            warn!("Metrics collector dropped while running, samples are discarded");
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}

async fn poll_loop(
    metrics: Vec<SharedMetric>,
    poll_period: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: BenchMetrics,
) -> Result<u64, CollectorError> {
    let mut ticks = 0u64;

    loop {
        if *shutdown.borrow() {
            debug!("Caught stop signal");
            break;
        }

        let start = Instant::now();
        sample_all(&metrics, &stats).await?;
        ticks += 1;

        let elapsed = start.elapsed();
        stats.observe_poll_duration(elapsed.as_secs_f64());

        match poll_period.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            _ => {
                stats.inc_poll_overruns();
                warn!(
                    elapsed = %pp_duration(elapsed),
                    elapsed_ms = elapsed.as_millis() as u64,
                    poll_period_ms = poll_period.as_millis() as u64,
                    "Collecting metrics took longer than poll period"
                );
            }
        }
    }

    Ok(ticks)
}

async fn sample_all(metrics: &[SharedMetric], stats: &BenchMetrics) -> Result<(), CollectorError> {
    for metric in metrics {
        let mut metric = metric.lock().await;
        debug!(metric = %metric, "Collecting");
        let rows = metric
            .sample()
            .await
            .map_err(|source| CollectorError::Sampling {
                metric: metric.name().to_string(),
                source,
            })?;
        stats.add_rows_sampled(rows as u64);
    }
    Ok(())
}

/// Builder for the metrics collector
pub struct MetricsCollectorBuilder {
    metrics: Vec<SharedMetric>,
    config: CollectorConfig,
}

impl MetricsCollectorBuilder {
    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
            config: CollectorConfig::default(),
        }
    }

    pub fn metric(mut self, metric: SharedMetric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn metrics(mut self, metrics: impl IntoIterator<Item = SharedMetric>) -> Self {
        self.metrics.extend(metrics);
        self
    }

    pub fn poll_period(mut self, poll_period: Duration) -> Self {
        self.config.poll_period = poll_period;
        self
    }

    pub fn store_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_at = Some(path.into());
        self
    }

    pub fn build(self) -> MetricsCollector {
        MetricsCollector::new(self.metrics, self.config)
    }
}

impl Default for MetricsCollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
