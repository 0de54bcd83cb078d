//! Experiment orchestration
//!
//! An [`Experiment`] runs a list of workloads against a cluster, one at a
//! time, each in its own short-lived namespace and with its metrics collected
//! in the background while it runs:
//!
//! ```text
//! kube-config -> bootstrap -> [namespace -> apply -> collect(wait)] * n -> teardown
//! ```
//!
//! Teardown happens on every exit path. An interruption stops the running
//! workload early, dumps what was collected and is not reported as an error.

use crate::cluster::{KubeconfigGuard, Microk8sCluster};
use crate::metrics::{Checkpoint, Field, MetricsCollector, SharedMetric, DEFAULT_POLL_PERIOD};
use crate::models::Addon;
use crate::observability::StructuredLogger;
use crate::utils::pp_duration;
use crate::workload::Workload;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

/// Relative to the working directory, like the plotting scripts expect
pub const DEFAULT_DATA_DIR: &str = "../../data";

/// Column added to every metric while a workload runs
pub const WORKLOAD_FIELD: &str = "workload";

/// The run was cancelled before all workloads finished
#[derive(Debug, Error)]
#[error("experiment interrupted")]
pub struct Interrupted;

pub struct Experiment {
    name: String,
    cluster: Microk8sCluster,
    required_addons: Vec<Addon>,
    workloads: Vec<Workload>,
    all_workloads_metrics: Vec<SharedMetric>,
    /// Keyed by position in `workloads`
    workload_metrics: HashMap<usize, Vec<SharedMetric>>,
    checkpoints: Vec<Arc<dyn Checkpoint>>,
    skip_teardown: bool,
    data_dir: PathBuf,
    kubeconfig_path: Option<PathBuf>,
    poll_period: Duration,
    run_id: String,
    logger: StructuredLogger,
}

impl Experiment {
    pub fn new(name: impl Into<String>, cluster: Microk8sCluster) -> Self {
        let name = name.into();
        Self {
            logger: StructuredLogger::new(name.clone()),
            name,
            cluster,
            required_addons: Vec::new(),
            workloads: Vec::new(),
            all_workloads_metrics: Vec::new(),
            workload_metrics: HashMap::new(),
            checkpoints: Vec::new(),
            skip_teardown: false,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            kubeconfig_path: None,
            poll_period: DEFAULT_POLL_PERIOD,
            run_id: format!("run-{}", chrono::Local::now().format("%d-%m-%Y")),
        }
    }

    pub fn with_addons(mut self, addons: Vec<Addon>) -> Self {
        self.required_addons = addons;
        self
    }

    /// Leave the addons enabled once the experiment is over
    pub fn with_skip_teardown(mut self, skip: bool) -> Self {
        self.skip_teardown = skip;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Where the kube-config is written instead of `~/.kube/config_{model}`
    pub fn with_kubeconfig_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = Some(path.into());
        self
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> &Microk8sCluster {
        &self.cluster
    }

    pub fn workloads(&self) -> &[Workload] {
        &self.workloads
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register workloads, with metrics collected only while they run
    pub fn register_workloads(
        &mut self,
        workloads: impl IntoIterator<Item = Workload>,
        metrics: Vec<SharedMetric>,
    ) {
        for workload in workloads {
            let index = self.workloads.len();
            self.workloads.push(workload);
            if !metrics.is_empty() {
                self.workload_metrics
                    .entry(index)
                    .or_default()
                    .extend(metrics.iter().cloned());
            }
        }
    }

    /// Register metrics collected for all workloads
    pub fn register_metrics(&mut self, metrics: impl IntoIterator<Item = SharedMetric>) {
        self.all_workloads_metrics.extend(metrics);
    }

    /// Register a source to snapshot before each workload starts
    pub fn register_checkpoint(&mut self, checkpoint: Arc<dyn Checkpoint>) {
        self.checkpoints.push(checkpoint);
    }

    /// Metrics for all workloads first, then those of workload `index`
    pub fn metrics_for_workload(&self, index: usize) -> Vec<SharedMetric> {
        let specific = self.workload_metrics.get(&index).into_iter().flatten();
        self.all_workloads_metrics
            .iter()
            .chain(specific)
            .cloned()
            .collect()
    }

    /// `data_dir/name/run-DD-MM-YYYY`
    pub fn store_metrics_at(&self) -> PathBuf {
        self.data_dir.join(&self.name).join(&self.run_id)
    }

    /// Namespaces may not contain underscores
    pub fn namespace(&self) -> String {
        self.name.replace('_', "-")
    }

    /// Run until done or until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until done or until `shutdown` completes
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        self.logger
            .log_experiment_started(&self.cluster.to_string(), &self.run_id);

        let _kubeconfig = KubeconfigGuard::fetch(&self.cluster, self.kubeconfig_path.clone()).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let work = self.bootstrap_and_start(cancel_rx);
        tokio::pin!(work);
        tokio::pin!(shutdown);

        let outcome = tokio::select! {
            outcome = &mut work => outcome,
            _ = &mut shutdown => {
                info!("Experiment cancelled! Tearing down cluster...");
                let _ = cancel_tx.send(true);
                work.await
            }
        };

        let torn_down = self.teardown().await;

        match outcome {
            Err(e) if e.is::<Interrupted>() => {
                self.logger.log_interrupted();
                torn_down
            }
            Err(e) => {
                if let Err(teardown_err) = torn_down {
                    error!(error = %format!("{:#}", teardown_err), "Teardown failed");
                }
                self.logger.log_experiment_failed(&e);
                Err(e)
            }
            Ok(()) => {
                torn_down?;
                self.logger
                    .log_experiment_finished(&self.store_metrics_at().display().to_string());
                Ok(())
            }
        }
    }

    async fn bootstrap_and_start(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        self.bootstrap().await?;
        self.start(cancel).await
    }

    /// Enable the required addons
    pub async fn bootstrap(&self) -> Result<()> {
        info!("Bootstrapping cluster");
        if self.required_addons.is_empty() {
            return Ok(());
        }
        let addons: Vec<String> = self.required_addons.iter().map(Addon::enable).collect();
        self.cluster
            .enable(&addons)
            .await
            .context("Failed to enable addons")
    }

    /// Disable the required addons one by one, unless teardown is skipped
    pub async fn teardown(&self) -> Result<()> {
        self.logger.log_teardown(self.skip_teardown);
        if self.skip_teardown {
            return Ok(());
        }

        let mut first_err = None;
        for addon in &self.required_addons {
            if let Err(e) = self.cluster.disable(&[addon.disable()]).await {
                error!(addon = %addon.name, error = %e, "Failed to disable addon");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e).context("Failed to disable addons"),
            None => Ok(()),
        }
    }

    async fn start(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        info!(experiment = %self.name, "Started benchmark");
        for index in 0..self.workloads.len() {
            if *cancel.borrow() {
                return Err(Interrupted.into());
            }
            self.run_workload(index, cancel.clone()).await?;
        }
        Ok(())
    }

    /// Run one workload in a namespace that is deleted afterwards
    async fn run_workload(&self, index: usize, cancel: watch::Receiver<bool>) -> Result<()> {
        let workload = &self.workloads[index];
        let namespace = self.namespace();

        self.cluster
            .create_namespace(&namespace)
            .await
            .with_context(|| format!("Failed to create namespace {}", namespace))?;

        let outcome = self.run_in_namespace(index, workload, &namespace, cancel).await;

        let deleted = self
            .cluster
            .delete_namespace(&namespace)
            .await
            .with_context(|| format!("Failed to delete namespace {}", namespace));

        match (outcome, deleted) {
            (Err(e), Err(delete_err)) => {
                error!(error = %format!("{:#}", delete_err), "Namespace left behind");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), deleted) => deleted,
        }
    }

    async fn run_in_namespace(
        &self,
        index: usize,
        workload: &Workload,
        namespace: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        workload
            .apply(self.cluster.kube().as_ref(), Some(namespace))
            .await
            .with_context(|| format!("Failed to apply {}", workload))?;

        let metrics = self.metrics_for_workload(index);
        label_metrics(&metrics, &workload.label()).await;
        let collected = self.collect(workload, namespace, metrics.clone(), cancel).await;
        unlabel_metrics(&metrics).await;
        collected
    }

    async fn collect(
        &self,
        workload: &Workload,
        namespace: &str,
        metrics: Vec<SharedMetric>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        for checkpoint in &self.checkpoints {
            checkpoint
                .checkpoint()
                .await
                .context("Failed to checkpoint metrics")?;
        }

        self.logger
            .log_workload_started(workload.name(), namespace, workload.duration().as_secs());
        let started = Instant::now();

        let mut collector = MetricsCollector::builder()
            .metrics(metrics)
            .poll_period(self.poll_period)
            .store_at(self.store_metrics_at())
            .build();

        collector
            .collect_during(async {
                tokio::select! {
                    _ = workload.wait() => Ok(()),
                    _ = cancelled(&mut cancel) => Err(Interrupted.into()),
                }
            })
            .await?;

        self.logger
            .log_workload_finished(workload.name(), &pp_duration(started.elapsed()));
        Ok(())
    }

    /// Path the kube-config will be written to, if overridden
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.as_deref()
    }
}

async fn label_metrics(metrics: &[SharedMetric], label: &str) {
    for metric in metrics {
        metric
            .lock()
            .await
            .add_field(Field::constant(WORKLOAD_FIELD, label));
    }
}

async fn unlabel_metrics(metrics: &[SharedMetric]) {
    for metric in metrics {
        metric.lock().await.remove_field(WORKLOAD_FIELD);
    }
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
