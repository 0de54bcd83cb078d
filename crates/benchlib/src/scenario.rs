//! The scale test: an idle cluster observed with the scale metrics enabled

use crate::cluster::Microk8sCluster;
use crate::experiment::{Experiment, DEFAULT_DATA_DIR};
use crate::metrics::{
    dqlite_cpu, dqlite_memory, ApiServerLatency, DEFAULT_EXCLUDED_VERBS, DEFAULT_PERCENTILES,
    DEFAULT_POLL_PERIOD,
};
use crate::models::Addon;
use crate::workload::Workload;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const SCALE_TEST: &str = "scale-test";

/// Tunables of a scale test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleTestSettings {
    pub poll_period_secs: u64,
    pub workload_duration_secs: u64,
    pub data_dir: PathBuf,
    pub percentiles: Vec<u32>,
    pub excluded_verbs: Vec<String>,
    pub kubeconfig: Option<PathBuf>,
    pub skip_teardown: bool,
}

impl Default for ScaleTestSettings {
    fn default() -> Self {
        Self {
            poll_period_secs: DEFAULT_POLL_PERIOD.as_secs(),
            workload_duration_secs: 300,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            excluded_verbs: DEFAULT_EXCLUDED_VERBS.iter().map(|v| v.to_string()).collect(),
            kubeconfig: None,
            skip_teardown: true,
        }
    }
}

impl ScaleTestSettings {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn workload_duration(&self) -> Duration {
        Duration::from_secs(self.workload_duration_secs)
    }
}

/// Addons needed by the scale test, with DNS forwarding to `dns_server`
pub fn scale_test_addons(dns_server: &str) -> Vec<Addon> {
    vec![
        Addon::new("dns").with_enable_arg(dns_server),
        Addon::new("hostpath-storage").with_disable_arg("destroy-storage"),
        Addon::new("metrics-server"),
    ]
}

/// Build the scale test experiment for `cluster`
///
/// Looks up the DNS server of the master node, so the cluster must be up.
pub async fn scale_test_experiment(
    cluster: Microk8sCluster,
    settings: &ScaleTestSettings,
) -> Result<Experiment> {
    let dns_server = cluster
        .dns_server()
        .await
        .context("Failed to get DNS server from cluster")?;

    let latency = Arc::new(
        ApiServerLatency::new(cluster.clone()).with_excluded_verbs(settings.excluded_verbs.clone()),
    );
    let latency_metric = latency.metric(&settings.percentiles)?;

    let mut experiment = Experiment::new(SCALE_TEST, cluster.clone())
        .with_addons(scale_test_addons(&dns_server))
        .with_skip_teardown(settings.skip_teardown)
        .with_data_dir(&settings.data_dir)
        .with_poll_period(settings.poll_period());
    if let Some(kubeconfig) = &settings.kubeconfig {
        experiment = experiment.with_kubeconfig_path(kubeconfig);
    }

    experiment.register_workloads([Workload::idle(settings.workload_duration())], Vec::new());
    experiment.register_metrics([
        latency_metric.into_shared(),
        dqlite_memory(&cluster).into_shared(),
        dqlite_cpu(&cluster).into_shared(),
    ]);
    experiment.register_checkpoint(latency);

    Ok(experiment)
}

/// Build and run the scale test
pub async fn run_scale_test(cluster: Microk8sCluster, settings: &ScaleTestSettings) -> Result<()> {
    scale_test_experiment(cluster, settings).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{cluster_with, MockKube, MockRunner, UnitFactory};

    #[test]
    fn test_default_settings() {
        let settings = ScaleTestSettings::default();
        assert_eq!(settings.poll_period(), Duration::from_secs(10));
        assert_eq!(settings.workload_duration(), Duration::from_secs(300));
        assert_eq!(settings.percentiles, vec![50, 95, 99]);
        assert_eq!(settings.excluded_verbs, vec!["WATCH"]);
        assert!(settings.skip_teardown);
    }

    #[test]
    fn test_partial_settings_fall_back_to_defaults() {
        let settings: ScaleTestSettings =
            serde_json::from_str(r#"{"workload_duration_secs": 60}"#).unwrap();
        assert_eq!(settings.workload_duration(), Duration::from_secs(60));
        assert_eq!(settings.poll_period_secs, 10);
    }

    #[test]
    fn test_addons() {
        let addons = scale_test_addons("10.0.0.2");
        let enabled: Vec<String> = addons.iter().map(Addon::enable).collect();
        let disabled: Vec<String> = addons.iter().map(Addon::disable).collect();
        assert_eq!(enabled, vec!["dns:10.0.0.2", "hostpath-storage", "metrics-server"]);
        assert_eq!(
            disabled,
            vec!["dns", "hostpath-storage:destroy-storage", "metrics-server"]
        );
    }

    #[tokio::test]
    async fn test_scale_test_experiment() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(
            "resolvectl status | grep 'Current DNS Server' | awk '{print $4}'",
            "10.0.0.2\n",
        );
        let kube = Arc::new(MockKube::new());
        let cluster = cluster_with(UnitFactory::default().cluster_info(3, 2), runner, kube);

        let experiment = scale_test_experiment(cluster, &ScaleTestSettings::default())
            .await
            .unwrap();

        assert_eq!(experiment.name(), "scale-test");
        assert_eq!(experiment.namespace(), "scale-test");
        assert_eq!(experiment.workloads(), &[Workload::idle(Duration::from_secs(300))]);

        let mut names = Vec::new();
        for metric in experiment.metrics_for_workload(0) {
            let metric = metric.lock().await;
            names.push((metric.name().to_string(), metric.field_names()));
        }
        assert_eq!(
            names,
            vec![
                (
                    "api_server_latency".to_string(),
                    vec!["total_nodes", "control_plane", "percentile", "latency", "total_requests"]
                        .into_iter()
                        .map(String::from)
                        .collect::<Vec<_>>()
                ),
                (
                    "dqlite_memory".to_string(),
                    vec!["total_nodes", "control_plane", "node", "memory_KB"]
                        .into_iter()
                        .map(String::from)
                        .collect()
                ),
                (
                    "dqlite_cpu".to_string(),
                    vec!["total_nodes", "control_plane", "node", "cpu_%"]
                        .into_iter()
                        .map(String::from)
                        .collect()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_percentile_rejected() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(
            "resolvectl status | grep 'Current DNS Server' | awk '{print $4}'",
            "10.0.0.2\n",
        );
        let cluster = cluster_with(
            UnitFactory::default().cluster_info(1, 0),
            runner,
            Arc::new(MockKube::new()),
        );
        let settings = ScaleTestSettings {
            percentiles: vec![50, 100],
            ..Default::default()
        };

        assert!(scale_test_experiment(cluster, &settings).await.is_err());
    }
}
