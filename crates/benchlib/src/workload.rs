//! Workloads applied to the cluster while metrics are collected

use crate::cluster::{CommandError, KubeClient};
use crate::utils::pp_duration;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

pub const DEFAULT_WORKLOAD_POLL_PERIOD: Duration = Duration::from_secs(30);

const IDLE: &str = "idle";

/// A manifest applied once, then left running for `duration`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Workload {
    manifest: Option<PathBuf>,
    duration: Duration,
    name: String,
    poll_period: Duration,
}

impl Workload {
    /// Workload named after the manifest file
    pub fn new(manifest: impl Into<PathBuf>, duration: Duration) -> Self {
        let manifest = manifest.into();
        let name = manifest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.display().to_string());
        Self {
            manifest: Some(manifest),
            duration,
            name,
            poll_period: DEFAULT_WORKLOAD_POLL_PERIOD,
        }
    }

    /// Nothing deployed; the cluster is observed at rest
    pub fn idle(duration: Duration) -> Self {
        Self {
            manifest: None,
            duration,
            name: IDLE.to_string(),
            poll_period: DEFAULT_WORKLOAD_POLL_PERIOD,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manifest(&self) -> Option<&Path> {
        self.manifest.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_idle(&self) -> bool {
        self.manifest.is_none()
    }

    /// Value of the `workload` column in the metric files
    pub fn label(&self) -> String {
        match &self.manifest {
            Some(manifest) => manifest.display().to_string(),
            None => IDLE.to_string(),
        }
    }

    pub async fn apply(
        &self,
        kube: &dyn KubeClient,
        namespace: Option<&str>,
    ) -> Result<(), CommandError> {
        match &self.manifest {
            Some(manifest) => kube.apply(manifest, namespace).await,
            None => Ok(()),
        }
    }

    /// Sleep until the workload duration has elapsed, reporting progress
    pub async fn wait(&self) {
        let deadline = Instant::now() + self.duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.as_secs() == 0 {
                break;
            }
            info!("Waiting for {}... {} left", self, pp_duration(remaining));
            tokio::time::sleep(self.poll_period.min(remaining)).await;
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Workload[{}]", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::MockKube;

    #[test]
    fn test_name_from_manifest() {
        let workload = Workload::new("/tmp/workloads/nginx.yaml", Duration::from_secs(60));
        assert_eq!(workload.name(), "nginx.yaml");
        assert_eq!(workload.label(), "/tmp/workloads/nginx.yaml");
        assert_eq!(workload.to_string(), "Workload[nginx.yaml]");

        let named = workload.with_name("web");
        assert_eq!(named.to_string(), "Workload[web]");
    }

    #[test]
    fn test_idle() {
        let workload = Workload::idle(Duration::from_secs(60));
        assert!(workload.is_idle());
        assert_eq!(workload.name(), "idle");
        assert_eq!(workload.label(), "idle");
        assert!(workload.manifest().is_none());
    }

    #[tokio::test]
    async fn test_apply_in_namespace() {
        let kube = MockKube::new();
        let workload = Workload::new("/tmp/nginx.yaml", Duration::from_secs(1));
        workload.apply(&kube, Some("scale-test")).await.unwrap();
        assert_eq!(kube.calls(), vec!["apply /tmp/nginx.yaml scale-test"]);
    }

    #[tokio::test]
    async fn test_idle_apply_is_noop() {
        let kube = MockKube::new();
        Workload::idle(Duration::from_secs(1))
            .apply(&kube, Some("scale-test"))
            .await
            .unwrap();
        assert!(kube.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_runs_for_duration() {
        let workload = Workload::idle(Duration::from_secs(2))
            .with_poll_period(Duration::from_secs(3));

        let start = Instant::now();
        workload.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_done() {
        let workload = Workload::idle(Duration::from_secs(65))
            .with_poll_period(Duration::from_secs(30));

        let start = Instant::now();
        workload.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(65));
    }
}
