//! Scoped kube-config
//!
//! [`KubeconfigGuard`] writes the cluster's kube-config to disk and points the
//! kube client at it. Dropping the guard removes the file and resets the
//! client, on every exit path.

use super::{KubeClient, Microk8sCluster};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// `~/.kube/config_{model}`
pub fn default_kubeconfig_path(model: &str) -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".kube").join(format!("config_{}", model)))
}

pub struct KubeconfigGuard {
    path: PathBuf,
    kube: Arc<dyn KubeClient>,
    cleanup: bool,
}

impl KubeconfigGuard {
    /// Fetch the kube-config of `cluster` into `path`, or the default location
    pub async fn fetch(cluster: &Microk8sCluster, path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_kubeconfig_path(&cluster.info().model)?,
        };

        let kubeconfig = cluster
            .fetch_kubeconfig()
            .await
            .context("Failed to fetch kube-config from cluster")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, kubeconfig)
            .with_context(|| format!("Failed to write kube-config to {}", path.display()))?;

        debug!(path = %path.display(), "Kube-config written");
        let kube = cluster.kube().clone();
        kube.set_kubeconfig(Some(path.clone()));

        Ok(Self {
            path,
            kube,
            cleanup: true,
        })
    }

    /// Keep the file on disk when the guard is dropped
    pub fn keep_file(mut self) -> Self {
        self.cleanup = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KubeconfigGuard {
    fn drop(&mut self) {
        self.kube.set_kubeconfig(None);
        if !self.cleanup {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Kube-config removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove kube-config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{cluster_with, MockKube, MockRunner, UnitFactory};
    use tempfile::TempDir;

    #[test]
    fn test_default_path() {
        let path = default_kubeconfig_path("mymodel").unwrap();
        assert!(path.ends_with(".kube/config_mymodel"));
    }

    #[tokio::test]
    async fn test_guard_writes_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kube").join("config_test");

        let runner = std::sync::Arc::new(MockRunner::new());
        runner.respond("microk8s config", "apiVersion: v1\n");
        let kube = std::sync::Arc::new(MockKube::new());
        let cluster = cluster_with(UnitFactory::default().cluster_info(1, 0), runner, kube.clone());

        {
            let guard = KubeconfigGuard::fetch(&cluster, Some(path.clone())).await.unwrap();
            assert_eq!(guard.path(), path.as_path());
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "apiVersion: v1\n");
            assert_eq!(*kube.kubeconfig.lock().unwrap(), Some(path.clone()));
        }

        assert!(!path.exists());
        assert!(kube.kubeconfig.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guard_released_on_error_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config_test");

        let runner = std::sync::Arc::new(MockRunner::new());
        let kube = std::sync::Arc::new(MockKube::new());
        let cluster = cluster_with(UnitFactory::default().cluster_info(1, 0), runner, kube.clone());

        let result: Result<()> = async {
            let _guard = KubeconfigGuard::fetch(&cluster, Some(path.clone())).await?;
            anyhow::bail!("workload failed")
        }
        .await;

        assert!(result.is_err());
        assert!(!path.exists());
        assert!(kube.kubeconfig.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config_test");

        let runner = std::sync::Arc::new(MockRunner::new());
        runner.fail_on("microk8s config");
        let kube = std::sync::Arc::new(MockKube::new());
        let cluster = cluster_with(UnitFactory::default().cluster_info(1, 0), runner, kube);

        assert!(KubeconfigGuard::fetch(&cluster, Some(path.clone())).await.is_err());
        assert!(!path.exists());
    }
}
