//! kubectl client

use super::{exec, CommandError, KubeClient};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::error;

pub const KUBECTL: &str = "/usr/bin/kubectl";

/// Runs the kubectl binary against the cluster selected by its kube-config
pub struct Kubectl {
    binary: PathBuf,
    kubeconfig: RwLock<Option<PathBuf>>,
}

impl Kubectl {
    pub fn new() -> Self {
        Self::with_binary(KUBECTL)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: RwLock::new(None),
        }
    }

    pub fn kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig
            .read()
            .map(|path| path.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn kubectl(&self, args: Vec<String>) -> Result<String, CommandError> {
        let kubeconfig = self.kubeconfig();
        let envs: Vec<(&str, &Path)> = kubeconfig
            .as_deref()
            .map(|path| ("KUBECONFIG", path))
            .into_iter()
            .collect();
        exec(&self.binary, &args, &envs).await.map(|output| output.stdout)
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn apply_args(manifest: &Path, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        "-f".to_string(),
        manifest.display().to_string(),
    ];
    if let Some(namespace) = namespace {
        args.push(format!("--namespace={}", namespace));
    }
    args
}

pub(crate) fn get_args(kind: &str, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.to_string()];
    match namespace {
        Some(namespace) => args.push(format!("--namespace={}", namespace)),
        None => args.push("--all-namespaces".to_string()),
    }
    args.push("-o".to_string());
    args.push("json".to_string());
    args
}

fn stderr_of(err: &CommandError) -> String {
    match err {
        CommandError::Failed { stderr, .. } => stderr.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl KubeClient for Kubectl {
    async fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<(), CommandError> {
        self.kubectl(apply_args(manifest, namespace)).await.map(|_| ())
    }

    async fn create(&self, kind: &str, name: &str) -> Result<(), CommandError> {
        let args = vec!["create".to_string(), kind.to_string(), name.to_string()];
        self.kubectl(args).await.map(|_| ()).map_err(|e| {
            error!("Error creating {} {}: {}", kind, name, stderr_of(&e));
            e
        })
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), CommandError> {
        let args = vec!["delete".to_string(), kind.to_string(), name.to_string()];
        self.kubectl(args).await.map(|_| ()).map_err(|e| {
            error!("Error deleting {} {}: {}", kind, name, stderr_of(&e));
            e
        })
    }

    async fn get_json(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<serde_json::Value, CommandError> {
        let args = get_args(kind, namespace);
        let command = format!("kubectl {}", args.join(" "));
        let stdout = self.kubectl(args).await?;
        serde_json::from_str(&stdout).map_err(|e| CommandError::MalformedOutput {
            command,
            reason: e.to_string(),
        })
    }

    fn set_kubeconfig(&self, path: Option<PathBuf>) {
        match self.kubeconfig.write() {
            Ok(mut current) => *current = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_args() {
        assert_eq!(
            apply_args(Path::new("/tmp/nginx.yaml"), Some("scale-test")),
            vec!["apply", "-f", "/tmp/nginx.yaml", "--namespace=scale-test"]
        );
        assert_eq!(
            apply_args(Path::new("nginx.yaml"), None),
            vec!["apply", "-f", "nginx.yaml"]
        );
    }

    #[test]
    fn test_get_args() {
        assert_eq!(
            get_args("pods", Some("kube-system")),
            vec!["get", "pods", "--namespace=kube-system", "-o", "json"]
        );
        assert_eq!(
            get_args("pods", None),
            vec!["get", "pods", "--all-namespaces", "-o", "json"]
        );
    }

    #[test]
    fn test_kubeconfig_is_scoped_to_client() {
        let kubectl = Kubectl::new();
        assert!(kubectl.kubeconfig().is_none());

        kubectl.set_kubeconfig(Some(PathBuf::from("/tmp/config_model")));
        assert_eq!(kubectl.kubeconfig(), Some(PathBuf::from("/tmp/config_model")));
        assert!(std::env::var_os("KUBECONFIG").map_or(true, |v| v != "/tmp/config_model"));

        kubectl.set_kubeconfig(None);
        assert!(kubectl.kubeconfig().is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let kubectl = Kubectl::with_binary("/nonexistent/kubectl");
        let err = kubectl.create("ns", "foo").await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
