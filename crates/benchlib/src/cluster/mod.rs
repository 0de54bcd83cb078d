//! Cluster command execution
//!
//! Commands reach the cluster through two external CLIs: juju runs shell
//! commands on the machine units, kubectl talks to the Kubernetes API.
//! Both sit behind narrow traits so the metrics and the orchestration can be
//! tested against canned outputs.

mod juju;
mod kubeconfig;
mod kubectl;
mod setup;

pub use juju::{JujuSession, RunTarget, TopologyError, JUJU, JUJU_WAIT};
pub use kubeconfig::{default_kubeconfig_path, KubeconfigGuard};
pub use kubectl::{Kubectl, KUBECTL};
pub use setup::{
    ClusterSetup, ADD_NODE_TOKEN, ADD_NODE_TOKEN_TTL, DEFAULT_CHANNEL, UNIT_CONSTRAINTS,
};
pub(crate) use setup::http_proxy_command;

use crate::models::{ClusterInfo, Unit};
use crate::observability::BenchMetrics;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Output of one unit in a batched run, as reported by `juju run --format json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnitOutput {
    #[serde(rename = "UnitId")]
    pub unit_id: String,
    #[serde(rename = "Stdout", default)]
    pub stdout: String,
    #[serde(rename = "Stderr", default)]
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` failed on {target} (exit code {code:?}): {stderr}")]
    Failed {
        command: String,
        target: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run target: {0}")]
    InvalidTarget(String),

    #[error("unexpected output of `{command}`: {reason}")]
    MalformedOutput { command: String, reason: String },
}

impl CommandError {
    /// Command text, when the error is tied to one
    pub fn command(&self) -> Option<&str> {
        match self {
            CommandError::Failed { command, .. } | CommandError::MalformedOutput { command, .. } => {
                Some(command)
            }
            _ => None,
        }
    }
}

/// Runs shell commands on the units of the cluster
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run on exactly one unit
    async fn run_in_unit(&self, unit: &str, command: &str) -> Result<CommandOutput, CommandError>;

    /// Run on several units at once; outputs can be matched back by unit id
    async fn run_in_units(
        &self,
        units: &[String],
        command: &str,
    ) -> Result<Vec<UnitOutput>, CommandError>;

    /// Run on every unit of the application
    async fn run_in_app(&self, command: &str) -> Result<CommandOutput, CommandError>;

    /// Run on every unit of the application, giving up after `timeout`
    async fn run_in_app_with_timeout(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.run_in_app(command).await
    }
}

/// Kubernetes API operations, through kubectl
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<(), CommandError>;

    async fn create(&self, kind: &str, name: &str) -> Result<(), CommandError>;

    async fn delete(&self, kind: &str, name: &str) -> Result<(), CommandError>;

    /// `get {kind} -o json`, in `namespace` or across all namespaces
    async fn get_json(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<serde_json::Value, CommandError>;

    /// Kube-config file passed to subsequent invocations
    fn set_kubeconfig(&self, _path: Option<PathBuf>) {}
}

/// Run a local program, failing on a non-zero exit code
pub(crate) async fn exec(
    program: &Path,
    args: &[String],
    envs: &[(&str, &Path)],
) -> Result<CommandOutput, CommandError> {
    let command_line = format!("{} {}", program.display(), args.join(" "));
    debug!(command = %command_line, "Running command");

    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }

    let output = command.output().await.map_err(|source| CommandError::Spawn {
        program: program.display().to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: command_line,
            target: "local".to_string(),
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Handle on a formed MicroK8s cluster
#[derive(Clone)]
pub struct Microk8sCluster {
    info: ClusterInfo,
    runner: Arc<dyn CommandRunner>,
    kube: Arc<dyn KubeClient>,
    stats: BenchMetrics,
}

impl Microk8sCluster {
    pub fn new(info: ClusterInfo, runner: Arc<dyn CommandRunner>, kube: Arc<dyn KubeClient>) -> Self {
        Self {
            info,
            runner,
            kube,
            stats: BenchMetrics::new(),
        }
    }

    /// Cluster driven through the juju and kubectl binaries
    pub fn connect(info: ClusterInfo) -> Self {
        let session = JujuSession::new(info.model.clone(), info.app.clone());
        Self::new(info, Arc::new(session), Arc::new(Kubectl::new()))
    }

    /// Cluster described by a cluster description file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::connect(ClusterInfo::from_file(path)?))
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn kube(&self) -> &Arc<dyn KubeClient> {
        &self.kube
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn size(&self) -> usize {
        self.info.size()
    }

    /// Number of control plane nodes
    pub fn cp(&self) -> usize {
        self.info.control_plane.len()
    }

    pub fn master(&self) -> &Unit {
        &self.info.master
    }

    pub fn control_plane_names(&self) -> Vec<String> {
        self.info.control_plane.iter().map(|u| u.name.clone()).collect()
    }

    pub async fn run_in_unit(&self, unit: &str, command: &str) -> Result<CommandOutput, CommandError> {
        self.runner.run_in_unit(unit, command).await.map_err(|e| {
            self.stats.inc_command_failures();
            error!(unit = %unit, error = %e, "Error running {} on {}", command, unit);
            e
        })
    }

    pub async fn run_in_units(
        &self,
        units: &[String],
        command: &str,
    ) -> Result<Vec<UnitOutput>, CommandError> {
        self.runner.run_in_units(units, command).await.map_err(|e| {
            self.stats.inc_command_failures();
            error!(error = %e, "Error running {} on {:?}", command, units);
            e
        })
    }

    pub async fn run_in_master_node(&self, command: &str) -> Result<CommandOutput, CommandError> {
        self.run_in_unit(&self.info.master.name, command).await
    }

    pub async fn create_namespace(&self, name: &str) -> Result<(), CommandError> {
        info!(namespace = %name, "Creating namespace");
        self.kube.create("ns", name).await
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<(), CommandError> {
        info!(namespace = %name, "Deleting namespace");
        self.kube.delete("ns", name).await
    }

    /// `microk8s enable` on the master node
    pub async fn enable(&self, addons: &[String]) -> Result<(), CommandError> {
        let addons = addons.join(" ");
        info!(addons = %addons, "Enabling addons");
        self.run_in_master_node(&format!("microk8s enable {}", addons))
            .await
            .map(|_| ())
    }

    /// `microk8s disable` on the master node
    pub async fn disable(&self, addons: &[String]) -> Result<(), CommandError> {
        let addons = addons.join(" ");
        info!(addons = %addons, "Disabling addons");
        self.run_in_master_node(&format!("microk8s disable {}", addons))
            .await
            .map(|_| ())
    }

    pub async fn fetch_kubeconfig(&self) -> Result<String, CommandError> {
        info!("Fetching kubectl config from cluster");
        self.run_in_master_node("microk8s config")
            .await
            .map(|output| output.stdout)
    }

    /// Whether every container of every pod reports ready
    pub async fn pods_ready(&self, namespace: Option<&str>) -> Result<bool, CommandError> {
        let pods = self.kube.get_json("pods", namespace).await?;
        Ok(all_containers_ready(&pods))
    }

    /// Poll until all pods are ready, warning instead of failing on timeout
    pub async fn wait_pods_ready(
        &self,
        namespace: Option<&str>,
        timeout: Duration,
        poll_period: Duration,
    ) -> Result<bool, CommandError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pods_ready(namespace).await? {
                return Ok(true);
            }
            if Instant::now() + poll_period > deadline {
                warn!(
                    namespace = ?namespace,
                    timeout_secs = timeout.as_secs(),
                    "Pods not ready before timeout, proceeding"
                );
                return Ok(false);
            }
            tokio::time::sleep(poll_period).await;
        }
    }

    /// DNS server the master node resolves through
    pub async fn dns_server(&self) -> Result<String, CommandError> {
        info!("Getting DNS server from cluster");
        let command = "resolvectl status | grep 'Current DNS Server' | awk '{print $4}'";
        let output = self.run_in_master_node(command).await?;
        let server = output.stdout.trim().to_string();
        if server.is_empty() {
            return Err(CommandError::MalformedOutput {
                command: command.to_string(),
                reason: "no DNS server reported".to_string(),
            });
        }
        Ok(server)
    }
}

/// Containers without a reported status count as not ready
fn all_containers_ready(pods: &serde_json::Value) -> bool {
    let Some(items) = pods.get("items").and_then(|items| items.as_array()) else {
        return true;
    };

    items
        .iter()
        .filter(|item| item.get("kind").and_then(|k| k.as_str()).unwrap_or("Pod") == "Pod")
        .all(|pod| {
            match pod
                .pointer("/status/containerStatuses")
                .and_then(|statuses| statuses.as_array())
            {
                Some(statuses) => statuses
                    .iter()
                    .all(|status| status.get("ready").and_then(|r| r.as_bool()).unwrap_or(false)),
                None => false,
            }
        })
}

impl fmt::Display for Microk8sCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Microk8sCluster[model={}][nodes={}, cp={}]",
            self.info.model,
            self.size(),
            self.cp()
        )
    }
}

impl fmt::Debug for Microk8sCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microk8sCluster")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned command runners and kube clients shared by unit tests

    use super::*;
    use crate::models::Unit;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Hands out unique unit names, ips and instance ids
    #[derive(Default)]
    pub struct UnitFactory {
        next: usize,
    }

    impl UnitFactory {
        pub fn unit(&mut self) -> Unit {
            let id = self.next;
            self.next += 1;
            Unit {
                instance_id: format!("instance_{}", id),
                ip: format!("ip_{}", id),
                name: format!("name_{}", id),
            }
        }

        pub fn cluster_info(&mut self, control_plane: usize, workers: usize) -> ClusterInfo {
            let master = self.unit();
            let mut info = ClusterInfo::single("app", "model", master);
            for _ in 1..control_plane {
                info.control_plane.push(self.unit());
            }
            for _ in 0..workers {
                info.workers.push(self.unit());
            }
            info
        }
    }

    /// Records every command and answers from a table keyed by command
    #[derive(Default)]
    pub struct MockRunner {
        pub calls: Mutex<Vec<(String, String)>>,
        pub responses: Mutex<HashMap<String, String>>,
        pub failing: Mutex<Vec<String>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, command: &str, stdout: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(command.to_string(), stdout.to_string());
        }

        pub fn fail_on(&self, command: &str) {
            self.failing.lock().unwrap().push(command.to_string());
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, command)| command).collect()
        }

        fn answer(&self, target: &str, command: &str) -> Result<String, CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.to_string(), command.to_string()));

            if self.failing.lock().unwrap().iter().any(|c| c == command) {
                return Err(CommandError::Failed {
                    command: command.to_string(),
                    target: target.to_string(),
                    code: Some(1),
                    stdout: "some output".to_string(),
                    stderr: "some error".to_string(),
                });
            }

            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run_in_unit(&self, unit: &str, command: &str) -> Result<CommandOutput, CommandError> {
            self.answer(unit, command).map(CommandOutput::new)
        }

        async fn run_in_units(
            &self,
            units: &[String],
            command: &str,
        ) -> Result<Vec<UnitOutput>, CommandError> {
            let stdout = self.answer(&units.join(","), command)?;
            serde_json::from_str(&stdout).map_err(|e| CommandError::MalformedOutput {
                command: command.to_string(),
                reason: e.to_string(),
            })
        }

        async fn run_in_app(&self, command: &str) -> Result<CommandOutput, CommandError> {
            self.answer("app", command).map(CommandOutput::new)
        }
    }

    /// Kube client recording calls, with canned `get` output
    #[derive(Default)]
    pub struct MockKube {
        pub calls: Mutex<Vec<String>>,
        pub pods: Mutex<serde_json::Value>,
        pub kubeconfig: Mutex<Option<PathBuf>>,
        pub fail_apply: Mutex<bool>,
    }

    impl MockKube {
        pub fn new() -> Self {
            Self {
                pods: Mutex::new(serde_json::json!({ "items": [] })),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl KubeClient for MockKube {
        async fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<(), CommandError> {
            self.record(format!("apply {} {}", manifest.display(), namespace.unwrap_or("-")));
            if *self.fail_apply.lock().unwrap() {
                return Err(CommandError::Failed {
                    command: "apply".to_string(),
                    target: "local".to_string(),
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "invalid manifest".to_string(),
                });
            }
            Ok(())
        }

        async fn create(&self, kind: &str, name: &str) -> Result<(), CommandError> {
            self.record(format!("create {} {}", kind, name));
            Ok(())
        }

        async fn delete(&self, kind: &str, name: &str) -> Result<(), CommandError> {
            self.record(format!("delete {} {}", kind, name));
            Ok(())
        }

        async fn get_json(
            &self,
            kind: &str,
            namespace: Option<&str>,
        ) -> Result<serde_json::Value, CommandError> {
            self.record(format!("get {} {}", kind, namespace.unwrap_or("-A")));
            Ok(self.pods.lock().unwrap().clone())
        }

        fn set_kubeconfig(&self, path: Option<PathBuf>) {
            *self.kubeconfig.lock().unwrap() = path;
        }
    }

    pub fn cluster_with(
        info: ClusterInfo,
        runner: Arc<MockRunner>,
        kube: Arc<MockKube>,
    ) -> Microk8sCluster {
        Microk8sCluster::new(info, runner, kube)
    }
}
