//! Core data models for the benchmarks

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Juju application that hosts the cluster nodes
pub const DEFAULT_APP: &str = "microk8s-node";

/// Control plane sizes exercised by the sweep
pub const CONTROL_PLANE_SIZES: [usize; 3] = [1, 3, 5];

/// Total node counts exercised by the sweep
pub const TOTAL_NODES: [usize; 5] = [1, 10, 30, 50, 100];

/// A machine unit of the juju application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    pub instance_id: String,
    pub ip: String,
    pub name: String,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit[{}]", self.name)
    }
}

/// Cluster topology as persisted in the cluster description file
///
/// The master is always part of the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default = "default_app")]
    pub app: String,
    pub model: String,
    pub master: Unit,
    pub workers: Vec<Unit>,
    pub control_plane: Vec<Unit>,
}

fn default_app() -> String {
    DEFAULT_APP.to_string()
}

impl ClusterInfo {
    /// A single node cluster formed by `master`
    pub fn single(app: impl Into<String>, model: impl Into<String>, master: Unit) -> Self {
        Self {
            app: app.into(),
            model: model.into(),
            control_plane: vec![master.clone()],
            master,
            workers: Vec::new(),
        }
    }

    /// All nodes, control plane first
    pub fn nodes(&self) -> Vec<&Unit> {
        self.control_plane.iter().chain(self.workers.iter()).collect()
    }

    pub fn size(&self) -> usize {
        self.control_plane.len() + self.workers.len()
    }

    /// Load a cluster description file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cluster file {}", path.display()))
    }

    /// Save the cluster description file
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving cluster info");
        let content = serde_json::to_string(self).context("Failed to serialize cluster info")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write cluster file {}", path.display()))
    }
}

/// A microk8s addon with optional enable/disable arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    #[serde(default)]
    pub enable_arg: Option<String>,
    #[serde(default)]
    pub disable_arg: Option<String>,
}

impl Addon {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable_arg: None,
            disable_arg: None,
        }
    }

    pub fn with_enable_arg(mut self, arg: impl Into<String>) -> Self {
        self.enable_arg = Some(arg.into());
        self
    }

    pub fn with_disable_arg(mut self, arg: impl Into<String>) -> Self {
        self.disable_arg = Some(arg.into());
        self
    }

    /// Argument for `microk8s enable`
    pub fn enable(&self) -> String {
        Self::with_arg(&self.name, self.enable_arg.as_deref())
    }

    /// Argument for `microk8s disable`
    pub fn disable(&self) -> String {
        Self::with_arg(&self.name, self.disable_arg.as_deref())
    }

    fn with_arg(name: &str, arg: Option<&str>) -> String {
        match arg {
            Some(arg) => format!("{}:{}", name, arg),
            None => name.to_string(),
        }
    }
}

/// Private registry credentials configured into containerd
#[derive(Clone, PartialEq, Eq)]
pub struct DockerCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DockerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl DockerCredentials {
    pub const USERNAME_VAR: &'static str = "DOCKER_USERNAME";
    pub const PASSWORD_VAR: &'static str = "DOCKER_PASSWORD";

    /// Read credentials from the environment, if both variables are set
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(Self::USERNAME_VAR).ok()?;
        let password = std::env::var(Self::PASSWORD_VAR).ok()?;
        Self::resolve(None, None, Some(username), Some(password))
    }

    /// Pick credentials from explicit values first, then from the environment
    pub fn resolve(
        username: Option<String>,
        password: Option<String>,
        env_username: Option<String>,
        env_password: Option<String>,
    ) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self { username, password })
            }
            _ => match (env_username, env_password) {
                (Some(username), Some(password))
                    if !username.is_empty() && !password.is_empty() =>
                {
                    tracing::debug!("docker credentials found from env vars");
                    Some(Self { username, password })
                }
                _ => {
                    tracing::debug!("docker credentials not provided");
                    None
                }
            },
        }
    }
}

/// Shape of a cluster in the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterShape {
    pub control_plane: usize,
    pub total: usize,
}

impl ClusterShape {
    /// Juju model name for this shape
    pub fn model_name(&self) -> String {
        format!("uk8s-benchmarks-cluster-{}-{}", self.control_plane, self.total)
    }
}

impl fmt::Display for ClusterShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp={} total={}", self.control_plane, self.total)
    }
}

/// Every (control plane, total) combination with enough nodes, smallest clusters first
pub fn valid_cluster_shapes() -> Vec<ClusterShape> {
    let mut shapes: Vec<ClusterShape> = CONTROL_PLANE_SIZES
        .iter()
        .flat_map(|&control_plane| {
            TOTAL_NODES
                .iter()
                .map(move |&total| ClusterShape { control_plane, total })
        })
        .filter(|shape| shape.total >= shape.control_plane)
        .collect();
    shapes.sort_by_key(|shape| shape.total);
    shapes
}
