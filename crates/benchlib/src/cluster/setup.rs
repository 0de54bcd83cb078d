//! Cluster provisioning
//!
//! Deploys machine units with juju, installs the microk8s snap on them and
//! joins them into one cluster. The first unit becomes the master.

use super::{CommandRunner, JujuSession, Kubectl, Microk8sCluster};
use crate::models::{ClusterInfo, ClusterShape, DockerCredentials, Unit, DEFAULT_APP};
use crate::utils::timed;
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHANNEL: &str = "1.24/stable";

/// Fixed join token, so joining never depends on the add-node output
pub const ADD_NODE_TOKEN: &str = "microk8sisgreatushouldgiveitatry";

/// Five years, in seconds
pub const ADD_NODE_TOKEN_TTL: u64 = 5 * 365 * 24 * 60 * 60;

pub const UNIT_CONSTRAINTS: &str = "mem=4G cores=2 root-disk=40G";

const CONTAINERD_TEMPLATE: &str = "/var/snap/microk8s/current/args/containerd-template.toml";
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Provisioning plan for one cluster
pub struct ClusterSetup {
    juju: JujuSession,
    runner: Arc<dyn CommandRunner>,
    total_nodes: usize,
    control_plane_nodes: usize,
    channel: String,
    http_proxy: Option<String>,
    creds: Option<DockerCredentials>,
}

impl ClusterSetup {
    pub fn new(model: impl Into<String>, total_nodes: usize, control_plane_nodes: usize) -> Result<Self> {
        if control_plane_nodes == 0 {
            bail!("a cluster needs at least one control plane node");
        }
        if control_plane_nodes > total_nodes {
            bail!(
                "control plane nodes ({}) cannot exceed total nodes ({})",
                control_plane_nodes,
                total_nodes
            );
        }

        let juju = JujuSession::new(model, DEFAULT_APP);
        Ok(Self {
            runner: Arc::new(juju.clone()),
            juju,
            total_nodes,
            control_plane_nodes,
            channel: DEFAULT_CHANNEL.to_string(),
            http_proxy: None,
            creds: None,
        })
    }

    pub fn for_shape(shape: ClusterShape) -> Result<Self> {
        Self::new(shape.model_name(), shape.total, shape.control_plane)
    }

    /// Run unit commands through `runner` instead of the juju session
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_http_proxy(mut self, http_proxy: Option<String>) -> Self {
        self.http_proxy = http_proxy;
        self
    }

    pub fn with_credentials(mut self, creds: Option<DockerCredentials>) -> Self {
        self.creds = creds;
        self
    }

    pub fn model(&self) -> &str {
        self.juju.model()
    }

    /// Default cluster description file for the model
    pub fn cluster_file(&self) -> PathBuf {
        PathBuf::from(format!("{}_cluster.json", self.model()))
    }

    /// Add the model, deploy the ubuntu charm and scale it to `total_nodes`
    pub async fn deploy_units(&self) -> Result<Vec<Unit>> {
        timed("deploy_units", self.deploy_units_inner()).await
    }

    async fn deploy_units_inner(&self) -> Result<Vec<Unit>> {
        info!(units = self.total_nodes, model = %self.model(), "Deploying ubuntu charm units");
        self.juju.add_model().await?;
        let constraints = format!("--constraints={}", UNIT_CONSTRAINTS);
        self.juju
            .deploy("ubuntu", &["--series=focal", constraints.as_str()])
            .await?;
        if self.total_nodes > 1 {
            self.juju.add_units(self.total_nodes - 1).await?;
        }
        self.juju.wait_for_model().await?;
        Ok(self.juju.units().await?)
    }

    /// Install and configure microk8s on every unit
    pub async fn install_microk8s(&self, units: &[Unit]) -> Result<()> {
        timed("install_microk8s", self.install_microk8s_inner(units)).await
    }

    async fn install_microk8s_inner(&self, units: &[Unit]) -> Result<()> {
        if let Some(http_proxy) = &self.http_proxy {
            self.configure_http_proxy(http_proxy).await?;
            self.reboot_and_wait().await?;
        }

        info!("Installing microk8s on all units");
        self.run_in_app(&install_snap_command(&self.channel)).await?;

        info!("Adding units hostnames on /etc/hosts");
        self.run_in_app(&etc_hosts_command(units)).await?;

        if let Some(creds) = &self.creds {
            info!("Configuring containerd docker credentials");
            self.run_in_app(&containerd_credentials_command(creds)).await?;
            self.run_in_app("sudo snap restart microk8s.daemon-containerd")
                .await?;
        }

        self.run_in_app(&format!(
            "microk8s status --wait-ready --timeout {}",
            READY_TIMEOUT.as_secs()
        ))
        .await
    }

    async fn configure_http_proxy(&self, http_proxy: &str) -> Result<()> {
        info!("Configuring proxy settings on units");
        self.run_in_app(&http_proxy_command(http_proxy, CLUSTER_NO_PROXY)).await
    }

    async fn reboot_and_wait(&self) -> Result<()> {
        info!("Rebooting all units");
        // The connection drops while the units go down
        if let Err(e) = self.runner.run_in_app_with_timeout("reboot", REBOOT_TIMEOUT).await {
            debug!(error = %e, "Reboot command returned an error");
        }
        info!(model = %self.model(), "Waiting for model");
        self.juju.wait_for_model().await?;
        Ok(())
    }

    async fn run_in_app(&self, command: &str) -> Result<()> {
        self.runner
            .run_in_app(command)
            .await
            .map(|_| ())
            .map_err(|e| {
                error!(error = %e, "Error running command on all units");
                e.into()
            })
    }

    /// Join `units` into one cluster; the first unit is the master
    pub async fn form_cluster(&self, units: Vec<Unit>) -> Result<ClusterInfo> {
        timed("form_cluster", self.form_cluster_inner(units)).await
    }

    async fn form_cluster_inner(&self, units: Vec<Unit>) -> Result<ClusterInfo> {
        if units.len() < self.control_plane_nodes {
            bail!(
                "{} units deployed but {} control plane nodes requested",
                units.len(),
                self.control_plane_nodes
            );
        }

        info!(
            workers = units.len() - self.control_plane_nodes,
            control_plane = self.control_plane_nodes,
            "Setting up a microk8s cluster"
        );

        let mut units = units.into_iter();
        let Some(master) = units.next() else {
            bail!("no units to form a cluster with");
        };
        let mut cluster = ClusterInfo::single(DEFAULT_APP, self.model(), master.clone());

        let others: Vec<Unit> = units.collect();
        if others.is_empty() {
            return Ok(cluster);
        }

        let join_url = self.join_url(&master).await?;
        let mut control_plane_left = self.control_plane_nodes - 1;
        for node in others {
            if control_plane_left > 0 {
                self.join(&node, &join_url, false).await?;
                control_plane_left -= 1;
                cluster.control_plane.push(node);
            } else {
                self.join(&node, &join_url, true).await?;
                cluster.workers.push(node);
            }
        }
        Ok(cluster)
    }

    async fn join_url(&self, master: &Unit) -> Result<String> {
        let command = format!(
            "microk8s add-node --token {} --token-ttl {}",
            ADD_NODE_TOKEN, ADD_NODE_TOKEN_TTL
        );
        self.runner.run_in_unit(&master.name, &command).await?;
        Ok(format!("{}:25000/{}", master.ip, ADD_NODE_TOKEN))
    }

    async fn join(&self, node: &Unit, join_url: &str, as_worker: bool) -> Result<()> {
        info!(node = %node, worker = as_worker, "Joining node to cluster");
        let mut command = format!("microk8s join {}", join_url);
        if as_worker {
            command.push_str(" --worker");
        }
        self.runner
            .run_in_unit(&node.name, &command)
            .await
            .with_context(|| format!("Failed to join {} to cluster", node))?;
        Ok(())
    }

    /// Deploy, install and form the cluster
    pub async fn provision(&self) -> Result<ClusterInfo> {
        let units = self.deploy_units().await?;
        self.install_microk8s(&units).await?;
        self.form_cluster(units).await
    }

    pub async fn destroy(&self) -> Result<()> {
        warn!(model = %self.model(), "Destroying model");
        self.juju.destroy_model().await?;
        Ok(())
    }

    /// Provision a cluster, run `f` against it, then destroy it
    ///
    /// The model is destroyed whatever the outcome of provisioning or `f`.
    pub async fn temporary<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Microk8sCluster) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = match self.provision().await {
            Ok(info) => {
                let cluster =
                    Microk8sCluster::new(info, self.runner.clone(), Arc::new(Kubectl::new()));
                f(cluster).await
            }
            Err(e) => Err(e.context(format!("Failed to provision {}", self.model()))),
        };

        if let Err(e) = self.destroy().await {
            error!(model = %self.model(), error = %e, "Failed to destroy model");
        }
        outcome
    }
}

fn install_snap_command(channel: &str) -> String {
    [
        format!("snap install microk8s --classic --channel={}", channel),
        "usermod -a -G microk8s ubuntu".to_string(),
        "chown -f -R ubuntu ~/.kube".to_string(),
        "newgrp microk8s".to_string(),
    ]
    .join(";")
}

/// Node hostnames must resolve for add-node/join to work
fn etc_hosts_command(units: &[Unit]) -> String {
    units
        .iter()
        .map(|unit| format!("echo {}\t{} >> /etc/hosts", unit.ip, unit.instance_id))
        .collect::<Vec<_>>()
        .join(";")
}

/// Private ranges of the cluster network that bypass the proxy
pub(crate) const CLUSTER_NO_PROXY: &str = "10.1.0.0/16,10.152.183.0/24,127.0.0.1";

/// Proxy variables appended to `/etc/environment`; the unit's own address
/// and hostname are added to `no_proxy`
pub(crate) fn http_proxy_command(http_proxy: &str, no_proxy: &str) -> String {
    [
        format!("echo HTTPS_PROXY={} >> /etc/environment", http_proxy),
        format!("echo HTTP_PROXY={} >> /etc/environment", http_proxy),
        format!("echo https_proxy={} >> /etc/environment", http_proxy),
        format!("echo http_proxy={} >> /etc/environment", http_proxy),
        "local_ip=$(hostname -I | awk '{print $1}')".to_string(),
        "juju_instance_id=$(grep \"juju\" /etc/hosts | head -n 1 | awk '{print $NF}')".to_string(),
        format!("noproxy=\"{},${{local_ip}},${{juju_instance_id}}\"", no_proxy),
        "echo no_proxy=${noproxy} >> /etc/environment".to_string(),
        "echo NO_PROXY=${noproxy} >> /etc/environment".to_string(),
    ]
    .join(";")
}

fn containerd_credentials_command(creds: &DockerCredentials) -> String {
    let lines = [
        r#"[plugins.\"io.containerd.grpc.v1.cri\".registry.configs.\"registry-1.docker.io\".auth]"#
            .to_string(),
        format!(r#"username = \"{}\""#, creds.username),
        format!(r#"password = \"{}\""#, creds.password),
    ];
    lines
        .iter()
        .map(|line| format!("echo \"{}\" >> {}", line, CONTAINERD_TEMPLATE))
        .collect::<Vec<_>>()
        .join(";")
}
