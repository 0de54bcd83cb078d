//! Cluster provisioning commands

use anyhow::{Context, Result};
use benchlib::cluster::{ClusterSetup, JujuSession, DEFAULT_CHANNEL};
use benchlib::{DockerCredentials, DEFAULT_APP};
use clap::Args;
use std::path::PathBuf;
use tracing::error;

use crate::commands::status::print_cluster;
use crate::output::{print_error, print_info, print_success, print_warning, OutputFormat};

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Microk8s snap channel to install
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Total number of nodes of the cluster
    #[arg(short, long, default_value_t = 1)]
    pub nodes: usize,

    /// Number of control plane nodes
    #[arg(short, long, default_value_t = 1)]
    pub control_plane: usize,

    /// Juju model to deploy the cluster into
    #[arg(short, long, default_value = "microk8s")]
    pub model: String,

    /// Url of the http and https proxy to configure units with
    #[arg(long)]
    pub http_proxy: Option<String>,

    /// Destroy the juju model if an error occurs
    #[arg(long)]
    pub destroy_on_error: bool,

    /// Docker username to configure containerd with
    #[arg(long)]
    pub docker_username: Option<String>,

    /// Docker password to configure containerd with
    #[arg(long)]
    pub docker_password: Option<String>,

    /// Where to save the cluster file, `{model}_cluster.json` by default
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl SetupArgs {
    /// Flags first, then `DOCKER_USERNAME` / `DOCKER_PASSWORD`
    pub fn credentials(&self) -> Option<DockerCredentials> {
        DockerCredentials::resolve(
            self.docker_username.clone(),
            self.docker_password.clone(),
            std::env::var(DockerCredentials::USERNAME_VAR).ok(),
            std::env::var(DockerCredentials::PASSWORD_VAR).ok(),
        )
    }
}

/// Provision a cluster and save its description file
pub async fn setup_cluster(args: SetupArgs, format: OutputFormat) -> Result<()> {
    let setup = ClusterSetup::new(&args.model, args.nodes, args.control_plane)?
        .with_channel(&args.channel)
        .with_http_proxy(args.http_proxy.clone())
        .with_credentials(args.credentials());

    print_info(&format!(
        "Setting up cluster in model {} ({} nodes, {} control plane)",
        args.model, args.nodes, args.control_plane
    ));

    let info = match setup.provision().await {
        Ok(info) => info,
        Err(e) => {
            if args.destroy_on_error {
                print_warning(&format!("Setup failed, destroying model {}", args.model));
                if let Err(destroy_err) = setup.destroy().await {
                    error!(model = %args.model, error = %destroy_err, "Failed to destroy model");
                    print_error(&format!("Failed to destroy model {}", args.model));
                }
            }
            return Err(e);
        }
    };

    let path = args.output.clone().unwrap_or_else(|| setup.cluster_file());
    info.save(&path)?;
    print_success(&format!("Cluster ready, details saved to {}", path.display()));
    print_cluster(&info, format);
    Ok(())
}

/// Destroy a juju model and everything deployed in it
pub async fn destroy_model(model: &str) -> Result<()> {
    JujuSession::new(model, DEFAULT_APP)
        .destroy_model()
        .await
        .with_context(|| format!("Failed to destroy model {}", model))?;
    print_success(&format!("Model {} destroyed", model));
    Ok(())
}
