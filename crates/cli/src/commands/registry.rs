//! Local image registry commands

use anyhow::{bail, Result};
use benchlib::cluster::ClusterSetup;
use benchlib::registry::{
    images_from_cluster, images_from_snap, load_images, push_images, save_images, RegistrySetup,
    DEFAULT_IMAGES_CHANNEL,
};
use benchlib::{DockerCredentials, Microk8sCluster};
use clap::{ArgGroup, Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::output::{print_info, print_success};

/// Model of the throwaway cluster images are listed from
const TEMP_MODEL: &str = "temp";

#[derive(Subcommand, Debug)]
pub enum RegistryCommand {
    /// Deploy the registry machine
    Setup {
        /// Url of the http and https proxy to configure the unit with
        #[arg(long)]
        http_proxy: Option<String>,
    },

    /// Push the images of a cluster, a file or a snap channel to the registry
    Push(PushArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["file", "cluster_file", "channel"])))]
pub struct PushArgs {
    /// Json file with the list of images
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Cluster description file of a running cluster
    #[arg(long)]
    pub cluster_file: Option<PathBuf>,

    /// Microk8s channel whose images are collected on a temporary cluster
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_IMAGES_CHANNEL)]
    pub channel: Option<String>,

    /// Push from this machine to the given registry, e.g. http://10.0.0.2:5000
    #[arg(short, long)]
    pub registry: Option<String>,

    /// Url of the http and https proxy for the temporary cluster
    #[arg(long)]
    pub http_proxy: Option<String>,

    /// Docker username to configure containerd with
    #[arg(long)]
    pub docker_username: Option<String>,

    /// Docker password to configure containerd with
    #[arg(long)]
    pub docker_password: Option<String>,
}

pub async fn run(command: RegistryCommand) -> Result<()> {
    match command {
        RegistryCommand::Setup { http_proxy } => {
            let unit = RegistrySetup::new(http_proxy).setup().await?;
            print_success(&format!("Registry unit {} deployed", unit));
        }
        RegistryCommand::Push(args) => push(args).await?,
    }
    Ok(())
}

async fn push(args: PushArgs) -> Result<()> {
    let images = collect_images(&args).await?;
    print_info(&format!("Pushing {} images", images.len()));
    let tags = push_images(&images, args.registry.as_deref()).await?;
    print_success(&format!("Pushed {} images", tags.len()));
    Ok(())
}

async fn collect_images(args: &PushArgs) -> Result<Vec<String>> {
    let cwd = std::env::current_dir()?;

    if let Some(path) = &args.file {
        return load_images(path);
    }

    if let Some(path) = &args.cluster_file {
        let cluster = Microk8sCluster::from_file(path)?;
        let images = images_from_cluster(&cluster).await?;
        save_images(&images, &cwd, &cluster_name(path))?;
        return Ok(images);
    }

    let Some(channel) = &args.channel else {
        bail!("one of --file, --cluster-file or --channel is required");
    };
    let creds = DockerCredentials::resolve(
        args.docker_username.clone(),
        args.docker_password.clone(),
        std::env::var(DockerCredentials::USERNAME_VAR).ok(),
        std::env::var(DockerCredentials::PASSWORD_VAR).ok(),
    );
    let setup = ClusterSetup::new(TEMP_MODEL, 1, 1)?
        .with_channel(channel)
        .with_http_proxy(args.http_proxy.clone())
        .with_credentials(creds);
    let images = images_from_snap(&setup).await?;
    save_images(&images, &cwd, channel)?;
    Ok(images)
}

/// `clusters/big_cluster.json` is saved as `big_cluster`
fn cluster_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .unwrap_or("cluster")
        .to_string()
}
