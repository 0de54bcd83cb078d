//! Local image registry mirror
//!
//! Clusters under test pull their images from a registry machine in the
//! `registry` model instead of the public registries. Images are listed from
//! a running cluster, a saved file or a throwaway single node cluster, then
//! pulled, retagged and pushed either from the registry unit itself or from
//! this machine.

use crate::cluster::{exec, http_proxy_command, ClusterSetup, CommandRunner, JujuSession, Microk8sCluster};
use crate::models::{Addon, Unit};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REGISTRY_MODEL: &str = "registry";
pub const REGISTRY_APP: &str = "registry";
pub const REGISTRY_UNIT: &str = "registry/0";
pub const REGISTRY_PORT: u16 = 5000;

/// Channel whose images are mirrored when none is given
pub const DEFAULT_IMAGES_CHANNEL: &str = "latest/edge";

/// Registries whose images are mirrored; anything else is skipped
pub const KNOWN_REGISTRIES: &[&str] = &["docker.io", "quay.io", "k8s.gcr.io"];

pub const IMAGES_DIR: &str = ".docker_images";

pub const LIST_IMAGES_COMMAND: &str = "microk8s.ctr image ls -q";

const REGISTRY_NO_PROXY: &str = "10.0.0.0/8,localhost,127.0.0.1";
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// `docker.io/bar/foo:v1` becomes `{registry_addr}/bar/foo:v1`
pub fn image_tag(image: &str, registry_addr: &str) -> String {
    let path = KNOWN_REGISTRIES
        .iter()
        .find_map(|registry| image.strip_prefix(registry)?.strip_prefix('/'))
        .unwrap_or(image);
    format!("{}/{}", registry_addr, path)
}

/// Pulls, tags and pushes images into the registry
#[async_trait]
pub trait ImagePusher: Send + Sync {
    /// Address the images are tagged with
    fn registry_addr(&self) -> &str;

    /// Run `docker` once per argument list, in order
    async fn docker(&self, invocations: &[Vec<String>]) -> Result<()>;

    /// Mirror `images`, returning the pushed tags
    async fn push(&self, images: &[String]) -> Result<Vec<String>> {
        info!(images = images.len(), "Pulling images");
        let pulls: Vec<_> = images.iter().map(|image| docker_args(&["pull", image.as_str()])).collect();
        self.docker(&pulls).await?;

        info!("Tagging images");
        let tags: Vec<String> = images
            .iter()
            .map(|image| image_tag(image, self.registry_addr()))
            .collect();
        let tagging: Vec<_> = images
            .iter()
            .zip(&tags)
            .map(|(image, tag)| docker_args(&["tag", image.as_str(), tag.as_str()]))
            .collect();
        self.docker(&tagging).await?;

        info!(registry = %self.registry_addr(), "Pushing images");
        let pushes: Vec<_> = tags.iter().map(|tag| docker_args(&["push", tag.as_str()])).collect();
        self.docker(&pushes).await?;
        Ok(tags)
    }
}

fn docker_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// Pushes from the registry unit, in one juju run per step
pub struct JujuPusher {
    runner: Arc<dyn CommandRunner>,
    unit: String,
    registry_addr: String,
}

impl JujuPusher {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(JujuSession::new(REGISTRY_MODEL, REGISTRY_APP)))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            unit: REGISTRY_UNIT.to_string(),
            registry_addr: format!("localhost:{}", REGISTRY_PORT),
        }
    }
}

impl Default for JujuPusher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImagePusher for JujuPusher {
    fn registry_addr(&self) -> &str {
        &self.registry_addr
    }

    async fn docker(&self, invocations: &[Vec<String>]) -> Result<()> {
        if invocations.is_empty() {
            return Ok(());
        }
        let command = invocations
            .iter()
            .map(|args| format!("docker {}", args.join(" ")))
            .collect::<Vec<_>>()
            .join(";");
        self.runner
            .run_in_unit(&self.unit, &command)
            .await
            .with_context(|| format!("Failed to run docker on {}", self.unit))?;
        Ok(())
    }
}

/// Pushes through the docker CLI of this machine
pub struct LocalPusher {
    docker: PathBuf,
    registry_addr: String,
}

impl LocalPusher {
    /// `registry_addr` may carry an `http://` or `https://` scheme
    pub fn new(registry_addr: &str) -> Self {
        let addr = registry_addr
            .strip_prefix("http://")
            .or_else(|| registry_addr.strip_prefix("https://"))
            .unwrap_or(registry_addr);
        Self {
            docker: PathBuf::from("docker"),
            registry_addr: addr.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_docker(mut self, docker: impl Into<PathBuf>) -> Self {
        self.docker = docker.into();
        self
    }
}

#[async_trait]
impl ImagePusher for LocalPusher {
    fn registry_addr(&self) -> &str {
        &self.registry_addr
    }

    async fn docker(&self, invocations: &[Vec<String>]) -> Result<()> {
        for args in invocations {
            exec(&self.docker, args, &[]).await?;
        }
        Ok(())
    }
}

/// Mirror `images` from this machine when `registry_addr` is given, from
/// the registry unit otherwise
pub async fn push_images(images: &[String], registry_addr: Option<&str>) -> Result<Vec<String>> {
    match registry_addr {
        Some(addr) => LocalPusher::new(addr).push(images).await,
        None => JujuPusher::new().push(images).await,
    }
}

/// Image references from `ctr image ls -q`
///
/// Digests and untagged references are dropped, as are images from
/// registries that are not mirrored.
pub fn parse_image_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.contains(':') && !line.contains("@sha") && !line.starts_with("sha256:"))
        .filter(|line| {
            let known = KNOWN_REGISTRIES.iter().any(|registry| line.starts_with(registry));
            if !known {
                warn!(image = %line, "Image not expected, skipping");
            }
            known
        })
        .map(str::to_string)
        .collect()
}

/// Images present on the master node of `cluster`
pub async fn images_from_cluster(cluster: &Microk8sCluster) -> Result<Vec<String>> {
    let output = cluster
        .run_in_master_node(LIST_IMAGES_COMMAND)
        .await
        .context("Failed to list images")?;
    let images = parse_image_list(&output.stdout);
    info!(images = images.len(), cluster = %cluster, "Found images");
    Ok(images)
}

/// Addons enabled on a throwaway cluster so their images get pulled
pub fn image_addons() -> Vec<Addon> {
    vec![
        Addon::new("dns"),
        Addon::new("prometheus"),
        Addon::new("hostpath-storage").with_disable_arg("destroy-storage"),
    ]
}

/// Images a fresh cluster pulls, from a temporary single node cluster
pub async fn images_from_snap(setup: &ClusterSetup) -> Result<Vec<String>> {
    setup
        .temporary(|cluster| async move {
            let addons: Vec<String> = image_addons().iter().map(Addon::enable).collect();
            cluster.enable(&addons).await?;
            images_from_cluster(&cluster).await
        })
        .await
}

/// Image list saved with [`save_images`]
pub fn load_images(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read images file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse images file {}", path.display()))
}

/// Save to `{dir}/.docker_images/{name}.json`, `/` in `name` becoming `-`
pub fn save_images(images: &[String], dir: &Path, name: &str) -> Result<PathBuf> {
    let images_dir = dir.join(IMAGES_DIR);
    std::fs::create_dir_all(&images_dir)
        .with_context(|| format!("Failed to create {}", images_dir.display()))?;

    let path = images_dir.join(format!("{}.json", name.replace('/', "-")));
    info!(path = %path.display(), "Saving images");
    std::fs::write(&path, serde_json::to_string(images)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Deploys the registry machine
pub struct RegistrySetup {
    juju: JujuSession,
    runner: Arc<dyn CommandRunner>,
    http_proxy: Option<String>,
}

impl RegistrySetup {
    pub fn new(http_proxy: Option<String>) -> Self {
        let juju = JujuSession::new(REGISTRY_MODEL, REGISTRY_APP);
        Self {
            runner: Arc::new(juju.clone()),
            juju,
            http_proxy,
        }
    }

    pub fn with_juju(mut self, juju: JujuSession) -> Self {
        self.juju = juju;
        self
    }

    /// Run unit commands through `runner` instead of the juju session
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Deploy the unit and configure its proxy
    ///
    /// Docker and the registry itself are installed by hand afterwards.
    pub async fn setup(&self) -> Result<Unit> {
        let unit = self.deploy_unit().await?;
        self.prepare(&unit).await?;

        info!(unit = %unit, "Registry unit deployed");
        warn!("Docker has to be set up on the registry unit manually:");
        warn!(" - Ssh into it with: juju ssh -m {} {}", REGISTRY_MODEL, unit.name);
        warn!(" - Install Docker Engine following https://docs.docker.com/engine/install/ubuntu/");
        warn!(" - Start the registry following https://docs.docker.com/registry/");
        Ok(unit)
    }

    async fn deploy_unit(&self) -> Result<Unit> {
        info!(model = %REGISTRY_MODEL, "Deploying ubuntu unit");
        self.juju.add_model().await?;
        self.juju.deploy("ubuntu", &["--series=focal"]).await?;
        self.juju.wait_for_model().await?;

        let units = self.juju.units().await?;
        match units.into_iter().next() {
            Some(unit) => Ok(unit),
            None => bail!("no {} unit after deploying", REGISTRY_APP),
        }
    }

    /// Proxy settings and a reboot to load them, when a proxy is set
    pub async fn prepare(&self, unit: &Unit) -> Result<()> {
        let Some(http_proxy) = &self.http_proxy else {
            return Ok(());
        };

        info!(unit = %unit, "Configuring proxy settings");
        self.runner
            .run_in_unit(&unit.name, &http_proxy_command(http_proxy, REGISTRY_NO_PROXY))
            .await
            .context("Failed to configure proxy")?;

        info!("Rebooting registry unit");
        // The connection drops while the unit goes down
        if let Err(e) = self.runner.run_in_app_with_timeout("reboot", REBOOT_TIMEOUT).await {
            debug!(error = %e, "Reboot command returned an error");
        }
        self.juju.wait_for_model().await?;
        Ok(())
    }
}
