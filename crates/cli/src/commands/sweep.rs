//! Scale test sweep over every cluster shape
//!
//! Each shape gets its own juju model: the cluster is provisioned, the scale
//! test runs on it, and the model is destroyed whatever the outcome.

use anyhow::{anyhow, bail, Result};
use benchlib::cluster::{ClusterSetup, DEFAULT_CHANNEL};
use benchlib::{run_scale_test, valid_cluster_shapes, ClusterShape, DockerCredentials, ScaleTestSettings};
use clap::Args;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::output::{print_error, print_info, print_success};

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Number of clusters provisioned and tested at once
    #[arg(short = 'j', long, default_value_t = 1)]
    pub concurrency: usize,

    /// Microk8s snap channel to install
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Url of the http and https proxy to configure units with
    #[arg(long)]
    pub http_proxy: Option<String>,

    /// Seconds the idle workload runs for on each cluster
    #[arg(long, default_value_t = 300)]
    pub duration: u64,

    /// Directory metric files are written under
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Docker username to configure containerd with
    #[arg(long)]
    pub docker_username: Option<String>,

    /// Docker password to configure containerd with
    #[arg(long)]
    pub docker_password: Option<String>,
}

struct SweepPlan {
    channel: String,
    http_proxy: Option<String>,
    creds: Option<DockerCredentials>,
    settings: ScaleTestSettings,
}

impl SweepPlan {
    fn from_args(args: &SweepArgs) -> Self {
        let mut settings = ScaleTestSettings {
            workload_duration_secs: args.duration,
            ..Default::default()
        };
        if let Some(data_dir) = &args.data_dir {
            settings.data_dir = data_dir.clone();
        }
        Self {
            channel: args.channel.clone(),
            http_proxy: args.http_proxy.clone(),
            creds: DockerCredentials::resolve(
                args.docker_username.clone(),
                args.docker_password.clone(),
                std::env::var(DockerCredentials::USERNAME_VAR).ok(),
                std::env::var(DockerCredentials::PASSWORD_VAR).ok(),
            ),
            settings,
        }
    }

    async fn run_shape(&self, shape: ClusterShape) -> Result<()> {
        let setup = ClusterSetup::for_shape(shape)?
            .with_channel(&self.channel)
            .with_http_proxy(self.http_proxy.clone())
            .with_credentials(self.creds.clone());

        info!(shape = %shape, model = %setup.model(), "Running scale test");
        setup
            .temporary(|cluster| run_scale_test(cluster, &self.settings))
            .await
    }
}

/// Run the scale test on every valid cluster shape
pub async fn sweep(args: SweepArgs) -> Result<()> {
    let plan = Arc::new(SweepPlan::from_args(&args));
    let shapes = valid_cluster_shapes();
    print_info(&format!(
        "Sweeping {} cluster shapes, {} at a time",
        shapes.len(),
        args.concurrency.max(1)
    ));

    let cancelled = Arc::new(AtomicBool::new(false));
    let listener = {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Sweep cancelled, no new clusters will be provisioned");
                cancelled.store(true, Ordering::SeqCst);
            }
        })
    };

    let result = run_all(shapes, args.concurrency, cancelled, move |shape| {
        let plan = plan.clone();
        async move { plan.run_shape(shape).await }
    })
    .await;
    listener.abort();

    result?;
    print_success("Sweep finished");
    Ok(())
}

/// Run `run` for every shape, at most `concurrency` at once
///
/// Serial runs stop at the first failure. Concurrent runs let the in-flight
/// shapes finish, then return the first failure.
async fn run_all<F, Fut>(
    shapes: Vec<ClusterShape>,
    concurrency: usize,
    cancelled: Arc<AtomicBool>,
    run: F,
) -> Result<()>
where
    F: Fn(ClusterShape) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if concurrency <= 1 {
        for shape in shapes {
            if cancelled.load(Ordering::SeqCst) {
                bail!("sweep cancelled before {}", shape);
            }
            run(shape).await.map_err(|e| report_failure(shape, e))?;
        }
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    for shape in shapes {
        let semaphore = semaphore.clone();
        let cancelled = cancelled.clone();
        let fut = run(shape);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            if cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            fut.await.map_err(|e| report_failure(shape, e))
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| anyhow!("sweep task failed: {}", e)).and_then(|r| r);
        if let Err(e) = outcome {
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None if cancelled.load(Ordering::SeqCst) => bail!("sweep cancelled"),
        None => Ok(()),
    }
}

fn report_failure(shape: ClusterShape, e: anyhow::Error) -> anyhow::Error {
    error!(shape = %shape, error = %format!("{:#}", e), "Scale test failed");
    print_error(&format!("Scale test failed on {}: {:#}", shape, e));
    e.context(format!("Scale test failed on {}", shape))
}
