//! Scale test - observe an idle MicroK8s cluster
//!
//! Enables the scale test addons on the cluster described by a cluster file,
//! then records API server latency and dqlite memory/CPU into CSV files.

use anyhow::{Context, Result};
use benchlib::{observability::BenchMetrics, run_scale_test, Microk8sCluster};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

#[derive(Parser, Debug)]
#[command(name = "scale-test")]
#[command(about = "Run the scale test experiment on a MicroK8s cluster", long_about = None)]
#[command(version)]
struct Args {
    /// JSON file with the details of the cluster to run the experiment on
    #[arg(short, long)]
    cluster_file: PathBuf,

    /// Increase log verbosity
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the workload duration, in seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Override the directory metric files are written under
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = config::ScaleTestConfig::load(args.config.as_deref())?;
    if let Some(duration) = args.duration {
        config.workload_duration_secs = duration;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    init_tracing(args.debug, args.log_json || config.log_json);

    let metrics = BenchMetrics::new();
    let cluster = Microk8sCluster::from_file(&args.cluster_file)
        .with_context(|| format!("Failed to load cluster from {}", args.cluster_file.display()))?;
    info!(cluster = %cluster, "Starting scale test");

    let result = run_scale_test(cluster, &config.settings()).await;

    metrics.log_summary();
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "Scale test failed");
    }
    result
}
