//! MicroK8s benchmarks CLI
//!
//! Provisions clusters through juju, runs the scale test across cluster
//! shapes and summarises the metric files it produces.

mod commands;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{registry, report, setup, status, sweep};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// MicroK8s benchmarks CLI
#[derive(Parser)]
#[command(name = "mk8s-bench")]
#[command(author, version, about = "CLI for MicroK8s scale benchmarks", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Increase log verbosity
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a cluster and save its description file
    Setup(setup::SetupArgs),

    /// Destroy a juju model
    Destroy {
        /// Model to destroy
        model: String,
    },

    /// Show the nodes of a cluster
    Status(StatusArgs),

    /// Provision every cluster shape in turn and run the scale test on it
    Sweep(sweep::SweepArgs),

    /// Manage the local image registry clusters pull from
    Registry {
        #[command(subcommand)]
        command: registry::RegistryCommand,
    },

    /// Summarise a metric file
    Report {
        /// Path of a metric-*.csv file
        file: PathBuf,

        /// Column to group the summary by, e.g. workload
        #[arg(long, short)]
        group_by: Option<String>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct StatusArgs {
    /// Cluster description file
    #[arg(long, short)]
    pub cluster_file: Option<PathBuf>,

    /// Juju model to query
    #[arg(long, short)]
    pub model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Setup(args) => {
            setup::setup_cluster(args, cli.format).await?;
        }
        Commands::Destroy { model } => {
            setup::destroy_model(&model).await?;
        }
        Commands::Status(StatusArgs { cluster_file, model }) => match (cluster_file, model) {
            (Some(path), _) => status::show_cluster_file(&path, cli.format)?,
            (None, Some(model)) => status::show_model(&model, cli.format).await?,
            (None, None) => anyhow::bail!("one of --cluster-file or --model is required"),
        },
        Commands::Sweep(args) => {
            sweep::sweep(args).await?;
        }
        Commands::Registry { command } => {
            registry::run(command).await?;
        }
        Commands::Report { file, group_by } => {
            report::show_report(&file, group_by.as_deref(), cli.format)?;
        }
    }

    Ok(())
}
