//! Scale test configuration

use anyhow::{Context, Result};
use benchlib::scenario::ScaleTestSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Scale test configuration
///
/// Read from an optional TOML file, then from `SCALE_TEST_*` environment
/// variables. Lists in the environment are comma separated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScaleTestConfig {
    /// Seconds between two samples of every metric
    pub poll_period_secs: u64,

    /// Seconds the idle workload runs for
    pub workload_duration_secs: u64,

    /// Root of the metric files
    pub data_dir: PathBuf,

    /// API server latency percentiles to report
    pub percentiles: Vec<u32>,

    /// Request verbs left out of the latency histogram
    pub excluded_verbs: Vec<String>,

    /// Kube-config location, `~/.kube/config_{model}` when unset
    pub kubeconfig: Option<PathBuf>,

    /// Leave addons enabled after the run
    pub skip_teardown: bool,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for ScaleTestConfig {
    fn default() -> Self {
        let settings = ScaleTestSettings::default();
        Self {
            poll_period_secs: settings.poll_period_secs,
            workload_duration_secs: settings.workload_duration_secs,
            data_dir: settings.data_dir,
            percentiles: settings.percentiles,
            excluded_verbs: settings.excluded_verbs,
            kubeconfig: settings.kubeconfig,
            skip_teardown: settings.skip_teardown,
            log_json: false,
        }
    }
}

impl ScaleTestConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SCALE_TEST")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("percentiles")
                    .with_list_parse_key("excluded_verbs"),
            )
            .build()
            .context("Failed to read scale test configuration")?;

        config
            .try_deserialize()
            .context("Invalid scale test configuration")
    }

    pub fn settings(&self) -> ScaleTestSettings {
        ScaleTestSettings {
            poll_period_secs: self.poll_period_secs,
            workload_duration_secs: self.workload_duration_secs,
            data_dir: self.data_dir.clone(),
            percentiles: self.percentiles.clone(),
            excluded_verbs: self.excluded_verbs.clone(),
            kubeconfig: self.kubeconfig.clone(),
            skip_teardown: self.skip_teardown,
        }
    }
}
