//! Juju client session
//!
//! Wraps the `juju` binary for one model and application so several models
//! can be driven side by side.

use super::{exec, CommandError, CommandOutput, CommandRunner, UnitOutput};
use crate::models::Unit;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const JUJU: &str = "/snap/bin/juju";
pub const JUJU_WAIT: &str = "/snap/bin/juju-wait";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("malformed juju status output: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("application {0} not found in juju status")]
    UnknownApplication(String),

    #[error("machine {machine} of unit {unit} not found in juju status")]
    UnknownMachine { unit: String, machine: String },
}

/// Where `juju run` executes a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Unit(String),
    Units(Vec<String>),
    App(String),
}

#[derive(Debug, Clone)]
pub struct JujuSession {
    model: String,
    app: String,
    juju: PathBuf,
    juju_wait: PathBuf,
}

impl JujuSession {
    pub fn new(model: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            app: app.into(),
            juju: PathBuf::from(JUJU),
            juju_wait: PathBuf::from(JUJU_WAIT),
        }
    }

    pub fn with_binaries(mut self, juju: impl Into<PathBuf>, juju_wait: impl Into<PathBuf>) -> Self {
        self.juju = juju.into();
        self.juju_wait = juju_wait.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Arguments of `juju run` for `command` on `target`
    pub fn run_args(
        &self,
        target: &RunTarget,
        command: &str,
        timeout: Option<Duration>,
        format: Option<&str>,
    ) -> Result<Vec<String>, CommandError> {
        let mut args = vec!["run".to_string(), "-m".to_string(), self.model.clone()];
        if let Some(timeout) = timeout {
            args.push("--timeout".to_string());
            args.push(format!("{}s", timeout.as_secs()));
        }
        if let Some(format) = format {
            args.push("--format".to_string());
            args.push(format.to_string());
        }

        match target {
            RunTarget::Unit(unit) => {
                args.push("-u".to_string());
                args.push(unit.clone());
            }
            RunTarget::Units(units) if units.is_empty() => {
                return Err(CommandError::InvalidTarget("empty unit list".to_string()));
            }
            RunTarget::Units(units) => {
                args.push("-u".to_string());
                args.push(units.join(","));
            }
            RunTarget::App(app) => {
                args.push("-a".to_string());
                args.push(app.clone());
            }
        }

        args.push("--".to_string());
        args.push(command.to_string());
        Ok(args)
    }

    pub async fn run(
        &self,
        target: &RunTarget,
        command: &str,
        timeout: Option<Duration>,
        format: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        let args = self.run_args(target, command, timeout, format)?;
        exec(&self.juju, &args, &[]).await.map_err(|e| match e {
            CommandError::Failed {
                code, stdout, stderr, ..
            } => CommandError::Failed {
                command: command.to_string(),
                target: target_label(target),
                code,
                stdout,
                stderr,
            },
            other => other,
        })
    }

    async fn juju(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        exec(&self.juju, &to_strings(args), &[]).await
    }

    pub async fn add_model(&self) -> Result<(), CommandError> {
        info!(model = %self.model, "Adding model");
        self.juju(&["add-model", self.model.as_str()]).await.map(|_| ())
    }

    /// `juju deploy {charm} -m {model} {extra_args...} {app}`
    pub async fn deploy(&self, charm: &str, extra_args: &[&str]) -> Result<(), CommandError> {
        let mut args = vec!["deploy", charm, "-m", self.model.as_str()];
        args.extend_from_slice(extra_args);
        args.push(self.app.as_str());
        self.juju(&args).await.map(|_| ())
    }

    pub async fn add_units(&self, units: usize) -> Result<(), CommandError> {
        let units = units.to_string();
        self.juju(&["add-unit", "-m", self.model.as_str(), "-n", units.as_str(), self.app.as_str()])
            .await
            .map(|_| ())
    }

    pub async fn status(&self, format: Option<&str>) -> Result<CommandOutput, CommandError> {
        let format = format.map(|f| format!("--format={}", f));
        let mut args = vec!["status", "-m", self.model.as_str()];
        if let Some(format) = &format {
            args.push(format.as_str());
        }
        self.juju(&args).await
    }

    /// Block until the model settles
    pub async fn wait_for_model(&self) -> Result<(), CommandError> {
        info!(model = %self.model, "Waiting for model");
        exec(&self.juju_wait, &to_strings(&["-m", self.model.as_str()]), &[])
            .await
            .map(|_| ())
    }

    pub async fn destroy_model(&self) -> Result<(), CommandError> {
        info!(model = %self.model, "Destroying model");
        self.juju(&["destroy-model", "-y", self.model.as_str()]).await.map(|_| ())
    }

    /// Units of the application, sorted by unit number
    pub async fn units(&self) -> Result<Vec<Unit>, TopologyError> {
        let status = self.status(Some("json")).await?;
        parse_status_units(&status.stdout, &self.app)
    }
}

#[async_trait]
impl CommandRunner for JujuSession {
    async fn run_in_unit(&self, unit: &str, command: &str) -> Result<CommandOutput, CommandError> {
        self.run(&RunTarget::Unit(unit.to_string()), command, None, None)
            .await
    }

    async fn run_in_units(
        &self,
        units: &[String],
        command: &str,
    ) -> Result<Vec<UnitOutput>, CommandError> {
        let output = self
            .run(&RunTarget::Units(units.to_vec()), command, None, Some("json"))
            .await?;
        serde_json::from_str(&output.stdout).map_err(|e| CommandError::MalformedOutput {
            command: command.to_string(),
            reason: e.to_string(),
        })
    }

    async fn run_in_app(&self, command: &str) -> Result<CommandOutput, CommandError> {
        self.run(&RunTarget::App(self.app.clone()), command, None, None)
            .await
    }

    async fn run_in_app_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        self.run(&RunTarget::App(self.app.clone()), command, Some(timeout), None)
            .await
    }
}

fn to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn target_label(target: &RunTarget) -> String {
    match target {
        RunTarget::Unit(unit) => unit.clone(),
        RunTarget::Units(units) => units.join(","),
        RunTarget::App(app) => format!("all units of {}", app),
    }
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    applications: HashMap<String, Application>,
    #[serde(default)]
    machines: HashMap<String, Machine>,
}

#[derive(Deserialize)]
struct Application {
    #[serde(default)]
    units: HashMap<String, UnitStatus>,
}

#[derive(Deserialize)]
struct UnitStatus {
    #[serde(rename = "public-address", default)]
    public_address: String,
    machine: String,
}

#[derive(Deserialize)]
struct Machine {
    hostname: String,
}

fn parse_status_units(status: &str, app: &str) -> Result<Vec<Unit>, TopologyError> {
    let status: Status = serde_json::from_str(status)?;
    let application = status
        .applications
        .get(app)
        .ok_or_else(|| TopologyError::UnknownApplication(app.to_string()))?;

    let mut units = application
        .units
        .iter()
        .map(|(name, unit)| {
            let machine = status
                .machines
                .get(&unit.machine)
                .ok_or_else(|| TopologyError::UnknownMachine {
                    unit: name.clone(),
                    machine: unit.machine.clone(),
                })?;
            Ok(Unit {
                instance_id: machine.hostname.clone(),
                ip: unit.public_address.clone(),
                name: name.clone(),
            })
        })
        .collect::<Result<Vec<_>, TopologyError>>()?;

    units.sort_by_key(|unit| unit_number(&unit.name));
    Ok(units)
}

fn unit_number(name: &str) -> (u64, String) {
    let number = name
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX);
    (number, name.to_string())
}
