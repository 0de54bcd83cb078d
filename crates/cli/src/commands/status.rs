//! Cluster topology commands

use anyhow::{Context, Result};
use benchlib::cluster::JujuSession;
use benchlib::{ClusterInfo, Unit, DEFAULT_APP};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{color_role, print_table, OutputFormat};

/// Row for the nodes table
#[derive(Tabled, Serialize, Debug, PartialEq)]
pub struct NodeRow {
    #[tabled(rename = "Role")]
    pub role: String,
    #[tabled(rename = "Unit")]
    pub name: String,
    #[tabled(rename = "IP")]
    pub ip: String,
    #[tabled(rename = "Instance")]
    pub instance_id: String,
}

impl NodeRow {
    fn new(role: &str, unit: &Unit) -> Self {
        Self {
            role: role.to_string(),
            name: unit.name.clone(),
            ip: unit.ip.clone(),
            instance_id: unit.instance_id.clone(),
        }
    }
}

/// Master first, then the rest of the control plane, then workers
pub fn node_rows(info: &ClusterInfo) -> Vec<NodeRow> {
    let control_plane = info
        .control_plane
        .iter()
        .filter(|unit| **unit != info.master)
        .map(|unit| NodeRow::new("control-plane", unit));
    let workers = info.workers.iter().map(|unit| NodeRow::new("worker", unit));

    std::iter::once(NodeRow::new("master", &info.master))
        .chain(control_plane)
        .chain(workers)
        .collect()
}

pub fn print_cluster(info: &ClusterInfo, format: OutputFormat) {
    let mut rows = node_rows(info);
    if format == OutputFormat::Table {
        println!(
            "{} {} ({} nodes, {} control plane)",
            "Model".bold(),
            info.model.cyan(),
            info.size(),
            info.control_plane.len()
        );
        for row in &mut rows {
            row.role = color_role(&row.role);
        }
    }
    print_table(&rows, format);
}

/// Show the topology saved in a cluster file
pub fn show_cluster_file(path: &Path, format: OutputFormat) -> Result<()> {
    let info = ClusterInfo::from_file(path)?;
    print_cluster(&info, format);
    Ok(())
}

/// Show the units juju currently reports for a model
pub async fn show_model(model: &str, format: OutputFormat) -> Result<()> {
    let units = JujuSession::new(model, DEFAULT_APP)
        .units()
        .await
        .with_context(|| format!("Failed to get status of model {}", model))?;
    let rows: Vec<NodeRow> = units.iter().map(|unit| NodeRow::new("unit", unit)).collect();
    print_table(&rows, format);
    Ok(())
}
