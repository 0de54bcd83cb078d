//! Resource usage of the dqlite datastore on the control plane nodes

use super::{BatchProbe, Field, Metric, Value};
use crate::cluster::Microk8sCluster;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Resident memory of the k8s-dqlite process, in KB
pub const DQLITE_MEMORY_COMMAND: &str = "pmap -X $(pgrep k8s-dqlite) | tail -n 1 | awk '{print $2}'";

/// CPU usage of the k8s-dqlite process, in percent
pub const DQLITE_CPU_COMMAND: &str =
    "top -b -n 2 -d 0.2 -p $(pgrep k8s-dqlite) | tail -1 | awk '{print $9}'";

/// Metric with the cluster size as its leading columns
pub fn cluster_metric(name: &str, cluster: &Microk8sCluster) -> Metric {
    Metric::new(name)
        .with_field(Field::constant("total_nodes", cluster.size()))
        .with_field(Field::constant("control_plane", cluster.cp()))
}

/// `dqlite_memory`: memory of dqlite on every control plane node
pub fn dqlite_memory(cluster: &Microk8sCluster) -> Metric {
    let probe = ControlPlaneProbe {
        cluster: cluster.clone(),
        command: DQLITE_MEMORY_COMMAND,
        parse: |stdout| Ok(Value::Int(stdout.parse()?)),
    };
    cluster_metric("dqlite_memory", cluster).with_field(Field::multidimensional(
        "memory_KB",
        "node",
        node_params(cluster),
        Arc::new(probe),
    ))
}

/// `dqlite_cpu`: CPU usage of dqlite on every control plane node
pub fn dqlite_cpu(cluster: &Microk8sCluster) -> Metric {
    let probe = ControlPlaneProbe {
        cluster: cluster.clone(),
        command: DQLITE_CPU_COMMAND,
        parse: |stdout| Ok(Value::Float(stdout.parse()?)),
    };
    cluster_metric("dqlite_cpu", cluster).with_field(Field::multidimensional(
        "cpu_%",
        "node",
        node_params(cluster),
        Arc::new(probe),
    ))
}

fn node_params(cluster: &Microk8sCluster) -> Vec<Value> {
    cluster
        .control_plane_names()
        .into_iter()
        .map(Value::from)
        .collect()
}

/// Runs one command on all the requested nodes in a single batched call
struct ControlPlaneProbe {
    cluster: Microk8sCluster,
    command: &'static str,
    parse: fn(&str) -> Result<Value>,
}

#[async_trait]
impl BatchProbe for ControlPlaneProbe {
    async fn probe_all(&self, params: &[Value]) -> Result<Vec<(Value, Value)>> {
        let units: Vec<String> = params.iter().map(|param| param.to_string()).collect();
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let outputs: HashMap<String, String> = self
            .cluster
            .run_in_units(&units, self.command)
            .await?
            .into_iter()
            .map(|output| (output.unit_id, output.stdout))
            .collect();

        params
            .iter()
            .zip(&units)
            .map(|(param, unit)| {
                let stdout = outputs
                    .get(unit)
                    .ok_or_else(|| anyhow!("no output from {}", unit))?;
                let value = (self.parse)(stdout.trim())
                    .with_context(|| format!("unexpected output from {}: {:?}", unit, stdout))?;
                Ok((param.clone(), value))
            })
            .collect()
    }
}
