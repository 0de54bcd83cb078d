//! Benchmark library for MicroK8s scale testing
//!
//! This crate provides the core functionality for:
//! - Metrics sampling into CSV files (fields, metrics, background collector)
//! - API server latency and dqlite resource metrics
//! - Cluster commands through juju and kubectl
//! - Cluster provisioning and experiment orchestration
//! - Mirroring cluster images into a local registry
//! - Self-observability

pub mod cluster;
pub mod experiment;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod registry;
pub mod scenario;
pub mod utils;
pub mod workload;

pub use cluster::{CommandError, CommandOutput, CommandRunner, Microk8sCluster, UnitOutput};
pub use experiment::Experiment;
pub use metrics::{Field, Metric, MetricsCollector, SharedMetric, Value};
pub use models::*;
pub use observability::{BenchMetrics, StructuredLogger};
pub use scenario::{run_scale_test, scale_test_experiment, ScaleTestSettings};
pub use workload::Workload;
