//! Metrics sampling into CSV files
//!
//! A [`Metric`] is an ordered set of [`Field`]s. Sampling a metric evaluates
//! every field once and expands the values into one or more rows, which are
//! later appended to `metric-{name}.csv`. The [`MetricsCollector`] samples a
//! set of metrics from a background task at a fixed poll period.

mod dqlite;
mod field;
mod latency;
mod r#loop;
mod metric;

#[cfg(test)]
mod tests;

pub use dqlite::{cluster_metric, dqlite_cpu, dqlite_memory, DQLITE_CPU_COMMAND, DQLITE_MEMORY_COMMAND};
pub use field::{BatchProbe, Collected, Field, FieldKind, Probe};
pub use latency::{
    ApiServerLatency, Histogram, LatencyError, API_SERVER_LATENCY_BUCKET,
    API_SERVER_METRICS_COMMAND, DEFAULT_EXCLUDED_VERBS, DEFAULT_PERCENTILES,
};
pub use metric::{Metric, MetricError, Sample};
pub use r#loop::{
    CollectorConfig, CollectorError, MetricsCollector, MetricsCollectorBuilder,
    DEFAULT_POLL_PERIOD,
};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A metric shared between the orchestrator and a running collector
pub type SharedMetric = Arc<Mutex<Metric>>;

/// Hook invoked at workload boundaries so a metric can report deltas
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Snapshot the current state; later samples are relative to it
    async fn checkpoint(&self) -> anyhow::Result<()>;
}

/// A single sampled value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write_float(f, *v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Shortest round-trip form, exponent signed and padded to two digits:
/// `0.25`, `1.0`, `1e-05`, `1.5e+16`, `nan`, `inf`
fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        return f.write_str("nan");
    }
    if v == 0.0 || v.is_infinite() || (1e-4..1e16).contains(&v.abs()) {
        // Debug keeps the trailing `.0` on whole floats
        return write!(f, "{:?}", v);
    }

    let formatted = format!("{:e}", v);
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    write!(f, "{}e{}{:0>2}", mantissa, sign, digits)
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
