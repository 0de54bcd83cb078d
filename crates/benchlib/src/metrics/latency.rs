//! API server latency from the request duration histogram
//!
//! The API server exposes `apiserver_request_duration_seconds` as a
//! cumulative Prometheus histogram. Latency percentiles are estimated by
//! turning the buckets back into per-bucket counts and treating every request
//! as if it took exactly the upper bound of its bucket.

use super::{BatchProbe, Checkpoint, Field, Metric, Probe, Value};
use crate::cluster::Microk8sCluster;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

pub const API_SERVER_LATENCY_BUCKET: &str = "apiserver_request_duration_seconds_bucket";

/// Long-poll requests would swamp the distribution
pub const DEFAULT_EXCLUDED_VERBS: &[&str] = &["WATCH"];

pub const DEFAULT_PERCENTILES: &[u32] = &[50, 95, 99];

pub const API_SERVER_METRICS_COMMAND: &str = "microk8s kubectl get --raw /metrics";

#[derive(Debug, Error, PartialEq)]
pub enum LatencyError {
    #[error("no requests recorded in the latency histogram")]
    NoSamples,

    #[error("malformed histogram line `{line}`: {reason}")]
    Malformed { line: String, reason: String },

    #[error("percentile {0} out of range, expected 1 to 99")]
    InvalidPercentile(u32),
}

/// Cumulative histogram, buckets sorted by upper bound
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    buckets: Vec<(f64, u64)>,
}

impl Histogram {
    /// Build from `(upper bound, cumulative count)` pairs in any order
    ///
    /// Counts of repeated bounds are summed, e.g. when the exposition of
    /// several nodes was concatenated.
    pub fn from_buckets(buckets: impl IntoIterator<Item = (f64, u64)>) -> Self {
        let mut merged: HashMap<u64, (f64, u64)> = HashMap::new();
        for (bound, count) in buckets {
            let entry = merged.entry(bound.to_bits()).or_insert((bound, 0));
            entry.1 += count;
        }

        let mut buckets: Vec<(f64, u64)> = merged.into_values().collect();
        buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { buckets }
    }

    /// Parse the text exposition, keeping the buckets of `metric`
    ///
    /// Series whose `verb` label is in `excluded_verbs` are skipped.
    pub fn parse(text: &str, metric: &str, excluded_verbs: &[String]) -> Result<Self, LatencyError> {
        let mut buckets = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // <name{labels}> <value> [timestamp]
            let name_end = line
                .find(|c: char| c == '{' || c.is_whitespace())
                .unwrap_or(line.len());
            if &line[..name_end] != metric {
                continue;
            }

            let malformed = |reason: &str| LatencyError::Malformed {
                line: line.to_string(),
                reason: reason.to_string(),
            };

            let (labels, value) = if line[name_end..].starts_with('{') {
                let close = line
                    .rfind('}')
                    .filter(|close| *close > name_end)
                    .ok_or_else(|| malformed("unterminated label set"))?;
                let labels = parse_labels(&line[name_end + 1..close]).map_err(|r| malformed(&r))?;
                (labels, &line[close + 1..])
            } else {
                (Vec::new(), &line[name_end..])
            };

            let label = |key: &str| {
                labels
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            };

            if label("verb").is_some_and(|verb| excluded_verbs.iter().any(|e| e == verb)) {
                continue;
            }

            let bound = label("le")
                .ok_or_else(|| malformed("missing le label"))
                .and_then(|le| parse_bound(le).ok_or_else(|| malformed("invalid le label")))?;

            let count = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| malformed("invalid sample value"))?;

            buckets.push((bound, count as u64));
        }

        Ok(Self::from_buckets(buckets))
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn buckets(&self) -> &[(f64, u64)] {
        &self.buckets
    }

    /// Requests counted by the histogram
    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|(_, count)| *count).max().unwrap_or(0)
    }

    /// Requests observed since `checkpoint`, bucket by bucket
    pub fn since(&self, checkpoint: &Histogram) -> Histogram {
        let previous: HashMap<u64, u64> = checkpoint
            .buckets
            .iter()
            .map(|(bound, count)| (bound.to_bits(), *count))
            .collect();

        Histogram {
            buckets: self
                .buckets
                .iter()
                .map(|(bound, count)| {
                    let before = previous.get(&bound.to_bits()).copied().unwrap_or(0);
                    (*bound, count.saturating_sub(before))
                })
                .collect(),
        }
    }

    /// Non-cumulative count of each bucket
    pub fn counts(&self) -> Vec<(f64, u64)> {
        let mut seen = 0;
        self.buckets
            .iter()
            .map(|(bound, cumulative)| {
                let count = cumulative.saturating_sub(seen);
                seen = seen.max(*cumulative);
                (*bound, count)
            })
            .collect()
    }

    /// Estimate percentiles, rounded to 4 decimals
    ///
    /// Splits the requests into 100 groups with the exclusive method, where
    /// every request is assumed to take the upper bound of its bucket.
    pub fn percentiles(&self, percentiles: &[u32]) -> Result<Vec<(u32, f64)>, LatencyError> {
        if let Some(p) = percentiles.iter().find(|p| !(1..=99).contains(*p)) {
            return Err(LatencyError::InvalidPercentile(*p));
        }

        let samples = RunLength::new(self.counts());
        if samples.len == 0 {
            return Err(LatencyError::NoSamples);
        }

        Ok(percentiles
            .iter()
            .map(|p| (*p, round4(samples.quantile(*p as u64, 100))))
            .collect())
    }
}

/// Sorted samples stored as `(value, repetitions)`
struct RunLength {
    runs: Vec<(f64, u64)>,
    len: u64,
}

impl RunLength {
    fn new(runs: Vec<(f64, u64)>) -> Self {
        let runs: Vec<_> = runs.into_iter().filter(|(_, count)| *count > 0).collect();
        let len = runs.iter().map(|(_, count)| count).sum();
        Self { runs, len }
    }

    /// Sample at `index` in sorted order
    fn at(&self, index: u64) -> f64 {
        let mut seen = 0;
        for (value, count) in &self.runs {
            seen += count;
            if index < seen {
                return *value;
            }
        }
        self.runs.last().map(|(value, _)| *value).unwrap_or(f64::NAN)
    }

    /// `i`-th of the `n`-quantiles, exclusive method
    ///
    /// Cut points below the second sample or above the second to last one
    /// extrapolate linearly from the two samples at that end, so `delta`
    /// may fall outside `0..=n`.
    fn quantile(&self, i: u64, n: u64) -> f64 {
        if self.len == 1 {
            return self.at(0);
        }

        let (i, n, len) = (i as i64, n as i64, self.len as i64);
        let m = len + 1;
        let j = (i * m / n).clamp(1, len - 1);
        let delta = i * m - j * n;

        let low = self.at((j - 1) as u64);
        let high = self.at(j as u64);
        if delta == 0 || low == high {
            low
        } else {
            (low * (n - delta) as f64 + high * delta as f64) / n as f64
        }
    }
}

fn round4(value: f64) -> f64 {
    if value.is_finite() {
        (value * 10_000.0).round() / 10_000.0
    } else {
        value
    }
}

fn parse_bound(le: &str) -> Option<f64> {
    match le {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        other => other.parse().ok(),
    }
}

/// Parse `k="v",...`, the text between the braces of a series
fn parse_labels(body: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut labels = Vec::new();
    let mut rest = body.trim_start_matches([',', ' ']);

    while !rest.is_empty() {
        let Some((key, quoted)) = rest.split_once("=\"") else {
            return Err(format!("label `{}` is not quoted", rest));
        };

        let mut value = String::new();
        let mut chars = quoted.char_indices();
        let end = loop {
            match chars.next() {
                Some((i, '"')) => break i,
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, escaped)) => value.push(escaped),
                    None => {}
                },
                Some((_, c)) => value.push(c),
                None => return Err(format!("unterminated value of label {}", key.trim())),
            }
        };

        labels.push((key.trim().to_string(), value));
        rest = quoted[end + 1..].trim_start_matches([',', ' ']);
    }
    Ok(labels)
}

/// Latency percentiles of the API server, relative to the last checkpoint
///
/// One fetch per sample feeds both the percentile field and the request
/// count field of the same row.
pub struct ApiServerLatency {
    cluster: Microk8sCluster,
    excluded_verbs: Vec<String>,
    checkpoint: Mutex<Option<Histogram>>,
    last: Mutex<Option<Histogram>>,
}

impl ApiServerLatency {
    pub fn new(cluster: Microk8sCluster) -> Self {
        Self {
            cluster,
            excluded_verbs: DEFAULT_EXCLUDED_VERBS.iter().map(|v| v.to_string()).collect(),
            checkpoint: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub fn with_excluded_verbs(mut self, verbs: Vec<String>) -> Self {
        self.excluded_verbs = verbs;
        self
    }

    async fn fetch_raw(&self) -> Result<Histogram> {
        let output = self
            .cluster
            .run_in_master_node(API_SERVER_METRICS_COMMAND)
            .await?;
        Ok(Histogram::parse(
            &output.stdout,
            API_SERVER_LATENCY_BUCKET,
            &self.excluded_verbs,
        )?)
    }

    /// Current histogram minus the checkpoint
    pub async fn fetch(&self) -> Result<Histogram> {
        let current = self.fetch_raw().await?;
        let checkpoint = lock(&self.checkpoint).clone();
        Ok(match checkpoint {
            Some(checkpoint) => current.since(&checkpoint),
            None => current,
        })
    }

    /// `api_server_latency` metric: cluster size, percentile/latency pairs,
    /// request count
    pub fn metric(self: &Arc<Self>, percentiles: &[u32]) -> Result<Metric, LatencyError> {
        if let Some(p) = percentiles.iter().find(|p| !(1..=99).contains(*p)) {
            return Err(LatencyError::InvalidPercentile(*p));
        }

        let params = percentiles.iter().map(|p| Value::from(*p)).collect();
        Ok(super::cluster_metric("api_server_latency", &self.cluster)
            .with_field(Field::multidimensional(
                "latency",
                "percentile",
                params,
                self.clone(),
            ))
            .with_field(Field::variable(
                "total_requests",
                Arc::new(RequestCount(self.clone())),
            )))
    }
}

#[async_trait]
impl BatchProbe for ApiServerLatency {
    async fn probe_all(&self, params: &[Value]) -> Result<Vec<(Value, Value)>> {
        let histogram = self.fetch().await?;

        let percentiles = params
            .iter()
            .map(|param| match param {
                Value::Int(p) => u32::try_from(*p).map_err(|_| anyhow::anyhow!("invalid percentile {}", p)),
                other => anyhow::bail!("invalid percentile {}", other),
            })
            .collect::<Result<Vec<u32>>>()?;

        // An idle interval is a valid observation, not a failed sample
        let latencies = match histogram.percentiles(&percentiles) {
            Err(LatencyError::NoSamples) => {
                debug!("No API server requests since the last sample");
                percentiles.iter().map(|p| (*p, f64::NAN)).collect()
            }
            other => other?,
        };
        debug!(requests = histogram.total(), ?latencies, "API server latency");
        *lock(&self.last) = Some(histogram);

        Ok(latencies
            .into_iter()
            .map(|(p, latency)| (Value::from(p), Value::from(latency)))
            .collect())
    }
}

#[async_trait]
impl Checkpoint for ApiServerLatency {
    async fn checkpoint(&self) -> Result<()> {
        let current = self.fetch_raw().await?;
        debug!(requests = current.total(), "API server latency checkpoint");
        *lock(&self.checkpoint) = Some(current);
        Ok(())
    }
}

/// Requests behind the latest percentiles, fetching anew if there are none
struct RequestCount(Arc<ApiServerLatency>);

#[async_trait]
impl Probe for RequestCount {
    async fn probe(&self) -> Result<Value> {
        let last = lock(&self.0.last).take();
        let histogram = match last {
            Some(histogram) => histogram,
            None => self.0.fetch().await?,
        };
        Ok(Value::from(histogram.total()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
