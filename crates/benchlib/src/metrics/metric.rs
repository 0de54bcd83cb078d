//! Metrics: ordered fields plus the rows sampled from them

use super::{Collected, Field, SharedMetric, Value};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// One CSV row
pub type Sample = Vec<Value>;

/// Serializes appends to metric files within the process
static DUMP_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("failed to collect field {field} of metric {metric}: {source:#}")]
    Field {
        metric: String,
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// A set of samples, each formed by the values of an ordered list of fields
///
/// Constant and variable fields contribute one column each. A multidimensional
/// field contributes a parameter column and a value column, and multiplies the
/// rows of the sample: with fields `[a, m1, b, m2]` where `m1` and `m2` have
/// `k1` and `k2` parameters, one sample yields `k1 * k2` rows.
pub struct Metric {
    name: String,
    fields: Vec<Field>,
    samples: Vec<Sample>,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            samples: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a field; field order is column order
    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.add_field(field);
        self
    }

    /// Remove the first field called `name`
    pub fn remove_field(&mut self, name: &str) -> Option<Field> {
        let index = self.fields.iter().position(|f| f.name() == name)?;
        Some(self.fields.remove(index))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .flat_map(|field| field.column_names())
            .map(str::to_string)
            .collect()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn file_name(&self) -> String {
        format!("metric-{}.csv", self.name)
    }

    pub fn into_shared(self) -> SharedMetric {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Evaluate every field once and expand the values into rows
    ///
    /// Scalar values are appended to every row collected so far, while
    /// parameter/value pairs multiply the rows.
    pub async fn collect_fields(&self) -> Result<Vec<Sample>, MetricError> {
        if self.fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows: Vec<Sample> = vec![Vec::new()];
        for field in &self.fields {
            let collected = field.collect().await.map_err(|source| MetricError::Field {
                metric: self.name.clone(),
                field: field.name().to_string(),
                source,
            })?;

            match collected {
                Collected::Scalar(value) => {
                    for row in rows.iter_mut() {
                        row.push(value.clone());
                    }
                }
                Collected::Pairs(pairs) => {
                    rows = rows
                        .iter()
                        .flat_map(|row| {
                            pairs.iter().map(move |(param, value)| {
                                let mut expanded = row.clone();
                                expanded.push(param.clone());
                                expanded.push(value.clone());
                                expanded
                            })
                        })
                        .collect();
                }
            }
        }

        debug_assert!(rows.iter().all(|row| row.len() == self.field_names().len()));
        Ok(rows)
    }

    /// Collect one sample, returning the number of rows it added
    pub async fn sample(&mut self) -> Result<usize, MetricError> {
        let rows = self.collect_fields().await?;
        let added = rows.len();
        self.samples.extend(rows);
        Ok(added)
    }

    /// Append the accumulated rows to `dir/metric-{name}.csv`
    ///
    /// The header is written only when the file does not exist yet.
    pub fn dump(&self, dir: &Path) -> Result<PathBuf, MetricError> {
        let path = dir.join(self.file_name());
        let _guard = DUMP_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| MetricError::Io {
                path: path.clone(),
                source,
            })?;

        let csv_err = |source| MetricError::Csv {
            path: path.clone(),
            source,
        };

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        if !exists {
            writer.write_record(self.field_names()).map_err(csv_err)?;
        }
        for row in &self.samples {
            writer
                .write_record(row.iter().map(|value| value.to_string()))
                .map_err(csv_err)?;
        }
        writer.flush().map_err(|source| MetricError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    /// Drop the in-memory rows; the file on disk is untouched
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metric[{}]", self.name)
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("samples", &self.samples.len())
            .finish()
    }
}
