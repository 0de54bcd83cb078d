//! Summaries of metric files

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tabled::Tabled;

use crate::output::{format_number, print_table, OutputFormat};

/// Row for the summary table
#[derive(Tabled, Serialize, Debug, Clone, PartialEq)]
pub struct ColumnSummary {
    #[tabled(rename = "Group")]
    pub group: String,
    #[tabled(rename = "Column")]
    pub column: String,
    #[tabled(rename = "Samples")]
    pub samples: usize,
    #[tabled(rename = "Min", display_with = "display_number")]
    pub min: f64,
    #[tabled(rename = "Mean", display_with = "display_number")]
    pub mean: f64,
    #[tabled(rename = "Max", display_with = "display_number")]
    pub max: f64,
}

fn display_number(value: &f64) -> String {
    format_number(*value)
}

#[derive(Default)]
struct Accumulator {
    samples: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn add(&mut self, value: f64) {
        if self.samples == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.samples += 1;
        self.sum += value;
    }
}

/// Min, mean and max of every numeric column, per value of `group_by`
///
/// A column is numeric when all of its values parse as numbers. Groups keep
/// the order in which they first appear.
pub fn summarize(input: impl Read, group_by: Option<&str>) -> Result<Vec<ColumnSummary>> {
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers().context("Failed to read header")?.clone();

    let group_index = match group_by {
        Some(column) => match headers.iter().position(|h| h == column) {
            Some(index) => Some(index),
            None => bail!("no column named {} in {:?}", column, headers.iter().collect::<Vec<_>>()),
        },
        None => None,
    };

    let mut numeric = vec![true; headers.len()];
    let mut groups: Vec<String> = Vec::new();
    let mut stats: HashMap<(usize, usize), Accumulator> = HashMap::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read row {}", line + 1))?;

        let group = match group_index {
            Some(index) => record.get(index).unwrap_or_default().to_string(),
            None => "all".to_string(),
        };
        let group_id = match groups.iter().position(|g| *g == group) {
            Some(id) => id,
            None => {
                groups.push(group);
                groups.len() - 1
            }
        };

        for (column, value) in record.iter().enumerate() {
            if Some(column) == group_index || !numeric[column] {
                continue;
            }
            match value.parse::<f64>() {
                Ok(value) => stats.entry((group_id, column)).or_default().add(value),
                Err(_) => numeric[column] = false,
            }
        }
    }

    let mut summaries = Vec::new();
    for (group_id, group) in groups.iter().enumerate() {
        for (column, name) in headers.iter().enumerate() {
            if !numeric[column] {
                continue;
            }
            let Some(acc) = stats.get(&(group_id, column)) else {
                continue;
            };
            summaries.push(ColumnSummary {
                group: group.clone(),
                column: name.to_string(),
                samples: acc.samples,
                min: acc.min,
                mean: acc.sum / acc.samples as f64,
                max: acc.max,
            });
        }
    }
    Ok(summaries)
}

/// Summarise a `metric-*.csv` file
pub fn show_report(path: &Path, group_by: Option<&str>, format: OutputFormat) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let summaries = summarize(file, group_by)
        .with_context(|| format!("Failed to summarise {}", path.display()))?;
    print_table(&summaries, format);
    Ok(())
}
