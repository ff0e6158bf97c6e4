use std::io::Read;
use std::path::Path;

use ndarray::Array2;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Target column '{0}' not found")]
    MissingTarget(String),

    #[error("Row {row}: column '{column}' is not numeric ({value:?})")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },

    #[error("Row {row}: label {value:?} is not 0 or 1")]
    InvalidLabel { row: usize, value: String },

    #[error("Dataset has no rows")]
    Empty,
}

/// Labelled training data: numeric features plus a 0/1 target.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub labels: Vec<f64>,
}

impl Dataset {
    pub fn from_path(path: &Path, target: &str) -> Result<Self, DatasetError> {
        let file = std::fs::File::open(path).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(file, target)
    }

    /// Parse a headered CSV. Empty cells become NaN; the target must be 0 or 1.
    pub fn from_reader<R: Read>(reader: R, target: &str) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();

        let target_idx = headers
            .iter()
            .position(|h| h == target)
            .ok_or_else(|| DatasetError::MissingTarget(target.to_string()))?;
        let feature_names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != target_idx)
            .map(|(_, h)| h.to_string())
            .collect();

        let mut values = Vec::new();
        let mut labels = Vec::new();

        for (row, record) in reader.records().enumerate() {
            let record = record?;
            for (i, cell) in record.iter().enumerate() {
                if i == target_idx {
                    labels.push(parse_label(row, cell)?);
                    continue;
                }
                values.push(parse_cell(cell).ok_or_else(|| DatasetError::NotNumeric {
                    row,
                    column: headers.get(i).unwrap_or_default().to_string(),
                    value: cell.to_string(),
                })?);
            }
        }

        if labels.is_empty() {
            return Err(DatasetError::Empty);
        }

        let features = Array2::from_shape_vec((labels.len(), feature_names.len()), values)
            .map_err(|_| DatasetError::Empty)?;

        Ok(Self {
            feature_names,
            features,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positive_ratio(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().sum::<f64>() / self.labels.len() as f64
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    if cell.is_empty() {
        return Some(f64::NAN);
    }
    match cell {
        "True" | "true" => Some(1.0),
        "False" | "false" => Some(0.0),
        _ => cell.parse().ok(),
    }
}

fn parse_label(row: usize, cell: &str) -> Result<f64, DatasetError> {
    match parse_cell(cell) {
        Some(v) if v == 0.0 || v == 1.0 => Ok(v),
        _ => Err(DatasetError::InvalidLabel {
            row,
            value: cell.to_string(),
        }),
    }
}

/// Read every row of a headered CSV as a JSON object. Numeric cells become
/// numbers, empty cells null, anything else a string.
pub fn read_rows<R: Read>(reader: R) -> Result<Vec<Map<String, Value>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    cell.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or_else(|| Value::String(cell.to_string()))
                };
                (h.to_string(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
