use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Per-feature standardisation: `(x - mean) / scale`.
///
/// Uses the population standard deviation; constant columns get scale 1 so
/// they map to zero instead of NaN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fit on the columns of `x`. NaN cells are skipped.
    pub fn fit(x: &Array2<f64>) -> Self {
        let mut mean = Vec::with_capacity(x.ncols());
        let mut scale = Vec::with_capacity(x.ncols());

        for column in x.axis_iter(Axis(1)) {
            let (m, s) = column_stats(column);
            mean.push(m);
            scale.push(if s > f64::EPSILON { s } else { 1.0 });
        }

        Self { mean, scale }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>, ModelError> {
        if row.len() != self.n_features() {
            return Err(ModelError::WidthMismatch {
                expected: self.n_features(),
                actual: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect())
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        if x.ncols() != self.n_features() {
            return Err(ModelError::WidthMismatch {
                expected: self.n_features(),
                actual: x.ncols(),
            });
        }
        let mut out = x.clone();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[j], self.scale[j]);
            column.mapv_inplace(|v| (v - m) / s);
        }
        Ok(out)
    }
}

fn column_stats(column: ArrayView1<f64>) -> (f64, f64) {
    let finite: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return (0.0, 1.0);
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
