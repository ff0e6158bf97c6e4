//! Gradient-boosted decision trees for binary classification.
//!
//! Logistic loss with second-order (gradient + hessian) leaf estimates and the
//! usual regularised split gain:
//!
//! ```text
//! gain = ½ · (G_L² / (H_L + λ) + G_R² / (H_R + λ) − G² / (H + λ)) − γ
//! leaf = −G / (H + λ) · η
//! ```
//!
//! Split finding works on per-feature quantile histograms computed once before
//! boosting. A split on bin `b` is stored as the float threshold `cuts[b]`, so
//! `bin(x) <= b` during training is the same test as `x < threshold` at
//! prediction time. NaN always goes left.

use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::ModelError;

const MIN_HESSIAN: f64 = 1e-16;
const MIN_SPLIT_GAIN: f64 = 1e-10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoosterParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub n_estimators: usize,
    pub subsample: f64,
    pub colsample_bytree: f64,
    pub min_child_weight: f64,
    pub reg_lambda: f64,
    pub gamma: f64,
    pub max_bins: usize,
    pub early_stopping_rounds: Option<usize>,
    pub seed: u64,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            learning_rate: 0.1,
            n_estimators: 100,
            subsample: 0.8,
            colsample_bytree: 0.8,
            min_child_weight: 1.0,
            reg_lambda: 1.0,
            gamma: 0.0,
            max_bins: 256,
            early_stopping_rounds: Some(10),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row[*feature];
                    idx = if x.is_nan() || x < *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Trained ensemble. Serialized as-is into the model artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientBoostedClassifier {
    pub n_features: usize,
    pub base_margin: f64,
    pub trees: Vec<Tree>,
    pub best_iteration: usize,
    pub feature_importances: Vec<f64>,
}

/// Validation data watched for early stopping.
pub struct EvalSet<'a> {
    pub x: &'a Array2<f64>,
    pub y: &'a [f64],
}

impl GradientBoostedClassifier {
    pub fn fit(
        x: &Array2<f64>,
        y: &[f64],
        eval: Option<EvalSet<'_>>,
        params: &BoosterParams,
    ) -> Result<Self, ModelError> {
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 || n_features == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if y.len() != n_rows {
            return Err(ModelError::LabelMismatch {
                rows: n_rows,
                labels: y.len(),
            });
        }
        if let Some(eval) = &eval {
            if eval.x.ncols() != n_features {
                return Err(ModelError::WidthMismatch {
                    expected: n_features,
                    actual: eval.x.ncols(),
                });
            }
            if eval.y.len() != eval.x.nrows() {
                return Err(ModelError::LabelMismatch {
                    rows: eval.x.nrows(),
                    labels: eval.y.len(),
                });
            }
        }

        let positive_rate = (y.iter().sum::<f64>() / n_rows as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (positive_rate / (1.0 - positive_rate)).ln();

        let binned = BinnedMatrix::build(x, params.max_bins.max(2));
        let mut rng = SmallRng::seed_from_u64(params.seed);

        let mut margin = vec![base_margin; n_rows];
        let mut eval_margin = eval.as_ref().map(|e| vec![base_margin; e.x.nrows()]);
        let mut grad = vec![0.0; n_rows];
        let mut hess = vec![0.0; n_rows];

        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut gain_sum = vec![0.0; n_features];
        let mut split_count = vec![0usize; n_features];
        let mut best = (f64::INFINITY, 0usize);

        let n_cols_per_tree =
            ((params.colsample_bytree * n_features as f64).round() as usize).clamp(1, n_features);
        let mut all_features: Vec<usize> = (0..n_features).collect();

        for round in 0..params.n_estimators {
            for i in 0..n_rows {
                let p = sigmoid(margin[i]);
                grad[i] = p - y[i];
                hess[i] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }

            let rows: Vec<usize> = if params.subsample < 1.0 {
                (0..n_rows)
                    .filter(|_| rng.random::<f64>() < params.subsample)
                    .collect()
            } else {
                (0..n_rows).collect()
            };

            all_features.shuffle(&mut rng);
            let mut features = all_features[..n_cols_per_tree].to_vec();
            features.sort_unstable();

            let mut builder = TreeBuilder {
                binned: &binned,
                grad: &grad,
                hess: &hess,
                features: &features,
                params,
                nodes: Vec::new(),
                gain_sum: &mut gain_sum,
                split_count: &mut split_count,
            };
            builder.grow(rows, 0);
            let tree = Tree {
                nodes: builder.nodes,
            };

            for (i, row) in x.axis_iter(Axis(0)).enumerate() {
                margin[i] += tree.predict(row_slice(&row).as_ref());
            }

            if let (Some(eval), Some(eval_margin)) = (&eval, eval_margin.as_mut()) {
                for (i, row) in eval.x.axis_iter(Axis(0)).enumerate() {
                    eval_margin[i] += tree.predict(row_slice(&row).as_ref());
                }
                let loss = log_loss(eval.y, eval_margin);
                tracing::debug!(round = round, eval_logloss = loss, "boosting round");
                if loss < best.0 {
                    best = (loss, round);
                }
            }

            trees.push(tree);

            if let Some(patience) = params.early_stopping_rounds {
                if eval.is_some() && round - best.1 >= patience {
                    tracing::info!(
                        best_iteration = best.1,
                        round = round,
                        "Early stopping: no validation improvement"
                    );
                    break;
                }
            }
        }

        let best_iteration = if eval.is_some() {
            best.1
        } else {
            trees.len().saturating_sub(1)
        };
        trees.truncate(best_iteration + 1);

        let mut feature_importances: Vec<f64> = gain_sum
            .iter()
            .zip(&split_count)
            .map(|(g, &c)| if c > 0 { g / c as f64 } else { 0.0 })
            .collect();
        let total: f64 = feature_importances.iter().sum();
        if total > 0.0 {
            feature_importances.iter_mut().for_each(|v| *v /= total);
        }

        Ok(Self {
            n_features,
            base_margin,
            trees,
            best_iteration,
            feature_importances,
        })
    }

    /// Check that every split references an existing feature and points forward
    /// to nodes inside its tree, so prediction cannot index out of bounds or loop.
    pub fn validate(&self) -> Result<(), ModelError> {
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(ModelError::CorruptTree {
                    tree: t,
                    reason: "no nodes".to_string(),
                });
            }
            for (idx, node) in tree.nodes.iter().enumerate() {
                let Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } = node
                else {
                    continue;
                };
                if *feature >= self.n_features {
                    return Err(ModelError::CorruptTree {
                        tree: t,
                        reason: format!(
                            "node {} splits on feature {} of {}",
                            idx, feature, self.n_features
                        ),
                    });
                }
                for child in [*left, *right] {
                    if child <= idx || child >= tree.nodes.len() {
                        return Err(ModelError::CorruptTree {
                            tree: t,
                            reason: format!("node {} has invalid child {}", idx, child),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn predict_margin(&self, row: &[f64]) -> Result<f64, ModelError> {
        if row.len() != self.n_features {
            return Err(ModelError::WidthMismatch {
                expected: self.n_features,
                actual: row.len(),
            });
        }
        Ok(self.base_margin + self.trees.iter().map(|t| t.predict(row)).sum::<f64>())
    }

    /// `[P(class 0), P(class 1)]`
    pub fn predict_proba(&self, row: &[f64]) -> Result<[f64; 2], ModelError> {
        let p = sigmoid(self.predict_margin(row)?);
        Ok([1.0 - p, p])
    }

    pub fn predict(&self, row: &[f64]) -> Result<u8, ModelError> {
        let [_, p] = self.predict_proba(row)?;
        Ok(u8::from(p > 0.5))
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn log_loss(y: &[f64], margin: &[f64]) -> f64 {
    let eps = 1e-15;
    let total: f64 = y
        .iter()
        .zip(margin)
        .map(|(&t, &m)| {
            let p = sigmoid(m).clamp(eps, 1.0 - eps);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum();
    total / y.len().max(1) as f64
}

fn row_slice<'a>(row: &'a ArrayView1<'a, f64>) -> std::borrow::Cow<'a, [f64]> {
    match row.as_slice() {
        Some(s) => std::borrow::Cow::Borrowed(s),
        None => std::borrow::Cow::Owned(row.to_vec()),
    }
}

/// Column-major bin indices plus the cut points that produced them.
struct BinnedMatrix {
    bins: Vec<Vec<u16>>,
    cuts: Vec<Vec<f64>>,
}

impl BinnedMatrix {
    fn build(x: &Array2<f64>, max_bins: usize) -> Self {
        let mut bins = Vec::with_capacity(x.ncols());
        let mut cuts = Vec::with_capacity(x.ncols());

        for column in x.axis_iter(Axis(1)) {
            let feature_cuts = quantile_cuts(column, max_bins);
            let feature_bins = column
                .iter()
                .map(|&v| {
                    if v.is_nan() {
                        0
                    } else {
                        feature_cuts.partition_point(|&c| c <= v) as u16
                    }
                })
                .collect();
            bins.push(feature_bins);
            cuts.push(feature_cuts);
        }

        Self { bins, cuts }
    }
}

/// Strictly increasing cut points; at most `max_bins - 1` of them.
fn quantile_cuts(column: ArrayView1<f64>, max_bins: usize) -> Vec<f64> {
    let mut values: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup();

    if values.len() <= 1 {
        return Vec::new();
    }

    if values.len() <= max_bins {
        return values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }

    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|i| values[i * values.len() / max_bins])
        .collect();
    cuts.dedup();
    cuts
}

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
    params: &'a BoosterParams,
    nodes: Vec<Node>,
    gain_sum: &'a mut Vec<f64>,
    split_count: &'a mut Vec<usize>,
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = rows.iter().map(|&i| self.hess[i]).sum();
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            value: self.leaf_value(g, h),
        });

        if depth >= self.params.max_depth || h < 2.0 * self.params.min_child_weight {
            return idx;
        }

        let Some(split) = self.best_split(&rows, g, h) else {
            return idx;
        };

        let column = &self.binned.bins[split.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| column[i] as usize <= split.bin);

        self.gain_sum[split.feature] += split.gain;
        self.split_count[split.feature] += 1;

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: self.binned.cuts[split.feature][split.bin],
            left,
            right,
        };
        idx
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.reg_lambda) * self.params.learning_rate
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let lambda = self.params.reg_lambda;
        let mcw = self.params.min_child_weight;
        let parent = g * g / (h + lambda);
        let mut best: Option<SplitCandidate> = None;

        for &feature in self.features {
            let cuts = &self.binned.cuts[feature];
            if cuts.is_empty() {
                continue;
            }
            let column = &self.binned.bins[feature];
            let mut hist_g = vec![0.0; cuts.len() + 1];
            let mut hist_h = vec![0.0; cuts.len() + 1];
            for &i in rows {
                let b = column[i] as usize;
                hist_g[b] += self.grad[i];
                hist_h[b] += self.hess[i];
            }

            let (mut gl, mut hl) = (0.0, 0.0);
            for bin in 0..cuts.len() {
                gl += hist_g[bin];
                hl += hist_h[bin];
                let (gr, hr) = (g - gl, h - hl);
                if hl < mcw || hr < mcw {
                    continue;
                }
                let gain = 0.5 * (gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent)
                    - self.params.gamma;
                if gain > MIN_SPLIT_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Two informative features, one noise feature; label = x0 + x1 > 0.
    fn separable(n: usize, seed: u64) -> (Array2<f64>, Vec<f64>) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut x = Array2::zeros((n, 3));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let a: f64 = rng.random_range(-1.0..1.0);
            let b: f64 = rng.random_range(-1.0..1.0);
            x[[i, 0]] = a;
            x[[i, 1]] = b;
            x[[i, 2]] = rng.random_range(-1.0..1.0);
            y.push(if a + b > 0.0 { 1.0 } else { 0.0 });
        }
        (x, y)
    }

    #[test]
    fn test_learns_separable_problem() {
        let (x, y) = separable(400, 7);
        let model = GradientBoostedClassifier::fit(&x, &y, None, &BoosterParams::default()).unwrap();

        let correct = x
            .axis_iter(Axis(0))
            .zip(&y)
            .filter(|(row, t)| model.predict(&row.to_vec()).unwrap() as f64 == **t)
            .count();
        assert!(correct as f64 / y.len() as f64 > 0.9, "accuracy too low: {}", correct);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let (x, y) = separable(200, 11);
        let model = GradientBoostedClassifier::fit(&x, &y, None, &BoosterParams::default()).unwrap();
        let [p0, p1] = model.predict_proba(&[0.3, -0.1, 0.0]).unwrap();
        assert!((p0 + p1 - 1.0).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&p1));
    }

    #[test]
    fn test_importances_favour_informative_features() {
        let (x, y) = separable(400, 3);
        let model = GradientBoostedClassifier::fit(&x, &y, None, &BoosterParams::default()).unwrap();
        let imp = &model.feature_importances;
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(imp[0] + imp[1] > imp[2]);
    }

    #[test]
    fn test_early_stopping_truncates_to_best_round() {
        let (x, y) = separable(300, 5);
        let (vx, vy) = separable(100, 6);
        let params = BoosterParams {
            n_estimators: 300,
            early_stopping_rounds: Some(5),
            ..Default::default()
        };
        let model = GradientBoostedClassifier::fit(
            &x,
            &y,
            Some(EvalSet { x: &vx, y: &vy }),
            &params,
        )
        .unwrap();
        assert_eq!(model.trees.len(), model.best_iteration + 1);
        assert!(model.trees.len() <= 300);
    }

    #[test]
    fn test_nan_routes_left() {
        let tree = Tree {
            nodes: vec![
                Node::Split {
                    feature: 0,
                    threshold: 0.5,
                    left: 1,
                    right: 2,
                },
                Node::Leaf { value: -1.0 },
                Node::Leaf { value: 1.0 },
            ],
        };
        assert_eq!(tree.predict(&[f64::NAN]), -1.0);
        assert_eq!(tree.predict(&[0.4]), -1.0);
        assert_eq!(tree.predict(&[0.5]), 1.0);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let x = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            GradientBoostedClassifier::fit(&x, &[], None, &BoosterParams::default()),
            Err(ModelError::EmptyTrainingSet)
        ));

        let (x, _) = separable(10, 1);
        assert!(matches!(
            GradientBoostedClassifier::fit(&x, &[1.0], None, &BoosterParams::default()),
            Err(ModelError::LabelMismatch { rows: 10, labels: 1 })
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_indices() {
        let (x, y) = separable(100, 9);
        let model = GradientBoostedClassifier::fit(&x, &y, None, &BoosterParams::default()).unwrap();
        assert!(model.validate().is_ok());

        let split = |feature, left, right| Node::Split {
            feature,
            threshold: 0.0,
            left,
            right,
        };
        let leaf = || Node::Leaf { value: 0.0 };
        let corrupt = [
            vec![split(3, 1, 2), leaf(), leaf()],
            vec![split(0, 1, 7), leaf(), leaf()],
            vec![split(0, 0, 1), leaf()],
            vec![],
        ];
        for nodes in corrupt {
            let mut bad = model.clone();
            bad.trees = vec![Tree { nodes }];
            assert!(matches!(bad.validate(), Err(ModelError::CorruptTree { tree: 0, .. })));
        }
    }

    #[test]
    fn test_quantile_cuts_are_strictly_increasing() {
        let column = ndarray::Array1::from_iter((0..1000).map(|i| (i % 97) as f64));
        let cuts = quantile_cuts(column.view(), 16);
        assert!(cuts.len() <= 15);
        assert!(cuts.windows(2).all(|w| w[0] < w[1]));
    }
}
