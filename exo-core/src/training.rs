//! Retraining pipeline.
//!
//! Fit the scaler on the whole dataset, split 60/20/20 (stratified, seeded),
//! boost with early stopping on the validation split and score AUC on the
//! held-out test split.

use ndarray::{Array2, Axis};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::Dataset;
use crate::model::gbdt::EvalSet;
use crate::model::{BoosterParams, GradientBoostedClassifier, ModelBundle, ModelError, StandardScaler};

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("AUC is undefined when only one class is present in the test split")]
    SingleClass,

    #[error("Dataset too small to split: {0} rows")]
    TooSmall(usize),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingParams {
    /// Fraction of rows held out from training (validation + test).
    pub holdout_fraction: f64,
    /// Share of the holdout that becomes the test split.
    pub test_share: f64,
    pub seed: u64,
    pub booster: BoosterParams,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.4,
            test_share: 0.5,
            seed: 42,
            booster: BoosterParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub auc_score: f64,
    pub dataset_size: usize,
    pub training_size: usize,
    pub validation_size: usize,
    pub test_size: usize,
    pub exoplanet_ratio: f64,
    pub best_iteration: usize,
    pub n_trees: usize,
    pub top_features: Vec<FeatureImportance>,
    pub training_date: String,
}

/// Split indices `0..labels.len()` into `(kept, held_out)` with each class
/// contributing `round(count * fraction)` rows to the held-out side.
pub fn stratified_split(labels: &[f64], indices: &[usize], fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut kept = Vec::new();
    let mut held = Vec::new();

    for class in [0.0, 1.0] {
        let mut members: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| labels[i] == class)
            .collect();
        members.shuffle(&mut rng);
        let n_held = (members.len() as f64 * fraction).round() as usize;
        held.extend_from_slice(&members[..n_held]);
        kept.extend_from_slice(&members[n_held..]);
    }

    kept.sort_unstable();
    held.sort_unstable();
    (kept, held)
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
pub fn roc_auc(labels: &[f64], scores: &[f64]) -> Result<f64, TrainingError> {
    let n_pos = labels.iter().filter(|&&y| y == 1.0).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(TrainingError::SingleClass);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; tied block i..=j shares the average rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            if labels[k] == 1.0 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

fn select(x: &Array2<f64>, y: &[f64], rows: &[usize]) -> (Array2<f64>, Vec<f64>) {
    (x.select(Axis(0), rows), rows.iter().map(|&i| y[i]).collect())
}

/// Train a fresh bundle from `dataset`. CPU-bound; callers on an async runtime
/// should run this on a blocking thread.
pub fn train_model(
    dataset: &Dataset,
    params: &TrainingParams,
) -> Result<(ModelBundle, TrainingReport), TrainingError> {
    if dataset.len() < 5 {
        return Err(TrainingError::TooSmall(dataset.len()));
    }

    tracing::info!(
        rows = dataset.len(),
        features = dataset.feature_names.len(),
        "Starting model training"
    );

    let scaler = StandardScaler::fit(&dataset.features);
    let x = scaler.transform(&dataset.features)?;
    let y = &dataset.labels;

    let all: Vec<usize> = (0..dataset.len()).collect();
    let (train_idx, temp_idx) = stratified_split(y, &all, params.holdout_fraction, params.seed);
    let (val_idx, test_idx) = stratified_split(y, &temp_idx, params.test_share, params.seed);

    let (x_train, y_train) = select(&x, y, &train_idx);
    let (x_val, y_val) = select(&x, y, &val_idx);
    let (x_test, y_test) = select(&x, y, &test_idx);

    let eval = (!val_idx.is_empty()).then_some(EvalSet { x: &x_val, y: &y_val });
    let model = GradientBoostedClassifier::fit(&x_train, &y_train, eval, &params.booster)?;

    let test_scores = x_test
        .axis_iter(Axis(0))
        .map(|row| model.predict_proba(&row.to_vec()).map(|p| p[1]))
        .collect::<Result<Vec<f64>, ModelError>>()?;
    let auc_score = roc_auc(&y_test, &test_scores)?;

    let mut ranked: Vec<FeatureImportance> = dataset
        .feature_names
        .iter()
        .zip(&model.feature_importances)
        .map(|(feature, &importance)| FeatureImportance {
            feature: feature.clone(),
            importance,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked.truncate(10);

    let report = TrainingReport {
        auc_score,
        dataset_size: dataset.len(),
        training_size: train_idx.len(),
        validation_size: val_idx.len(),
        test_size: test_idx.len(),
        exoplanet_ratio: dataset.positive_ratio(),
        best_iteration: model.best_iteration,
        n_trees: model.trees.len(),
        top_features: ranked,
        training_date: chrono::Utc::now().to_rfc3339(),
    };

    tracing::info!(
        auc = report.auc_score,
        trees = report.n_trees,
        train = report.training_size,
        validation = report.validation_size,
        test = report.test_size,
        "Model training complete"
    );

    let bundle = ModelBundle::new(model, scaler, dataset.feature_names.clone())?;
    Ok((bundle, report))
}
