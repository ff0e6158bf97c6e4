//! Classifier, scaler and the bundle that ties them to a feature order.

pub mod artifacts;
pub mod gbdt;
pub mod scaler;

use thiserror::Error;

pub use artifacts::{ModelBundle, Prediction};
pub use gbdt::{BoosterParams, GradientBoostedClassifier};
pub use scaler::StandardScaler;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Expected {expected} features, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("Training set is empty")]
    EmptyTrainingSet,

    #[error("Got {rows} rows but {labels} labels")]
    LabelMismatch { rows: usize, labels: usize },

    #[error("Feature list has {features} names but the model expects {model}")]
    InconsistentArtifacts { features: usize, model: usize },

    #[error("Tree {tree} is corrupt: {reason}")]
    CorruptTree { tree: usize, reason: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed artifact {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Feature(#[from] crate::features::FeatureError),
}
