//! Persisted model artifacts.
//!
//! Three JSON files live side by side in the model directory: the tree ensemble,
//! the scaler and the ordered feature names. They are loaded together into a
//! [`ModelBundle`] and always replaced together.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{GradientBoostedClassifier, ModelError, StandardScaler};
use crate::config::ModelConfig;
use crate::features::extract_features;

#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub model: GradientBoostedClassifier,
    pub scaler: StandardScaler,
    pub feature_names: Vec<String>,
}

/// Output of a single prediction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub label: u8,
    /// `[P(not exoplanet), P(exoplanet)]`
    pub probabilities: [f64; 2],
}

impl Prediction {
    pub fn is_exoplanet(&self) -> bool {
        self.label == 1
    }

    pub fn confidence(&self) -> f64 {
        self.probabilities[1]
    }
}

impl ModelBundle {
    pub fn new(
        model: GradientBoostedClassifier,
        scaler: StandardScaler,
        feature_names: Vec<String>,
    ) -> Result<Self, ModelError> {
        if feature_names.len() != model.n_features {
            return Err(ModelError::InconsistentArtifacts {
                features: feature_names.len(),
                model: model.n_features,
            });
        }
        model.validate()?;
        if scaler.n_features() != model.n_features {
            return Err(ModelError::WidthMismatch {
                expected: model.n_features,
                actual: scaler.n_features(),
            });
        }
        Ok(Self {
            model,
            scaler,
            feature_names,
        })
    }

    pub fn load(config: &ModelConfig) -> Result<Self, ModelError> {
        let model = read_json(&config.model_path())?;
        let scaler = read_json(&config.scaler_path())?;
        let feature_names = read_json(&config.features_path())?;
        Self::new(model, scaler, feature_names)
    }

    /// Write all three artifacts. Each file goes to a temporary sibling first and
    /// is renamed into place.
    pub fn save(&self, config: &ModelConfig) -> Result<(), ModelError> {
        std::fs::create_dir_all(&config.dir).map_err(|source| ModelError::Write {
            path: config.dir.display().to_string(),
            source,
        })?;
        write_json(&config.model_path(), &self.model)?;
        write_json(&config.scaler_path(), &self.scaler)?;
        write_json(&config.features_path(), &self.feature_names)?;
        Ok(())
    }

    /// Scale and classify an already ordered feature vector.
    pub fn predict_vector(&self, features: &[f64]) -> Result<Prediction, ModelError> {
        let scaled = self.scaler.transform_row(features)?;
        let probabilities = self.model.predict_proba(&scaled)?;
        Ok(Prediction {
            label: u8::from(probabilities[1] > 0.5),
            probabilities,
        })
    }

    /// Validate a request body against the feature list, then classify it.
    pub fn predict(&self, data: &Map<String, Value>) -> Result<Prediction, ModelError> {
        let features = extract_features(&self.feature_names, data)?;
        self.predict_vector(&features)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let bytes = std::fs::read(path).map_err(|source| ModelError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ModelError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ModelError> {
    let bytes = serde_json::to_vec(value).map_err(|source| ModelError::Malformed {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    let write = |p: &Path| std::fs::write(p, &bytes).and_then(|_| std::fs::rename(p, path));
    write(&tmp).map_err(|source| ModelError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::gbdt::{Node, Tree};
    use serde_json::json;

    /// Single stump on feature 1: scaled value >= 0 means exoplanet.
    fn stump_bundle() -> ModelBundle {
        let model = GradientBoostedClassifier {
            n_features: 2,
            base_margin: 0.0,
            trees: vec![Tree {
                nodes: vec![
                    Node::Split {
                        feature: 1,
                        threshold: 0.0,
                        left: 1,
                        right: 2,
                    },
                    Node::Leaf { value: -3.0 },
                    Node::Leaf { value: 3.0 },
                ],
            }],
            best_iteration: 0,
            feature_importances: vec![0.0, 1.0],
        };
        let scaler = StandardScaler {
            mean: vec![0.0, 10.0],
            scale: vec![1.0, 2.0],
        };
        ModelBundle::new(model, scaler, vec!["pl_orbper".into(), "pl_rade".into()]).unwrap()
    }

    #[test]
    fn test_predict_scales_before_classifying() {
        let bundle = stump_bundle();
        let positive = json!({"pl_orbper": 1.0, "pl_rade": 12.0});
        let negative = json!({"pl_orbper": 1.0, "pl_rade": 8.0});

        let p = bundle.predict(positive.as_object().unwrap()).unwrap();
        assert!(p.is_exoplanet());
        assert!((p.probabilities.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let n = bundle.predict(negative.as_object().unwrap()).unwrap();
        assert_eq!(n.label, 0);
        assert!(n.confidence() < 0.5);
    }

    #[test]
    fn test_predict_reports_missing_feature() {
        let bundle = stump_bundle();
        let body = json!({"pl_orbper": 1.0});
        let err = bundle.predict(body.as_object().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "Missing features: pl_rade");
    }

    #[test]
    fn test_inconsistent_artifacts_rejected() {
        let bundle = stump_bundle();
        let err = ModelBundle::new(bundle.model, bundle.scaler, vec!["only_one".into()]);
        assert!(matches!(err, Err(ModelError::InconsistentArtifacts { .. })));
    }

    #[test]
    fn test_load_rejects_corrupt_tree() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        stump_bundle().save(&config).unwrap();

        let mut model: serde_json::Value =
            serde_json::from_slice(&std::fs::read(config.model_path()).unwrap()).unwrap();
        model["trees"][0]["nodes"][0]["feature"] = json!(9);
        std::fs::write(config.model_path(), serde_json::to_vec(&model).unwrap()).unwrap();

        let err = ModelBundle::load(&config).unwrap_err();
        assert!(matches!(err, ModelError::CorruptTree { tree: 0, .. }));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            dir: dir.path().join("models"),
            ..Default::default()
        };
        let bundle = stump_bundle();
        bundle.save(&config).unwrap();
        assert!(!config.dir.join("gbdt_model.json.tmp").exists());

        let loaded = ModelBundle::load(&config).unwrap();
        assert_eq!(loaded.feature_names, bundle.feature_names);
        assert_eq!(loaded.scaler, bundle.scaler);
        assert_eq!(loaded.model, bundle.model);
    }

    #[test]
    fn test_load_missing_dir_is_read_error() {
        let config = ModelConfig {
            dir: "/nonexistent/exo/models".into(),
            ..Default::default()
        };
        assert!(matches!(ModelBundle::load(&config), Err(ModelError::Read { .. })));
    }
}
