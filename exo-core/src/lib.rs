pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod features;
pub mod habitability;
pub mod imagegen;
pub mod llm;
pub mod model;
pub mod training;

pub use config::ExoConfig;
pub use dataset::Dataset;
pub use db::DatasetStore;
pub use error::ExoError;
pub use features::{extract_features, feature_metadata, FeatureError, FeatureMeta};
pub use habitability::{HabitabilityAnalyzer, HabitabilityReport};
pub use imagegen::{ImageGenerator, Visualization};
pub use llm::{ChatBackend, LlmError, OpenAiChatClient};
pub use model::{ModelBundle, ModelError, Prediction};
pub use training::{train_model, TrainingError, TrainingParams, TrainingReport};
