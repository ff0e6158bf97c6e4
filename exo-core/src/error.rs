use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExoError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset error: {0}")]
    Dataset(#[from] crate::dataset::DatasetError),

    #[error("Model error: {0}")]
    Model(#[from] crate::model::ModelError),

    #[error("Training error: {0}")]
    Training(#[from] crate::training::TrainingError),

    #[error("Table {0} does not exist")]
    MissingTable(String),

    #[error("Cannot export column {column} of type {type_name}")]
    UnsupportedColumn { column: String, type_name: String },

    #[error("Other error: {0}")]
    Other(String),
}
