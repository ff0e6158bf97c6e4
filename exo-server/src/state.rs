//! Shared application state.
//!
//! The classifier, its scaler and the feature list travel together as one
//! `Arc<ModelBundle>`. Handlers clone the `Arc` out of the lock and never hold
//! the lock across an await, so a retrain swaps all three at once.

use std::sync::Arc;

use exo_core::imagegen::ImageGenerator;
use exo_core::llm::{ChatBackend, OpenAiChatClient};
use exo_core::{DatasetStore, ExoConfig, HabitabilityAnalyzer, ModelBundle};
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};

pub struct AppState {
    pub config: ExoConfig,
    pub pool: PgPool,
    pub store: DatasetStore,
    pub analyzer: HabitabilityAnalyzer,
    pub images: Option<ImageGenerator>,
    /// Held for the whole duration of a retrain.
    pub retrain_lock: Arc<Mutex<()>>,
    model: RwLock<Option<Arc<ModelBundle>>>,
}

impl AppState {
    pub fn new(
        config: ExoConfig,
        pool: PgPool,
        model: Option<ModelBundle>,
        analyzer: HabitabilityAnalyzer,
        images: Option<ImageGenerator>,
    ) -> Self {
        let store = DatasetStore::new(pool.clone(), config.database.table_name.clone());
        Self {
            config,
            pool,
            store,
            analyzer,
            images,
            retrain_lock: Arc::new(Mutex::new(())),
            model: RwLock::new(model.map(Arc::new)),
        }
    }

    /// Build everything from config. Missing artifacts, a missing API key or a
    /// broken image client degrade the service instead of failing startup.
    pub fn from_config(config: ExoConfig, pool: PgPool) -> Self {
        let model = match ModelBundle::load(&config.model) {
            Ok(bundle) => {
                tracing::info!(
                    features = bundle.feature_names.len(),
                    trees = bundle.model.trees.len(),
                    "Model artifacts loaded"
                );
                Some(bundle)
            }
            Err(e) => {
                tracing::error!(dir = %config.model.dir.display(), error = %e, "Failed to load model artifacts");
                None
            }
        };

        let analyzer = build_analyzer(&config);
        let images = build_image_generator(&config);
        Self::new(config, pool, model, analyzer, images)
    }

    pub async fn model(&self) -> Option<Arc<ModelBundle>> {
        self.model.read().await.clone()
    }

    pub async fn replace_model(&self, bundle: ModelBundle) {
        *self.model.write().await = Some(Arc::new(bundle));
        tracing::info!("Model swapped");
    }
}

fn build_analyzer(config: &ExoConfig) -> HabitabilityAnalyzer {
    if !config.llm.enabled() {
        tracing::warn!("LLM not available: no API key configured, habitability analysis disabled");
        return HabitabilityAnalyzer::disabled();
    }

    match OpenAiChatClient::new(config.llm.clone()) {
        Ok(client) => {
            tracing::info!(model = %config.llm.model, "Chat client initialized for habitability analysis");
            let backend: Arc<dyn ChatBackend> = Arc::new(client);
            HabitabilityAnalyzer::new(Some(backend))
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM not available");
            HabitabilityAnalyzer::disabled()
        }
    }
}

fn build_image_generator(config: &ExoConfig) -> Option<ImageGenerator> {
    if !config.image.enabled {
        return None;
    }
    match ImageGenerator::new(&config.image) {
        Ok(images) => Some(images),
        Err(e) => {
            tracing::warn!(error = %e, "Image generation disabled");
            None
        }
    }
}
