//! Exoplanet HTTP JSON API
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic is testable without
//! going through the router.
//!
//! Endpoints:
//! - GET  /api/features               feature names with display metadata
//! - POST /api/predict                classify one feature vector
//! - GET  /api/example                random row of the example dataset
//! - GET  /api/health                 model and integration status
//! - POST /api/habitability           habitability narrative only
//! - POST /api/upload-csv             import a CSV into the dataset table
//! - POST /api/export-dataset         dump the dataset table to CSV
//! - GET  /api/download-dataset       download the last export
//! - GET|POST /api/database-status    connectivity and row count
//! - POST /api/retrain                retrain from the dataset table and swap
//! - GET  /api/visualizations/:file   serve a generated image

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use exo_core::dataset::{read_rows, Dataset};
use exo_core::features::coerce_f64;
use exo_core::{feature_metadata, train_model, DatasetStore, ExoError, HabitabilityAnalyzer, ModelBundle, ModelError};
use rand::seq::IndexedRandom;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::state::AppState;

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.http.max_upload_bytes;
    Router::new()
        .route("/api/features", get(features_handler))
        .route("/api/predict", post(predict_handler))
        .route("/api/example", get(example_handler))
        .route("/api/health", get(health_handler))
        .route("/api/habitability", post(habitability_handler))
        .route("/api/upload-csv", post(upload_handler))
        .route("/api/export-dataset", post(export_handler))
        .route("/api/download-dataset", get(download_handler))
        .route(
            "/api/database-status",
            get(database_status_handler).post(database_status_handler),
        )
        .route("/api/retrain", post(retrain_handler))
        .route("/api/visualizations/:file", get(visualization_handler))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Exoplanet API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs and helpers
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RetrainRequest {
    /// Train from the last export instead of exporting the table first.
    pub use_existing_export: bool,
}

fn error_body(msg: impl std::fmt::Display) -> Value {
    json!({ "error": msg.to_string() })
}

/// Parse a request body into a non-empty JSON object. Anything else counts as
/// "no data".
pub fn parse_object(body: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}

pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("csv"))
}

/// A bare file name: no separators, no parent references.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub fn features_inner(model: Option<&ModelBundle>) -> (StatusCode, Value) {
    let Some(bundle) = model else {
        return (StatusCode::INTERNAL_SERVER_ERROR, error_body("Features not loaded"));
    };
    let features: Vec<_> = bundle
        .feature_names
        .iter()
        .map(|name| feature_metadata(name))
        .collect();
    (StatusCode::OK, json!({ "features": features }))
}

pub async fn predict_inner(state: &AppState, body: Option<Map<String, Value>>) -> (StatusCode, Value) {
    let Some(bundle) = state.model().await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Models not loaded properly"),
        );
    };
    let Some(data) = body else {
        return (StatusCode::BAD_REQUEST, error_body("No data provided"));
    };

    let prediction = match bundle.predict(&data) {
        Ok(p) => p,
        Err(ModelError::Feature(e)) => return (StatusCode::BAD_REQUEST, error_body(e)),
        Err(e) => {
            tracing::error!(error = %e, "Prediction failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e));
        }
    };

    let is_exoplanet = prediction.is_exoplanet();
    let (habitability, visualization) = if is_exoplanet {
        tracing::info!(confidence = prediction.confidence(), "Exoplanet detected, enriching result");
        let visualize = async {
            match &state.images {
                Some(images) => Some(images.visualize(&data).await),
                None => None,
            }
        };
        let (report, vis) = tokio::join!(state.analyzer.analyze(&data), visualize);
        (json!(report), json!(vis))
    } else {
        (Value::Null, Value::Null)
    };

    let [not_exoplanet, exoplanet] = prediction.probabilities;
    let label = if is_exoplanet {
        "Exoplanet Detected! 🌟"
    } else {
        "Not an Exoplanet ❌"
    };
    (
        StatusCode::OK,
        json!({
            "prediction": prediction.label,
            "is_exoplanet": is_exoplanet,
            "confidence": prediction.confidence(),
            "probabilities": {
                "not_exoplanet": not_exoplanet,
                "exoplanet": exoplanet,
            },
            "label": label,
            "habitability": habitability,
            "visualization": visualization,
        }),
    )
}

/// Pick a random row of the example CSV, keep the model's features and report
/// the row's label alongside.
pub async fn example_inner(model: Option<&ModelBundle>, csv_path: &Path, target: &str) -> (StatusCode, Value) {
    let Some(bundle) = model else {
        return (StatusCode::INTERNAL_SERVER_ERROR, error_body("Features not loaded"));
    };

    let bytes = match tokio::fs::read(csv_path).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(path = %csv_path.display(), error = %e, "Failed to read example dataset");
            return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e));
        }
    };
    let rows = match read_rows(bytes.as_slice()) {
        Ok(rows) => rows,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, error_body(e)),
    };
    let Some(row) = rows.choose(&mut rand::rng()) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("Example dataset is empty"),
        );
    };

    let features: Map<String, Value> = bundle
        .feature_names
        .iter()
        .filter_map(|name| {
            let value = row.get(name).and_then(coerce_f64)?;
            Some((name.clone(), json!(value)))
        })
        .collect();
    let actual_label = row
        .get(target)
        .and_then(coerce_f64)
        .map(|v| v as i64);

    (
        StatusCode::OK,
        json!({ "features": features, "actual_label": actual_label }),
    )
}

pub async fn health_inner(state: &AppState) -> (StatusCode, Value) {
    let model = state.model().await;
    let loaded = model.is_some();
    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "model_loaded": loaded,
            "scaler_loaded": loaded,
            "features_loaded": loaded,
            "num_features": model.map(|m| m.feature_names.len()).unwrap_or(0),
            "llm_enabled": state.analyzer.enabled(),
            "image_enabled": state.images.is_some(),
        }),
    )
}

pub async fn habitability_inner(
    analyzer: &HabitabilityAnalyzer,
    body: Option<Map<String, Value>>,
) -> (StatusCode, Value) {
    let Some(data) = body else {
        return (StatusCode::BAD_REQUEST, error_body("No data provided"));
    };
    if !analyzer.enabled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("LLM not enabled. Please set OPENROUTER_API_KEY in .env file"),
        );
    }
    (StatusCode::OK, json!(analyzer.analyze(&data).await))
}

/// Import an uploaded CSV. `file` is `(file_name, contents)` of the multipart
/// `file` field, if one was sent.
pub async fn upload_inner(store: &DatasetStore, file: Option<(String, Bytes)>) -> (StatusCode, Value) {
    let Some((filename, contents)) = file else {
        return (StatusCode::BAD_REQUEST, error_body("No file provided"));
    };
    if filename.is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("No file selected"));
    }
    if !allowed_file(&filename) {
        return (StatusCode::BAD_REQUEST, error_body("Only CSV files are allowed"));
    }

    let rows_inserted = match store.import_csv(&contents).await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(file = %filename, error = %e, "CSV import failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": format!("Database error: {}", e) }),
            );
        }
    };

    let total_rows = store.row_count().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Row count after import failed");
        0
    });

    (
        StatusCode::OK,
        json!({
            "success": true,
            "message": format!("Successfully added {} rows to database", rows_inserted),
            "rows_inserted": rows_inserted,
            "total_rows": total_rows,
        }),
    )
}

pub async fn export_inner(store: &DatasetStore, output_path: &Path) -> (StatusCode, Value) {
    match store.export_csv(output_path).await {
        Ok(rows_exported) => (
            StatusCode::OK,
            json!({
                "success": true,
                "message": format!("Successfully exported {} rows", rows_exported),
                "rows_exported": rows_exported,
                "output_path": output_path.display().to_string(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Dataset export failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": format!("Export error: {}", e) }),
            )
        }
    }
}

pub async fn database_status_inner(store: &DatasetStore) -> (StatusCode, Value) {
    match store.row_count().await {
        Ok(count) => (
            StatusCode::OK,
            json!({ "connected": true, "row_count": count }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "connected": false, "error": e.to_string() }),
        ),
    }
}

/// Export (unless asked not to), train on a blocking thread, persist the new
/// artifacts and swap them in. Only one retrain runs at a time.
///
/// The work runs in its own task holding the retrain lock, so a dropped request
/// still finishes the swap and keeps the lock until the artifacts are in place.
pub async fn retrain_inner(state: Arc<AppState>, req: RetrainRequest) -> (StatusCode, Value) {
    let Ok(guard) = state.retrain_lock.clone().try_lock_owned() else {
        return (
            StatusCode::CONFLICT,
            json!({ "success": false, "error": "Retraining already in progress" }),
        );
    };

    match tokio::spawn(run_retrain(state, req, guard)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Retraining task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": format!("Training task failed: {}", e) }),
            )
        }
    }
}

async fn run_retrain(
    state: Arc<AppState>,
    req: RetrainRequest,
    _guard: OwnedMutexGuard<()>,
) -> (StatusCode, Value) {
    let data_path = state.config.data.export_csv.clone();
    if !req.use_existing_export {
        if let Err(e) = state.store.export_csv(&data_path).await {
            tracing::error!(error = %e, "Export before retraining failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": format!("Export error: {}", e) }),
            );
        }
    }

    let target = state.config.data.target_column.clone();
    let params = state.config.training.clone();
    let model_config = state.config.model.clone();

    let outcome = tokio::task::spawn_blocking(move || -> Result<_, ExoError> {
        let dataset = Dataset::from_path(&data_path, &target)?;
        let (bundle, report) = train_model(&dataset, &params)?;
        bundle.save(&model_config)?;
        Ok((bundle, report))
    })
    .await;

    match outcome {
        Ok(Ok((bundle, report))) => {
            state.replace_model(bundle).await;
            (
                StatusCode::OK,
                json!({
                    "success": true,
                    "message": "Model retrained successfully",
                    "results": report,
                }),
            )
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Retraining failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": e.to_string() }),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "Training task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": format!("Training task failed: {}", e) }),
            )
        }
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn features_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let model = state.model().await;
    let (status, body) = features_inner(model.as_deref());
    (status, Json(body))
}

pub async fn predict_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let (status, body) = predict_inner(&state, parse_object(&body)).await;
    (status, Json(body))
}

pub async fn example_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let model = state.model().await;
    let (status, body) = example_inner(
        model.as_deref(),
        &state.config.data.example_csv,
        &state.config.data.target_column,
    )
    .await;
    (status, Json(body))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn habitability_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let (status, body) = habitability_inner(&state.analyzer, parse_object(&body)).await;
    (status, Json(body))
}

pub async fn upload_handler(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> impl IntoResponse {
    let mut file = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(contents) => file = Some((filename, contents)),
                    Err(e) => return (StatusCode::BAD_REQUEST, Json(error_body(e))),
                }
            }
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, Json(error_body(e))),
        }
    }

    let (status, body) = upload_inner(&state.store, file).await;
    (status, Json(body))
}

pub async fn export_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = export_inner(&state.store, &state.config.data.export_csv).await;
    (status, Json(body))
}

pub async fn download_handler(State(state): State<Arc<AppState>>) -> Response {
    let path = &state.config.data.export_csv;
    let contents = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (
                StatusCode::NOT_FOUND,
                Json(error_body("Dataset not found. Please export first.")),
            )
                .into_response();
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(error_body(e))).into_response(),
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "whole_dataset.csv".to_string());
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        contents,
    )
        .into_response()
}

pub async fn database_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = database_status_inner(&state.store).await;
    (status, Json(body))
}

pub async fn retrain_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let req = if body.is_empty() {
        RetrainRequest::default()
    } else {
        match serde_json::from_slice::<RetrainRequest>(&body) {
            Ok(r) => r,
            Err(e) => return (StatusCode::BAD_REQUEST, Json(error_body(e))),
        }
    };
    let (status, body) = retrain_inner(state, req).await;
    (status, Json(body))
}

pub async fn visualization_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(file): UrlPath<String>,
) -> Response {
    if !is_plain_file_name(&file) {
        return (StatusCode::NOT_FOUND, Json(error_body("Visualization not found"))).into_response();
    }
    let path = state.config.image.output_dir.join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Json(error_body("Visualization not found"))).into_response(),
    }
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
