use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::model::{round_to, ModelBundle};
use crate::types::{ModelInfoResponse, PredictionRequest, PredictionResponse};

// ---------- Server state ----------

/// Shared across handlers. The bundle is loaded once and never written,
/// so a plain Arc is all the synchronization needed.
#[derive(Clone)]
pub struct AppState {
    pub bundle: Arc<ModelBundle>,
}

impl AppState {
    pub fn new(bundle: ModelBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
        }
    }
}

// ---------- Handlers ----------

pub async fn predict(
    State(state): State<AppState>,
    Json(payload): Json<PredictionRequest>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let raw = payload.validate()?;

    let row = raw
        .ordered_row(&state.bundle.features)
        .ok_or_else(|| ApiError::Inference("artifact feature list out of sync".into()))?;

    if tracing::enabled!(tracing::Level::DEBUG) {
        let nz = row.iter().filter(|x| **x != 0.0).count();
        let sample: Vec<String> = state
            .bundle
            .features
            .iter()
            .zip(&row)
            .take(4)
            .map(|(name, x)| format!("{name}={x:.3}"))
            .collect();
        tracing::debug!(
            "predict in_dim={} nonzero={} sample=[{}]",
            row.len(),
            nz,
            sample.join(", ")
        );
    }

    let predicted = state
        .bundle
        .predict_lap_time(&row)
        .map_err(|e| ApiError::Inference(e.to_string()))?;
    let confidence = state.bundle.confidence(predicted);

    Ok(Json(PredictionResponse {
        predicted_lap_time: round_to(predicted, 3),
        confidence: round_to(confidence, 1),
    }))
}

/// Liveness probe. No model dependency, so it answers 200 no matter what.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Feature names and, when the artifact carries them, the per-feature
/// importances captured at training time. Nothing is recomputed here.
pub async fn model_info(State(state): State<AppState>) -> Json<ModelInfoResponse> {
    Json(ModelInfoResponse {
        features: state.bundle.features.clone(),
        importances: state.bundle.feature_importances.clone(),
    })
}

// ---------- Router ----------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/model-info", get(model_info))
        .with_state(state)
}
