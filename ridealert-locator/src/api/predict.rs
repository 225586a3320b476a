//! Prediction endpoints
//!
//! `POST /predict` corrects one telemetry reading and publishes the result to
//! the broadcast hub. Readiness is decided by whether a model set is
//! published, not by the load state: after a failed reload the previous set
//! keeps serving.

use crate::error::{ApiError, ApiResult};
use crate::inference::InferenceError;
use crate::models::{LoadState, ModelLifecycleManager};
use crate::pipeline::{Correction, PipelineError, TelemetryReading};
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Corrected position
#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub latitude: f64,
    pub longitude: f64,
}

/// 202 body while models load
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub status: &'static str,
    pub message: String,
}

/// `GET /predict/status` body
#[derive(Debug, Serialize)]
pub struct PredictStatusResponse {
    pub status: &'static str,
    pub models_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What one reading turned into
#[derive(Debug)]
pub enum PredictOutcome {
    Corrected(Correction),
    /// No model set yet; try again later
    Pending(PendingResponse),
    /// Bad position input (400)
    Invalid(String),
    /// Model failed to load or rejected the input (503)
    Unavailable(String),
}

/// Shared by `POST /predict` and the IoT ingest channel
pub fn run_prediction(state: &AppState, reading: &TelemetryReading) -> PredictOutcome {
    if state.pipeline.engine().active_set().is_none() {
        return not_ready(&state.lifecycle);
    }

    match state.pipeline.process(reading) {
        Ok(correction) => PredictOutcome::Corrected(correction),
        Err(PipelineError::InvalidPosition(msg)) => PredictOutcome::Invalid(msg),
        // cleared between the check above and inference
        Err(PipelineError::Inference(InferenceError::NotReady)) => not_ready(&state.lifecycle),
        Err(PipelineError::Inference(e)) => {
            warn!(error = %e, "Prediction rejected by model");
            PredictOutcome::Unavailable(e.to_string())
        }
    }
}

fn not_ready(lifecycle: &ModelLifecycleManager) -> PredictOutcome {
    let state = lifecycle.state();
    debug!(state = state.status_label(), "Prediction requested before model is ready");

    match state {
        LoadState::NotStarted => {
            lifecycle.start_loading();
            PredictOutcome::Pending(PendingResponse {
                status: lifecycle.state().status_label(),
                message: "Model loading initiated. Please try again in a few minutes.".to_string(),
            })
        }
        LoadState::Downloading | LoadState::Validating => PredictOutcome::Pending(PendingResponse {
            status: state.status_label(),
            message: "Models are still being downloaded and loaded in the background. \
                      Please try again in a moment."
                .to_string(),
        }),
        LoadState::Failed { reason, .. } => {
            PredictOutcome::Unavailable(format!("Models failed to load: {}", reason))
        }
        LoadState::Ready => {
            PredictOutcome::Unavailable("Models are not ready yet. Please try again.".to_string())
        }
    }
}

/// POST /predict
pub async fn predict(
    State(state): State<AppState>,
    Json(reading): Json<TelemetryReading>,
) -> ApiResult<Response> {
    match run_prediction(&state, &reading) {
        PredictOutcome::Corrected(c) => Ok(Json(PredictResponse {
            latitude: c.fix.latitude,
            longitude: c.fix.longitude,
        })
        .into_response()),
        PredictOutcome::Pending(body) => Ok((StatusCode::ACCEPTED, Json(body)).into_response()),
        PredictOutcome::Invalid(msg) => Err(ApiError::BadRequest(msg)),
        PredictOutcome::Unavailable(msg) => Err(ApiError::Unavailable(msg)),
    }
}

/// GET /predict/status
pub async fn predict_status(State(state): State<AppState>) -> Json<PredictStatusResponse> {
    let load_state = state.lifecycle.state();
    let error = match &load_state {
        LoadState::Failed { reason, .. } => Some(reason.clone()),
        _ => None,
    };

    Json(PredictStatusResponse {
        status: load_state.status_label(),
        models_loaded: state.pipeline.engine().active_set().is_some(),
        error,
    })
}

/// Build prediction routes
pub fn predict_routes() -> Router<AppState> {
    Router::new()
        .route("/predict", post(predict))
        .route("/predict/status", get(predict_status))
}
