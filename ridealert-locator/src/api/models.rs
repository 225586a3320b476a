//! Model management endpoints

use crate::error::ApiResult;
use crate::models::{LifecycleSnapshot, ReloadOutcome};
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub status: &'static str,
    pub already_in_progress: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub status: &'static str,
    pub deleted_files: usize,
}

/// GET /models/status
pub async fn models_status(State(state): State<AppState>) -> Json<LifecycleSnapshot> {
    Json(state.lifecycle.snapshot().await)
}

/// POST /models/reload
///
/// Acknowledges immediately; poll `/models/status` for completion.
pub async fn reload_models(State(state): State<AppState>) -> (StatusCode, Json<ReloadResponse>) {
    let outcome = state.lifecycle.force_reload();
    info!(outcome = ?outcome, "Model reload requested");

    let body = match outcome {
        ReloadOutcome::Started => ReloadResponse {
            status: "accepted",
            already_in_progress: false,
            message: "Model reload started",
        },
        ReloadOutcome::AlreadyInProgress => ReloadResponse {
            status: "accepted",
            already_in_progress: true,
            message: "A model download is already in progress",
        },
    };

    (StatusCode::ACCEPTED, Json(body))
}

/// DELETE /models/clear
pub async fn clear_models(State(state): State<AppState>) -> ApiResult<Json<ClearResponse>> {
    let deleted_files = state.lifecycle.clear().await?;

    Ok(Json(ClearResponse {
        status: "cleared",
        deleted_files,
    }))
}

/// Build model management routes
pub fn model_routes() -> Router<AppState> {
    Router::new()
        .route("/models/status", get(models_status))
        .route("/models/reload", post(reload_models))
        .route("/models/clear", delete(clear_models))
}
