//! ridealert-locator library interface
//!
//! GPS correction service: loads the correction model in the background,
//! corrects telemetry from `/predict` and the IoT WebSocket, and fans the
//! corrected fixes out to observer channels.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod geodesy;
pub mod inference;
pub mod models;
pub mod pipeline;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use broadcast::BroadcastHub;
use chrono::{DateTime, Utc};
use geodesy::Wgs84;
use inference::InferenceEngine;
use models::ModelLifecycleManager;
use pipeline::PredictionPipeline;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ModelLifecycleManager,
    pub hub: BroadcastHub,
    pub pipeline: PredictionPipeline,
    /// Per-frame send timeout for WebSocket connections
    pub send_timeout: Duration,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(lifecycle: ModelLifecycleManager, hub: BroadcastHub, send_timeout: Duration) -> Self {
        let engine = InferenceEngine::new(lifecycle.slot());
        let pipeline = PredictionPipeline::new(engine, hub.clone(), Arc::new(Wgs84));

        Self {
            lifecycle,
            hub,
            pipeline,
            send_timeout,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::predict_routes())
        .merge(api::model_routes())
        .merge(api::ws_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
