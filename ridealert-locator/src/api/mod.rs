//! HTTP and WebSocket handlers for ridealert-locator

pub mod health;
pub mod models;
pub mod predict;
pub mod ws;

pub use health::health_routes;
pub use models::model_routes;
pub use predict::predict_routes;
pub use ws::ws_routes;
