//! HTTP server and routing integration tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`;
//! models come from an in-memory store.

mod helpers;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use helpers::{bundle, manager, reading_json, settle, MemoryStore};
use http_body_util::BodyExt;
use ridealert_common::ScopeKey;
use ridealert_locator::api::ws::{ingest_frame, IngestReply};
use ridealert_locator::broadcast::{BroadcastHub, ConnectionId};
use ridealert_locator::models::{ArtifactKind, FetchError, LoadState};
use ridealert_locator::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    state: AppState,
    store: Arc<MemoryStore>,
    _dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new(bundle(0.001, 0.002));
        let lifecycle = manager(dir.path(), store.clone());
        let state = AppState::new(lifecycle, BroadcastHub::new(16), Duration::from_secs(1));
        Self {
            state,
            store,
            _dir: dir,
        }
    }

    async fn ready() -> Self {
        let app = Self::new();
        app.state.lifecycle.start_loading();
        assert_eq!(settle(&app.state.lifecycle).await, LoadState::Ready);
        app
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_module_and_model_state() {
    let app = TestApp::new();
    let (status, body) = send(app.router(), Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "ridealert-locator");
    assert_eq!(body["model_state"], "not_started");
    assert_eq!(body["models_loaded"], false);
    assert_eq!(body["subscribers"], 0);
}

#[tokio::test]
async fn test_predict_when_not_started_starts_loading() {
    let app = TestApp::new();
    app.store.pause();

    let (status, body) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("UncalAccel", None, None)),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "loading");
    assert_eq!(app.state.lifecycle.state(), LoadState::Downloading);

    app.store.resume();
    assert_eq!(settle(&app.state.lifecycle).await, LoadState::Ready);
}

#[tokio::test]
async fn test_predict_while_loading_is_accepted() {
    let app = TestApp::new();
    app.store.pause();
    app.state.lifecycle.start_loading();

    let (status, body) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("UncalAccel", None, None)),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "loading");
    assert!(body["message"].as_str().unwrap().contains("try again"));
}

#[tokio::test]
async fn test_predict_after_failed_load_is_unavailable() {
    let app = TestApp::new();
    app.store
        .fail(ArtifactKind::Model, FetchError::Permanent("HTTP 404".into()));
    app.state.lifecycle.start_loading();
    assert!(settle(&app.state.lifecycle).await.is_failed());

    let (status, body) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("UncalAccel", None, None)),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Models failed to load"));
}

#[tokio::test]
async fn test_predict_returns_corrected_position_and_broadcasts() {
    let app = TestApp::ready().await;
    let mut observer = app
        .state
        .hub
        .subscribe(ConnectionId::new(), vec![ScopeKey::Vehicle("v1".into())])
        .unwrap();

    let (status, body) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("UncalAccel", Some("v1"), Some("f1"))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let lat = body["latitude"].as_f64().unwrap();
    let lng = body["longitude"].as_f64().unwrap();
    assert!((lat - 37.001).abs() < 1e-6, "latitude {}", lat);
    assert!((lng - -121.998).abs() < 1e-6, "longitude {}", lng);

    let fix = observer.try_recv().expect("observer should receive the fix");
    assert!((fix.latitude - lat).abs() < 1e-9);
    assert!((fix.longitude - lng).abs() < 1e-9);
    assert_eq!(fix.vehicle_id.as_deref(), Some("v1"));
    assert_eq!(fix.fleet_id.as_deref(), Some("f1"));
}

#[tokio::test]
async fn test_predict_accepts_wls_ecef_position() {
    let app = TestApp::ready().await;
    let mut body = reading_json("UncalAccel", None, None);
    let obj = body.as_object_mut().unwrap();
    obj.remove("raw_latitude");
    obj.remove("raw_longitude");
    obj.remove("raw_altitude");
    // equator, prime meridian, on the ellipsoid
    obj.insert("WlsPositionXEcefMeters".into(), json!(6378137.0));
    obj.insert("WlsPositionYEcefMeters".into(), json!(0.0));
    obj.insert("WlsPositionZEcefMeters".into(), json!(0.0));

    let (status, body) = send(app.router(), Method::POST, "/predict", Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert!((body["latitude"].as_f64().unwrap() - 0.001).abs() < 1e-9);
    assert!((body["longitude"].as_f64().unwrap() - 0.002).abs() < 1e-9);
}

#[tokio::test]
async fn test_predict_rejects_both_position_forms() {
    let app = TestApp::ready().await;
    let mut body = reading_json("UncalAccel", None, None);
    body["WlsPositionXEcefMeters"] = json!(1.0);
    body["WlsPositionYEcefMeters"] = json!(2.0);
    body["WlsPositionZEcefMeters"] = json!(3.0);

    let (status, body) = send(app.router(), Method::POST, "/predict", Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_predict_rejects_missing_position() {
    let app = TestApp::ready().await;
    let mut body = reading_json("UncalAccel", None, None);
    let obj = body.as_object_mut().unwrap();
    obj.remove("raw_latitude");
    obj.remove("raw_longitude");
    obj.remove("raw_altitude");

    let (status, _) = send(app.router(), Method::POST, "/predict", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_predict_unknown_category_is_unavailable() {
    let app = TestApp::ready().await;
    let mut observer = app
        .state
        .hub
        .subscribe(ConnectionId::new(), vec![ScopeKey::All])
        .unwrap();

    let (status, body) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("Barometer", Some("v1"), None)),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Barometer"));
    assert!(observer.try_recv().is_none(), "failed predictions are not broadcast");
}

#[tokio::test]
async fn test_predict_status_tracks_lifecycle() {
    let app = TestApp::new();

    let (_, body) = send(app.router(), Method::GET, "/predict/status", None).await;
    assert_eq!(body["status"], "not_started");
    assert_eq!(body["models_loaded"], false);

    app.state.lifecycle.start_loading();
    settle(&app.state.lifecycle).await;

    let (status, body) = send(app.router(), Method::GET, "/predict/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["models_loaded"], true);
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_models_status_lists_artifacts() {
    let app = TestApp::ready().await;
    let (status, body) = send(app.router(), Method::GET, "/models/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["load_state"]["phase"], "ready");
    let artifacts = body["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 4);
    assert_eq!(artifacts[3]["file_name"], "gradient_boosting_model_v6.json");
    assert_eq!(artifacts[3]["present"], true);
    assert_eq!(body["active_model"]["feature_count"], 5);
}

#[tokio::test]
async fn test_reload_acknowledges_and_coalesces() {
    let app = TestApp::ready().await;
    app.store.pause();

    let (status, body) = send(app.router(), Method::POST, "/models/reload", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["already_in_progress"], false);

    let (status, body) = send(app.router(), Method::POST, "/models/reload", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["already_in_progress"], true);

    // old set keeps serving during the reload
    let (status, _) = send(
        app.router(),
        Method::POST,
        "/predict",
        Some(reading_json("UncalAccel", None, None)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    app.store.resume();
    assert_eq!(settle(&app.state.lifecycle).await, LoadState::Ready);
}

#[tokio::test]
async fn test_clear_conflicts_while_downloading() {
    let app = TestApp::new();
    app.store.pause();
    app.state.lifecycle.start_loading();

    let (status, body) = send(app.router(), Method::DELETE, "/models/clear", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    app.store.resume();
    settle(&app.state.lifecycle).await;

    let (status, body) = send(app.router(), Method::DELETE, "/models/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted_files"], 4);
    assert_eq!(app.state.lifecycle.state(), LoadState::NotStarted);
}

#[tokio::test]
async fn test_ingest_frame_corrects_and_publishes() {
    let app = TestApp::ready().await;
    let mut fleet_observer = app
        .state
        .hub
        .subscribe(ConnectionId::new(), vec![ScopeKey::Fleet("f9".into())])
        .unwrap();

    let frame = reading_json("UncalGyro", Some("v9"), Some("f9")).to_string();
    match ingest_frame(&app.state, &frame) {
        IngestReply::Fix { fix, delivered } => {
            assert_eq!(delivered, 1);
            assert!((fix.longitude - -121.996).abs() < 1e-6);
        }
        other => panic!("expected fix reply, got {:?}", other),
    }
    assert!(fleet_observer.try_recv().is_some());

    match ingest_frame(&app.state, "{not json") {
        IngestReply::Error { code, .. } => assert_eq!(code, "BAD_REQUEST"),
        other => panic!("expected error reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ingest_frame_before_ready_is_pending() {
    let app = TestApp::new();
    app.store.pause();

    let frame = reading_json("UncalAccel", Some("v1"), None).to_string();
    assert!(matches!(
        ingest_frame(&app.state, &frame),
        IngestReply::Pending { status: "loading", .. }
    ));
}
