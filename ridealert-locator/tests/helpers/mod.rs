//! Shared fixtures for ridealert-locator integration tests
//!
//! - [`MemoryStore`]: in-memory artifact source that can be paused or made
//!   to fail per artifact
//! - [`bundle`]: a tiny but valid model bundle with known offsets

#![allow(dead_code)]

use async_trait::async_trait;
use ridealert_locator::inference::{RoutingIds, TelemetrySample};
use ridealert_locator::models::{
    ArtifactKind, ArtifactProgress, ArtifactStore, FetchError, FetchPolicy, LoadState,
    ModelLifecycleManager,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const IMU_CLASSES: [&str; 3] = ["UncalAccel", "UncalGyro", "UncalMag"];

/// Model bundle whose prediction is `(lat_offset, lng_offset)` for
/// `UncalAccel` and `(lat_offset, 2 * lng_offset)` for the other classes
pub fn bundle(lat_offset: f64, lng_offset: f64) -> HashMap<ArtifactKind, Vec<u8>> {
    let features = json!([
        "Cn0DbHz",
        "SvElevationDegrees",
        "IMU_MessageType",
        "SignalQuality",
        "WLS_Distance"
    ]);
    let encoders = json!({ "IMU_MessageType": IMU_CLASSES });
    let scaler = json!({
        "center": [30.0, 45.0, 0.0, 15.0, 6371000.0],
        "scale": [10.0, 20.0, 1.0, 10.0, 1000.0]
    });
    let model = json!({
        "n_features": 5,
        "outputs": [
            {"init": lat_offset, "learning_rate": 1.0, "trees": []},
            {"init": 0.0, "learning_rate": 1.0, "trees": [[
                {"kind": "split", "feature": 2, "threshold": 0.5, "left": 1, "right": 2},
                {"kind": "leaf", "value": lng_offset},
                {"kind": "leaf", "value": 2.0 * lng_offset}
            ]]}
        ]
    });

    let mut files = HashMap::new();
    files.insert(ArtifactKind::Features, to_bytes(&features));
    files.insert(ArtifactKind::LabelEncoders, to_bytes(&encoders));
    files.insert(ArtifactKind::Scaler, to_bytes(&scaler));
    files.insert(ArtifactKind::Model, to_bytes(&model));
    files
}

fn to_bytes(v: &Value) -> Vec<u8> {
    serde_json::to_vec(v).unwrap()
}

/// Sample carrying every feature [`bundle`] needs
pub fn sample(imu: &str) -> TelemetrySample {
    TelemetrySample::new(RoutingIds::default())
        .with_number("Cn0DbHz", 35.0)
        .with_number("SvElevationDegrees", 30.0)
        .with_category("IMU_MessageType", imu)
        .with_number("SignalQuality", 17.5)
        .with_number("WLS_Distance", 6_371_500.0)
}

/// `/predict` body with raw coordinates
pub fn reading_json(imu: &str, vehicle_id: Option<&str>, fleet_id: Option<&str>) -> Value {
    let mut body = json!({
        "Cn0DbHz": 35.0,
        "Svid": 7,
        "SvElevationDegrees": 30.0,
        "SvAzimuthDegrees": 200.0,
        "IMU_MessageType": imu,
        "MeasurementX": 0.01,
        "MeasurementY": -0.02,
        "MeasurementZ": 9.81,
        "BiasX": 0.0,
        "BiasY": 0.0,
        "BiasZ": 0.0,
        "raw_latitude": 37.0,
        "raw_longitude": -122.0,
        "raw_altitude": 10.0
    });
    if let Some(v) = vehicle_id {
        body["vehicle_id"] = json!(v);
    }
    if let Some(f) = fleet_id {
        body["fleet_id"] = json!(f);
    }
    body
}

/// In-memory artifact source
pub struct MemoryStore {
    files: Mutex<HashMap<ArtifactKind, Vec<u8>>>,
    failures: Mutex<HashMap<ArtifactKind, FetchError>>,
    open: watch::Sender<bool>,
    calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(files: HashMap<ArtifactKind, Vec<u8>>) -> Arc<Self> {
        let (open, _) = watch::channel(true);
        Arc::new(Self {
            files: Mutex::new(files),
            failures: Mutex::new(HashMap::new()),
            open,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_files(&self, files: HashMap<ArtifactKind, Vec<u8>>) {
        *self.files.lock().unwrap() = files;
    }

    pub fn set_file(&self, artifact: ArtifactKind, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(artifact, bytes);
    }

    /// Every fetch of `artifact` fails with `err` until healed
    pub fn fail(&self, artifact: ArtifactKind, err: FetchError) {
        self.failures.lock().unwrap().insert(artifact, err);
    }

    pub fn heal(&self, artifact: ArtifactKind) {
        self.failures.lock().unwrap().remove(&artifact);
    }

    /// Block fetches until [`MemoryStore::resume`]
    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn fetch(
        &self,
        artifact: ArtifactKind,
        progress: &ArtifactProgress,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut open = self.open.subscribe();
        let _ = open.wait_for(|o| *o).await;

        let failure = self.failures.lock().unwrap().get(&artifact).cloned();
        if let Some(err) = failure {
            return Err(err);
        }

        let bytes = self.files.lock().unwrap().get(&artifact).cloned();
        let bytes = bytes.ok_or_else(|| FetchError::Permanent("HTTP 404".to_string()))?;
        progress.set_expected(bytes.len() as u64);
        progress.add_downloaded(bytes.len() as u64);
        Ok(bytes)
    }
}

pub fn fast_policy() -> FetchPolicy {
    FetchPolicy {
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        backoff_multiplier: 4,
    }
}

pub fn manager(dir: &Path, store: Arc<MemoryStore>) -> ModelLifecycleManager {
    ModelLifecycleManager::new(store, dir.to_path_buf(), fast_policy())
}

/// Wait until the load finishes one way or the other
pub async fn settle(manager: &ModelLifecycleManager) -> LoadState {
    tokio::time::timeout(
        Duration::from_secs(10),
        manager.wait_for(|s| s.is_ready() || s.is_failed()),
    )
    .await
    .expect("model load did not settle")
}
