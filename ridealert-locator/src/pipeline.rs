//! Telemetry → corrected fix → observers
//!
//! [`PredictionPipeline`] is shared by `POST /predict` and the IoT WebSocket
//! ingest channel: resolve the baseline position, derive the engineered
//! features, run inference, apply the offset and publish the result.

use crate::broadcast::BroadcastHub;
use crate::geodesy::{self, CoordinateTransform, Ecef, Geodetic};
use crate::inference::{InferenceEngine, InferenceError, Offset, RoutingIds, TelemetrySample};
use chrono::Utc;
use ridealert_common::CorrectedFix;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Telemetry as sent by devices
///
/// Field names follow the device firmware and the model's feature names.
/// The baseline position is given either as a WLS ECEF solution or as raw
/// latitude/longitude/altitude, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReading {
    #[serde(rename = "Cn0DbHz")]
    pub cn0_db_hz: f64,
    #[serde(rename = "Svid")]
    pub svid: i64,
    #[serde(rename = "SvElevationDegrees")]
    pub sv_elevation_degrees: f64,
    #[serde(rename = "SvAzimuthDegrees")]
    pub sv_azimuth_degrees: f64,
    #[serde(rename = "IMU_MessageType")]
    pub imu_message_type: String,
    #[serde(rename = "MeasurementX")]
    pub measurement_x: f64,
    #[serde(rename = "MeasurementY")]
    pub measurement_y: f64,
    #[serde(rename = "MeasurementZ")]
    pub measurement_z: f64,
    #[serde(rename = "BiasX")]
    pub bias_x: f64,
    #[serde(rename = "BiasY")]
    pub bias_y: f64,
    #[serde(rename = "BiasZ")]
    pub bias_z: f64,

    #[serde(rename = "WlsPositionXEcefMeters", default, skip_serializing_if = "Option::is_none")]
    pub wls_x_ecef_meters: Option<f64>,
    #[serde(rename = "WlsPositionYEcefMeters", default, skip_serializing_if = "Option::is_none")]
    pub wls_y_ecef_meters: Option<f64>,
    #[serde(rename = "WlsPositionZEcefMeters", default, skip_serializing_if = "Option::is_none")]
    pub wls_z_ecef_meters: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_longitude: Option<f64>,
    /// Meters above the WGS-84 ellipsoid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_altitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,
}

/// Baseline position in whichever form the device sent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionInput {
    Ecef(Ecef),
    Geodetic(Geodetic),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Position fields missing, incomplete or given in both forms
    #[error("{0}")]
    InvalidPosition(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl TelemetryReading {
    /// Pick the baseline position form
    ///
    /// A form counts as given when any of its fields is present; it must
    /// then be complete and finite.
    pub fn position(&self) -> Result<PositionInput, PipelineError> {
        let ecef = [
            self.wls_x_ecef_meters,
            self.wls_y_ecef_meters,
            self.wls_z_ecef_meters,
        ];
        let raw = [self.raw_latitude, self.raw_longitude, self.raw_altitude];
        let ecef_given = ecef.iter().any(Option::is_some);
        let raw_given = raw.iter().any(Option::is_some);

        match (ecef_given, raw_given) {
            (true, true) => Err(PipelineError::InvalidPosition(
                "Provide either WLS ECEF coordinates or raw coordinates, not both".to_string(),
            )),
            (false, false) => Err(PipelineError::InvalidPosition(
                "Either WLS ECEF coordinates (WlsPositionXEcefMeters, WlsPositionYEcefMeters, \
                 WlsPositionZEcefMeters) or raw coordinates (raw_latitude, raw_longitude, \
                 raw_altitude) must be provided"
                    .to_string(),
            )),
            (true, false) => {
                let [x, y, z] = complete(ecef, "WLS ECEF coordinates")?;
                Ok(PositionInput::Ecef(Ecef { x, y, z }))
            }
            (false, true) => {
                let [latitude, longitude, altitude] = complete(raw, "raw coordinates")?;
                if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    return Err(PipelineError::InvalidPosition(format!(
                        "raw coordinates out of range: ({}, {})",
                        latitude, longitude
                    )));
                }
                Ok(PositionInput::Geodetic(Geodetic {
                    latitude,
                    longitude,
                    altitude,
                }))
            }
        }
    }

    pub fn routing(&self) -> RoutingIds {
        RoutingIds {
            device_id: self.device_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            fleet_id: self.fleet_id.clone(),
        }
    }

    /// Every raw field plus the two derived ones, keyed by feature name
    pub fn to_sample(&self, wls: Ecef) -> TelemetrySample {
        TelemetrySample::new(self.routing())
            .with_number("Cn0DbHz", self.cn0_db_hz)
            .with_number("Svid", self.svid as f64)
            .with_number("SvElevationDegrees", self.sv_elevation_degrees)
            .with_number("SvAzimuthDegrees", self.sv_azimuth_degrees)
            .with_category("IMU_MessageType", self.imu_message_type.clone())
            .with_number("MeasurementX", self.measurement_x)
            .with_number("MeasurementY", self.measurement_y)
            .with_number("MeasurementZ", self.measurement_z)
            .with_number("BiasX", self.bias_x)
            .with_number("BiasY", self.bias_y)
            .with_number("BiasZ", self.bias_z)
            .with_number("WlsPositionXEcefMeters", wls.x)
            .with_number("WlsPositionYEcefMeters", wls.y)
            .with_number("WlsPositionZEcefMeters", wls.z)
            .with_number(
                "SignalQuality",
                geodesy::signal_quality(self.cn0_db_hz, self.sv_elevation_degrees),
            )
            .with_number("WLS_Distance", geodesy::ecef_distance(wls))
    }
}

fn complete(parts: [Option<f64>; 3], what: &str) -> Result<[f64; 3], PipelineError> {
    match parts {
        [Some(a), Some(b), Some(c)] if a.is_finite() && b.is_finite() && c.is_finite() => {
            Ok([a, b, c])
        }
        [Some(_), Some(_), Some(_)] => Err(PipelineError::InvalidPosition(format!(
            "{} must be finite numbers",
            what
        ))),
        _ => Err(PipelineError::InvalidPosition(format!(
            "{} are incomplete: all three values are required",
            what
        ))),
    }
}

/// Outcome of one successful correction
#[derive(Debug, Clone)]
pub struct Correction {
    pub fix: CorrectedFix,
    pub offset: Offset,
    /// Observers the fix was queued for
    pub delivered: usize,
}

/// Inference → coordinate correction → broadcast
#[derive(Clone)]
pub struct PredictionPipeline {
    engine: InferenceEngine,
    hub: BroadcastHub,
    transform: Arc<dyn CoordinateTransform>,
}

impl PredictionPipeline {
    pub fn new(
        engine: InferenceEngine,
        hub: BroadcastHub,
        transform: Arc<dyn CoordinateTransform>,
    ) -> Self {
        Self {
            engine,
            hub,
            transform,
        }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Correct one reading and publish it
    ///
    /// Nothing is published unless inference succeeds.
    pub fn process(&self, reading: &TelemetryReading) -> Result<Correction, PipelineError> {
        let wls = match reading.position()? {
            PositionInput::Ecef(ecef) => ecef,
            PositionInput::Geodetic(geodetic) => self.transform.to_ecef(geodetic),
        };

        let sample = reading.to_sample(wls);
        let offset = self.engine.predict(&sample)?;
        let baseline = self.transform.to_geodetic(wls);

        let fix = CorrectedFix {
            latitude: baseline.latitude + offset.delta_latitude,
            longitude: baseline.longitude + offset.delta_longitude,
            source_device_id: sample.routing.device_id,
            vehicle_id: sample.routing.vehicle_id,
            fleet_id: sample.routing.fleet_id,
            timestamp: Utc::now(),
        };
        let delivered = self.hub.publish(&fix);

        debug!(
            vehicle_id = ?fix.vehicle_id,
            latitude = fix.latitude,
            longitude = fix.longitude,
            delivered,
            "Corrected fix published"
        );

        Ok(Correction {
            fix,
            offset,
            delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading(extra: serde_json::Value) -> TelemetryReading {
        let mut body = json!({
            "Cn0DbHz": 35.0,
            "Svid": 12,
            "SvElevationDegrees": 30.0,
            "SvAzimuthDegrees": 120.0,
            "IMU_MessageType": "UncalAccel",
            "MeasurementX": 0.1,
            "MeasurementY": 0.2,
            "MeasurementZ": 9.8,
            "BiasX": 0.0,
            "BiasY": 0.0,
            "BiasZ": 0.0
        });
        if let (Some(base), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_position_requires_exactly_one_form() {
        let neither = reading(json!({}));
        assert!(matches!(neither.position(), Err(PipelineError::InvalidPosition(_))));

        let both = reading(json!({
            "WlsPositionXEcefMeters": 1.0, "WlsPositionYEcefMeters": 2.0, "WlsPositionZEcefMeters": 3.0,
            "raw_latitude": 37.0, "raw_longitude": -122.0, "raw_altitude": 10.0
        }));
        assert!(matches!(both.position(), Err(PipelineError::InvalidPosition(_))));
    }

    #[test]
    fn test_incomplete_form_rejected() {
        let partial = reading(json!({"raw_latitude": 37.0, "raw_longitude": -122.0}));
        assert!(matches!(partial.position(), Err(PipelineError::InvalidPosition(_))));
    }

    #[test]
    fn test_out_of_range_raw_position_rejected() {
        let bad = reading(json!({"raw_latitude": 137.0, "raw_longitude": 0.0, "raw_altitude": 0.0}));
        assert!(matches!(bad.position(), Err(PipelineError::InvalidPosition(_))));
    }

    #[test]
    fn test_geodetic_form_accepted() {
        let r = reading(json!({"raw_latitude": 37.0, "raw_longitude": -122.0, "raw_altitude": 10.0}));
        assert_eq!(
            r.position().unwrap(),
            PositionInput::Geodetic(Geodetic {
                latitude: 37.0,
                longitude: -122.0,
                altitude: 10.0
            })
        );
    }

    #[test]
    fn test_sample_contains_derived_features() {
        let r = reading(json!({}));
        let sample = r.to_sample(Ecef { x: 3.0, y: 4.0, z: 0.0 });

        use crate::inference::FeatureValue;
        assert_eq!(sample.get("WLS_Distance"), Some(&FeatureValue::Number(5.0)));
        assert_eq!(
            sample.get("IMU_MessageType"),
            Some(&FeatureValue::Category("UncalAccel".into()))
        );
        let Some(FeatureValue::Number(q)) = sample.get("SignalQuality") else {
            panic!("SignalQuality missing");
        };
        assert!((q - 17.5).abs() < 1e-9);
    }

    #[test]
    fn test_routing_ids_are_optional() {
        let r = reading(json!({"vehicle_id": "v1"}));
        let routing = r.routing();
        assert_eq!(routing.vehicle_id.as_deref(), Some("v1"));
        assert!(routing.device_id.is_none());
        assert!(routing.fleet_id.is_none());
    }
}
