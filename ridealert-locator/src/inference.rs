//! Inference against the published model set
//!
//! The engine takes one snapshot of the published [`ModelArtifactSet`] per
//! call and runs the whole prediction against it, so a concurrent reload can
//! never hand a single call a mix of old and new artifacts.

use crate::models::{ModelArtifactSet, ModelSlot};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Raw value of one input feature
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Number(f64),
    Category(String),
}

/// Identifiers used for routing the result, never for inference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingIds {
    pub device_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub fleet_id: Option<String>,
}

/// Named feature values for one telemetry message
///
/// Values are looked up by the names the published set declares, so the
/// order here does not have to match the model's.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySample {
    pub routing: RoutingIds,
    features: Vec<(String, FeatureValue)>,
}

impl TelemetrySample {
    pub fn new(routing: RoutingIds) -> Self {
        Self {
            routing,
            features: Vec::new(),
        }
    }

    pub fn with_number(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, FeatureValue::Number(value));
        self
    }

    pub fn with_category(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, FeatureValue::Category(value.into()));
        self
    }

    /// Insert or overwrite a feature
    pub fn set(&mut self, name: impl Into<String>, value: FeatureValue) {
        let name = name.into();
        match self.features.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.features.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.features
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Predicted correction in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Offset {
    pub delta_latitude: f64,
    pub delta_longitude: f64,
}

/// Per-request inference failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    /// No model set has been published yet
    #[error("Model is not ready")]
    NotReady,

    /// Categorical value the encoder was never trained on
    #[error("Unknown category '{value}' for feature '{feature}'")]
    UnknownCategory { feature: String, value: String },

    /// Sample does not line up with the model's feature list
    #[error("Feature vector mismatch: {0}")]
    FeatureVectorMismatch(String),
}

/// Turns telemetry samples into position offsets
///
/// Read-only against the artifact set; any number of callers may predict
/// concurrently.
#[derive(Clone)]
pub struct InferenceEngine {
    slot: ModelSlot,
}

impl InferenceEngine {
    pub fn new(slot: ModelSlot) -> Self {
        Self { slot }
    }

    /// Predict with whatever set is published right now
    pub fn predict(&self, sample: &TelemetrySample) -> Result<Offset, InferenceError> {
        let set = self.slot.current().ok_or(InferenceError::NotReady)?;
        predict_with(&set, sample)
    }

    /// The set a prediction started now would use
    pub fn active_set(&self) -> Option<Arc<ModelArtifactSet>> {
        self.slot.current()
    }
}

/// Encode, scale and evaluate `sample` against one specific set
///
/// Pure function of its inputs: identical set and sample give bit-identical
/// output.
pub fn predict_with(
    set: &ModelArtifactSet,
    sample: &TelemetrySample,
) -> Result<Offset, InferenceError> {
    let mut x = Vec::with_capacity(set.feature_names().len());

    for name in set.feature_names() {
        let value = sample.get(name).ok_or_else(|| {
            InferenceError::FeatureVectorMismatch(format!("missing feature '{}'", name))
        })?;

        let encoded = match (set.encoder(name), value) {
            (Some(encoder), FeatureValue::Category(category)) => {
                encoder.encode(category).ok_or_else(|| InferenceError::UnknownCategory {
                    feature: name.clone(),
                    value: category.clone(),
                })? as f64
            }
            (Some(_), FeatureValue::Number(_)) => {
                return Err(InferenceError::FeatureVectorMismatch(format!(
                    "feature '{}' is categorical but a number was given",
                    name
                )));
            }
            (None, FeatureValue::Number(n)) if n.is_finite() => *n,
            (None, FeatureValue::Number(_)) => {
                return Err(InferenceError::FeatureVectorMismatch(format!(
                    "feature '{}' is not a finite number",
                    name
                )));
            }
            (None, FeatureValue::Category(_)) => {
                return Err(InferenceError::FeatureVectorMismatch(format!(
                    "feature '{}' is numeric but a category was given",
                    name
                )));
            }
        };
        x.push(encoded);
    }

    set.scaler().transform(&mut x);
    let [delta_latitude, delta_longitude] = set.model().predict(&x);

    Ok(Offset {
        delta_latitude,
        delta_longitude,
    })
}
