//! Typed model artifacts
//!
//! The bundle is four JSON files. Each is decoded into a concrete type and
//! validated right after decode, so shape problems surface as
//! [`LoadError::SchemaMismatch`] during loading instead of at prediction time.

use super::LoadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// One file of the model bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Features,
    LabelEncoders,
    Scaler,
    Model,
}

impl ArtifactKind {
    /// Small artifacts first so the large model is decoded last
    pub const LOAD_ORDER: [ArtifactKind; 4] = [
        ArtifactKind::Features,
        ArtifactKind::LabelEncoders,
        ArtifactKind::Scaler,
        ArtifactKind::Model,
    ];

    /// File name inside the model directory
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Features => "enhanced_features_v6.json",
            ArtifactKind::LabelEncoders => "enhanced_label_encoders_v6.json",
            ArtifactKind::Scaler => "robust_scaler_v6.json",
            ArtifactKind::Model => "gradient_boosting_model_v6.json",
        }
    }

    /// Environment variable carrying the download URL
    pub fn url_env_var(self) -> &'static str {
        match self {
            ArtifactKind::Features => "ENHANCED_FEATURES_V6",
            ArtifactKind::LabelEncoders => "ENHANCED_LABEL_ENCODERS_V6",
            ArtifactKind::Scaler => "ROBUST_SCALER_V6",
            ArtifactKind::Model => "GRADIENT_BOOSTING_MODEL_V6",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Maps category strings of one feature to integer codes
///
/// A class's code is its position in the class list.
#[derive(Debug, Clone)]
pub struct CategoryEncoder {
    classes: Vec<String>,
    codes: HashMap<String, usize>,
}

impl CategoryEncoder {
    pub fn new(classes: Vec<String>) -> Result<Self, String> {
        if classes.is_empty() {
            return Err("encoder has no classes".to_string());
        }

        let mut codes = HashMap::with_capacity(classes.len());
        for (code, class) in classes.iter().enumerate() {
            if codes.insert(class.clone(), code).is_some() {
                return Err(format!("duplicate class '{}'", class));
            }
        }

        Ok(Self { classes, codes })
    }

    pub fn encode(&self, category: &str) -> Option<usize> {
        self.codes.get(category).copied()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Per-feature centering and scaling (robust scaler)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub center: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    fn validate(&self) -> Result<(), String> {
        if self.center.len() != self.scale.len() {
            return Err(format!(
                "center has {} entries but scale has {}",
                self.center.len(),
                self.scale.len()
            ));
        }
        if let Some(i) = self
            .center
            .iter()
            .chain(self.scale.iter())
            .position(|v| !v.is_finite())
        {
            return Err(format!("non-finite value at position {}", i));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.center.len()
    }

    pub fn is_empty(&self) -> bool {
        self.center.is_empty()
    }

    /// `(x - center) / scale`, with a zero scale treated as 1
    pub fn transform(&self, values: &mut [f64]) {
        for ((v, center), scale) in values.iter_mut().zip(&self.center).zip(&self.scale) {
            let s = if *scale == 0.0 { 1.0 } else { *scale };
            *v = (*v - center) / s;
        }
    }
}

/// Node of a regression tree in flat-array form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// Single regression tree; node 0 is the root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    /// Children must point forward, which also rules out cycles
    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".to_string());
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {} splits on feature {} but model has {} features",
                            idx, feature, n_features
                        ));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(format!("node {} has invalid child {}", idx, child));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(format!("leaf {} has non-finite value", idx));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Boosted ensemble for one output dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub init: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
}

impl TreeEnsemble {
    fn evaluate(&self, x: &[f64]) -> f64 {
        self.trees
            .iter()
            .fold(self.init, |acc, tree| acc + self.learning_rate * tree.evaluate(x))
    }
}

/// Gradient-boosted regression producing (Δlatitude, Δlongitude)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostingModel {
    pub n_features: usize,
    pub outputs: Vec<TreeEnsemble>,
}

impl GradientBoostingModel {
    fn validate(&self) -> Result<(), String> {
        if self.outputs.len() != 2 {
            return Err(format!("expected 2 outputs, found {}", self.outputs.len()));
        }
        for (o, ensemble) in self.outputs.iter().enumerate() {
            if !ensemble.init.is_finite() || !ensemble.learning_rate.is_finite() {
                return Err(format!("output {} has non-finite init or learning rate", o));
            }
            for (t, tree) in ensemble.trees.iter().enumerate() {
                tree.validate(self.n_features)
                    .map_err(|e| format!("output {} tree {}: {}", o, t, e))?;
            }
        }
        Ok(())
    }

    /// `x` must hold exactly `n_features` values
    pub fn predict(&self, x: &[f64]) -> [f64; 2] {
        [self.outputs[0].evaluate(x), self.outputs[1].evaluate(x)]
    }
}

/// Result of decoding one artifact file
#[derive(Debug)]
pub enum DecodedArtifact {
    Features(Vec<String>),
    LabelEncoders(BTreeMap<String, CategoryEncoder>),
    Scaler(FeatureScaler),
    Model(GradientBoostingModel),
}

/// Decode and validate one artifact in isolation
pub fn decode(kind: ArtifactKind, bytes: &[u8]) -> Result<DecodedArtifact, LoadError> {
    let corrupt = |e: serde_json::Error| LoadError::ArtifactCorrupt {
        artifact: kind,
        reason: e.to_string(),
    };
    let mismatch = |reason: String| LoadError::SchemaMismatch {
        artifact: kind,
        reason,
    };

    match kind {
        ArtifactKind::Features => {
            let names: Vec<String> = serde_json::from_slice(bytes).map_err(corrupt)?;
            if names.is_empty() {
                return Err(mismatch("feature list is empty".to_string()));
            }
            let mut seen = HashSet::with_capacity(names.len());
            for name in &names {
                if !seen.insert(name.as_str()) {
                    return Err(mismatch(format!("duplicate feature '{}'", name)));
                }
            }
            Ok(DecodedArtifact::Features(names))
        }
        ArtifactKind::LabelEncoders => {
            let raw: BTreeMap<String, Vec<String>> =
                serde_json::from_slice(bytes).map_err(corrupt)?;
            let mut encoders = BTreeMap::new();
            for (feature, classes) in raw {
                let encoder = CategoryEncoder::new(classes)
                    .map_err(|e| mismatch(format!("encoder '{}': {}", feature, e)))?;
                encoders.insert(feature, encoder);
            }
            Ok(DecodedArtifact::LabelEncoders(encoders))
        }
        ArtifactKind::Scaler => {
            let scaler: FeatureScaler = serde_json::from_slice(bytes).map_err(corrupt)?;
            scaler.validate().map_err(mismatch)?;
            Ok(DecodedArtifact::Scaler(scaler))
        }
        ArtifactKind::Model => {
            let model: GradientBoostingModel = serde_json::from_slice(bytes).map_err(corrupt)?;
            model.validate().map_err(mismatch)?;
            Ok(DecodedArtifact::Model(model))
        }
    }
}

/// Immutable, fully validated model bundle
///
/// Never mutated after construction; a reload builds a new set.
#[derive(Debug)]
pub struct ModelArtifactSet {
    feature_names: Vec<String>,
    encoders: BTreeMap<String, CategoryEncoder>,
    scaler: FeatureScaler,
    model: GradientBoostingModel,
    loaded_at: DateTime<Utc>,
}

impl ModelArtifactSet {
    /// Cross-check the four artifacts against each other
    pub fn assemble(
        feature_names: Vec<String>,
        encoders: BTreeMap<String, CategoryEncoder>,
        scaler: FeatureScaler,
        model: GradientBoostingModel,
    ) -> Result<Self, LoadError> {
        let n = feature_names.len();

        if let Some(unknown) = encoders.keys().find(|f| !feature_names.contains(*f)) {
            return Err(LoadError::SchemaMismatch {
                artifact: ArtifactKind::LabelEncoders,
                reason: format!("encoder for '{}' which is not in the feature list", unknown),
            });
        }
        if scaler.len() != n {
            return Err(LoadError::SchemaMismatch {
                artifact: ArtifactKind::Scaler,
                reason: format!("scaler covers {} features, feature list has {}", scaler.len(), n),
            });
        }
        if model.n_features != n {
            return Err(LoadError::SchemaMismatch {
                artifact: ArtifactKind::Model,
                reason: format!("model expects {} features, feature list has {}", model.n_features, n),
            });
        }
        scaler.validate().map_err(|reason| LoadError::SchemaMismatch {
            artifact: ArtifactKind::Scaler,
            reason,
        })?;
        model.validate().map_err(|reason| LoadError::SchemaMismatch {
            artifact: ArtifactKind::Model,
            reason,
        })?;

        Ok(Self {
            feature_names,
            encoders,
            scaler,
            model,
            loaded_at: Utc::now(),
        })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn encoder(&self, feature: &str) -> Option<&CategoryEncoder> {
        self.encoders.get(feature)
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.scaler
    }

    pub fn model(&self) -> &GradientBoostingModel {
        &self.model
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}
