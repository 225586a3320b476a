//! Model artifact handling
//!
//! - [`artifacts`]: typed decoding and validation of the artifact bundle
//! - [`store`]: where artifact bytes come from (HTTP in production)
//! - [`lifecycle`]: download → validate → publish state machine

pub mod artifacts;
pub mod lifecycle;
pub mod store;

pub use artifacts::{ArtifactKind, ModelArtifactSet};
pub use lifecycle::{
    ActiveModelInfo, ArtifactStatus, LifecycleError, LifecycleSnapshot, LoadState,
    ModelLifecycleManager, ModelSlot, ReloadOutcome,
};
pub use store::{
    ArtifactProgress, ArtifactStore, ArtifactUrls, FetchError, FetchPolicy, HttpArtifactStore,
};

use thiserror::Error;

/// Why a load attempt failed
///
/// Every variant is local to one load attempt: the manager moves to
/// `Failed` and the process keeps serving.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Fetch kept failing with retryable errors until the budget ran out
    #[error("{artifact}: download failed after {attempts} attempts: {reason}")]
    TransientFetch {
        artifact: ArtifactKind,
        attempts: u32,
        reason: String,
    },

    /// Fetch failed in a way retrying cannot fix (e.g. HTTP 404)
    #[error("{artifact}: download failed: {reason}")]
    Fetch { artifact: ArtifactKind, reason: String },

    /// Artifact is not cached and has no download URL
    #[error("{artifact}: no download URL configured (set {env_var})")]
    MissingUrl {
        artifact: ArtifactKind,
        env_var: &'static str,
    },

    /// Bytes could not be decoded at all
    #[error("{artifact}: corrupt artifact: {reason}")]
    ArtifactCorrupt { artifact: ArtifactKind, reason: String },

    /// Decoded, but the shape is wrong or inconsistent with the other artifacts
    #[error("{artifact}: schema mismatch: {reason}")]
    SchemaMismatch { artifact: ArtifactKind, reason: String },

    /// Local storage failure
    #[error("{artifact}: I/O error: {source}")]
    Io {
        artifact: ArtifactKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoadError {
    /// Artifact the failure is attributed to, if any
    pub fn artifact(&self) -> Option<ArtifactKind> {
        match self {
            LoadError::TransientFetch { artifact, .. }
            | LoadError::Fetch { artifact, .. }
            | LoadError::MissingUrl { artifact, .. }
            | LoadError::ArtifactCorrupt { artifact, .. }
            | LoadError::SchemaMismatch { artifact, .. }
            | LoadError::Io { artifact, .. } => Some(*artifact),
            LoadError::Internal(_) => None,
        }
    }
}
