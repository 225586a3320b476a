//! Model lifecycle management
//!
//! Brings the artifact bundle from "not present" to "published" on a
//! background task while request handlers keep serving.
//!
//! State machine:
//!
//! ```text
//! NotStarted ──start──▶ Downloading ──▶ Validating ──▶ Ready
//!     ▲                   ▲   │              │           │
//!     │                   │   └──────────────┴─▶ Failed  │
//!     │                   └──── retry (start) ────┘      │
//!     │                   └──── force_reload ────────────┘
//!     └──── clear (any state except Downloading/Validating)
//! ```
//!
//! The published [`ModelArtifactSet`] lives in a [`ModelSlot`]. It is only
//! replaced at the very end of a successful load, so a failed reload leaves
//! the previous set serving.

use super::artifacts::{self, ArtifactKind, DecodedArtifact, ModelArtifactSet};
use super::store::{fetch_with_retry, ArtifactProgress, ArtifactStore, FetchPolicy};
use super::LoadError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Where the lifecycle currently stands
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum LoadState {
    NotStarted,
    Downloading,
    Validating,
    Ready,
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<ArtifactKind>,
        reason: String,
    },
}

impl LoadState {
    /// A load task owns the model directory
    pub fn is_busy(&self) -> bool {
        matches!(self, LoadState::Downloading | LoadState::Validating)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadState::Failed { .. })
    }

    /// Coarse label used by `/predict/status`
    pub fn status_label(&self) -> &'static str {
        match self {
            LoadState::NotStarted => "not_started",
            LoadState::Downloading | LoadState::Validating => "loading",
            LoadState::Ready => "ready",
            LoadState::Failed { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct Transition {
    state: LoadState,
    changed_at: DateTime<Utc>,
}

impl Transition {
    fn to(state: LoadState) -> Self {
        Self {
            state,
            changed_at: Utc::now(),
        }
    }
}

/// Holder of the currently published artifact set
///
/// Readers clone the inner `Arc` under a read lock that is released
/// immediately; the write lock is held only for the pointer replacement.
#[derive(Clone, Default)]
pub struct ModelSlot {
    inner: Arc<RwLock<Option<Arc<ModelArtifactSet>>>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the published set, if any
    pub fn current(&self) -> Option<Arc<ModelArtifactSet>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the published set; returns the previous one
    pub fn publish(&self, set: Option<Arc<ModelArtifactSet>>) -> Option<Arc<ModelArtifactSet>> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, set)
    }
}

/// Errors from operations that collide with a running load
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A download or validation is in progress
    #[error("Model download in progress")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of [`ModelLifecycleManager::force_reload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Started,
    AlreadyInProgress,
}

/// Per-artifact diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub artifact: ArtifactKind,
    pub file_name: &'static str,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub expected_bytes: u64,
    pub downloaded_bytes: u64,
}

/// Summary of the published set
#[derive(Debug, Clone, Serialize)]
pub struct ActiveModelInfo {
    pub loaded_at: DateTime<Utc>,
    pub feature_count: usize,
    pub generation: u64,
}

/// Everything `GET /models/status` reports
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub load_state: LoadState,
    pub changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_model: Option<ActiveModelInfo>,
    pub artifacts: Vec<ArtifactStatus>,
    pub total_size_bytes: u64,
}

struct Inner {
    store: Arc<dyn ArtifactStore>,
    model_dir: PathBuf,
    policy: FetchPolicy,
    slot: ModelSlot,
    state: watch::Sender<Transition>,
    progress: HashMap<ArtifactKind, ArtifactProgress>,
    /// Held by the load task for its whole run, and by `clear` while deleting
    disk: Mutex<()>,
    generation: AtomicU64,
}

/// Owns download → validate → publish for the model bundle
///
/// Cheap to clone; constructed once at startup and handed to every handler.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<Inner>,
}

impl ModelLifecycleManager {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        model_dir: impl Into<PathBuf>,
        policy: FetchPolicy,
    ) -> Self {
        let (state, _) = watch::channel(Transition::to(LoadState::NotStarted));
        let progress = ArtifactKind::LOAD_ORDER
            .into_iter()
            .map(|a| (a, ArtifactProgress::default()))
            .collect();

        Self {
            inner: Arc::new(Inner {
                store,
                model_dir: model_dir.into(),
                policy,
                slot: ModelSlot::new(),
                state,
                progress,
                disk: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Begin loading unless a load is running or a set is already ready
    ///
    /// Returns immediately; `true` when a new load task was spawned.
    /// Artifacts already on disk are reused.
    pub fn start_loading(&self) -> bool {
        self.begin(false)
    }

    /// Re-download everything, even when `Ready`
    ///
    /// In-flight predictions keep the old set until the new one is
    /// published. Calls made while a load is running are coalesced.
    pub fn force_reload(&self) -> ReloadOutcome {
        if self.begin(true) {
            ReloadOutcome::Started
        } else {
            ReloadOutcome::AlreadyInProgress
        }
    }

    fn begin(&self, force: bool) -> bool {
        let started = self.inner.state.send_if_modified(|t| {
            let allowed = match t.state {
                LoadState::NotStarted | LoadState::Failed { .. } => true,
                LoadState::Ready => force,
                LoadState::Downloading | LoadState::Validating => false,
            };
            if allowed {
                *t = Transition::to(LoadState::Downloading);
            }
            allowed
        });

        if started {
            info!(force, "Model loading started");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                // a panicking load must not leave the state stuck on Downloading
                let task = tokio::spawn(run_load(inner.clone(), force));
                if let Err(e) = task.await {
                    error!(error = %e, "Model load task aborted");
                    transition(
                        &inner,
                        LoadState::Failed {
                            artifact: None,
                            reason: format!("load task aborted: {}", e),
                        },
                    );
                }
            });
        } else {
            debug!(force, state = ?self.state(), "Model load request ignored");
        }

        started
    }

    /// Delete artifact files, unpublish the set and return to `NotStarted`
    ///
    /// Fails with [`LifecycleError::Busy`] while a load is running. Returns
    /// the number of files deleted.
    pub async fn clear(&self) -> Result<usize, LifecycleError> {
        let _disk = self.inner.disk.try_lock().map_err(|_| LifecycleError::Busy)?;

        let reset = self.inner.state.send_if_modified(|t| {
            if t.state.is_busy() {
                return false;
            }
            *t = Transition::to(LoadState::NotStarted);
            true
        });
        if !reset {
            return Err(LifecycleError::Busy);
        }

        self.inner.slot.publish(None);

        let mut deleted = 0;
        for artifact in ArtifactKind::LOAD_ORDER {
            let path = self.inner.model_dir.join(artifact.file_name());
            for candidate in [path.clone(), part_path(&path)] {
                match tokio::fs::remove_file(&candidate).await {
                    Ok(()) => {
                        debug!(file = %candidate.display(), "Deleted model file");
                        deleted += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if let Some(progress) = self.inner.progress.get(&artifact) {
                progress.reset();
            }
        }

        info!(deleted, "Model files cleared");
        Ok(deleted)
    }

    /// Current state; never blocks
    pub fn state(&self) -> LoadState {
        self.inner.state.borrow().state.clone()
    }

    /// Current state plus per-artifact diagnostics
    pub async fn snapshot(&self) -> LifecycleSnapshot {
        let (load_state, changed_at) = {
            let t = self.inner.state.borrow();
            (t.state.clone(), t.changed_at)
        };

        let mut artifacts = Vec::with_capacity(ArtifactKind::LOAD_ORDER.len());
        let mut total_size_bytes = 0;
        for artifact in ArtifactKind::LOAD_ORDER {
            let path = self.inner.model_dir.join(artifact.file_name());
            let size_bytes = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
            total_size_bytes += size_bytes.unwrap_or(0);

            let (expected_bytes, downloaded_bytes) = self
                .inner
                .progress
                .get(&artifact)
                .map(|p| (p.expected_bytes(), p.downloaded_bytes()))
                .unwrap_or((0, 0));

            artifacts.push(ArtifactStatus {
                artifact,
                file_name: artifact.file_name(),
                present: size_bytes.is_some(),
                size_bytes,
                expected_bytes,
                downloaded_bytes,
            });
        }

        let active_model = self.inner.slot.current().map(|set| ActiveModelInfo {
            loaded_at: set.loaded_at(),
            feature_count: set.feature_names().len(),
            generation: self.published_generation(),
        });

        LifecycleSnapshot {
            load_state,
            changed_at,
            active_model,
            artifacts,
            total_size_bytes,
        }
    }

    /// Wait until the state satisfies `pred`, returning that state
    pub async fn wait_for<F>(&self, mut pred: F) -> LoadState
    where
        F: FnMut(&LoadState) -> bool,
    {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|t| pred(&t.state)).await;
        match result {
            Ok(t) => t.state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Handle readers use to reach the published set
    pub fn slot(&self) -> ModelSlot {
        self.inner.slot.clone()
    }

    /// Number of sets published so far
    pub fn published_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn model_dir(&self) -> &Path {
        &self.inner.model_dir
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn transition(inner: &Inner, state: LoadState) {
    info!(state = state.status_label(), "Model load state changed: {:?}", state);
    inner.state.send_modify(|t| *t = Transition::to(state));
}

async fn run_load(inner: Arc<Inner>, force: bool) {
    let _disk = inner.disk.lock().await;
    let started = std::time::Instant::now();

    match load_sequence(&inner, force).await {
        Ok(set) => {
            let features = set.feature_names().len();
            inner.slot.publish(Some(Arc::new(set)));
            let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            info!(
                features,
                generation,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Model artifact set published"
            );
            transition(&inner, LoadState::Ready);
        }
        Err(e) => {
            error!(error = %e, "Model load failed; previous model set (if any) stays active");
            transition(
                &inner,
                LoadState::Failed {
                    artifact: e.artifact(),
                    reason: e.to_string(),
                },
            );
        }
    }
}

/// A freshly downloaded artifact waiting in `<file>.part`
struct Staged {
    artifact: ArtifactKind,
    part: PathBuf,
    path: PathBuf,
}

/// Download, decode and assemble; only then move new files into place
///
/// Downloads stay in `.part` files until the whole bundle assembles, so a
/// load that fails halfway never leaves a mix of two bundles for the cache.
async fn load_sequence(inner: &Inner, force: bool) -> Result<ModelArtifactSet, LoadError> {
    tokio::fs::create_dir_all(&inner.model_dir)
        .await
        .map_err(|e| LoadError::Internal(format!("create {}: {}", inner.model_dir.display(), e)))?;

    let mut staged = Vec::new();
    let set = match stage_and_assemble(inner, force, &mut staged).await {
        Ok(set) => set,
        Err(e) => {
            discard(&staged).await;
            return Err(e);
        }
    };

    commit(inner, &staged).await?;
    Ok(set)
}

async fn stage_and_assemble(
    inner: &Inner,
    force: bool,
    staged: &mut Vec<Staged>,
) -> Result<ModelArtifactSet, LoadError> {
    let mut sources = Vec::with_capacity(ArtifactKind::LOAD_ORDER.len());

    for artifact in ArtifactKind::LOAD_ORDER {
        let path = inner.model_dir.join(artifact.file_name());
        let progress = inner
            .progress
            .get(&artifact)
            .ok_or_else(|| LoadError::Internal(format!("no progress slot for {}", artifact)))?;

        if !force {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                info!(artifact = %artifact, size_bytes = meta.len(), "Using cached artifact");
                progress.reset();
                progress.set_expected(meta.len());
                progress.add_downloaded(meta.len());
                sources.push((artifact, path));
                continue;
            }
        }

        info!(artifact = %artifact, "Downloading artifact");
        let bytes = fetch_with_retry(inner.store.as_ref(), artifact, &inner.policy, progress).await?;
        let part = part_path(&path);
        staged.push(Staged {
            artifact,
            part: part.clone(),
            path,
        });
        tokio::fs::write(&part, &bytes)
            .await
            .map_err(|source| LoadError::Io { artifact, source })?;
        info!(artifact = %artifact, size_bytes = bytes.len(), "Artifact downloaded");
        sources.push((artifact, part));
    }

    transition(inner, LoadState::Validating);

    let mut features = None;
    let mut encoders = None;
    let mut scaler = None;
    let mut model = None;

    for (artifact, source) in sources {
        // read + decode on the blocking pool; the byte buffer is dropped
        // before the next artifact is read
        let decoded = tokio::task::spawn_blocking(move || {
            let bytes =
                std::fs::read(&source).map_err(|source| LoadError::Io { artifact, source })?;
            artifacts::decode(artifact, &bytes)
        })
        .await
        .map_err(|e| LoadError::Internal(format!("decode task for {} failed: {}", artifact, e)))??;

        debug!(artifact = %artifact, "Artifact decoded");
        match decoded {
            DecodedArtifact::Features(v) => features = Some(v),
            DecodedArtifact::LabelEncoders(v) => encoders = Some(v),
            DecodedArtifact::Scaler(v) => scaler = Some(v),
            DecodedArtifact::Model(v) => model = Some(v),
        }
    }

    let missing = |artifact: ArtifactKind| LoadError::Internal(format!("{} was not decoded", artifact));
    ModelArtifactSet::assemble(
        features.ok_or_else(|| missing(ArtifactKind::Features))?,
        encoders.ok_or_else(|| missing(ArtifactKind::LabelEncoders))?,
        scaler.ok_or_else(|| missing(ArtifactKind::Scaler))?,
        model.ok_or_else(|| missing(ArtifactKind::Model))?,
    )
}

async fn discard(staged: &[Staged]) {
    for s in staged {
        match tokio::fs::remove_file(&s.part).await {
            Ok(()) => debug!(artifact = %s.artifact, "Discarded staged artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(artifact = %s.artifact, error = %e, "Failed to discard staged artifact"),
        }
    }
}

/// Rename staged files over the cached ones
///
/// If a rename fails the whole cache is dropped, so the next load fetches a
/// complete bundle instead of reusing a half-replaced one.
async fn commit(inner: &Inner, staged: &[Staged]) -> Result<(), LoadError> {
    for (i, s) in staged.iter().enumerate() {
        if let Err(source) = tokio::fs::rename(&s.part, &s.path).await {
            warn!(artifact = %s.artifact, error = %source, "Rename of downloaded artifact failed");
            discard(&staged[i..]).await;
            for artifact in ArtifactKind::LOAD_ORDER {
                let _ = tokio::fs::remove_file(inner.model_dir.join(artifact.file_name())).await;
            }
            return Err(LoadError::Io {
                artifact: s.artifact,
                source,
            });
        }
    }
    Ok(())
}
