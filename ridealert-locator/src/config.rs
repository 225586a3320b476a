//! Runtime configuration for ridealert-locator
//!
//! Combines command-line arguments (clap also reads their environment
//! variables), the artifact URL environment variables and the bootstrap TOML
//! file into one resolved [`LocatorConfig`].

use crate::models::{ArtifactKind, ArtifactUrls, FetchPolicy};
use ridealert_common::config::{resolve_model_dir, ArtifactUrlSection, TomlConfig};
use ridealert_common::{Error, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listen address
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    pub bind: SocketAddr,
    pub model_dir: PathBuf,
    pub urls: ArtifactUrls,
    pub fetch_policy: FetchPolicy,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub log_level: String,
}

impl LocatorConfig {
    /// Resolve every setting
    ///
    /// `cli_bind` and `cli_model_dir` are what clap produced from flags or
    /// their environment variables; they win over the TOML file.
    pub fn resolve(
        cli_bind: Option<&str>,
        cli_model_dir: Option<&Path>,
        toml: &TomlConfig,
    ) -> Result<Self> {
        let bind_str = cli_bind
            .or(toml.server.bind.as_deref())
            .unwrap_or(DEFAULT_BIND);
        let bind = bind_str
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid bind address '{}': {}", bind_str, e)))?;

        let models = &toml.models;
        Ok(Self {
            bind,
            model_dir: resolve_model_dir(cli_model_dir, toml),
            urls: artifact_urls(&models.urls),
            fetch_policy: FetchPolicy {
                max_retries: models.max_retries,
                initial_backoff: Duration::from_millis(models.initial_backoff_ms),
                backoff_multiplier: models.backoff_multiplier,
            },
            request_timeout: Duration::from_secs(models.request_timeout_secs),
            queue_capacity: toml.broadcast.queue_capacity,
            send_timeout: Duration::from_millis(toml.broadcast.send_timeout_ms),
            log_level: toml.logging.level.clone(),
        })
    }
}

/// Download URLs: environment variable first, then `[models.urls]`
pub fn artifact_urls(section: &ArtifactUrlSection) -> ArtifactUrls {
    let mut urls = ArtifactUrls::new();

    for artifact in ArtifactKind::LOAD_ORDER {
        let from_toml = match artifact {
            ArtifactKind::Features => section.features.as_deref(),
            ArtifactKind::LabelEncoders => section.label_encoders.as_deref(),
            ArtifactKind::Scaler => section.scaler.as_deref(),
            ArtifactKind::Model => section.model.as_deref(),
        };

        match std::env::var(artifact.url_env_var()) {
            Ok(url) if !url.trim().is_empty() => urls.set(artifact, url),
            _ => {
                if let Some(url) = from_toml {
                    urls.set(artifact, url);
                }
            }
        }
    }

    urls
}
