//! Bootstrap configuration loading and directory resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or malformed TOML file never stops a service from starting:
//! a warning is logged and compiled defaults are used.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the model directory
pub const MODEL_DIR_ENV: &str = "RIDEALERT_MODEL_DIR";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub broadcast: BroadcastSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    /// Socket address to bind, e.g. `0.0.0.0:8000`
    #[serde(default)]
    pub bind: Option<String>,
}

/// `[models]`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsSection {
    /// Directory holding downloaded model artifacts
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Retries after the first failed fetch of an artifact
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Factor applied to the delay after each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,

    /// Whole-request timeout for a single artifact download
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Download URLs per artifact
    #[serde(default)]
    pub urls: ArtifactUrlSection,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            request_timeout_secs: default_request_timeout_secs(),
            urls: ArtifactUrlSection::default(),
        }
    }
}

/// `[models.urls]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactUrlSection {
    #[serde(default)]
    pub features: Option<String>,
    #[serde(default)]
    pub label_encoders: Option<String>,
    #[serde(default)]
    pub scaler: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// `[broadcast]`
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSection {
    /// Outbound events buffered per connection before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-frame send timeout before a connection is treated as disconnected
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> u32 {
    4
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load from an explicit path or the platform default location
    ///
    /// Falls back to defaults (with a warning) when the file is missing or
    /// malformed.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Ok(p) => p,
                Err(_) => {
                    info!("No config file found, using compiled defaults");
                    return Self::default();
                }
            },
        };

        match Self::load(&path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("{} - using compiled defaults", e);
                Self::default()
            }
        }
    }
}

/// Locate the default configuration file for the platform
pub fn default_config_path() -> Result<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("ridealert").join("locator.toml"));

    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/ridealert/locator.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Resolve the model artifact directory
///
/// CLI argument, then `RIDEALERT_MODEL_DIR`, then `[models] dir`, then the
/// compiled default.
pub fn resolve_model_dir(cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(MODEL_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml.models.dir {
        return path.clone();
    }

    default_model_dir()
}

/// OS-dependent default model directory
pub fn default_model_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/ridealert/ml (or /var/lib/ridealert/ml for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("ridealert").join("ml"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/ridealert/ml"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("ridealert").join("ml"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/ridealert/ml"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("ridealert").join("ml"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\ridealert\\ml"))
    } else {
        PathBuf::from("./ridealert_data/ml")
    }
}
