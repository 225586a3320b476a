//! Configuration loading and resolution tests
//!
//! Tests that manipulate RIDEALERT_MODEL_DIR are marked with #[serial]
//! so they never race each other on the process environment.

use ridealert_common::config::{
    default_model_dir, resolve_model_dir, TomlConfig, MODEL_DIR_ENV,
};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

#[test]
fn test_empty_toml_uses_defaults() {
    let config = TomlConfig::parse("").unwrap();

    assert!(config.server.bind.is_none());
    assert!(config.models.dir.is_none());
    assert_eq!(config.models.max_retries, 1);
    assert_eq!(config.models.initial_backoff_ms, 1000);
    assert_eq!(config.models.backoff_multiplier, 4);
    assert_eq!(config.broadcast.queue_capacity, 64);
    assert_eq!(config.broadcast.send_timeout_ms, 5000);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_full_toml_parses_all_sections() {
    let config = TomlConfig::parse(
        r#"
        [server]
        bind = "127.0.0.1:9000"

        [models]
        dir = "/srv/ridealert/ml"
        max_retries = 3
        initial_backoff_ms = 10

        [models.urls]
        features = "https://example.com/features.json"
        model = "https://example.com/model.json"

        [broadcast]
        queue_capacity = 8

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.bind.as_deref(), Some("127.0.0.1:9000"));
    assert_eq!(config.models.dir, Some(PathBuf::from("/srv/ridealert/ml")));
    assert_eq!(config.models.max_retries, 3);
    assert_eq!(config.models.initial_backoff_ms, 10);
    // unspecified fields keep their defaults
    assert_eq!(config.models.backoff_multiplier, 4);
    assert_eq!(
        config.models.urls.features.as_deref(),
        Some("https://example.com/features.json")
    );
    assert!(config.models.urls.scaler.is_none());
    assert_eq!(config.broadcast.queue_capacity, 8);
    assert_eq!(config.broadcast.send_timeout_ms, 5000);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = TomlConfig::parse("[models\nmax_retries = ");
    assert!(matches!(result, Err(ridealert_common::Error::Config(_))));
}

#[test]
fn test_load_or_default_tolerates_missing_file() {
    let config = TomlConfig::load_or_default(Some(Path::new("/nonexistent/ridealert/locator.toml")));
    assert_eq!(config.models.max_retries, 1);
}

#[test]
fn test_load_or_default_reads_explicit_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[broadcast]\nqueue_capacity = 3").unwrap();

    let config = TomlConfig::load_or_default(Some(file.path()));
    assert_eq!(config.broadcast.queue_capacity, 3);
}

#[test]
#[serial]
fn test_model_dir_cli_beats_env_and_toml() {
    env::set_var(MODEL_DIR_ENV, "/tmp/ridealert-env");
    let toml = TomlConfig::parse("[models]\ndir = \"/tmp/ridealert-toml\"").unwrap();

    let dir = resolve_model_dir(Some(Path::new("/tmp/ridealert-cli")), &toml);
    assert_eq!(dir, PathBuf::from("/tmp/ridealert-cli"));

    env::remove_var(MODEL_DIR_ENV);
}

#[test]
#[serial]
fn test_model_dir_env_beats_toml() {
    env::set_var(MODEL_DIR_ENV, "/tmp/ridealert-env");
    let toml = TomlConfig::parse("[models]\ndir = \"/tmp/ridealert-toml\"").unwrap();

    assert_eq!(resolve_model_dir(None, &toml), PathBuf::from("/tmp/ridealert-env"));

    env::remove_var(MODEL_DIR_ENV);
}

#[test]
#[serial]
fn test_model_dir_falls_back_to_toml_then_default() {
    env::remove_var(MODEL_DIR_ENV);

    let toml = TomlConfig::parse("[models]\ndir = \"/tmp/ridealert-toml\"").unwrap();
    assert_eq!(resolve_model_dir(None, &toml), PathBuf::from("/tmp/ridealert-toml"));

    let empty = TomlConfig::default();
    assert_eq!(resolve_model_dir(None, &empty), default_model_dir());
}

#[test]
fn test_default_model_dir_is_named_ml() {
    let dir = default_model_dir();
    assert_eq!(dir.file_name().and_then(|n| n.to_str()), Some("ml"));
}
