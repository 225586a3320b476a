//! ridealert-locator - GPS correction and live location service
//!
//! Corrects raw GPS fixes with a learned offset model and streams corrected
//! positions to vehicle, fleet and global observer channels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ridealert_common::config::TomlConfig;
use ridealert_locator::broadcast::BroadcastHub;
use ridealert_locator::config::LocatorConfig;
use ridealert_locator::models::{HttpArtifactStore, ModelLifecycleManager};
use ridealert_locator::AppState;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for ridealert-locator
#[derive(Parser, Debug)]
#[command(name = "ridealert-locator")]
#[command(about = "GPS correction and live location service for RideAlert")]
#[command(version)]
struct Args {
    /// Address to listen on [default: 0.0.0.0:8000]
    #[arg(short, long, env = "RIDEALERT_BIND")]
    bind: Option<String>,

    /// Path to the TOML config file
    #[arg(short, long, env = "RIDEALERT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for downloaded model artifacts
    #[arg(short, long, env = "RIDEALERT_MODEL_DIR")]
    model_dir: Option<PathBuf>,
}

fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("ridealert_locator={level},tower_http={level}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing; the configured log level is applied once resolved
    let rust_log = EnvFilter::try_from_default_env().ok();
    let from_env = rust_log.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(rust_log.unwrap_or_else(|| log_filter("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ridealert-locator v{}", env!("CARGO_PKG_VERSION"));

    let toml = TomlConfig::load_or_default(args.config.as_deref());
    let config = LocatorConfig::resolve(args.bind.as_deref(), args.model_dir.as_deref(), &toml)
        .context("Invalid configuration")?;
    if !from_env {
        filter_handle
            .reload(log_filter(&config.log_level))
            .context("Failed to apply log level")?;
    }
    info!("Model directory: {}", config.model_dir.display());

    let missing = config.urls.missing();
    if !missing.is_empty() {
        warn!(
            "No download URL for {:?}; those artifacts must already be in the model directory",
            missing.iter().map(|a| a.url_env_var()).collect::<Vec<_>>()
        );
    }

    let store = HttpArtifactStore::new(config.urls.clone(), config.request_timeout)
        .context("Failed to build HTTP client")?;
    let lifecycle = ModelLifecycleManager::new(
        Arc::new(store),
        config.model_dir.clone(),
        config.fetch_policy.clone(),
    );
    let hub = BroadcastHub::new(config.queue_capacity);
    info!(queue_capacity = config.queue_capacity, "Broadcast hub initialized");

    let state = AppState::new(lifecycle.clone(), hub, config.send_timeout);
    let app = ridealert_locator::build_router(state);

    // Load in the background; the server answers 202 until ready
    lifecycle.start_loading();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;
    info!("Listening on http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
