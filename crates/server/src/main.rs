//! Waffle server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waffle_core::config::AppConfig;
use waffle_server::bootstrap::{collaborators_from_config, initialize, spawn_background_tasks};
use waffle_server::{AppState, create_router};

/// Waffle - a version-aware caching gateway for git-hosted datasets
#[derive(Parser, Debug)]
#[command(name = "waffled")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "WAFFLE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Waffle v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override everything)
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    // WAFFLE_CONFIG is only the path and does not count as configuration
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("WAFFLE_") && key != "WAFFLE_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: waffled --config /path/to/config.toml\n  \
             2. Environment variables: WAFFLE_SERVER__BIND=0.0.0.0:3333 \
             WAFFLE_CONTROL__TYPE=spreadsheet WAFFLE_CONTROL__SPREADSHEET_ID=YOUR_SHEET_ID waffled\n\n\
             See config/server.example.toml for example configuration.\n\
             Set WAFFLE_CONFIG env var to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("WAFFLE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    waffle_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let collaborators = collaborators_from_config(&config).await?;
    let state = AppState::new(config.clone(), collaborators);

    // Refuses to start without access control tables
    initialize(&state).await?;
    let _background = spawn_background_tasks(&state);

    let app = create_router(state.clone());

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.worker.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
