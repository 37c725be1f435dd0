//! Feedhouse Relay
//!
//! Receives data feed submissions over HTTP, stages them durably, aggregates them
//! into bounded containers and forwards the containers to the configured
//! destinations.
//!
//! ## Configuration
//!
//! A TOML file (see `feedhouse_server::config`) plus these overrides:
//!
//! - `--config` / `FEEDHOUSE_CONFIG`: configuration file
//! - `--bind` / `FEEDHOUSE_BIND`: listen address
//! - `--data-dir` / `FEEDHOUSE_DATA_DIR`: staging root
//! - `--temp-dir` / `FEEDHOUSE_TEMP_DIR`: temporary root
//! - `--home-dir` / `FEEDHOUSE_HOME_DIR`: working state root
//! - `--log-json` / `FEEDHOUSE_LOG_JSON`: JSON log lines
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG`:
//! ```bash
//! RUST_LOG=debug feedhouse --config relay.toml
//! RUST_LOG=feedhouse_agent=debug,info feedhouse --config relay.toml
//! ```

use anyhow::Context;
use clap::Parser;
use feedhouse_server::shutdown::{serve_with_shutdown, shutdown_signal};
use feedhouse_server::{build_state, Overrides, ProxyConfig};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "feedhouse")]
#[command(about = "Data feed receiving and forwarding relay", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FEEDHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, env = "FEEDHOUSE_BIND")]
    bind: Option<SocketAddr>,

    /// Staging root
    #[arg(long, env = "FEEDHOUSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Temporary root for writes before commit
    #[arg(long, env = "FEEDHOUSE_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Working state root
    #[arg(long, env = "FEEDHOUSE_HOME_DIR")]
    home_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "FEEDHOUSE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    feedhouse_observability::metrics::init();

    let config = match &cli.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    }
    .apply(Overrides {
        bind: cli.bind,
        data_dir: cli.data_dir,
        temp_dir: cli.temp_dir,
        home_dir: cli.home_dir,
    });

    tracing::info!("Starting feedhouse relay");
    let state = build_state(&config).await.context("initialising relay")?;
    state.lifecycle.start().await?;

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;

    tracing::info!("Configuration:");
    tracing::info!("  Staging: {}", config.repository.data_dir.display());
    tracing::info!(
        "  Aggregates: {} items / {} bytes, every {:?}",
        config.aggregator.max_items_per_aggregate,
        config.aggregator.max_uncompressed_bytes,
        config.aggregator.aggregation_frequency
    );
    for destination in &config.destinations {
        tracing::info!(
            "  Destination: {} (required: {})",
            destination.name(),
            destination.required()
        );
    }

    serve_with_shutdown(
        listener,
        state,
        config.server.max_request_body_bytes,
        shutdown_signal(),
    )
    .await?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
