//! Feedhouse HTTP Server
//!
//! Ingestion endpoint, health/status surface and process wiring for the relay.
//!
//! ## Endpoints
//!
//! - `POST|PUT /datafeed`: submit data; `Feed`, `Type`, `Compression` and any other
//!   headers become attributes
//! - `POST|PUT /datafeed/:feed`: same, with the feed taken from the path when no
//!   `Feed` header is sent
//! - `GET /health`, `GET /live`: process is up
//! - `GET /ready`: aggregation is scheduled and no required destination is tripped
//! - `GET /status`: scheduler, last pass and destination details as JSON
//! - `GET /metrics`: Prometheus scrape

use axum::{
    routing::{get, post},
    Router,
};
use feedhouse_agent::ProxyLifecycle;
use feedhouse_forward::build_forwarder;
use feedhouse_storage::{Receiver, RepositoryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod config;
pub mod error;
pub mod handlers;
pub mod shutdown;

pub use config::{Overrides, ProxyConfig, ServerConfig};
pub use error::{Result, ServerError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub receiver: Receiver,
    pub lifecycle: Arc<ProxyLifecycle>,
    shutting_down: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(receiver: Receiver, lifecycle: Arc<ProxyLifecycle>) -> Self {
        Self {
            receiver,
            lifecycle,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse new submissions from now on.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// Open the repository, build destinations and wire the lifecycle. Nothing is
/// scheduled until `lifecycle.start()`.
pub async fn build_state(config: &ProxyConfig) -> Result<AppState> {
    config.validate()?;

    let store = RepositoryStore::open(config.repository.clone()).await?;
    let forwarder = build_forwarder(&config.forward, &config.destinations, &config.roll_root()).await?;
    let lifecycle = ProxyLifecycle::builder()
        .store(store.clone())
        .forwarder(Arc::new(forwarder))
        .config(config.aggregator.clone())
        .build()?;

    info!(
        data_dir = ?config.repository.data_dir,
        last_id = %store.last_id(),
        destinations = config.destinations.len(),
        "Relay state initialised"
    );

    Ok(AppState::new(
        Receiver::new(store, config.receive.clone()),
        Arc::new(lifecycle),
    ))
}

/// Create the router with all endpoints
pub fn create_router(state: AppState, max_request_body_bytes: usize) -> Router {
    let datafeed = Router::new()
        .route(
            "/datafeed",
            post(handlers::receive::receive).put(handlers::receive::receive),
        )
        .route(
            "/datafeed/:feed",
            post(handlers::receive::receive_for_feed).put(handlers::receive::receive_for_feed),
        )
        .layer(RequestBodyLimitLayer::new(max_request_body_bytes));

    Router::new()
        .merge(datafeed)
        .route("/health", get(handlers::health::health_check))
        .route("/live", get(handlers::health::liveness_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/status", get(handlers::health::status))
        .with_state(state)
        .merge(feedhouse_observability::exporter::create_metrics_router())
        .layer(TraceLayer::new_for_http())
}
