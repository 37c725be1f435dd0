//! Graceful Shutdown
//!
//! On SIGINT or SIGTERM the relay:
//!
//! 1. Refuses new submissions (503) and stops accepting connections
//! 2. Lets in-flight requests finish staging
//! 3. Stops the aggregation schedule, draining the in-flight pass
//! 4. Closes destinations, flushing rolling outputs
//!
//! ```ignore
//! let state = build_state(&config).await?;
//! state.lifecycle.start().await?;
//! let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
//! serve_with_shutdown(listener, state, config.server.max_request_body_bytes, shutdown_signal()).await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::{create_router, AppState};

/// Shutdown signal type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
        }
    }
}

/// Completes when a shutdown signal is received.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::SigInt,
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::SigTerm
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

/// Serve until `signal` completes, then drain requests and the lifecycle.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    max_request_body_bytes: usize,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ShutdownSignal> + Send + 'static,
{
    let router = create_router(state.clone(), max_request_body_bytes);
    let draining = state.clone();

    info!(addr = %listener.local_addr()?, "Relay listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let signal = signal.await;
        info!(%signal, "Initiating graceful shutdown");
        draining.begin_shutdown();
    })
    .await?;

    info!("HTTP server stopped, draining aggregation");
    state.lifecycle.stop().await?;
    info!("Relay shut down gracefully");
    Ok(())
}
