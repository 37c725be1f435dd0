//! Feedhouse Observability
//!
//! Prometheus metrics shared by the receiver, the aggregator and the forwarder,
//! plus the `/metrics` exporter route.
//!
//! # Usage
//!
//! ```no_run
//! use feedhouse_observability::{exporter, metrics};
//!
//! metrics::init();
//! let metrics_router: axum::Router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_is_safe() {
        init_metrics();
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
