//! Feedhouse Forwarding
//!
//! Delivers closed aggregates to their destinations.
//!
//! ## Architecture
//!
//! - **Traits**: `Destination` is the sink interface; `AggregateFile` is what it receives.
//! - **Destinations**: `FileDestination` writes numbered output directories,
//!   `HttpDestination` POSTs the container to a remote endpoint.
//! - **Rolling**: `RollingDestination` batches aggregates into larger outputs on a
//!   size or time schedule before handing them to another destination.
//! - **Forwarder**: fans an aggregate out to every destination under a timeout,
//!   with a circuit breaker per destination.
//!
//! An aggregate is forwarded when every required destination accepted it. Anything
//! else leaves the source entries staged for a later pass, so a destination may see
//! the same entries more than once.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod file;
pub mod forwarder;
pub mod http;
pub mod rolling;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{build_forwarder, DestinationConfig, ForwardConfig};
pub use error::{ForwardError, Result};
pub use file::FileDestination;
pub use forwarder::{DestinationResult, DestinationStatus, ForwardReport, ForwardTarget, Forwarder};
pub use http::{HttpDestination, HttpSettings};
pub use rolling::{RollPeriod, RollingConfig, RollingDestination};
pub use traits::{AggregateFile, Destination};
