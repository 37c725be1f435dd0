//! Feedhouse Agent - Aggregation and Lifecycle
//!
//! Turns the backlog in the repository into forwarded aggregates.
//!
//! ## Components
//!
//! - **Aggregator**: one pass scans staged entries, groups them by partition
//!   key, closes aggregates on count/size/age bounds and forwards them
//! - **ProxyLifecycle**: runs passes on a schedule and drains on shutdown
//!
//! ## Guarantees
//!
//! Source entries are marked forwarded only after every required destination
//! accepted the aggregate. A crash or a failed delivery leaves them staged, so
//! delivery is at-least-once. Passes are single-flight: a trigger that arrives
//! while a pass runs is dropped.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod lifecycle;

pub use aggregator::{Aggregator, PassReport};
pub use config::{AggregatorConfig, GroupKey, PartitionBy};
pub use error::{AgentError, Result};
pub use lifecycle::{LastPass, LifecycleHealth, LifecycleState, ProxyLifecycle, ProxyLifecycleBuilder};
