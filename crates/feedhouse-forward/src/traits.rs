//! The destination abstraction.
//!
//! A destination receives closed aggregates as container files on local disk.
//! The aggregator deletes the source entries only after every required
//! destination has returned `Ok` from [`Destination::deliver`].

use async_trait::async_trait;
use feedhouse_core::{headers, AttributeMap};
use std::path::PathBuf;

use crate::error::Result;

/// A closed aggregate, serialized as a container file.
#[derive(Debug, Clone)]
pub struct AggregateFile {
    /// Container holding the aggregate's entries
    pub path: PathBuf,
    /// Attributes shared by every entry, plus aggregate statistics
    pub attributes: AttributeMap,
    /// Number of entries in the container
    pub item_count: u64,
    /// Sum of entry payload sizes before compression
    pub uncompressed_bytes: u64,
}

impl AggregateFile {
    pub fn feed(&self) -> Option<&str> {
        self.attributes.get_non_empty(headers::FEED)
    }
}

/// A named sink for aggregates.
///
/// `deliver` returns `Ok` only once the aggregate is delivered, or durably queued
/// for destinations that batch output. Any error means "retry later".
#[async_trait]
pub trait Destination: Send + Sync {
    /// Unique name used in logs, metrics and health output.
    fn name(&self) -> &str;

    /// Deliver one aggregate.
    async fn deliver(&self, aggregate: &AggregateFile) -> Result<()>;

    /// Periodic housekeeping, called once per aggregation pass.
    async fn tick(&self) -> Result<()> {
        Ok(())
    }

    /// Flush anything still buffered. Called at shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
