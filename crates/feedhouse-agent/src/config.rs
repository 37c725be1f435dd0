//! Aggregation settings.
//!
//! Accepts both snake_case keys and the camelCase names used by existing proxy
//! deployments (`maxItemsPerAggregate`, `maxFileScan`, `proxyThreads`, ...).
//!
//! ## When aggregates close
//!
//! An aggregate closes as soon as it reaches `max_items_per_aggregate` or
//! `max_uncompressed_bytes`. Otherwise it stays open across passes, its entries
//! still staged, until it is `max_aggregate_age_ms` old. With `close_on_pass_end`
//! set, every open aggregate closes at the end of each pass instead.

use feedhouse_core::{duration_ms, headers, AttributeMap};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// What separates one aggregate from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    /// One aggregate stream per feed
    Feed,
    /// One aggregate stream per feed and type
    FeedAndType,
}

/// Partition an entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub feed: String,
    pub data_type: Option<String>,
}

impl PartitionBy {
    pub fn key_for(&self, attributes: &AttributeMap) -> GroupKey {
        let feed = attributes
            .get_non_empty(headers::FEED)
            .unwrap_or_default()
            .to_string();
        let data_type = match self {
            PartitionBy::Feed => None,
            PartitionBy::FeedAndType => attributes
                .get_non_empty(headers::TYPE)
                .map(str::to_string),
        };
        GroupKey { feed, data_type }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Entries per aggregate (default: 1000)
    #[serde(
        default = "default_max_items",
        alias = "maxItemsPerAggregate",
        alias = "maxFilesPerAggregate"
    )]
    pub max_items_per_aggregate: usize,

    /// Uncompressed bytes per aggregate; a larger single entry is sent alone (default: 1 GiB)
    #[serde(
        default = "default_max_bytes",
        alias = "maxUncompressedByteSize",
        alias = "maxUncompressedFileSize"
    )]
    pub max_uncompressed_bytes: u64,

    /// Age of the oldest entry that forces an aggregate closed (default: 10 min)
    #[serde(
        default = "default_max_age",
        with = "duration_ms",
        rename = "max_aggregate_age_ms",
        alias = "maxAggregateAge"
    )]
    pub max_aggregate_age: Duration,

    /// Interval between passes (default: 1 min)
    #[serde(
        default = "default_frequency",
        with = "duration_ms",
        rename = "aggregation_frequency_ms",
        alias = "aggregationFrequency"
    )]
    pub aggregation_frequency: Duration,

    /// Entries inspected per pass (default: 100000)
    #[serde(default = "default_max_file_scan", alias = "maxFileScan")]
    pub max_file_scan: usize,

    /// Staged files open at once during a pass (default: 100000)
    #[serde(default = "default_max_mapped", alias = "maxConcurrentMappedFiles")]
    pub max_concurrent_mapped_files: usize,

    /// Parallel entry reads (default: 10)
    #[serde(default = "default_proxy_threads", alias = "proxyThreads")]
    pub proxy_threads: usize,

    #[serde(default = "default_partition_by")]
    pub partition_by: PartitionBy,

    /// Close every open aggregate at the end of each pass instead of waiting
    /// for `max_aggregate_age_ms` (default: false)
    #[serde(default)]
    pub close_on_pass_end: bool,

    /// How long `stop` waits for an in-flight pass (default: 30s)
    #[serde(
        default = "default_drain_timeout",
        with = "duration_ms",
        rename = "drain_timeout_ms"
    )]
    pub drain_timeout: Duration,
}

fn default_max_items() -> usize {
    1000
}

fn default_max_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_age() -> Duration {
    Duration::from_secs(600)
}

fn default_frequency() -> Duration {
    Duration::from_secs(60)
}

fn default_max_file_scan() -> usize {
    100_000
}

fn default_max_mapped() -> usize {
    100_000
}

fn default_proxy_threads() -> usize {
    10
}

fn default_partition_by() -> PartitionBy {
    PartitionBy::FeedAndType
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_aggregate: default_max_items(),
            max_uncompressed_bytes: default_max_bytes(),
            max_aggregate_age: default_max_age(),
            aggregation_frequency: default_frequency(),
            max_file_scan: default_max_file_scan(),
            max_concurrent_mapped_files: default_max_mapped(),
            proxy_threads: default_proxy_threads(),
            partition_by: default_partition_by(),
            close_on_pass_end: false,
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl AggregatorConfig {
    /// Clamp limits into a consistent range.
    ///
    /// Zero limits become 1 and `proxy_threads` never exceeds
    /// `max_concurrent_mapped_files`.
    pub fn normalized(mut self) -> Self {
        self.max_items_per_aggregate = self.max_items_per_aggregate.max(1);
        self.max_file_scan = self.max_file_scan.max(1);
        self.max_concurrent_mapped_files = self.max_concurrent_mapped_files.max(1);
        self.proxy_threads = self.proxy_threads.max(1);

        if self.proxy_threads > self.max_concurrent_mapped_files {
            warn!(
                proxy_threads = self.proxy_threads,
                max_concurrent_mapped_files = self.max_concurrent_mapped_files,
                "proxy_threads exceeds max_concurrent_mapped_files, clamping"
            );
            self.proxy_threads = self.max_concurrent_mapped_files;
        }
        self
    }
}
