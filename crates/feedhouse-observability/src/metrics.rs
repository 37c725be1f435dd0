use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Receive Metrics
    // ============================================================================

    /// Ingestion requests by feed and outcome
    pub static ref RECEIVE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_receive_requests_total", "Total ingestion requests"),
        &["feed", "status"]
    ).expect("metric can be created");

    /// Payload bytes staged, after decompression
    pub static ref RECEIVE_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_receive_bytes_total", "Total payload bytes staged"),
        &["feed"]
    ).expect("metric can be created");

    /// Entries committed to the repository
    pub static ref STAGED_ENTRIES_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_staged_entries_total",
        "Total entries committed to the repository"
    ).expect("metric can be created");

    /// Ingestion latency
    pub static ref RECEIVE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("feedhouse_receive_latency_seconds", "Time to validate and stage a submission")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    ).expect("metric can be created");

    // ============================================================================
    // Repository Metrics
    // ============================================================================

    /// Highest allocated repository id
    pub static ref REPOSITORY_MAX_ID: IntGauge = IntGauge::new(
        "feedhouse_repository_max_id",
        "Highest allocated repository id"
    ).expect("metric can be created");

    /// Submissions moved aside because they could not be read
    pub static ref QUARANTINED_TOTAL: IntCounter = IntCounter::new(
        "feedhouse_quarantined_total",
        "Total submissions moved to the failed directory"
    ).expect("metric can be created");

    // ============================================================================
    // Aggregation Metrics
    // ============================================================================

    /// Duration of a full scan/group/close pass
    pub static ref AGGREGATION_PASS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("feedhouse_aggregation_pass_seconds", "Aggregation pass duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0])
    ).expect("metric can be created");

    /// Passes skipped because one was already running
    pub static ref AGGREGATION_PASSES_SKIPPED: IntCounter = IntCounter::new(
        "feedhouse_aggregation_passes_skipped_total",
        "Total aggregation triggers dropped while a pass was running"
    ).expect("metric can be created");

    /// Aggregates closed, by outcome
    pub static ref AGGREGATES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_aggregates_total", "Total aggregates closed"),
        &["outcome"]
    ).expect("metric can be created");

    /// Items per closed aggregate
    pub static ref AGGREGATE_ITEMS: Histogram = Histogram::with_opts(
        HistogramOpts::new("feedhouse_aggregate_items", "Entries per aggregate")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0])
    ).expect("metric can be created");

    /// Aggregates currently open
    pub static ref OPEN_AGGREGATES: IntGauge = IntGauge::new(
        "feedhouse_open_aggregates",
        "Aggregates currently open"
    ).expect("metric can be created");

    // ============================================================================
    // Forward Metrics
    // ============================================================================

    /// Deliveries per destination and outcome
    pub static ref FORWARD_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_forward_total", "Total deliveries attempted"),
        &["destination", "outcome"]
    ).expect("metric can be created");

    /// Delivery latency per destination
    pub static ref FORWARD_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("feedhouse_forward_latency_seconds", "Delivery latency in seconds")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0]),
        &["destination"]
    ).expect("metric can be created");

    /// Rolled outputs handed to the inner destination
    pub static ref ROLLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedhouse_rolls_total", "Total rolling output rotations"),
        &["destination"]
    ).expect("metric can be created");
}

/// Register every metric with `REGISTRY`. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(RECEIVE_REQUESTS_TOTAL.clone()))
            .expect("receive_requests_total can be registered");
        REGISTRY
            .register(Box::new(RECEIVE_BYTES_TOTAL.clone()))
            .expect("receive_bytes_total can be registered");
        REGISTRY
            .register(Box::new(STAGED_ENTRIES_TOTAL.clone()))
            .expect("staged_entries_total can be registered");
        REGISTRY
            .register(Box::new(RECEIVE_LATENCY.clone()))
            .expect("receive_latency can be registered");

        REGISTRY
            .register(Box::new(REPOSITORY_MAX_ID.clone()))
            .expect("repository_max_id can be registered");
        REGISTRY
            .register(Box::new(QUARANTINED_TOTAL.clone()))
            .expect("quarantined_total can be registered");

        REGISTRY
            .register(Box::new(AGGREGATION_PASS_DURATION.clone()))
            .expect("aggregation_pass_duration can be registered");
        REGISTRY
            .register(Box::new(AGGREGATION_PASSES_SKIPPED.clone()))
            .expect("aggregation_passes_skipped can be registered");
        REGISTRY
            .register(Box::new(AGGREGATES_TOTAL.clone()))
            .expect("aggregates_total can be registered");
        REGISTRY
            .register(Box::new(AGGREGATE_ITEMS.clone()))
            .expect("aggregate_items can be registered");
        REGISTRY
            .register(Box::new(OPEN_AGGREGATES.clone()))
            .expect("open_aggregates can be registered");

        REGISTRY
            .register(Box::new(FORWARD_TOTAL.clone()))
            .expect("forward_total can be registered");
        REGISTRY
            .register(Box::new(FORWARD_LATENCY.clone()))
            .expect("forward_latency can be registered");
        REGISTRY
            .register(Box::new(ROLLS_TOTAL.clone()))
            .expect("rolls_total can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        // If no panic, registration succeeded
    }

    #[test]
    fn test_receive_metrics() {
        RECEIVE_REQUESTS_TOTAL
            .with_label_values(&["metrics-test-feed", "ok"])
            .inc();
        RECEIVE_BYTES_TOTAL
            .with_label_values(&["metrics-test-feed"])
            .inc_by(1024);

        assert_eq!(
            RECEIVE_REQUESTS_TOTAL
                .with_label_values(&["metrics-test-feed", "ok"])
                .get(),
            1
        );
        assert_eq!(
            RECEIVE_BYTES_TOTAL
                .with_label_values(&["metrics-test-feed"])
                .get(),
            1024
        );
    }

    #[test]
    fn test_forward_latency() {
        FORWARD_LATENCY
            .with_label_values(&["metrics-test-dest"])
            .observe(0.25);
        assert_eq!(
            FORWARD_LATENCY
                .with_label_values(&["metrics-test-dest"])
                .get_sample_count(),
            1
        );
    }
}
