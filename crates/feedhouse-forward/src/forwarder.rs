//! Fan-out of closed aggregates to every configured destination.
//!
//! Each destination gets the aggregate concurrently and under its own timeout.
//! The aggregate counts as forwarded when every *required* destination succeeded;
//! when no destination is marked required, one success is enough.

use futures::future::join_all;
use feedhouse_observability::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::traits::{AggregateFile, Destination};

/// A destination plus its delivery policy.
pub struct ForwardTarget {
    pub destination: Arc<dyn Destination>,
    pub required: bool,
    breaker: CircuitBreaker,
}

impl ForwardTarget {
    pub fn new(destination: Arc<dyn Destination>, required: bool, breaker: CircuitBreakerConfig) -> Self {
        Self {
            destination,
            required,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    pub fn name(&self) -> &str {
        self.destination.name()
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DestinationResult {
    pub name: String,
    pub required: bool,
    pub outcome: Result<(), String>,
}

/// Outcome of forwarding one aggregate.
#[derive(Debug, Clone, Default)]
pub struct ForwardReport {
    pub results: Vec<DestinationResult>,
}

impl ForwardReport {
    pub fn is_success(&self) -> bool {
        let mut required = self.results.iter().filter(|r| r.required).peekable();
        if required.peek().is_some() {
            required.all(|r| r.outcome.is_ok())
        } else {
            self.results.iter().any(|r| r.outcome.is_ok())
        }
    }

    /// `name: reason` for every failed destination.
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| format!("{}: {}", r.name, e)))
            .collect()
    }
}

/// Destination health as reported by `/status` and readiness.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationStatus {
    pub name: String,
    pub required: bool,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub struct Forwarder {
    targets: Vec<ForwardTarget>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(targets: Vec<ForwardTarget>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    pub fn destination_count(&self) -> usize {
        self.targets.len()
    }

    /// Deliver `aggregate` to every destination concurrently.
    pub async fn deliver(&self, aggregate: &AggregateFile) -> ForwardReport {
        let attempts = self
            .targets
            .iter()
            .map(|target| self.deliver_one(target, aggregate));
        ForwardReport {
            results: join_all(attempts).await,
        }
    }

    async fn deliver_one(&self, target: &ForwardTarget, aggregate: &AggregateFile) -> DestinationResult {
        let name = target.name().to_string();

        if !target.breaker.allow_request() {
            metrics::FORWARD_TOTAL
                .with_label_values(&[&name, "skipped"])
                .inc();
            debug!(destination = %name, "Circuit open, skipping delivery");
            return DestinationResult {
                name,
                required: target.required,
                outcome: Err("circuit open".to_string()),
            };
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, target.destination.deliver(aggregate)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        };
        metrics::FORWARD_LATENCY
            .with_label_values(&[&name])
            .observe(start.elapsed().as_secs_f64());

        match &outcome {
            Ok(()) => {
                target.breaker.record_success();
                metrics::FORWARD_TOTAL.with_label_values(&[&name, "success"]).inc();
                debug!(
                    destination = %name,
                    items = aggregate.item_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Aggregate delivered"
                );
            }
            Err(reason) => {
                target.breaker.record_failure(reason.clone());
                metrics::FORWARD_TOTAL.with_label_values(&[&name, "failure"]).inc();
                warn!(
                    destination = %name,
                    required = target.required,
                    error = %reason,
                    "Aggregate delivery failed"
                );
            }
        }

        DestinationResult {
            name,
            required: target.required,
            outcome,
        }
    }

    /// Drive per-destination housekeeping such as rolling schedules.
    pub async fn tick(&self) {
        let ticks = self.targets.iter().map(|target| async move {
            if let Err(e) = target.destination.tick().await {
                warn!(destination = %target.name(), error = %e, "Destination tick failed");
            }
        });
        join_all(ticks).await;
    }

    /// Flush and close every destination.
    pub async fn close(&self) {
        for target in &self.targets {
            if let Err(e) = target.destination.close().await {
                warn!(destination = %target.name(), error = %e, "Destination close failed");
            }
        }
    }

    pub fn status(&self) -> Vec<DestinationStatus> {
        self.targets
            .iter()
            .map(|target| DestinationStatus {
                name: target.name().to_string(),
                required: target.required,
                circuit: target.breaker.state(),
                consecutive_failures: target.breaker.consecutive_failures(),
                last_error: target.breaker.last_error(),
            })
            .collect()
    }

    /// False when a required destination's circuit is open.
    pub fn required_healthy(&self) -> bool {
        self.targets
            .iter()
            .filter(|target| target.required)
            .all(|target| target.breaker.state() != CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, required: bool, ok: bool) -> DestinationResult {
        DestinationResult {
            name: name.to_string(),
            required,
            outcome: if ok { Ok(()) } else { Err("down".to_string()) },
        }
    }

    #[test]
    fn test_required_destinations_decide_success() {
        let report = ForwardReport {
            results: vec![result("a", true, true), result("b", false, false)],
        };
        assert!(report.is_success());

        let report = ForwardReport {
            results: vec![result("a", true, true), result("b", true, false)],
        };
        assert!(!report.is_success());
        assert_eq!(report.failures(), vec!["b: down".to_string()]);
    }

    #[test]
    fn test_best_effort_only_needs_one_success() {
        let report = ForwardReport {
            results: vec![result("a", false, false), result("b", false, true)],
        };
        assert!(report.is_success());

        let report = ForwardReport {
            results: vec![result("a", false, false)],
        };
        assert!(!report.is_success());
    }

    #[test]
    fn test_empty_report_is_failure() {
        assert!(!ForwardReport::default().is_success());
    }
}
