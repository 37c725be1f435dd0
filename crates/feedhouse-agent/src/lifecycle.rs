//! Lifecycle - Scheduling and Graceful Drain
//!
//! Owns the aggregation schedule. Once started, a background task triggers a
//! pass every `aggregation_frequency`; ticks that fall due while a pass is still
//! running are skipped rather than queued.
//!
//! ## Lifecycle
//!
//! 1. **Build**: wire the repository store, the forwarder and the settings
//! 2. **Start**: spawn the schedule
//! 3. **Run**: passes fire on the timer, or on demand via `trigger_pass`
//! 4. **Stop**: cancel, wait up to `drain_timeout` for the in-flight pass, close
//!    destinations (flushing rolling outputs)
//!
//! ## Example
//!
//! ```rust,no_run
//! use feedhouse_agent::{AggregatorConfig, ProxyLifecycle};
//! use feedhouse_forward::Forwarder;
//! use feedhouse_storage::RepositoryStore;
//! use std::sync::Arc;
//!
//! # async fn example(store: RepositoryStore, forwarder: Arc<Forwarder>) -> Result<(), Box<dyn std::error::Error>> {
//! let lifecycle = ProxyLifecycle::builder()
//!     .store(store)
//!     .forwarder(forwarder)
//!     .config(AggregatorConfig::default())
//!     .build()?;
//!
//! lifecycle.start().await?;
//! // ... receive traffic ...
//! lifecycle.stop().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use feedhouse_forward::{DestinationStatus, Forwarder};
use feedhouse_storage::RepositoryStore;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, PassReport};
use crate::config::AggregatorConfig;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Stopped,
}

/// Outcome of the most recent pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LastPass {
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<PassReport>,
    pub error: Option<String>,
}

/// Scheduler and destination health.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleHealth {
    pub state: LifecycleState,
    /// The schedule is running
    pub scanner_running: bool,
    /// A pass is executing right now
    pub pass_in_progress: bool,
    pub open_entries: usize,
    pub last_pass: LastPass,
    pub destinations: Vec<DestinationStatus>,
}

impl LifecycleHealth {
    /// Ready to take traffic: scheduler up and no required destination tripped.
    pub fn is_ready(&self) -> bool {
        self.scanner_running
            && self
                .destinations
                .iter()
                .filter(|d| d.required)
                .all(|d| d.circuit != feedhouse_forward::CircuitState::Open)
    }
}

pub struct ProxyLifecycle {
    aggregator: Arc<Aggregator>,
    state: RwLock<LifecycleState>,
    cancel: RwLock<CancellationToken>,
    handle: RwLock<Option<JoinHandle<()>>>,
    last_pass: Arc<StdMutex<LastPass>>,
}

impl ProxyLifecycle {
    pub fn builder() -> ProxyLifecycleBuilder {
        ProxyLifecycleBuilder::new()
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        self.aggregator.forwarder()
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Spawn the aggregation schedule.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == LifecycleState::Started {
            return Err(AgentError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        *self.cancel.write().await = cancel.clone();

        let aggregator = Arc::clone(&self.aggregator);
        let last_pass = Arc::clone(&self.last_pass);
        let frequency = aggregator.config().aggregation_frequency;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = aggregator.run_pass(&cancel).await;
                        record(&last_pass, &outcome);
                    }
                }
            }
            info!("Aggregation schedule stopped");
        });
        *self.handle.write().await = Some(handle);
        *state = LifecycleState::Started;

        info!(
            frequency_ms = frequency.as_millis() as u64,
            destinations = self.forwarder().destination_count(),
            "Aggregation schedule started"
        );
        Ok(())
    }

    /// Stop the schedule, draining the in-flight pass.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != LifecycleState::Started {
            warn!("Lifecycle not started, skipping stop");
            return Ok(());
        }

        info!("Stopping aggregation schedule");
        self.cancel.read().await.cancel();

        if let Some(mut handle) = self.handle.write().await.take() {
            let drain = self.aggregator.config().drain_timeout;
            match tokio::time::timeout(drain, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Aggregation task failed"),
                Err(_) => {
                    warn!(
                        drain_timeout_ms = drain.as_millis() as u64,
                        "In-flight pass did not finish in time, aborting"
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.forwarder().close().await;
        *state = LifecycleState::Stopped;
        info!("Aggregation schedule stopped gracefully");
        Ok(())
    }

    /// Run a pass now, outside the schedule. Still single-flight.
    pub async fn trigger_pass(&self) -> Result<PassReport> {
        let cancel = self.cancel.read().await.clone();
        let outcome = self.aggregator.run_pass(&cancel).await;
        record(&self.last_pass, &outcome);
        outcome
    }

    pub async fn health(&self) -> LifecycleHealth {
        let state = *self.state.read().await;
        let scanner_running = state == LifecycleState::Started
            && self
                .handle
                .read()
                .await
                .as_ref()
                .map_or(false, |handle| !handle.is_finished());

        LifecycleHealth {
            state,
            scanner_running,
            pass_in_progress: self.aggregator.is_running(),
            open_entries: self.aggregator.claimed_entries(),
            last_pass: lock_last(&self.last_pass).clone(),
            destinations: self.forwarder().status(),
        }
    }
}

fn lock_last(last: &StdMutex<LastPass>) -> std::sync::MutexGuard<'_, LastPass> {
    last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(last: &StdMutex<LastPass>, outcome: &Result<PassReport>) {
    // Skipped triggers say nothing about the pass that is running.
    if matches!(outcome, Ok(report) if report.skipped) {
        return;
    }

    let mut last = lock_last(last);
    last.finished_at = Some(Utc::now());
    match outcome {
        Ok(report) => {
            last.report = Some(report.clone());
            last.error = None;
        }
        Err(e) => {
            error!(error = %e, "Aggregation pass failed");
            last.error = Some(e.to_string());
        }
    }
}

/// Builder for ProxyLifecycle
pub struct ProxyLifecycleBuilder {
    store: Option<RepositoryStore>,
    forwarder: Option<Arc<Forwarder>>,
    config: AggregatorConfig,
}

impl ProxyLifecycleBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            forwarder: None,
            config: AggregatorConfig::default(),
        }
    }

    pub fn store(mut self, store: RepositoryStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ProxyLifecycle> {
        let store = self
            .store
            .ok_or_else(|| AgentError::Config("store is required".to_string()))?;
        let forwarder = self
            .forwarder
            .ok_or_else(|| AgentError::Config("forwarder is required".to_string()))?;

        Ok(ProxyLifecycle {
            aggregator: Arc::new(Aggregator::new(store, forwarder, self.config)),
            state: RwLock::new(LifecycleState::Created),
            cancel: RwLock::new(CancellationToken::new()),
            handle: RwLock::new(None),
            last_pass: Arc::new(StdMutex::new(LastPass::default())),
        })
    }
}

impl Default for ProxyLifecycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
