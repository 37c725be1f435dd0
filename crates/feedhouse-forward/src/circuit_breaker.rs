//! Destination Health
//!
//! Each destination sits behind a circuit breaker so a dead downstream is not hit
//! on every aggregation pass, and so health checks can report it.
//!
//! ```text
//! ┌────────┐  failures >= threshold  ┌──────┐
//! │ Closed │ ──────────────────────> │ Open │
//! └───┬────┘                         └───┬──┘
//!     ▲                                  │ open_timeout elapsed
//!     │ successes >= threshold           ▼
//!     │                            ┌──────────┐
//!     └─────────────────────────── │ HalfOpen │ ── any failure ──> Open
//!                                  └──────────┘
//! ```
//!
//! A delivery skipped because the circuit is open counts as a failed delivery:
//! the aggregate's entries stay staged and are retried on a later pass.

use feedhouse_core::duration_ms;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Circuit state as seen by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed deliveries before the circuit opens (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes in half-open before closing (default: 1)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time spent open before a probe delivery is allowed (default: 30s)
    #[serde(
        default = "default_open_timeout",
        with = "duration_ms",
        rename = "open_timeout_ms"
    )]
    pub open_timeout: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout: default_open_timeout(),
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    /// Milliseconds since epoch when the circuit last opened
    opened_at: AtomicU64,
    last_error: Mutex<Option<String>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            last_error: Mutex::new(None),
            config,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Whether a delivery may be attempted now. Moves an expired open circuit to
    /// half-open.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = Self::now_ms().saturating_sub(self.opened_at.load(Ordering::Acquire));
                if elapsed >= self.config.open_timeout.as_millis() as u64 {
                    self.set_state(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.set_state(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
        *self.last_error_slot() = None;
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        *self.last_error_slot() = Some(reason.into());
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error_slot().clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    fn open(&self) {
        self.opened_at.store(Self::now_ms(), Ordering::Release);
        self.set_state(CircuitState::Open);
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
    }

    fn last_error_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn breaker(failure_threshold: u32, open_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            open_timeout,
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
        assert!(breaker.last_error().is_none());
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let breaker = breaker(3, Duration::from_secs(10));

        breaker.record_failure("refused");
        breaker.record_failure("refused");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.record_failure("refused");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.last_error().as_deref(), Some("refused"));
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = breaker(3, Duration::from_secs(10));
        breaker.record_failure("x");
        breaker.record_failure("x");
        breaker.record_success();

        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.last_error().is_none());
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure("down");
        assert!(!breaker.allow_request());

        sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let breaker = breaker(1, Duration::from_millis(50));
        breaker.record_failure("down");

        sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());

        breaker.record_failure("still down");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(CircuitState::from(0), CircuitState::Closed);
        assert_eq!(CircuitState::from(1), CircuitState::Open);
        assert_eq!(CircuitState::from(2), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(42), CircuitState::Closed);
    }
}
