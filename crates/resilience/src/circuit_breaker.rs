//! Circuit breaker guarding one class of operation.
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[recovery_timeout elapsed, next call]-----> HalfOpen
//! HalfOpen --[success_threshold successes]-------------> Closed
//! HalfOpen --[any failure]-----------------------------> Open
//! ```
//!
//! One breaker per operation class: sharing a breaker between unrelated
//! operations lets failures of one kind block the other.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl core::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before an open circuit lets a trial call through.
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// Half-open successes needed to close the circuit again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Storage reads: trip early, recover quickly.
    pub fn for_storage() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    /// Slow document recognition calls.
    pub fn for_document_recognition() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{breaker}' is open; retry after {retry_after:?}")]
    Rejected {
        breaker: String,
        retry_after: Duration,
    },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitBreakerError::Rejected { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Rejected { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    /// Time since the failure that (re)opened the circuit.
    pub since_last_failure_ms: Option<u64>,
    pub times_opened: u64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    last_failure_time: Option<Instant>,
    times_opened: u64,
}

/// Thread-safe circuit breaker.
///
/// The internal lock is never held while the wrapped operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejected calls never invoke `operation`. Failed calls update breaker state
    /// and hand the operation's own error back as `Inner`.
    pub fn call<T, E, F>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit().map_err(|retry_after| CircuitBreakerError::Rejected {
            breaker: self.name.clone(),
            retry_after,
        })?;

        match operation() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Force the breaker closed (administrative override).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_successes = 0;
        inner.last_failure_time = None;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            since_last_failure_ms: inner
                .last_failure_time
                .map(|t| t.elapsed().as_millis().min(u64::MAX as u128) as u64),
            times_opened: inner.times_opened,
        }
    }

    /// Decide whether a call may proceed; `Err` carries the remaining cool-down.
    fn admit(&self) -> Result<(), Duration> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed > self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!(breaker = %self.name, "circuit breaker half-open, allowing trial call");
            return Ok(());
        }

        Err(self.config.recovery_timeout.saturating_sub(elapsed))
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            // A call admitted before another thread re-opened the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                self.trip(&mut inner);
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.trip(&mut inner);
            }
            CircuitState::Closed => {}
            CircuitState::Open => inner.last_failure_time = Some(Instant::now()),
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.last_failure_time = Some(Instant::now());
        inner.times_opened += 1;
        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Breaker bookkeeping cannot be left half-updated; recover from poisoning.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
