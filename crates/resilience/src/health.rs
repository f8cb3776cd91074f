//! Per-dependency health bookkeeping and the probe interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Latency above which a component's score starts to drop (1 point per 10 ms).
pub const LATENCY_BUDGET_MS: f64 = 500.0;

/// How much a dependency matters to the level decision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTier {
    /// The system of record (database). Losing it caps the system at Minimal.
    Critical,
    /// The primary inference service. Losing it caps the system at Limited.
    Primary,
    /// Cache, object store and other auxiliaries.
    NonCritical,
}

/// Why a probe could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Outcome of one health check: `Ok(healthy)` or the reason the check itself failed.
pub type HealthCheckResult = Result<bool, ProbeError>;

/// A named health check against one dependency.
pub trait HealthProbe: Send + Sync {
    fn check(&self) -> HealthCheckResult;
}

impl<F> HealthProbe for F
where
    F: Fn() -> HealthCheckResult + Send + Sync,
{
    fn check(&self) -> HealthCheckResult {
        self()
    }
}

/// Pin a closure's signature so it can be passed where a [`HealthProbe`] is expected.
///
/// `register_probe(.., probe_fn(|| Ok(ping())), ..)` instead of annotating the
/// closure's return type by hand.
pub fn probe_fn<F>(check: F) -> F
where
    F: Fn() -> HealthCheckResult + Send + Sync,
{
    check
}

/// Rolling health record of a single dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub tier: ProbeTier,
    pub is_healthy: bool,
    pub failure_count: u64,
    pub success_count: u64,
    pub avg_latency_ms: f64,
    pub weight: f64,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, tier: ProbeTier, weight: f64) -> Self {
        Self {
            name: name.into(),
            tier,
            is_healthy: true,
            failure_count: 0,
            success_count: 0,
            avg_latency_ms: 0.0,
            weight,
            last_error: None,
            last_check: None,
        }
    }

    /// Record a healthy check.
    ///
    /// A success forgives one past failure; it does not wipe the history.
    pub fn record_success(&mut self, latency_ms: f64) {
        self.success_count += 1;
        self.failure_count = self.failure_count.saturating_sub(1);
        // Running mean over successful checks.
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.success_count as f64;
        self.is_healthy = true;
        self.last_check = Some(Utc::now());
    }

    /// Record an unhealthy check (or a check that could not run).
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failure_count += 1;
        self.is_healthy = false;
        self.last_error = Some(error.into());
        self.last_check = Some(Utc::now());
    }

    pub fn observations(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.observations() {
            0 => 1.0,
            n => self.success_count as f64 / n as f64,
        }
    }

    /// Score in `[0, 100]`: success rate minus a latency penalty.
    pub fn health_score(&self) -> f64 {
        if self.observations() == 0 {
            return 100.0;
        }
        let latency_penalty = ((self.avg_latency_ms - LATENCY_BUDGET_MS) / 10.0).max(0.0);
        (100.0 * self.success_rate() - latency_penalty).clamp(0.0, 100.0)
    }
}
