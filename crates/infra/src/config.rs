//! Configuration loading and representation.
//!
//! Every setting has a default; `from_env` overlays environment variables on
//! top. Unparsable values are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use stockwarden_resilience::CircuitBreakerConfig;

use crate::retry::RetryPolicy;

pub const ENV_RECOVERY_INTERVAL_SECS: &str = "STOCKWARDEN_RECOVERY_INTERVAL_SECS";
pub const ENV_RECOVERY_CONFIRMATIONS: &str = "STOCKWARDEN_RECOVERY_CONFIRMATIONS";
pub const ENV_MAX_RETRIES: &str = "STOCKWARDEN_MAX_RETRIES";
pub const ENV_BACKOFF_BASE_MS: &str = "STOCKWARDEN_BACKOFF_BASE_MS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "STOCKWARDEN_LOCK_TIMEOUT_MS";
pub const ENV_STORAGE_BREAKER_THRESHOLD: &str = "STOCKWARDEN_STORAGE_BREAKER_THRESHOLD";
pub const ENV_STORAGE_BREAKER_TIMEOUT_SECS: &str = "STOCKWARDEN_STORAGE_BREAKER_TIMEOUT_SECS";

/// Recovery loop cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryLoopConfig {
    pub interval: Duration,
    /// Consecutive passes an improvement must be observed before it is applied.
    pub recovery_confirmations: u32,
}

impl Default for RecoveryLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            recovery_confirmations: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockServiceConfig {
    pub retry: RetryPolicy,
    /// Bounded wait for a product row lock.
    pub lock_timeout: Duration,
}

impl Default for StockServiceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockwardenConfig {
    pub recovery: RecoveryLoopConfig,
    pub stock: StockServiceConfig,
    pub storage_breaker: CircuitBreakerConfig,
    pub document_breaker: CircuitBreakerConfig,
}

impl Default for StockwardenConfig {
    fn default() -> Self {
        Self {
            recovery: RecoveryLoopConfig::default(),
            stock: StockServiceConfig::default(),
            storage_breaker: CircuitBreakerConfig::for_storage(),
            document_breaker: CircuitBreakerConfig::for_document_recognition(),
        }
    }
}

impl StockwardenConfig {
    /// Defaults overlaid with `STOCKWARDEN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(secs) = positive::<u64>(&lookup, ENV_RECOVERY_INTERVAL_SECS) {
            cfg.recovery.interval = Duration::from_secs(secs);
        }
        if let Some(n) = positive::<u32>(&lookup, ENV_RECOVERY_CONFIRMATIONS) {
            cfg.recovery.recovery_confirmations = n;
        }
        if let Some(n) = positive::<u32>(&lookup, ENV_MAX_RETRIES) {
            cfg.stock.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BACKOFF_BASE_MS) {
            cfg.stock.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = positive::<u64>(&lookup, ENV_LOCK_TIMEOUT_MS) {
            cfg.stock.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = positive::<u32>(&lookup, ENV_STORAGE_BREAKER_THRESHOLD) {
            cfg.storage_breaker = cfg.storage_breaker.with_failure_threshold(n);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_STORAGE_BREAKER_TIMEOUT_SECS) {
            cfg.storage_breaker = cfg.storage_breaker.with_recovery_timeout(Duration::from_secs(secs));
        }

        cfg
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = key, value = %raw, "unparsable environment variable; keeping default");
            None
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse_var::<T>(lookup, key)?;
    if value > T::default() {
        Some(value)
    } else {
        warn!(var = key, "environment variable must be positive; keeping default");
        None
    }
}
