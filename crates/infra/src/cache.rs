//! Cache invalidation hook.
//!
//! The stock service invalidates a product's cache entries before it mutates the
//! row. Invalidation is best-effort: failures are logged and never abort the
//! transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use stockwarden_core::ProductId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cache invalidation failed for '{key}': {reason}")]
pub struct CacheError {
    pub key: String,
    pub reason: String,
}

pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

pub fn product_key(product_id: ProductId) -> String {
    format!("product:{product_id}")
}

pub fn stock_key(product_id: ProductId) -> String {
    format!("stock:{product_id}")
}

/// Invalidate every cache entry derived from `product_id`, logging failures.
pub fn invalidate_product(cache: &dyn CacheInvalidator, product_id: ProductId) {
    for key in [product_key(product_id), stock_key(product_id)] {
        if let Err(err) = cache.invalidate(&key) {
            warn!(product_id = %product_id, key = %key, error = %err, "cache invalidation failed");
        }
    }
}

/// No cache configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Invalidations remembered by [`InMemoryCache`]; older keys are dropped.
pub const INVALIDATION_LOG_CAPACITY: usize = 1024;

/// Small TTL cache for dev/tests; remembers the most recent invalidations.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    ttl: Duration,
    invalidated: Mutex<VecDeque<String>>,
    unavailable: AtomicBool,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl InMemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            invalidated: Mutex::new(VecDeque::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), (value.into(), Instant::now() + self.ttl));
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    /// Most recent invalidated keys, oldest first.
    pub fn invalidated_keys(&self) -> Vec<String> {
        self.invalidated
            .lock()
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate an unreachable cache backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl CacheInvalidator for InMemoryCache {
    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError {
                key: key.to_string(),
                reason: "cache unreachable".to_string(),
            });
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
        if let Ok(mut keys) = self.invalidated.lock() {
            if keys.len() == INVALIDATION_LOG_CAPACITY {
                keys.pop_front();
            }
            keys.push_back(key.to_string());
        }
        Ok(())
    }
}
