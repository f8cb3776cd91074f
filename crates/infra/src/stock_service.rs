//! Atomic stock service.
//!
//! Every mutation runs inside one store session holding the product's row lock:
//! the locked row is re-validated, the movement rows and counters are written,
//! and everything commits together or not at all. Transient storage failures
//! (lock timeouts, busy backend) are retried with backoff; domain rejections
//! are returned as-is.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use stockwarden_core::{DomainError, LocationId, MovementId, ProductId, UserId};
use stockwarden_inventory::{
    MovementKind, Product, StockCheck, StockMovement, apply_delta, check_availability, ensure_movement_quantity,
    ensure_positive_quantity, plan_located_movement, plan_movement, plan_transfer, unflushed_delta,
};
use stockwarden_observability::metrics::{MetricsSink, NoopMetricsSink, OperationMetric};
use stockwarden_resilience::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot, DegradationLevel, Feature, FeatureGate,
};

use crate::cache::{CacheInvalidator, NoopCache, invalidate_product};
use crate::config::{StockServiceConfig, StockwardenConfig};
use crate::retry::RetryError;
use crate::session::{StockSession, StockStore, StockWrite, StoreError};

/// Stock service error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StockError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("circuit '{breaker}' is open; retry after {retry_after:?}")]
    CircuitOpen { breaker: String, retry_after: Duration },

    #[error("'{feature}' is unavailable while the system is {level}")]
    SystemDegraded {
        feature: Feature,
        level: DegradationLevel,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },

    #[error(transparent)]
    Storage(StoreError),

    #[error("document recognition failed: {0}")]
    Recognition(String),

    #[error("no document recognizer is configured")]
    RecognitionUnavailable,
}

impl StockError {
    /// Coarse label used in metrics.
    pub fn category(&self) -> &'static str {
        match self {
            StockError::Domain(_) => "validation",
            StockError::CircuitOpen { .. } => "circuit_open",
            StockError::SystemDegraded { .. } => "degraded",
            StockError::RetriesExhausted { .. } => "transient",
            StockError::Storage(_) => "storage",
            StockError::Recognition(_) | StockError::RecognitionUnavailable => "recognition",
        }
    }

    /// Whether the same call may succeed later without changing the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            StockError::CircuitOpen { .. } | StockError::RetriesExhausted { .. } => true,
            StockError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, StockError::Storage(err) if err.is_transient())
    }
}

impl<E> From<CircuitBreakerError<E>> for StockError
where
    E: Into<StockError>,
{
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Rejected { breaker, retry_after } => StockError::CircuitOpen { breaker, retry_after },
            CircuitBreakerError::Inner(inner) => inner.into(),
        }
    }
}

impl From<StoreError> for StockError {
    fn from(err: StoreError) -> Self {
        StockError::Storage(err)
    }
}

/// Failure inside a session: a domain rejection rolls back without counting
/// against the storage breaker; a permanent store error does.
#[derive(Debug)]
enum TxError {
    Domain(DomainError),
    Store(StoreError),
}

impl From<DomainError> for TxError {
    fn from(err: DomainError) -> Self {
        TxError::Domain(err)
    }
}

impl From<StoreError> for TxError {
    fn from(err: StoreError) -> Self {
        TxError::Store(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub product_id: ProductId,
    /// Positive, except for `Adjust` where the sign gives the direction.
    pub quantity: i64,
    pub kind: MovementKind,
    pub reason: String,
    pub actor_id: Option<UserId>,
    pub location_id: Option<LocationId>,
}

impl MovementRequest {
    pub fn new(product_id: ProductId, kind: MovementKind, quantity: i64, reason: impl Into<String>) -> Self {
        Self {
            product_id,
            quantity,
            kind,
            reason: reason.into(),
            actor_id: None,
            location_id: None,
        }
    }

    pub fn at(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn by(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementOutcome {
    pub movement_id: MovementId,
    /// Committed `stock_actual`.
    pub final_stock: i64,
    /// Committed location counter, for located movements.
    pub location_stock: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub product_id: ProductId,
    pub quantity: i64,
    pub origin: LocationId,
    pub destination: LocationId,
    pub reason: String,
    pub actor_id: Option<UserId>,
}

impl TransferRequest {
    pub fn new(
        product_id: ProductId,
        quantity: i64,
        origin: LocationId,
        destination: LocationId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            quantity,
            origin,
            destination,
            reason: reason.into(),
            actor_id: None,
        }
    }

    pub fn by(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub out_movement_id: MovementId,
    pub in_movement_id: MovementId,
    pub origin_stock: i64,
    pub destination_stock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub flushed: usize,
    pub final_stock: i64,
}

/// One line read off a delivery note or invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedLine {
    pub sku: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedDocument {
    pub lines: Vec<RecognizedLine>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RecognitionError(pub String);

/// External document recognition (OCR/ML) collaborator.
pub trait DocumentRecognizer: Send + Sync {
    fn recognize(&self, document: &[u8]) -> Result<RecognizedDocument, RecognitionError>;
}

impl From<RecognitionError> for StockError {
    fn from(err: RecognitionError) -> Self {
        StockError::Recognition(err.0)
    }
}

/// Stock mutations under row locks, retry and circuit breakers.
pub struct AtomicStockService<S, G> {
    store: Arc<S>,
    gate: G,
    config: StockServiceConfig,
    storage_breaker: CircuitBreaker,
    recognition_breaker: CircuitBreaker,
    cache: Arc<dyn CacheInvalidator>,
    metrics: Arc<dyn MetricsSink>,
    recognizer: Option<Arc<dyn DocumentRecognizer>>,
}

impl<S, G> AtomicStockService<S, G>
where
    S: StockStore,
    G: FeatureGate,
{
    pub fn new(store: Arc<S>, gate: G, config: &StockwardenConfig) -> Self {
        Self {
            store,
            gate,
            config: config.stock.clone(),
            storage_breaker: CircuitBreaker::new("storage", config.storage_breaker.clone()),
            recognition_breaker: CircuitBreaker::new("document_recognition", config.document_breaker.clone()),
            cache: Arc::new(NoopCache),
            metrics: Arc::new(NoopMetricsSink),
            recognizer: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn DocumentRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        vec![self.storage_breaker.snapshot(), self.recognition_breaker.snapshot()]
    }

    /// Read-only sufficiency check against `stock_actual` reconciled with staged
    /// unflushed movements.
    pub fn validate_sufficient_stock(&self, product_id: ProductId, quantity: i64) -> Result<StockCheck, StockError> {
        let started = Instant::now();
        let result = self
            .ensure_feature(Feature::ReadOperations)
            .and_then(|()| self.check_stock(product_id, quantity));
        self.record("validate_stock", None, &result, started);
        result
    }

    /// Apply one stock movement atomically.
    pub fn apply_movement(&self, request: MovementRequest) -> Result<MovementOutcome, StockError> {
        let started = Instant::now();
        let result = self.apply_movement_inner(&request);
        self.record("apply_movement", request.location_id, &result, started);
        result
    }

    /// Move units between two locations of one product; all-or-nothing.
    pub fn transfer_between_locations(&self, request: TransferRequest) -> Result<TransferOutcome, StockError> {
        let started = Instant::now();
        let result = self.transfer_inner(&request);
        self.record("transfer", Some(request.origin), &result, started);
        result
    }

    /// Fold staged unflushed movements into `stock_actual`, one movement row each.
    pub fn flush_unflushed(&self, product_id: ProductId) -> Result<FlushOutcome, StockError> {
        let started = Instant::now();
        let result = self.flush_inner(product_id);
        self.record("flush_unflushed", None, &result, started);
        result
    }

    /// Run document recognition behind its own circuit breaker.
    pub fn recognize_document(&self, document: &[u8]) -> Result<RecognizedDocument, StockError> {
        let started = Instant::now();
        let result = self.recognize_inner(document);
        self.record("recognize_document", None, &result, started);
        result
    }

    fn ensure_feature(&self, feature: Feature) -> Result<(), StockError> {
        if self.gate.allows(feature) {
            return Ok(());
        }
        let level = self.gate.current_level();
        warn!(feature = %feature, level = %level, "operation rejected by feature gate");
        Err(StockError::SystemDegraded { feature, level })
    }

    fn check_stock(&self, product_id: ProductId, quantity: i64) -> Result<StockCheck, StockError> {
        ensure_positive_quantity(quantity)?;

        // A missing product is a successful read as far as the breaker is concerned.
        let row: Option<(Product, i64)> = self.storage_breaker.call(|| {
            let Some(product) = self.store.load_product(product_id)? else {
                return Ok::<_, StoreError>(None);
            };
            let pending = self.store.unflushed_delta(product_id)?;
            Ok(Some((product, pending)))
        })?;

        let (product, pending) = row.ok_or(DomainError::ProductNotFound(product_id))?;
        product.ensure_active()?;
        Ok(check_availability(&product, pending, quantity)?)
    }

    fn apply_movement_inner(&self, request: &MovementRequest) -> Result<MovementOutcome, StockError> {
        self.ensure_feature(Feature::WriteOperations)?;
        ensure_movement_quantity(request.kind, request.quantity)?;

        let product_id = request.product_id;
        if request.kind.is_outbound() {
            let check = self.check_stock(product_id, request.quantity)?;
            if !check.sufficient {
                return Err(DomainError::insufficient(product_id, request.quantity, check.current).into());
            }
        }

        let outcome = self.transact("apply_movement", product_id, |session| {
            let product = session.product()?.ok_or(DomainError::ProductNotFound(product_id))?;
            let pending = unflushed_delta(&session.unflushed()?);

            let (final_stock, location_stock) = match request.location_id {
                Some(location_id) => {
                    let current = session.location_stock(location_id)?;
                    let (stock, at_location) =
                        plan_located_movement(&product, pending, current, request.kind, request.quantity)?;
                    (stock, Some(at_location))
                }
                None => (plan_movement(&product, pending, request.kind, request.quantity)?, None),
            };

            invalidate_product(self.cache.as_ref(), product_id);

            let movement = StockMovement::new(
                product_id,
                request.quantity,
                request.kind,
                request.reason.clone(),
                request.location_id,
                request.actor_id,
                Utc::now(),
            )?;
            let movement_id = movement.id;
            session.execute(StockWrite::InsertMovement(movement))?;
            session.execute(StockWrite::SetProductStock {
                product_id,
                stock: final_stock,
            })?;
            if let (Some(location_id), Some(stock)) = (request.location_id, location_stock) {
                session.execute(StockWrite::SetLocationStock {
                    product_id,
                    location_id,
                    stock,
                })?;
            }

            Ok(MovementOutcome {
                movement_id,
                final_stock,
                location_stock,
            })
        })?;

        info!(
            product_id = %product_id,
            kind = %request.kind,
            quantity = request.quantity,
            final_stock = outcome.final_stock,
            "stock movement applied"
        );
        Ok(outcome)
    }

    fn transfer_inner(&self, request: &TransferRequest) -> Result<TransferOutcome, StockError> {
        self.ensure_feature(Feature::WriteOperations)?;
        ensure_positive_quantity(request.quantity)?;
        if request.origin == request.destination {
            return Err(DomainError::invalid_transfer("origin and destination must differ").into());
        }

        let product_id = request.product_id;
        let outcome = self.transact("transfer", product_id, |session| {
            let product = session.product()?.ok_or(DomainError::ProductNotFound(product_id))?;
            let origin_stock = session.location_stock(request.origin)?;
            let destination_stock = session.location_stock(request.destination)?;
            let (origin_after, destination_after) =
                plan_transfer(&product, origin_stock, destination_stock, request.quantity)?;

            invalidate_product(self.cache.as_ref(), product_id);

            let now = Utc::now();
            let out = StockMovement::new(
                product_id,
                request.quantity,
                MovementKind::TransferOut,
                request.reason.clone(),
                Some(request.origin),
                request.actor_id,
                now,
            )?;
            let inbound = StockMovement::new(
                product_id,
                request.quantity,
                MovementKind::TransferIn,
                request.reason.clone(),
                Some(request.destination),
                request.actor_id,
                now,
            )?;
            let (out_movement_id, in_movement_id) = (out.id, inbound.id);

            session.execute(StockWrite::InsertMovement(out))?;
            session.execute(StockWrite::InsertMovement(inbound))?;
            session.execute(StockWrite::SetLocationStock {
                product_id,
                location_id: request.origin,
                stock: origin_after,
            })?;
            session.execute(StockWrite::SetLocationStock {
                product_id,
                location_id: request.destination,
                stock: destination_after,
            })?;

            Ok(TransferOutcome {
                out_movement_id,
                in_movement_id,
                origin_stock: origin_after,
                destination_stock: destination_after,
            })
        })?;

        info!(
            product_id = %product_id,
            origin = %request.origin,
            destination = %request.destination,
            quantity = request.quantity,
            "stock transferred"
        );
        Ok(outcome)
    }

    fn flush_inner(&self, product_id: ProductId) -> Result<FlushOutcome, StockError> {
        self.ensure_feature(Feature::WriteOperations)?;

        let outcome = self.transact("flush_unflushed", product_id, |session| {
            let product = session.product()?.ok_or(DomainError::ProductNotFound(product_id))?;
            product.ensure_active()?;
            let pending = session.unflushed()?;
            if pending.is_empty() {
                return Ok(FlushOutcome {
                    flushed: 0,
                    final_stock: product.stock_actual,
                });
            }

            let mut stock = product.stock_actual;
            let mut locations: BTreeMap<LocationId, i64> = BTreeMap::new();
            for entry in &pending {
                let delta = entry.signed_delta();
                stock = apply_delta(stock, delta)?;
                if let Some(location_id) = entry.location_id {
                    let current = match locations.get(&location_id) {
                        Some(known) => *known,
                        None => session.location_stock(location_id)?,
                    };
                    locations.insert(location_id, apply_delta(current, delta)?);
                }
                let movement = StockMovement::new(
                    product_id,
                    entry.quantity,
                    entry.kind,
                    "unflushed",
                    entry.location_id,
                    None,
                    entry.recorded_at,
                )?;
                session.execute(StockWrite::InsertMovement(movement))?;
            }

            if let Some(resulting) = std::iter::once(stock)
                .chain(locations.values().copied())
                .find(|s| *s < 0)
            {
                return Err(DomainError::NegativeStockViolation { product_id, resulting }.into());
            }

            session.execute(StockWrite::SetProductStock { product_id, stock })?;
            for (location_id, stock) in locations {
                session.execute(StockWrite::SetLocationStock {
                    product_id,
                    location_id,
                    stock,
                })?;
            }
            session.execute(StockWrite::ClearUnflushed { product_id })?;
            invalidate_product(self.cache.as_ref(), product_id);

            Ok(FlushOutcome {
                flushed: pending.len(),
                final_stock: stock,
            })
        })?;

        debug!(product_id = %product_id, flushed = outcome.flushed, "unflushed movements folded");
        Ok(outcome)
    }

    fn recognize_inner(&self, document: &[u8]) -> Result<RecognizedDocument, StockError> {
        self.ensure_feature(Feature::DocumentRecognition)?;
        let recognizer = self.recognizer.as_ref().ok_or(StockError::RecognitionUnavailable)?;
        Ok(self.recognition_breaker.call(|| recognizer.recognize(document))?)
    }

    /// Run `work` in a locked session, retrying transient failures.
    fn transact<T, F>(&self, operation: &'static str, product_id: ProductId, mut work: F) -> Result<T, StockError>
    where
        F: FnMut(&mut dyn StockSession) -> Result<T, TxError>,
    {
        self.config
            .retry
            .run(operation, |_| self.attempt(product_id, &mut work), StockError::is_transient)
            .map_err(|err| match err {
                RetryError::Permanent(err) => err,
                RetryError::Exhausted {
                    attempts,
                    last: StockError::Storage(last),
                } => StockError::RetriesExhausted { attempts, last },
                RetryError::Exhausted { last, .. } => last,
            })
    }

    fn attempt<T, F>(&self, product_id: ProductId, work: &mut F) -> Result<T, StockError>
    where
        F: FnMut(&mut dyn StockSession) -> Result<T, TxError>,
    {
        // Lock contention is not a backend fault; only the session work runs
        // inside the breaker, and transient errors leave it as successful calls
        // so that retries on one product cannot open the breaker for all.
        let mut session = self.store.begin(product_id, self.config.lock_timeout)?;

        let outcome = self.storage_breaker.call(move || {
            let result = match work(&mut session) {
                Ok(value) => session.commit().map(|()| value),
                Err(TxError::Domain(err)) => {
                    session.rollback();
                    return Ok(Err(StockError::Domain(err)));
                }
                Err(TxError::Store(err)) => {
                    session.rollback();
                    Err(err)
                }
            };
            match result {
                Ok(value) => Ok(Ok(value)),
                Err(err) if err.is_transient() => Ok(Err(StockError::Storage(err))),
                Err(err) => Err(err),
            }
        })?;

        outcome
    }

    fn record<T>(
        &self,
        operation: &'static str,
        location_id: Option<LocationId>,
        result: &Result<T, StockError>,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let location_id = location_id.map(|l| l.to_string());
        let metric = match result {
            Ok(_) => OperationMetric::success(operation, location_id, duration_ms),
            Err(err) => OperationMetric::failure(operation, location_id, err.category(), duration_ms),
        };
        self.metrics.record(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stockwarden_inventory::{MAX_MOVEMENT_QUANTITY, UnflushedMovement};
    use stockwarden_observability::metrics::{InMemoryMetricsSink, OperationResult};
    use stockwarden_resilience::{CircuitBreakerConfig, CircuitState, FixedGate};

    use crate::cache::{InMemoryCache, product_key, stock_key};
    use crate::retry::RetryPolicy;
    use crate::session::InMemoryStockStore;

    type Service = AtomicStockService<InMemoryStockStore, FixedGate>;

    fn test_config() -> StockwardenConfig {
        let mut cfg = StockwardenConfig::default();
        cfg.stock.retry = RetryPolicy::immediate(3);
        cfg.stock.lock_timeout = Duration::from_millis(50);
        cfg
    }

    fn service_at(level: DegradationLevel, stock: i64, minimo: i64) -> (Service, ProductId) {
        let store = Arc::new(InMemoryStockStore::new());
        let id = ProductId::new();
        store.insert_product(Product::new(id, "SKU-100", "Oat milk 1L", stock, minimo, 249).unwrap());
        (Service::new(store, FixedGate(level), &test_config()), id)
    }

    fn service(stock: i64) -> (Service, ProductId) {
        service_at(DegradationLevel::Optimal, stock, 2)
    }

    fn staged(kind: MovementKind, quantity: i64) -> UnflushedMovement {
        UnflushedMovement::new(kind, quantity, None, Utc::now()).unwrap()
    }

    #[test]
    fn validation_reports_remaining_and_low_stock() {
        let (svc, id) = service_at(DegradationLevel::Optimal, 10, 5);
        let check = svc.validate_sufficient_stock(id, 6).unwrap();
        assert_eq!(
            check,
            StockCheck {
                sufficient: true,
                current: 10,
                remaining: 4,
                low_stock_alert: true,
            }
        );
    }

    #[test]
    fn validation_reconciles_unflushed_movements() {
        let (svc, id) = service(10);
        svc.store().stage_unflushed(id, staged(MovementKind::Out, 7));
        let check = svc.validate_sufficient_stock(id, 5).unwrap();
        assert_eq!(check.current, 3);
        assert!(!check.sufficient);
    }

    #[test]
    fn missing_products_do_not_trip_the_storage_breaker() {
        let (svc, _) = service(10);
        for _ in 0..5 {
            let err = svc.validate_sufficient_stock(ProductId::new(), 1).unwrap_err();
            assert!(matches!(err, StockError::Domain(DomainError::ProductNotFound(_))));
        }
        assert_eq!(svc.breaker_snapshots()[0].state, CircuitState::Closed);
    }

    #[test]
    fn inactive_products_are_not_found() {
        let (svc, id) = service(10);
        let inactive = svc.store().product(id).unwrap().deactivated();
        svc.store().insert_product(inactive);
        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 1, "restock"))
            .unwrap_err();
        assert_eq!(err, StockError::Domain(DomainError::ProductNotFound(id)));
    }

    #[test]
    fn sale_decrements_stock_and_writes_a_row() {
        let (svc, id) = service(10);
        let cache = Arc::new(InMemoryCache::default());
        let svc = svc.with_cache(cache.clone());

        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Out, 4, "sale #81"))
            .unwrap();

        assert_eq!(outcome.final_stock, 6);
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 6);
        let rows = svc.store().movements_for(id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, outcome.movement_id);
        assert_eq!(rows[0].kind, MovementKind::Out);
        assert_eq!(cache.invalidated_keys(), vec![product_key(id), stock_key(id)]);
    }

    #[test]
    fn oversell_is_rejected_without_mutation() {
        let (svc, id) = service(3);
        let cache = Arc::new(InMemoryCache::default());
        let svc = svc.with_cache(cache.clone());

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Out, 5, "sale"))
            .unwrap_err();

        assert_eq!(err, StockError::Domain(DomainError::insufficient(id, 5, 3)));
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 3);
        assert!(svc.store().movements_for(id).is_empty());
        assert!(cache.invalidated_keys().is_empty());
    }

    #[test]
    fn adjustment_applies_a_signed_quantity() {
        let (svc, id) = service(40);
        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Adjust, -3, "cycle count"))
            .unwrap();
        assert_eq!(outcome.final_stock, 37);
        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Adjust, 5, "found in back room"))
            .unwrap();
        assert_eq!(outcome.final_stock, 42);
    }

    #[test]
    fn empty_shelf_count_brings_stock_to_zero() {
        let (svc, id) = service(10);
        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Adjust, -10, "count: shelf empty"))
            .unwrap();
        assert_eq!(outcome.final_stock, 0);
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 0);
        let rows = svc.store().movements_for(id);
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].kind, rows[0].quantity), (MovementKind::Adjust, -10));

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Adjust, -1, "count"))
            .unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::NegativeStockViolation { .. })));
        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Adjust, 0, "count"))
            .unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn oversized_quantities_are_rejected_without_panicking() {
        let (svc, id) = service(10);
        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, i64::MAX, "delivery"))
            .unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::Validation(_))));
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 10);
        assert!(!svc.store().is_locked(id));

        let err = svc.validate_sufficient_stock(id, i64::MAX).unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::Validation(_))));

        let check = svc.validate_sufficient_stock(id, MAX_MOVEMENT_QUANTITY).unwrap();
        assert!(!check.sufficient);
        assert_eq!(check.remaining, 10 - MAX_MOVEMENT_QUANTITY);
    }

    #[test]
    fn counter_overflow_rolls_back() {
        let store = Arc::new(InMemoryStockStore::new());
        let id = ProductId::new();
        store.insert_product(Product::new(id, "SKU-MAX", "Bulk screws", i64::MAX - 1, 0, 1).unwrap());
        let svc = Service::new(store, FixedGate(DegradationLevel::Optimal), &test_config());

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 5, "delivery"))
            .unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::Validation(_))));
        assert_eq!(svc.store().product(id).unwrap().stock_actual, i64::MAX - 1);
        assert!(svc.store().movements_for(id).is_empty());
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let (svc, id) = service(10);
        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 0, "noop"))
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn located_movements_update_the_location_counter() {
        let (svc, id) = service(10);
        let shelf = LocationId::new();
        svc.store().seed_location_stock(id, shelf, 10);

        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Out, 4, "sale").at(shelf))
            .unwrap();
        assert_eq!(outcome.final_stock, 6);
        assert_eq!(outcome.location_stock, Some(6));
        assert_eq!(svc.store().location_stock_of(id, shelf), 6);
    }

    #[test]
    fn unflushed_entries_can_surface_negative_stock_violation() {
        // Reconciled stock is 12 but the committed counter only holds 2.
        let (svc, id) = service(2);
        svc.store().stage_unflushed(id, staged(MovementKind::In, 10));

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::Out, 5, "sale"))
            .unwrap_err();

        assert_eq!(
            err,
            StockError::Domain(DomainError::NegativeStockViolation {
                product_id: id,
                resulting: -3
            })
        );
        assert!(svc.store().movements_for(id).is_empty());
    }

    #[test]
    fn writes_are_rejected_when_system_is_minimal() {
        let (svc, id) = service_at(DegradationLevel::Minimal, 10, 0);
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let svc = svc.with_metrics(metrics.clone());

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 5, "restock"))
            .unwrap_err();
        assert_eq!(
            err,
            StockError::SystemDegraded {
                feature: Feature::WriteOperations,
                level: DegradationLevel::Minimal,
            }
        );
        assert!(svc.store().movements_for(id).is_empty());
        assert_eq!(metrics.count_category("degraded"), 1);

        // Reads keep working.
        assert!(svc.validate_sufficient_stock(id, 1).is_ok());
    }

    #[test]
    fn transfer_moves_units_and_conserves_global_stock() {
        let (svc, id) = service(20);
        let (warehouse, store_front) = (LocationId::new(), LocationId::new());
        svc.store().seed_location_stock(id, warehouse, 15);
        svc.store().seed_location_stock(id, store_front, 5);

        let outcome = svc
            .transfer_between_locations(TransferRequest::new(id, 6, warehouse, store_front, "replenish"))
            .unwrap();

        assert_eq!(outcome.origin_stock, 9);
        assert_eq!(outcome.destination_stock, 11);
        assert_eq!(svc.store().location_stock_of(id, warehouse), 9);
        assert_eq!(svc.store().location_stock_of(id, store_front), 11);
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 20);

        let kinds: Vec<_> = svc.store().movements_for(id).iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MovementKind::TransferOut, MovementKind::TransferIn]);
    }

    #[test]
    fn transfer_to_same_location_is_invalid() {
        let (svc, id) = service(20);
        let shelf = LocationId::new();
        let err = svc
            .transfer_between_locations(TransferRequest::new(id, 1, shelf, shelf, "noop"))
            .unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::InvalidTransfer(_))));
    }

    #[test]
    fn transfer_beyond_origin_stock_changes_nothing() {
        let (svc, id) = service(20);
        let (a, b) = (LocationId::new(), LocationId::new());
        svc.store().seed_location_stock(id, a, 2);

        let err = svc
            .transfer_between_locations(TransferRequest::new(id, 3, a, b, "replenish"))
            .unwrap_err();
        assert_eq!(err, StockError::Domain(DomainError::insufficient(id, 3, 2)));
        assert_eq!(svc.store().location_stock_of(id, a), 2);
        assert_eq!(svc.store().location_stock_of(id, b), 0);
        assert!(svc.store().movements_for(id).is_empty());
    }

    #[test]
    fn failed_write_mid_transfer_rolls_back_everything() {
        let (svc, id) = service(20);
        let (a, b) = (LocationId::new(), LocationId::new());
        svc.store().seed_location_stock(id, a, 10);
        // Out row and In row succeed, origin counter write fails.
        svc.store().fail_nth_write(3);

        let err = svc
            .transfer_between_locations(TransferRequest::new(id, 4, a, b, "replenish"))
            .unwrap_err();
        assert!(matches!(err, StockError::Storage(StoreError::Backend(_))));
        assert_eq!(svc.store().location_stock_of(id, a), 10);
        assert_eq!(svc.store().location_stock_of(id, b), 0);
        assert!(svc.store().movements_for(id).is_empty());
    }

    #[test]
    fn busy_commits_are_retried() {
        let (svc, id) = service(10);
        svc.store().fail_next_commits(2);
        let outcome = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 5, "delivery"))
            .unwrap();
        assert_eq!(outcome.final_stock, 15);
        assert_eq!(svc.store().movements_for(id).len(), 1);
    }

    #[test]
    fn persistent_busy_exhausts_retries() {
        let (svc, id) = service(10);
        svc.store().fail_next_commits(10);
        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 5, "delivery"))
            .unwrap_err();
        assert!(matches!(
            err,
            StockError::RetriesExhausted {
                attempts: 3,
                last: StoreError::Busy(_)
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 10);
    }

    #[test]
    fn busy_commits_do_not_open_the_storage_breaker() {
        let (svc, a) = service(10);
        let b = ProductId::new();
        svc.store()
            .insert_product(Product::new(b, "SKU-200", "Rye bread", 4, 0, 399).unwrap());

        // Enough busy commits to exhaust one retry cycle per breaker threshold.
        svc.store().fail_next_commits(9);
        for _ in 0..3 {
            let err = svc
                .apply_movement(MovementRequest::new(a, MovementKind::In, 1, "delivery"))
                .unwrap_err();
            assert!(matches!(
                err,
                StockError::RetriesExhausted {
                    last: StoreError::Busy(_),
                    ..
                }
            ));
        }
        assert_eq!(svc.breaker_snapshots()[0].state, CircuitState::Closed);

        // Other products stay readable and writable.
        assert!(svc.validate_sufficient_stock(b, 1).unwrap().sufficient);
        let outcome = svc
            .apply_movement(MovementRequest::new(b, MovementKind::In, 1, "delivery"))
            .unwrap();
        assert_eq!(outcome.final_stock, 5);
    }

    #[test]
    fn backend_write_failures_still_open_the_breaker() {
        let (svc, id) = service(10);
        for _ in 0..3 {
            svc.store().fail_nth_write(1);
            let err = svc
                .apply_movement(MovementRequest::new(id, MovementKind::In, 1, "delivery"))
                .unwrap_err();
            assert!(matches!(err, StockError::Storage(StoreError::Backend(_))));
        }
        assert_eq!(svc.breaker_snapshots()[0].state, CircuitState::Open);
        assert!(matches!(
            svc.apply_movement(MovementRequest::new(id, MovementKind::In, 1, "delivery")),
            Err(StockError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn lock_timeouts_are_retried_then_reported() {
        let (svc, id) = service(10);
        let store = Arc::clone(svc.store());
        let _held = store.begin(id, Duration::from_millis(10)).unwrap();

        let err = svc
            .apply_movement(MovementRequest::new(id, MovementKind::In, 1, "delivery"))
            .unwrap_err();
        assert!(matches!(
            err,
            StockError::RetriesExhausted {
                attempts: 3,
                last: StoreError::LockTimeout { .. }
            }
        ));
        // Contention alone never opens the storage breaker.
        assert_eq!(svc.breaker_snapshots()[0].state, CircuitState::Closed);
    }

    #[test]
    fn storage_breaker_fails_fast_after_repeated_read_failures() {
        let (svc, id) = service(10);
        svc.store().set_reads_failing(true);
        for _ in 0..3 {
            let err = svc.validate_sufficient_stock(id, 1).unwrap_err();
            assert_eq!(err.category(), "storage");
        }
        let err = svc.validate_sufficient_stock(id, 1).unwrap_err();
        assert!(matches!(err, StockError::CircuitOpen { ref breaker, .. } if breaker == "storage"));
        // Open circuit is reported even once the backend is back.
        svc.store().set_reads_failing(false);
        assert!(matches!(
            svc.validate_sufficient_stock(id, 1),
            Err(StockError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn flush_folds_staged_movements() {
        let (svc, id) = service(10);
        let shelf = LocationId::new();
        svc.store().seed_location_stock(id, shelf, 10);
        svc.store().stage_unflushed(id, staged(MovementKind::Out, 3));
        svc.store().stage_unflushed(
            id,
            UnflushedMovement::new(MovementKind::In, 5, Some(shelf), Utc::now()).unwrap(),
        );

        let outcome = svc.flush_unflushed(id).unwrap();
        assert_eq!(outcome, FlushOutcome { flushed: 2, final_stock: 12 });
        assert_eq!(svc.store().product(id).unwrap().stock_actual, 12);
        assert_eq!(svc.store().location_stock_of(id, shelf), 15);
        assert_eq!(svc.store().movements_for(id).len(), 2);
        assert!(svc.store().unflushed_for(id).is_empty());

        let again = svc.flush_unflushed(id).unwrap();
        assert_eq!(again.flushed, 0);
    }

    #[test]
    fn flush_refuses_to_go_negative() {
        let (svc, id) = service(2);
        svc.store().stage_unflushed(id, staged(MovementKind::Out, 5));
        let err = svc.flush_unflushed(id).unwrap_err();
        assert!(matches!(err, StockError::Domain(DomainError::NegativeStockViolation { .. })));
        assert_eq!(svc.store().unflushed_for(id).len(), 1);
    }

    struct FlakyRecognizer {
        calls: AtomicUsize,
    }

    impl DocumentRecognizer for FlakyRecognizer {
        fn recognize(&self, _document: &[u8]) -> Result<RecognizedDocument, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RecognitionError("inference timeout".to_string()))
        }
    }

    struct FixedRecognizer;

    impl DocumentRecognizer for FixedRecognizer {
        fn recognize(&self, _document: &[u8]) -> Result<RecognizedDocument, RecognitionError> {
            Ok(RecognizedDocument {
                lines: vec![RecognizedLine {
                    sku: "SKU-100".to_string(),
                    quantity: 12,
                }],
                confidence: 0.93,
            })
        }
    }

    #[test]
    fn recognition_requires_a_recognizer() {
        let (svc, _) = service(10);
        assert_eq!(svc.recognize_document(b"%PDF"), Err(StockError::RecognitionUnavailable));
    }

    #[test]
    fn recognition_returns_parsed_lines() {
        let (svc, _) = service(10);
        let svc = svc.with_recognizer(Arc::new(FixedRecognizer));
        let doc = svc.recognize_document(b"%PDF").unwrap();
        assert_eq!(doc.lines[0].quantity, 12);
    }

    #[test]
    fn recognition_is_gated_below_degraded() {
        let (svc, _) = service_at(DegradationLevel::Limited, 10, 0);
        let svc = svc.with_recognizer(Arc::new(FixedRecognizer));
        assert!(matches!(
            svc.recognize_document(b"%PDF"),
            Err(StockError::SystemDegraded {
                feature: Feature::DocumentRecognition,
                ..
            })
        ));
    }

    #[test]
    fn recognition_failures_open_only_their_own_breaker() {
        let store = Arc::new(InMemoryStockStore::new());
        let id = ProductId::new();
        store.insert_product(Product::new(id, "SKU-1", "Tea", 10, 0, 100).unwrap());
        let mut cfg = test_config();
        cfg.document_breaker = CircuitBreakerConfig::for_document_recognition().with_failure_threshold(2);
        let recognizer = Arc::new(FlakyRecognizer {
            calls: AtomicUsize::new(0),
        });
        let svc = Service::new(store, FixedGate(DegradationLevel::Optimal), &cfg).with_recognizer(recognizer.clone());

        for _ in 0..2 {
            assert!(matches!(svc.recognize_document(b"x"), Err(StockError::Recognition(_))));
        }
        assert!(matches!(svc.recognize_document(b"x"), Err(StockError::CircuitOpen { .. })));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);

        let snapshots = svc.breaker_snapshots();
        assert_eq!(snapshots[0].state, CircuitState::Closed);
        assert_eq!(snapshots[1].state, CircuitState::Open);
        // Stock writes are unaffected.
        assert!(svc.apply_movement(MovementRequest::new(id, MovementKind::In, 1, "x")).is_ok());
    }

    #[test]
    fn every_entry_point_records_a_metric() {
        let (svc, id) = service(10);
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let svc = svc.with_metrics(metrics.clone());
        let shelf = LocationId::new();

        let _ = svc.validate_sufficient_stock(id, 1);
        let _ = svc.apply_movement(MovementRequest::new(id, MovementKind::Out, 1, "sale").at(shelf));
        let _ = svc.apply_movement(MovementRequest::new(id, MovementKind::Out, 100, "sale"));
        let _ = svc.transfer_between_locations(TransferRequest::new(id, 1, shelf, LocationId::new(), "t"));
        let _ = svc.flush_unflushed(id);
        let _ = svc.recognize_document(b"x");

        assert_eq!(metrics.len(), 6);
        assert_eq!(metrics.count("apply_movement", OperationResult::Failure), 2);
        assert_eq!(metrics.count("validate_stock", OperationResult::Success), 1);
        let located = metrics.snapshot().into_iter().find(|m| m.operation_type == "apply_movement").unwrap();
        assert_eq!(located.location_id, Some(shelf.to_string()));
    }

    #[test]
    fn unreachable_cache_does_not_block_movements() {
        let (svc, id) = service(10);
        let cache = Arc::new(InMemoryCache::default());
        cache.set_unavailable(true);
        let svc = svc.with_cache(cache);
        assert!(svc.apply_movement(MovementRequest::new(id, MovementKind::In, 1, "x")).is_ok());
    }
}
