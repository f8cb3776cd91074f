use std::time::Duration;

use thiserror::Error;

use stockwarden_core::{LocationId, ProductId};
use stockwarden_inventory::{Product, StockMovement, UnflushedMovement};

/// Storage operation error.
///
/// These are **infrastructure errors** (locking, availability, backend faults) as
/// opposed to domain errors (validation, insufficient stock).
///
/// ## Error Categories
///
/// - **Transient** (`LockTimeout`, `Busy`): worth retrying with backoff
/// - **Permanent** (`Backend`, `Poisoned`): retrying will not help
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for the row lock on product {product_id}")]
    LockTimeout { product_id: ProductId, waited: Duration },

    #[error("storage busy: {0}")]
    Busy(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. } | StoreError::Busy(_))
    }
}

/// One buffered write inside a [`StockSession`].
///
/// Writes only become visible to other sessions on commit, all together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockWrite {
    InsertMovement(StockMovement),
    SetProductStock {
        product_id: ProductId,
        stock: i64,
    },
    SetLocationStock {
        product_id: ProductId,
        location_id: LocationId,
        stock: i64,
    },
    /// Drop the staged unflushed movements once they have been folded in.
    ClearUnflushed { product_id: ProductId },
}

impl StockWrite {
    pub fn product_id(&self) -> ProductId {
        match self {
            StockWrite::InsertMovement(m) => m.product_id,
            StockWrite::SetProductStock { product_id, .. }
            | StockWrite::SetLocationStock { product_id, .. }
            | StockWrite::ClearUnflushed { product_id } => *product_id,
        }
    }
}

/// A transaction holding the row lock of one product.
///
/// Reads reflect writes already buffered in this session. Dropping a session
/// without committing rolls it back and releases the lock.
pub trait StockSession {
    fn product_id(&self) -> ProductId;

    /// The locked product row, or `None` if it does not exist.
    fn product(&self) -> Result<Option<Product>, StoreError>;

    /// Counter for the locked product at `location_id` (0 if never stocked there).
    fn location_stock(&self, location_id: LocationId) -> Result<i64, StoreError>;

    /// Staged movements not yet folded into `stock_actual`.
    fn unflushed(&self) -> Result<Vec<UnflushedMovement>, StoreError>;

    /// Buffer a write. Writes must target the locked product.
    fn execute(&mut self, write: StockWrite) -> Result<(), StoreError>;

    /// Apply every buffered write atomically and release the lock.
    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Discard buffered writes and release the lock.
    fn rollback(self)
    where
        Self: Sized;
}

/// Transactional stock storage with per-product row locks.
pub trait StockStore: Send + Sync {
    type Session<'a>: StockSession
    where
        Self: 'a;

    /// Start a session holding the row lock of `product_id`.
    ///
    /// Waits at most `lock_timeout` for a competing session to finish; then fails
    /// with [`StoreError::LockTimeout`].
    fn begin(&self, product_id: ProductId, lock_timeout: Duration) -> Result<Self::Session<'_>, StoreError>;

    /// Lock-free read of the committed product row.
    fn load_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Lock-free read of the signed sum of staged unflushed movements.
    fn unflushed_delta(&self, product_id: ProductId) -> Result<i64, StoreError>;
}
