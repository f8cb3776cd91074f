use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use stockwarden_core::{LocationId, ProductId};
use stockwarden_inventory::{Product, StockMovement, UnflushedMovement, unflushed_delta};

use super::r#trait::{StockSession, StockStore, StockWrite, StoreError};

#[derive(Debug, Default)]
struct StoreState {
    products: HashMap<ProductId, Product>,
    locations: HashMap<(ProductId, LocationId), i64>,
    movements: Vec<StockMovement>,
    unflushed: HashMap<ProductId, Vec<UnflushedMovement>>,
}

/// Injected failures, for exercising retry and breaker paths.
#[derive(Debug, Default)]
struct Faults {
    busy_commits: AtomicU32,
    write_countdown: AtomicU32,
    reads_down: AtomicBool,
}

/// In-memory transactional stock store with per-product row locks.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    state: RwLock<StoreState>,
    locks: Mutex<HashSet<ProductId>>,
    lock_released: Condvar,
    faults: Faults,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_product(&self, product: Product) {
        self.write_state().products.insert(product.id, product);
    }

    /// Seed a location counter directly (no movement row).
    pub fn seed_location_stock(&self, product_id: ProductId, location_id: LocationId, stock: i64) {
        self.write_state().locations.insert((product_id, location_id), stock);
    }

    /// Stage a movement recorded upstream; it is not folded into `stock_actual`.
    pub fn stage_unflushed(&self, product_id: ProductId, movement: UnflushedMovement) {
        self.write_state()
            .unflushed
            .entry(product_id)
            .or_default()
            .push(movement);
    }

    pub fn product(&self, product_id: ProductId) -> Option<Product> {
        self.read_state().products.get(&product_id).cloned()
    }

    pub fn location_stock_of(&self, product_id: ProductId, location_id: LocationId) -> i64 {
        self.read_state()
            .locations
            .get(&(product_id, location_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn movements_for(&self, product_id: ProductId) -> Vec<StockMovement> {
        self.read_state()
            .movements
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect()
    }

    pub fn unflushed_for(&self, product_id: ProductId) -> Vec<UnflushedMovement> {
        self.read_state()
            .unflushed
            .get(&product_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_locked(&self, product_id: ProductId) -> bool {
        self.locks
            .lock()
            .map(|held| held.contains(&product_id))
            .unwrap_or(false)
    }

    /// Fail the next `n` commits with [`StoreError::Busy`].
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.busy_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the `n`-th buffered write from now (1-based) with [`StoreError::Backend`].
    pub fn fail_nth_write(&self, n: u32) {
        self.faults.write_countdown.store(n, Ordering::SeqCst);
    }

    /// Make every read fail with [`StoreError::Backend`] until switched back.
    pub fn set_reads_failing(&self, failing: bool) {
        self.faults.reads_down.store(failing, Ordering::SeqCst);
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked_read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
        if self.faults.reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("storage unavailable".to_string()));
        }
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn acquire(&self, product_id: ProductId, timeout: Duration) -> Result<(), StoreError> {
        let started = Instant::now();
        let held = self.locks.lock().map_err(|_| StoreError::Poisoned)?;
        let (mut held, wait) = self
            .lock_released
            .wait_timeout_while(held, timeout, |held| held.contains(&product_id))
            .map_err(|_| StoreError::Poisoned)?;

        if wait.timed_out() && held.contains(&product_id) {
            return Err(StoreError::LockTimeout {
                product_id,
                waited: started.elapsed(),
            });
        }
        held.insert(product_id);
        Ok(())
    }

    fn release(&self, product_id: ProductId) {
        let mut held = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&product_id);
        drop(held);
        self.lock_released.notify_all();
    }

    fn apply(&self, writes: Vec<StockWrite>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;

        // Validate everything first so a rejected commit leaves no partial state.
        for write in &writes {
            match write {
                StockWrite::SetProductStock { product_id, stock } => {
                    if !state.products.contains_key(product_id) {
                        return Err(StoreError::Backend(format!("product {product_id} does not exist")));
                    }
                    if *stock < 0 {
                        return Err(StoreError::Backend(format!(
                            "stock_actual for {product_id} would be {stock}"
                        )));
                    }
                }
                StockWrite::SetLocationStock {
                    product_id,
                    location_id,
                    stock,
                } if *stock < 0 => {
                    return Err(StoreError::Backend(format!(
                        "stock for {product_id} at {location_id} would be {stock}"
                    )));
                }
                _ => {}
            }
        }

        for write in writes {
            match write {
                StockWrite::InsertMovement(m) => state.movements.push(m),
                StockWrite::SetProductStock { product_id, stock } => {
                    if let Some(p) = state.products.get_mut(&product_id) {
                        p.stock_actual = stock;
                    }
                }
                StockWrite::SetLocationStock {
                    product_id,
                    location_id,
                    stock,
                } => {
                    state.locations.insert((product_id, location_id), stock);
                }
                StockWrite::ClearUnflushed { product_id } => {
                    state.unflushed.remove(&product_id);
                }
            }
        }
        Ok(())
    }
}

impl StockStore for InMemoryStockStore {
    type Session<'a> = InMemoryStockSession<'a>;

    fn begin(&self, product_id: ProductId, lock_timeout: Duration) -> Result<Self::Session<'_>, StoreError> {
        self.acquire(product_id, lock_timeout)?;
        Ok(InMemoryStockSession {
            store: self,
            product_id,
            pending: Vec::new(),
        })
    }

    fn load_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.checked_read()?.products.get(&product_id).cloned())
    }

    fn unflushed_delta(&self, product_id: ProductId) -> Result<i64, StoreError> {
        let state = self.checked_read()?;
        Ok(state
            .unflushed
            .get(&product_id)
            .map(|pending| unflushed_delta(pending))
            .unwrap_or(0))
    }
}

/// Session over [`InMemoryStockStore`]; releases the row lock on drop.
#[derive(Debug)]
pub struct InMemoryStockSession<'a> {
    store: &'a InMemoryStockStore,
    product_id: ProductId,
    pending: Vec<StockWrite>,
}

impl StockSession for InMemoryStockSession<'_> {
    fn product_id(&self) -> ProductId {
        self.product_id
    }

    fn product(&self) -> Result<Option<Product>, StoreError> {
        let state = self.store.checked_read()?;
        let mut product = state.products.get(&self.product_id).cloned();
        if let Some(p) = product.as_mut() {
            for write in &self.pending {
                if let StockWrite::SetProductStock { stock, .. } = write {
                    p.stock_actual = *stock;
                }
            }
        }
        Ok(product)
    }

    fn location_stock(&self, location_id: LocationId) -> Result<i64, StoreError> {
        let state = self.store.checked_read()?;
        let committed = state
            .locations
            .get(&(self.product_id, location_id))
            .copied()
            .unwrap_or(0);
        let buffered = self.pending.iter().rev().find_map(|w| match w {
            StockWrite::SetLocationStock {
                location_id: l, stock, ..
            } if *l == location_id => Some(*stock),
            _ => None,
        });
        Ok(buffered.unwrap_or(committed))
    }

    fn unflushed(&self) -> Result<Vec<UnflushedMovement>, StoreError> {
        if self
            .pending
            .iter()
            .any(|w| matches!(w, StockWrite::ClearUnflushed { .. }))
        {
            return Ok(Vec::new());
        }
        let state = self.store.checked_read()?;
        Ok(state
            .unflushed
            .get(&self.product_id)
            .cloned()
            .unwrap_or_default())
    }

    fn execute(&mut self, write: StockWrite) -> Result<(), StoreError> {
        if write.product_id() != self.product_id {
            return Err(StoreError::Backend(format!(
                "write targets {} but session holds {}",
                write.product_id(),
                self.product_id
            )));
        }
        if countdown_hits_zero(&self.store.faults.write_countdown) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        self.pending.push(write);
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        if take_one(&self.store.faults.busy_commits) {
            return Err(StoreError::Busy("injected busy commit".to_string()));
        }
        let writes = std::mem::take(&mut self.pending);
        let count = writes.len();
        self.store.apply(writes)?;
        debug!(product_id = %self.product_id, writes = count, "session committed");
        Ok(())
    }

    fn rollback(mut self) {
        let discarded = std::mem::take(&mut self.pending).len();
        debug!(product_id = %self.product_id, discarded, "session rolled back");
    }
}

impl Drop for InMemoryStockSession<'_> {
    fn drop(&mut self) {
        self.store.release(self.product_id);
    }
}

/// Decrement a positive counter; `true` when this call took it from 1 to 0.
fn countdown_hits_zero(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .map(|previous| previous == 1)
        .unwrap_or(false)
}

/// Consume one unit of a positive counter; `true` if there was one.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
