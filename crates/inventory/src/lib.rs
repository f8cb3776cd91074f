//! Inventory stock domain.
//!
//! This crate contains the stock rules (movement deltas, sufficiency checks,
//! transfer planning) as deterministic domain logic: no IO, no locking, no storage.

pub mod availability;
pub mod movement;
pub mod product;

pub use availability::{
    StockCheck, check_availability, plan_located_movement, plan_movement, plan_transfer,
};
pub use movement::{
    MAX_MOVEMENT_QUANTITY, MovementKind, StockMovement, UnflushedMovement, apply_delta, ensure_movement_quantity,
    ensure_positive_quantity, unflushed_delta,
};
pub use product::Product;
