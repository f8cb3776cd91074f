//! Pure stock arithmetic: availability checks and movement planning.
//!
//! The stock service calls these twice per outbound movement: once before taking
//! the row lock (cheap rejection) and again against the locked row, which is the
//! authoritative check.

use serde::{Deserialize, Serialize};

use stockwarden_core::DomainError;

use crate::movement::{MovementKind, apply_delta, ensure_movement_quantity, ensure_positive_quantity};
use crate::product::Product;

/// Result of a sufficiency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCheck {
    pub sufficient: bool,
    /// `stock_actual` reconciled with unflushed movements.
    pub current: i64,
    /// What would be left after taking the requested quantity.
    pub remaining: i64,
    pub low_stock_alert: bool,
}

/// Check whether `quantity` units can be taken from `product`.
///
/// Fails only when the figures fall outside the counter range.
pub fn check_availability(product: &Product, unflushed_delta: i64, quantity: i64) -> Result<StockCheck, DomainError> {
    let current = apply_delta(product.stock_actual, unflushed_delta)?;
    let remaining = apply_delta(current, quantity.saturating_neg())?;
    Ok(StockCheck {
        sufficient: remaining >= 0,
        current,
        remaining,
        low_stock_alert: product.is_low(remaining),
    })
}

/// Decide the committed `stock_actual` after applying a movement to a locked row.
///
/// Rejects with `InsufficientStock` when an outbound movement exceeds the reconciled
/// stock, and with `NegativeStockViolation` if the counter itself would go below zero
/// (possible when unflushed entries inflate the reconciled figure).
pub fn plan_movement(
    product: &Product,
    unflushed_delta: i64,
    kind: MovementKind,
    quantity: i64,
) -> Result<i64, DomainError> {
    ensure_movement_quantity(kind, quantity)?;
    product.ensure_active()?;

    if kind.is_outbound() {
        let check = check_availability(product, unflushed_delta, quantity)?;
        if !check.sufficient {
            return Err(DomainError::insufficient(product.id, quantity, check.current));
        }
    }

    let resulting = apply_delta(product.stock_actual, kind.signed_delta(quantity))?;
    if resulting < 0 {
        return Err(DomainError::NegativeStockViolation {
            product_id: product.id,
            resulting,
        });
    }
    Ok(resulting)
}

/// Location counters after moving `quantity` units from origin to destination.
pub fn plan_transfer(
    product: &Product,
    origin_stock: i64,
    destination_stock: i64,
    quantity: i64,
) -> Result<(i64, i64), DomainError> {
    ensure_positive_quantity(quantity)?;
    product.ensure_active()?;

    let origin_after = origin_stock - quantity;
    if origin_after < 0 {
        return Err(DomainError::insufficient(product.id, quantity, origin_stock));
    }
    Ok((origin_after, apply_delta(destination_stock, quantity)?))
}

/// Product and location counters after a movement booked against one location.
///
/// Both counters move by the same signed delta. Outbound movements must be
/// covered by the reconciled product stock and by the location's own counter.
pub fn plan_located_movement(
    product: &Product,
    unflushed_delta: i64,
    location_stock: i64,
    kind: MovementKind,
    quantity: i64,
) -> Result<(i64, i64), DomainError> {
    let product_after = plan_movement(product, unflushed_delta, kind, quantity)?;

    let location_after = apply_delta(location_stock, kind.signed_delta(quantity))?;
    if location_after < 0 {
        return Err(DomainError::insufficient(product.id, quantity.saturating_abs(), location_stock));
    }
    Ok((product_after, location_after))
}
