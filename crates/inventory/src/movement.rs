use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockwarden_core::{DomainError, LocationId, MovementId, ProductId, UserId};

/// Largest quantity a single movement may carry.
pub const MAX_MOVEMENT_QUANTITY: i64 = 1_000_000_000;

/// Kind of a stock movement row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    In,
    Out,
    /// Inventory correction by a signed, non-zero quantity: positive for units
    /// found, negative for shrinkage.
    Adjust,
    TransferOut,
    TransferIn,
}

impl MovementKind {
    pub const ALL: [MovementKind; 5] = [
        MovementKind::In,
        MovementKind::Out,
        MovementKind::Adjust,
        MovementKind::TransferOut,
        MovementKind::TransferIn,
    ];

    /// Outbound kinds consume stock and must be validated for sufficiency first.
    pub fn is_outbound(self) -> bool {
        matches!(self, MovementKind::Out | MovementKind::TransferOut)
    }

    /// Change this movement makes to a stock counter.
    pub fn signed_delta(self, quantity: i64) -> i64 {
        match self {
            MovementKind::In | MovementKind::TransferIn | MovementKind::Adjust => quantity,
            MovementKind::Out | MovementKind::TransferOut => quantity.saturating_neg(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::In => "IN",
            MovementKind::Out => "OUT",
            MovementKind::Adjust => "ADJUST",
            MovementKind::TransferOut => "TRANSFER_OUT",
            MovementKind::TransferIn => "TRANSFER_IN",
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row written in the same transaction as every stock counter mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub kind: MovementKind,
    pub reason: String,
    pub location_id: Option<LocationId>,
    pub actor_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    /// Build a movement row. See [`ensure_movement_quantity`] for valid quantities.
    pub fn new(
        product_id: ProductId,
        quantity: i64,
        kind: MovementKind,
        reason: impl Into<String>,
        location_id: Option<LocationId>,
        actor_id: Option<UserId>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        ensure_movement_quantity(kind, quantity)?;
        Ok(Self {
            id: MovementId::new(),
            product_id,
            quantity,
            kind,
            reason: reason.into(),
            location_id,
            actor_id,
            created_at,
        })
    }

    pub fn signed_delta(&self) -> i64 {
        self.kind.signed_delta(self.quantity)
    }
}

/// A movement recorded upstream (e.g. an offline till) but not yet folded into
/// `stock_actual`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnflushedMovement {
    pub kind: MovementKind,
    pub quantity: i64,
    pub location_id: Option<LocationId>,
    pub recorded_at: DateTime<Utc>,
}

impl UnflushedMovement {
    pub fn new(
        kind: MovementKind,
        quantity: i64,
        location_id: Option<LocationId>,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        ensure_movement_quantity(kind, quantity)?;
        Ok(Self {
            kind,
            quantity,
            location_id,
            recorded_at,
        })
    }

    /// Entries count positive, exits negative.
    pub fn signed_delta(&self) -> i64 {
        self.kind.signed_delta(self.quantity)
    }
}

/// Net effect of a batch of unflushed movements (entries minus exits).
///
/// Saturates instead of wrapping; a saturated figure is then rejected by
/// [`apply_delta`] wherever it is used.
pub fn unflushed_delta<'a>(pending: impl IntoIterator<Item = &'a UnflushedMovement>) -> i64 {
    pending
        .into_iter()
        .map(UnflushedMovement::signed_delta)
        .fold(0i64, i64::saturating_add)
}

/// Quantity of a request that is not tied to a movement kind (checks, transfers).
pub fn ensure_positive_quantity(quantity: i64) -> Result<(), DomainError> {
    if quantity <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    if quantity > MAX_MOVEMENT_QUANTITY {
        return Err(DomainError::validation(format!(
            "quantity exceeds the maximum of {MAX_MOVEMENT_QUANTITY}"
        )));
    }
    Ok(())
}

/// `Adjust` takes any non-zero quantity within bounds; every other kind needs a
/// positive one.
pub fn ensure_movement_quantity(kind: MovementKind, quantity: i64) -> Result<(), DomainError> {
    match kind {
        MovementKind::Adjust if quantity == 0 => Err(DomainError::validation("adjustment must not be zero")),
        MovementKind::Adjust => ensure_positive_quantity(quantity.saturating_abs()),
        _ => ensure_positive_quantity(quantity),
    }
}

/// `current + delta`, rejecting results outside the counter range.
pub fn apply_delta(current: i64, delta: i64) -> Result<i64, DomainError> {
    current
        .checked_add(delta)
        .ok_or_else(|| DomainError::validation("stock counter out of range"))
}
