use serde::{Deserialize, Serialize};

use stockwarden_core::{DomainError, ProductId};

/// Product row as seen by the stock layer.
///
/// `stock_actual` is the committed global counter. It is only mutated through the
/// atomic stock service, under the product's row lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub stock_actual: i64,
    /// Reorder threshold; at or below this level a low-stock alert is raised.
    pub stock_minimo: i64,
    /// Price in smallest currency unit (e.g. cents).
    pub price: u64,
    pub active: bool,
}

impl Product {
    /// Build a new active product, validating the stock invariants.
    pub fn new(
        id: ProductId,
        sku: impl Into<String>,
        name: impl Into<String>,
        stock_actual: i64,
        stock_minimo: i64,
        price: u64,
    ) -> Result<Self, DomainError> {
        let sku = sku.into();
        let name = name.into();
        if sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if stock_actual < 0 {
            return Err(DomainError::validation("stock_actual cannot be negative"));
        }
        if stock_minimo < 0 {
            return Err(DomainError::validation("stock_minimo cannot be negative"));
        }

        Ok(Self {
            id,
            sku,
            name,
            stock_actual,
            stock_minimo,
            price,
            active: true,
        })
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Inactive products are treated as missing by every stock operation.
    pub fn ensure_active(&self) -> Result<(), DomainError> {
        if self.active {
            Ok(())
        } else {
            Err(DomainError::ProductNotFound(self.id))
        }
    }

    /// Whether a stock level at or below `stock_minimo` should raise an alert.
    pub fn is_low(&self, level: i64) -> bool {
        level <= self.stock_minimo
    }
}
