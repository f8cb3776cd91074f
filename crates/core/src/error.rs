//! Domain error model.

use thiserror::Error;

use crate::id::ProductId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants). These are never retried: the same input fails the same way.
/// Infrastructure concerns (lock contention, storage outages) belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The product does not exist or is inactive.
    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    /// An outbound movement asked for more units than are available.
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// A mutation would have left `stock_actual` below zero.
    #[error("negative stock for {product_id}: mutation would leave {resulting}")]
    NegativeStockViolation { product_id: ProductId, resulting: i64 },

    /// A transfer request was malformed (e.g. origin equals destination).
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transfer(msg: impl Into<String>) -> Self {
        Self::InvalidTransfer(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn insufficient(product_id: ProductId, requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            product_id,
            requested,
            available,
        }
    }

    /// Stable machine-readable code, used for metrics labels and API translation.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::ProductNotFound(_) => "product_not_found",
            DomainError::InsufficientStock { .. } => "insufficient_stock",
            DomainError::NegativeStockViolation { .. } => "negative_stock_violation",
            DomainError::InvalidTransfer(_) => "invalid_transfer",
            DomainError::Validation(_) => "validation_error",
            DomainError::InvalidId(_) => "invalid_id",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_message_names_quantities() {
        let id = ProductId::new();
        let err = DomainError::insufficient(id, 8, 2);
        let msg = err.to_string();
        assert!(msg.contains("requested 8"));
        assert!(msg.contains("available 2"));
        assert_eq!(err.code(), "insufficient_stock");
    }

    #[test]
    fn codes_are_distinct() {
        let id = ProductId::new();
        let errors = [
            DomainError::ProductNotFound(id),
            DomainError::insufficient(id, 1, 0),
            DomainError::NegativeStockViolation {
                product_id: id,
                resulting: -1,
            },
            DomainError::invalid_transfer("same location"),
            DomainError::validation("quantity must be positive"),
            DomainError::invalid_id("nope"),
        ];
        let mut codes: Vec<_> = errors.iter().map(DomainError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
