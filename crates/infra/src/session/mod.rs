//! Transactional stock storage boundary.
//!
//! A session holds the row lock of exactly one product for its whole lifetime;
//! writes are buffered and applied together on commit.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{InMemoryStockSession, InMemoryStockStore};
pub use r#trait::{StockSession, StockStore, StockWrite, StoreError};
