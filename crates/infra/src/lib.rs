//! Infrastructure layer: storage sessions, cache hook, retry, the atomic stock
//! service, background workers and configuration.

pub mod cache;
pub mod config;
pub mod retry;
pub mod session;
pub mod stock_service;
pub mod workers;


pub use config::{RecoveryLoopConfig, StockServiceConfig, StockwardenConfig};
pub use stock_service::{
    AtomicStockService, DocumentRecognizer, FlushOutcome, MovementOutcome, MovementRequest, RecognitionError,
    RecognizedDocument, RecognizedLine, StockError, TransferOutcome, TransferRequest,
};
