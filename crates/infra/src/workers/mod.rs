//! Background workers.

pub mod recovery_loop;

pub use recovery_loop::{RecoveryLoop, RecoveryLoopHandle};
