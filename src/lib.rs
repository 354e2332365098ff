//! TradeGate Library
//!
//! Pattern/correlation decision engine for a single traded asset:
//! pattern detection, multi-factor correlation against reference
//! instruments, a cost-aware advisor gate, and a per-account position
//! state machine with FIFO trade accounting.

pub mod advisor;
pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod execution;
pub mod gate;
pub mod history;
pub mod patterns;
pub mod persistence;
pub mod position;
pub mod types;

pub use engine::{CycleOutcome, TradingEngine};
pub use error::{EngineError, EngineResult};
