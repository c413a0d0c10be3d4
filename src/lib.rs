//! AlphaFlow Backend Library
//!
//! Low-latency market-microstructure pipeline: per-second feature alignment,
//! a per-symbol signal state machine, dual JSONL+SQLite persistence, a
//! deterministic trade simulator, and rate-limited broker adapters with an
//! equivalence harness proving backtest ≡ dry-run.
//!
//! Exposes core modules for use by the binary and the integration tests.

pub mod adapter;
pub mod align;
pub mod config;
pub mod equiv;
pub mod errors;
pub mod exec;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod replay;
pub mod signal;
pub mod sink;

// Re-export the workhorse types at crate root for convenience
pub use config::Config;
pub use errors::PipelineError;
pub use models::{FeatureRow, Fill, Order, Position, Signal, TradeRecord};
