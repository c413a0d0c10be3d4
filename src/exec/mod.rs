//! Execution Engine
//!
//! The deterministic trade simulator shared by backtest and live paths,
//! plus its cost models: fee accountant, slippage model, and the rollover
//! calendar that decides business dates and forced closes.

pub mod fees;
pub mod rollover;
pub mod sim;
pub mod slippage;

pub use fees::{FeeAssessment, FeeEngine};
pub use rollover::RolloverCalendar;
pub use sim::{TradeSimulator, TradeStats};
pub use slippage::SlippageEngine;

/// Sizing fallback when a signal carries no mid price (the live strategy
/// server behaves the same way): a coarse per-asset default. The actual
/// execution price still comes from the market stream.
pub fn default_mid_for_symbol(symbol: &str) -> f64 {
    let upper = symbol.to_ascii_uppercase();
    if upper.contains("BTC") {
        50_000.0
    } else if upper.contains("ETH") {
        2_000.0
    } else {
        1_000.0
    }
}
