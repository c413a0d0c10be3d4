//! Slippage Model
//!
//! `static`: flat bps offset. `piecewise`: scenario-keyed multiplier on the
//! base, further scaled by the observed spread. The offset is signed by
//! side: buys execute above mid, sells below.

use crate::config::{BacktestConfig, PiecewiseSlippage, SlippageModel};
use crate::models::{Scenario, Side};

pub struct SlippageEngine {
    model: SlippageModel,
    base_bps: f64,
    piecewise: PiecewiseSlippage,
}

impl SlippageEngine {
    pub fn new(bt: &BacktestConfig) -> Self {
        Self {
            model: bt.slippage_model,
            base_bps: bt.slippage_bps,
            piecewise: bt.slippage_piecewise.clone(),
        }
    }

    /// Effective slippage in bps for one execution.
    pub fn slip_bps(&self, scenario: Option<Scenario>, spread_bps: f64) -> f64 {
        match self.model {
            SlippageModel::Static => self.base_bps,
            SlippageModel::Piecewise => {
                let spread_factor =
                    1.0 + self.piecewise.spread_base_multiplier * spread_bps / 100.0;
                self.base_bps * self.piecewise.multiplier(scenario) * spread_factor
            }
        }
    }

    /// Execution price after the signed offset.
    pub fn apply(
        &self,
        side: Side,
        mid: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
    ) -> f64 {
        let bps = self.slip_bps(scenario, spread_bps);
        mid * (1.0 + side.sign() * bps / 10_000.0)
    }
}
