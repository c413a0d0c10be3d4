//! Fee Accountant
//!
//! Two models: `taker_static` (flat taker bps on notional) and `maker_taker`
//! (per-scenario maker probability with threshold or seeded-Bernoulli
//! accounting). The Bernoulli draw uses a ChaCha8 stream seeded from config,
//! so two runs over the same tape produce the identical maker/taker
//! sequence.

use crate::config::{AccountingMode, BacktestConfig, FeeModel};
use crate::models::{Liquidity, Scenario, Side};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Outcome of one fee assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeAssessment {
    pub is_maker: bool,
    pub liquidity: Liquidity,
    pub maker_probability: f64,
    pub fee_bps: f64,
    pub fee: f64,
}

/// Stateful fee engine; owns the Bernoulli RNG stream.
pub struct FeeEngine {
    model: FeeModel,
    taker_fee_bps: f64,
    maker_fee_bps: f64,
    accounting_mode: AccountingMode,
    maker_threshold: f64,
    spread_prob_multiplier: f64,
    sell_bias: f64,
    scenario_probs: crate::config::ScenarioProbs,
    rng: ChaCha8Rng,
}

impl FeeEngine {
    pub fn new(bt: &BacktestConfig) -> Self {
        let mt = &bt.fee_maker_taker;
        Self {
            model: bt.fee_model,
            taker_fee_bps: bt.taker_fee_bps,
            maker_fee_bps: bt.taker_fee_bps * mt.maker_fee_ratio,
            accounting_mode: mt.accounting_mode,
            maker_threshold: mt.maker_threshold,
            spread_prob_multiplier: mt.spread_prob_multiplier,
            sell_bias: mt.sell_bias,
            scenario_probs: mt.scenario_probs.clone(),
            rng: ChaCha8Rng::seed_from_u64(mt.bernoulli_seed),
        }
    }

    /// Effective maker probability for an order, after the optional spread
    /// and side-bias adjustments.
    pub fn maker_probability(
        &self,
        scenario: Option<Scenario>,
        spread_bps: f64,
        side: Side,
    ) -> f64 {
        let base = self.scenario_probs.for_scenario(scenario);
        let spread_penalty = spread_bps * self.spread_prob_multiplier / 100.0;
        let side_factor = match side {
            Side::Sell => self.sell_bias,
            Side::Buy => 1.0,
        };
        ((base - spread_penalty) * side_factor).clamp(0.0, 1.0)
    }

    /// Assess the fee for one execution of `notional`.
    ///
    /// In `maker_taker` + `bernoulli` this consumes one RNG draw, so call
    /// order must follow tape order for determinism.
    pub fn assess(
        &mut self,
        notional: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
        side: Side,
    ) -> FeeAssessment {
        match self.model {
            FeeModel::TakerStatic => {
                let fee_bps = self.taker_fee_bps;
                FeeAssessment {
                    is_maker: false,
                    liquidity: Liquidity::Taker,
                    maker_probability: 0.0,
                    fee_bps,
                    fee: notional * fee_bps / 10_000.0,
                }
            }
            FeeModel::MakerTaker => {
                let p = self.maker_probability(scenario, spread_bps, side);
                let is_maker = match self.accounting_mode {
                    AccountingMode::Threshold => p > self.maker_threshold,
                    AccountingMode::Bernoulli => self.rng.gen::<f64>() < p,
                };
                let fee_bps = if is_maker {
                    self.maker_fee_bps
                } else {
                    self.taker_fee_bps
                };
                FeeAssessment {
                    is_maker,
                    liquidity: if is_maker {
                        Liquidity::Maker
                    } else {
                        Liquidity::Taker
                    },
                    maker_probability: p,
                    fee_bps,
                    fee: notional * fee_bps / 10_000.0,
                }
            }
        }
    }
}
