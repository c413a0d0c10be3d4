//! Pipeline Configuration
//!
//! Every knob the pipeline reads arrives through these statically-typed
//! structs. Defaults are resolved in exactly one place (`Config::resolved`),
//! validation happens once at startup, and the digest of the resolved values
//! (`config_hash`) is stamped on every emitted signal.

use crate::errors::PipelineError;
use crate::models::Scenario;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// What the downstream executor is allowed to act on. Never changes what the
/// signal core stamps into the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    /// Only `confirm=true` signals are actionable.
    Strict,
    /// Soft gating reasons (weak signal, low consistency) may be acted on.
    IgnoreSoft,
    /// Everything except hard always-block reasons may be acted on.
    IgnoreAll,
}

impl Default for GatingMode {
    fn default() -> Self {
        GatingMode::Strict
    }
}

/// Per-regime entry thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideThresholds {
    pub buy: f64,
    pub sell: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub active: SideThresholds,
    pub quiet: SideThresholds,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            active: SideThresholds {
                buy: 2.0,
                sell: -2.0,
            },
            quiet: SideThresholds {
                buy: 2.5,
                sell: -2.5,
            },
        }
    }
}

/// Signal-core gates and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_weak_signal_threshold")]
    pub weak_signal_threshold: f64,
    #[serde(default = "default_consistency_min")]
    pub consistency_min: f64,
    #[serde(default = "default_dedupe_ms")]
    pub dedupe_ms: i64,
    #[serde(default = "default_min_consecutive_same_dir")]
    pub min_consecutive_same_dir: u32,
    /// Minimum rows seen per symbol before the core may confirm.
    #[serde(default = "default_warmup_min")]
    pub warmup_min: u64,
    /// Maximum tolerated feed lag, seconds.
    #[serde(default = "default_lag_max_sec")]
    pub lag_max_sec: f64,
    /// Maximum tolerated spread, basis points.
    #[serde(default = "default_spread_max_bps")]
    pub spread_max_bps: f64,
    #[serde(default)]
    pub thresholds: RegimeThresholds,
}

fn default_weak_signal_threshold() -> f64 {
    0.5
}
fn default_consistency_min() -> f64 {
    0.8
}
fn default_dedupe_ms() -> i64 {
    1_000
}
fn default_min_consecutive_same_dir() -> u32 {
    1
}
fn default_warmup_min() -> u64 {
    60
}
fn default_lag_max_sec() -> f64 {
    5.0
}
fn default_spread_max_bps() -> f64 {
    20.0
}

impl Default for SignalConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Score fusion and confirmation dynamics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default = "default_w_ofi")]
    pub w_ofi: f64,
    #[serde(default = "default_w_cvd")]
    pub w_cvd: f64,
    /// Extra |score| a flip must clear over the previous emit to re-arm.
    #[serde(default = "default_flip_rearm_margin")]
    pub flip_rearm_margin: f64,
    /// Cooldown after admit = k * expected_hold_sec.
    #[serde(default = "default_adaptive_cooldown_k")]
    pub adaptive_cooldown_k: f64,
    #[serde(default = "default_expected_hold_sec")]
    pub expected_hold_sec: f64,
}

fn default_w_ofi() -> f64 {
    0.6
}
fn default_w_cvd() -> f64 {
    0.4
}
fn default_flip_rearm_margin() -> f64 {
    0.3
}
fn default_adaptive_cooldown_k() -> f64 {
    1.0
}
fn default_expected_hold_sec() -> f64 {
    60.0
}

impl Default for FusionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentsConfig {
    #[serde(default)]
    pub fusion: FusionConfig,
}

/// Per-scenario maker probabilities for the maker/taker fee accountant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioProbs {
    #[serde(rename = "Q_L", default = "default_prob_q_l")]
    pub q_l: f64,
    #[serde(rename = "A_L", default = "default_prob_a_l")]
    pub a_l: f64,
    #[serde(rename = "A_H", default = "default_prob_a_h")]
    pub a_h: f64,
    #[serde(rename = "Q_H", default = "default_prob_q_h")]
    pub q_h: f64,
    #[serde(default = "default_prob_default")]
    pub default: f64,
}

fn default_prob_q_l() -> f64 {
    0.90
}
fn default_prob_a_l() -> f64 {
    0.80
}
fn default_prob_a_h() -> f64 {
    0.50
}
fn default_prob_q_h() -> f64 {
    0.40
}
fn default_prob_default() -> f64 {
    0.60
}

impl Default for ScenarioProbs {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

impl ScenarioProbs {
    #[inline]
    pub fn for_scenario(&self, scenario: Option<Scenario>) -> f64 {
        match scenario {
            Some(Scenario::QuietLow) => self.q_l,
            Some(Scenario::ActiveLow) => self.a_l,
            Some(Scenario::ActiveHigh) => self.a_h,
            Some(Scenario::QuietHigh) => self.q_h,
            None => self.default,
        }
    }
}

/// How the maker flag is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingMode {
    /// `is_maker ⟺ p > maker_threshold`.
    Threshold,
    /// Seeded Bernoulli draw with probability p. Reproducible.
    Bernoulli,
}

impl Default for AccountingMode {
    fn default() -> Self {
        AccountingMode::Threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakerTakerConfig {
    /// maker_fee_bps = taker_fee_bps * maker_fee_ratio.
    #[serde(default = "default_maker_fee_ratio")]
    pub maker_fee_ratio: f64,
    #[serde(default)]
    pub scenario_probs: ScenarioProbs,
    #[serde(default)]
    pub accounting_mode: AccountingMode,
    #[serde(default = "default_bernoulli_seed")]
    pub bernoulli_seed: u64,
    #[serde(default = "default_maker_threshold")]
    pub maker_threshold: f64,
    /// Optional penalty: maker probability shrinks by
    /// `spread_bps * spread_prob_multiplier / 100`. 0 disables.
    #[serde(default)]
    pub spread_prob_multiplier: f64,
    /// Optional side bias: sell-order maker probability is multiplied by
    /// this factor. 1.0 is neutral.
    #[serde(default = "default_sell_bias")]
    pub sell_bias: f64,
}

fn default_sell_bias() -> f64 {
    1.0
}

fn default_maker_fee_ratio() -> f64 {
    0.4
}
fn default_bernoulli_seed() -> u64 {
    42
}
fn default_maker_threshold() -> f64 {
    0.5
}

impl Default for MakerTakerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModel {
    TakerStatic,
    MakerTaker,
}

impl Default for FeeModel {
    fn default() -> Self {
        FeeModel::TakerStatic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    Static,
    Piecewise,
}

impl Default for SlippageModel {
    fn default() -> Self {
        SlippageModel::Static
    }
}

/// Scenario-keyed slippage multipliers for the piecewise model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiecewiseSlippage {
    /// Spread contribution: effective bps gains `spread_bps *
    /// spread_base_multiplier` on top of the scenario-scaled base.
    #[serde(default = "default_spread_base_multiplier")]
    pub spread_base_multiplier: f64,
    #[serde(rename = "Q_L", default = "default_slip_q_l")]
    pub q_l: f64,
    #[serde(rename = "A_L", default = "default_slip_a_l")]
    pub a_l: f64,
    #[serde(rename = "A_H", default = "default_slip_a_h")]
    pub a_h: f64,
    #[serde(rename = "Q_H", default = "default_slip_q_h")]
    pub q_h: f64,
}

fn default_spread_base_multiplier() -> f64 {
    0.5
}
fn default_slip_q_l() -> f64 {
    0.8
}
fn default_slip_a_l() -> f64 {
    1.0
}
fn default_slip_a_h() -> f64 {
    1.5
}
fn default_slip_q_h() -> f64 {
    1.2
}

impl Default for PiecewiseSlippage {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

impl PiecewiseSlippage {
    #[inline]
    pub fn multiplier(&self, scenario: Option<Scenario>) -> f64 {
        match scenario {
            Some(Scenario::QuietLow) => self.q_l,
            Some(Scenario::ActiveLow) => self.a_l,
            Some(Scenario::ActiveHigh) => self.a_h,
            Some(Scenario::QuietHigh) => self.q_h,
            None => 1.0,
        }
    }
}

/// Backtest / trade-simulator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_notional_per_trade")]
    pub notional_per_trade: f64,
    #[serde(default = "default_min_hold_time_sec")]
    pub min_hold_time_sec: i64,
    #[serde(default = "default_max_hold_time_sec")]
    pub max_hold_time_sec: i64,
    #[serde(default)]
    pub force_timeout_exit: bool,
    #[serde(default = "default_take_profit_bps")]
    pub take_profit_bps: f64,
    #[serde(default = "default_stop_loss_bps")]
    pub stop_loss_bps: f64,
    /// |pnl_bps| window inside which reverse-signal exits are suppressed.
    #[serde(default = "default_deadband_bps")]
    pub deadband_bps: f64,
    /// Legacy alias for `gating_mode=ignore_all` in backtests.
    #[serde(default)]
    pub ignore_gating_in_backtest: bool,
    #[serde(default = "default_rollover_timezone")]
    pub rollover_timezone: String,
    #[serde(default)]
    pub rollover_hour: u32,
    #[serde(default)]
    pub slippage_model: SlippageModel,
    #[serde(default)]
    pub fee_model: FeeModel,
    #[serde(default)]
    pub fee_maker_taker: MakerTakerConfig,
    #[serde(default)]
    pub slippage_piecewise: PiecewiseSlippage,
}

fn default_taker_fee_bps() -> f64 {
    5.0
}
fn default_slippage_bps() -> f64 {
    1.0
}
fn default_notional_per_trade() -> f64 {
    100.0
}
fn default_min_hold_time_sec() -> i64 {
    30
}
fn default_max_hold_time_sec() -> i64 {
    600
}
fn default_take_profit_bps() -> f64 {
    15.0
}
fn default_stop_loss_bps() -> f64 {
    10.0
}
fn default_deadband_bps() -> f64 {
    2.0
}
fn default_rollover_timezone() -> String {
    "UTC".to_string()
}

impl Default for BacktestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    Backtest,
    Testnet,
    Live,
}

impl Default for ExecutorMode {
    fn default() -> Self {
        ExecutorMode::Backtest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Jsonl,
    Sqlite,
    Dual,
}

impl Default for SinkKind {
    fn default() -> Self {
        SinkKind::Dual
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutorMode,
    #[serde(default)]
    pub sink: SinkKind,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_order_size_usd")]
    pub order_size_usd: f64,
    #[serde(default = "default_tif")]
    pub tif: String,
    #[serde(default = "default_order_type")]
    pub order_type: String,
}

fn default_output_dir() -> String {
    "output".to_string()
}
fn default_order_size_usd() -> f64 {
    100.0
}
fn default_tif() -> String {
    "GTC".to_string()
}
fn default_order_type() -> String {
    "MARKET".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Token bucket spec for one adapter action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub rps: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRateLimits {
    #[serde(default = "default_place_limit")]
    pub place: RateLimitSpec,
    #[serde(default = "default_cancel_limit")]
    pub cancel: RateLimitSpec,
}

fn default_place_limit() -> RateLimitSpec {
    RateLimitSpec {
        rps: 5.0,
        burst: 10,
    }
}
fn default_cancel_limit() -> RateLimitSpec {
    RateLimitSpec {
        rps: 10.0,
        burst: 20,
    }
}

impl Default for AdapterRateLimits {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub rate_limit: AdapterRateLimits,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
}

fn default_base_url() -> String {
    "https://testnet.binance.vision".to_string()
}
fn default_submit_timeout_ms() -> u64 {
    2_000
}
fn default_transient_retries() -> u32 {
    3
}

impl Default for AdapterConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_max_latency_ms")]
    pub batch_max_latency_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

fn default_db_name() -> String {
    "signals_v2.db".to_string()
}
fn default_batch_size() -> usize {
    200
}
fn default_batch_max_latency_ms() -> u64 {
    250
}
fn default_busy_timeout_ms() -> u64 {
    30_000
}
fn default_queue_capacity() -> usize {
    4_096
}
fn default_write_retries() -> u32 {
    5
}

impl Default for SinkConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignerConfig {
    /// Active/Quiet axis: spread at or above this is Active.
    #[serde(default = "default_active_spread_bps")]
    pub active_spread_bps_threshold: f64,
    /// High/Low axis: |return_1s| at or above this is High.
    #[serde(default = "default_high_vol_return_bps")]
    pub high_vol_return_bps_threshold: f64,
    /// Sub-feeds expected per bucket (price + orderbook = 2).
    #[serde(default = "default_expected_subfeeds")]
    pub expected_subfeeds: u32,
    /// Cap on consecutive fabricated gap seconds per symbol.
    #[serde(default = "default_max_gap_fill_sec")]
    pub max_gap_fill_sec: i64,
}

fn default_active_spread_bps() -> f64 {
    5.0
}
fn default_high_vol_return_bps() -> f64 {
    3.0
}
fn default_expected_subfeeds() -> u32 {
    2
}
fn default_max_gap_fill_sec() -> i64 {
    300
}

impl Default for AlignerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_retention_hours() -> i64 {
    24
}
fn default_open_timeout_ms() -> u64 {
    5_000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Root configuration. Deserialize from TOML, then call [`Config::resolved`]
/// to fold in env overrides and [`Config::validate`] before use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub components: ComponentsConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub aligner: AlignerConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub gating_mode: GatingMode,
}

impl Config {
    pub fn from_toml_path(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| PipelineError::ConfigInvalid(format!("{}: {}", path.display(), e)))
    }

    /// Fold in the environment overrides the core recognizes, in one place.
    /// Recognized keys: `V13_SINK`, `V13_OUTPUT_DIR`, `ROLLOVER_TZ`,
    /// `ROLLOVER_HOUR`. (`RUN_ID` and `V13_SIGNAL_V2` are read by the shell.)
    pub fn resolved(mut self) -> Result<Self, PipelineError> {
        if let Ok(sink) = std::env::var("V13_SINK") {
            self.sink.kind = match sink.as_str() {
                "jsonl" => SinkKind::Jsonl,
                "sqlite" => SinkKind::Sqlite,
                "dual" => SinkKind::Dual,
                other => {
                    return Err(PipelineError::ConfigInvalid(format!(
                        "V13_SINK: unknown sink kind '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(dir) = std::env::var("V13_OUTPUT_DIR") {
            self.sink.output_dir = dir.clone();
            self.executor.output_dir = dir;
        }
        if let Ok(tz) = std::env::var("ROLLOVER_TZ") {
            self.backtest.rollover_timezone = tz;
        }
        if let Ok(hour) = std::env::var("ROLLOVER_HOUR") {
            self.backtest.rollover_hour = hour.parse().map_err(|_| {
                PipelineError::ConfigInvalid(format!("ROLLOVER_HOUR: not an hour: '{}'", hour))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject out-of-bound knobs with the offending key in the message.
    pub fn validate(&self) -> Result<(), PipelineError> {
        fn bound(key: &str, v: f64, lo: f64, hi: f64) -> Result<(), PipelineError> {
            if !v.is_finite() || v < lo || v > hi {
                return Err(PipelineError::ConfigInvalid(format!(
                    "{}={} out of bounds [{}, {}]",
                    key, v, lo, hi
                )));
            }
            Ok(())
        }

        bound(
            "signal.weak_signal_threshold",
            self.signal.weak_signal_threshold,
            0.0,
            100.0,
        )?;
        bound("signal.consistency_min", self.signal.consistency_min, 0.0, 1.0)?;
        if self.signal.dedupe_ms < 0 {
            return Err(PipelineError::ConfigInvalid(
                "signal.dedupe_ms must be >= 0".into(),
            ));
        }
        bound("signal.lag_max_sec", self.signal.lag_max_sec, 0.0, 3_600.0)?;
        bound(
            "signal.spread_max_bps",
            self.signal.spread_max_bps,
            0.0,
            10_000.0,
        )?;
        if self.signal.thresholds.active.buy <= self.signal.thresholds.active.sell {
            return Err(PipelineError::ConfigInvalid(
                "signal.thresholds.active: buy must exceed sell".into(),
            ));
        }
        if self.signal.thresholds.quiet.buy <= self.signal.thresholds.quiet.sell {
            return Err(PipelineError::ConfigInvalid(
                "signal.thresholds.quiet: buy must exceed sell".into(),
            ));
        }

        let fusion = &self.components.fusion;
        bound("components.fusion.w_ofi", fusion.w_ofi, -10.0, 10.0)?;
        bound("components.fusion.w_cvd", fusion.w_cvd, -10.0, 10.0)?;
        bound(
            "components.fusion.adaptive_cooldown_k",
            fusion.adaptive_cooldown_k,
            0.0,
            100.0,
        )?;

        let bt = &self.backtest;
        bound("backtest.taker_fee_bps", bt.taker_fee_bps, 0.0, 1_000.0)?;
        bound("backtest.slippage_bps", bt.slippage_bps, 0.0, 1_000.0)?;
        bound(
            "backtest.notional_per_trade",
            bt.notional_per_trade,
            0.0,
            1e9,
        )?;
        if bt.min_hold_time_sec < 0 || bt.max_hold_time_sec <= 0 {
            return Err(PipelineError::ConfigInvalid(
                "backtest.{min,max}_hold_time_sec must be non-negative/positive".into(),
            ));
        }
        if bt.min_hold_time_sec > bt.max_hold_time_sec {
            return Err(PipelineError::ConfigInvalid(
                "backtest.min_hold_time_sec exceeds max_hold_time_sec".into(),
            ));
        }
        bound("backtest.take_profit_bps", bt.take_profit_bps, 0.0, 10_000.0)?;
        bound("backtest.stop_loss_bps", bt.stop_loss_bps, 0.0, 10_000.0)?;
        bound("backtest.deadband_bps", bt.deadband_bps, 0.0, 10_000.0)?;
        if bt.rollover_hour > 23 {
            return Err(PipelineError::ConfigInvalid(format!(
                "backtest.rollover_hour={} not in 0..=23",
                bt.rollover_hour
            )));
        }
        if bt.rollover_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(PipelineError::ConfigInvalid(format!(
                "backtest.rollover_timezone: unknown timezone '{}'",
                bt.rollover_timezone
            )));
        }
        let mt = &bt.fee_maker_taker;
        bound(
            "backtest.fee_maker_taker.maker_fee_ratio",
            mt.maker_fee_ratio,
            0.0,
            1.0,
        )?;
        bound(
            "backtest.fee_maker_taker.maker_threshold",
            mt.maker_threshold,
            0.0,
            1.0,
        )?;
        for (key, p) in [
            ("Q_L", mt.scenario_probs.q_l),
            ("A_L", mt.scenario_probs.a_l),
            ("A_H", mt.scenario_probs.a_h),
            ("Q_H", mt.scenario_probs.q_h),
            ("default", mt.scenario_probs.default),
        ] {
            bound(
                &format!("backtest.fee_maker_taker.scenario_probs.{}", key),
                p,
                0.0,
                1.0,
            )?;
        }

        if self.adapter.rate_limit.place.rps <= 0.0 || self.adapter.rate_limit.cancel.rps <= 0.0 {
            return Err(PipelineError::ConfigInvalid(
                "adapter.rate_limit: rps must be positive".into(),
            ));
        }
        if self.sink.batch_size == 0 || self.sink.queue_capacity == 0 {
            return Err(PipelineError::ConfigInvalid(
                "sink.batch_size and sink.queue_capacity must be positive".into(),
            ));
        }
        if self.reader.retention_hours <= 0 {
            return Err(PipelineError::ConfigInvalid(
                "reader.retention_hours must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The effective gating mode; the legacy backtest flag wins when set.
    pub fn effective_gating_mode(&self) -> GatingMode {
        if self.backtest.ignore_gating_in_backtest {
            GatingMode::IgnoreAll
        } else {
            self.gating_mode
        }
    }

    /// Stable digest of the resolved parameters: first 16 hex chars of
    /// SHA-256 over the canonical JSON encoding. Stamped on every signal.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)[..16].to_string()
    }

    /// Exact resolved numeric values of every knob, for the run manifest.
    pub fn effective_params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
