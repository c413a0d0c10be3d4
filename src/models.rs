//! Core Record Types
//!
//! Immutable value types passed between pipeline components: feature rows,
//! v2 signals, orders, fills, positions, and closed-trade records.
//! Cross-component communication happens exclusively through these values;
//! no component holds a back-pointer into another component's state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since Unix epoch (UTC). The pipeline's native time unit.
pub type Millis = i64;

/// Schema tag stamped on every emitted signal.
pub const SIGNAL_SCHEMA_VERSION: &str = "signal/v2";

/// Maximum length of a `signal_id` / `client_order_id`.
pub const SIGNAL_ID_MAX_LEN: usize = 36;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1.0 for buy, -1.0 for sell. Used by PnL and slippage accounting.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional proposal carried by a signal. `Flat` never becomes an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideHint {
    Buy,
    Sell,
    Flat,
}

impl SideHint {
    #[inline]
    pub fn as_side(&self) -> Option<Side> {
        match self {
            SideHint::Buy => Some(Side::Buy),
            SideHint::Sell => Some(Side::Sell),
            SideHint::Flat => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SideHint::Buy => "buy",
            SideHint::Sell => "sell",
            SideHint::Flat => "flat",
        }
    }
}

impl fmt::Display for SideHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 2x2 market scenario: Active/Quiet on the spread axis, High/Low on the
/// volatility axis. Distinct from [`Regime`], which is the signal-generation
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scenario {
    #[serde(rename = "A_H")]
    ActiveHigh,
    #[serde(rename = "A_L")]
    ActiveLow,
    #[serde(rename = "Q_H")]
    QuietHigh,
    #[serde(rename = "Q_L")]
    QuietLow,
}

impl Scenario {
    #[inline]
    pub fn from_axes(active: bool, high_vol: bool) -> Self {
        match (active, high_vol) {
            (true, true) => Scenario::ActiveHigh,
            (true, false) => Scenario::ActiveLow,
            (false, true) => Scenario::QuietHigh,
            (false, false) => Scenario::QuietLow,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Scenario::ActiveHigh | Scenario::ActiveLow)
    }

    #[inline]
    pub fn is_high_vol(&self) -> bool {
        matches!(self, Scenario::ActiveHigh | Scenario::QuietHigh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::ActiveHigh => "A_H",
            Scenario::ActiveLow => "A_L",
            Scenario::QuietHigh => "Q_H",
            Scenario::QuietLow => "Q_L",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A_H" => Some(Scenario::ActiveHigh),
            "A_L" => Some(Scenario::ActiveLow),
            "Q_H" => Some(Scenario::QuietHigh),
            "Q_L" => Some(Scenario::QuietLow),
            _ => None,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse signal-generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trend,
    Revert,
    Quiet,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trend => "trend",
            Regime::Revert => "revert",
            Regime::Quiet => "quiet",
        }
    }
}

/// Categorical reason for the terminal confirm/reject decision.
/// `Ok` iff `confirm=true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL_WARMUP")]
    FailWarmup,
    #[serde(rename = "FAIL_LAG")]
    FailLag,
    #[serde(rename = "FAIL_SPREAD")]
    FailSpread,
    #[serde(rename = "FAIL_CONSISTENCY")]
    FailConsistency,
    #[serde(rename = "FAIL_WEAK")]
    FailWeak,
    #[serde(rename = "FAIL_DEDUPE")]
    FailDedupe,
    #[serde(rename = "FAIL_COOLDOWN")]
    FailCooldown,
    #[serde(rename = "FAIL_FLIP_REARM")]
    FailFlipRearm,
    #[serde(rename = "FAIL_MIN_CONSECUTIVE")]
    FailMinConsecutive,
    #[serde(rename = "FAIL_GATING")]
    FailGating,
    #[serde(rename = "FAIL_EXPIRED")]
    FailExpired,
}

impl DecisionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::Ok => "OK",
            DecisionCode::FailWarmup => "FAIL_WARMUP",
            DecisionCode::FailLag => "FAIL_LAG",
            DecisionCode::FailSpread => "FAIL_SPREAD",
            DecisionCode::FailConsistency => "FAIL_CONSISTENCY",
            DecisionCode::FailWeak => "FAIL_WEAK",
            DecisionCode::FailDedupe => "FAIL_DEDUPE",
            DecisionCode::FailCooldown => "FAIL_COOLDOWN",
            DecisionCode::FailFlipRearm => "FAIL_FLIP_REARM",
            DecisionCode::FailMinConsecutive => "FAIL_MIN_CONSECUTIVE",
            DecisionCode::FailGating => "FAIL_GATING",
            DecisionCode::FailExpired => "FAIL_EXPIRED",
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, DecisionCode::Ok)
    }

    /// Soft gating reasons: a downstream executor configured with
    /// `gating_mode=ignore_soft` may still act on these.
    #[inline]
    pub fn is_soft(&self) -> bool {
        matches!(self, DecisionCode::FailWeak | DecisionCode::FailConsistency)
    }

    /// Reasons that block execution under every gating mode: quality-of-data
    /// failures where acting would trade on stale or unpriced state.
    #[inline]
    pub fn is_hard_always_block(&self) -> bool {
        matches!(
            self,
            DecisionCode::FailSpread
                | DecisionCode::FailLag
                | DecisionCode::FailGating
                | DecisionCode::FailExpired
        )
    }
}

impl fmt::Display for DecisionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One canonical per-second record for one symbol after alignment and
/// normalization. Created by the aligner, consumed once by the signal core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub symbol: String,
    /// UTC milliseconds, strictly increasing per symbol within a session.
    pub ts_ms: Millis,
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_bps: f64,
    pub z_ofi: f64,
    pub z_cvd: f64,
    pub fusion_score: f64,
    /// 1-second return in basis points against the last non-gap mid.
    pub return_1s: f64,
    pub lag_ms_price: i64,
    pub lag_ms_orderbook: i64,
    pub lag_sec: f64,
    pub is_gap_second: bool,
    /// Fraction of expected sub-feeds present in this bucket, in [0, 1].
    pub consistency: f64,
    pub warmup: bool,
    pub scenario_2x2: Scenario,
}

impl FeatureRow {
    /// Book sanity: `best_bid <= mid <= best_ask` and non-negative spread.
    #[inline]
    pub fn book_is_sane(&self) -> bool {
        self.best_bid <= self.mid && self.mid <= self.best_ask && self.spread_bps >= 0.0
    }
}

/// A v2 signal record. Field declaration order is the canonical JSONL key
/// order; both sinks serialize the same fields in the same units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub schema_version: String,
    pub ts_ms: Millis,
    pub symbol: String,
    pub signal_id: String,
    pub run_id: String,
    /// Monotonic per run.
    pub seq: u64,
    pub side_hint: SideHint,
    /// Signed fused score; magnitude is confidence.
    pub score: f64,
    pub regime: Regime,
    #[serde(default)]
    pub div_type: Option<String>,
    /// 1 iff every quality/threshold check passed.
    pub gating: u8,
    pub confirm: bool,
    pub cooldown_ms: i64,
    pub expiry_ms: i64,
    pub decision_code: DecisionCode,
    pub decision_reason: String,
    pub config_hash: String,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl Signal {
    /// Hard contract: `confirm=true ⇒ gating=1 ∧ decision_code=OK ∧
    /// side_hint ∈ {buy, sell}`.
    #[inline]
    pub fn contract_ok(&self) -> bool {
        if !self.confirm {
            return true;
        }
        self.gating == 1
            && self.decision_code.is_ok()
            && !matches!(self.side_hint, SideHint::Flat)
    }

    /// The eight fields that must be byte-equal across sinks for the same
    /// `signal_id`.
    pub fn canonical_fields(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{:.10}|{}|{}",
            self.symbol,
            self.ts_ms,
            self.confirm,
            self.gating,
            self.decision_code,
            self.score,
            self.side_hint,
            self.config_hash
        )
    }

    /// Mid price carried in `meta`, if the feeder attached one.
    pub fn meta_mid_price(&self) -> Option<f64> {
        self.meta
            .get("mid_price")
            .or_else(|| self.meta.get("price"))
            .and_then(|v| v.as_f64())
            .filter(|p| *p > 0.0)
    }

    pub fn meta_scenario(&self) -> Option<Scenario> {
        self.meta
            .get("_feature_data")
            .and_then(|fd| fd.get("scenario_2x2"))
            .or_else(|| self.meta.get("scenario_2x2"))
            .and_then(|v| v.as_str())
            .and_then(Scenario::parse)
    }

    pub fn meta_spread_bps(&self) -> Option<f64> {
        self.meta
            .get("_feature_data")
            .and_then(|fd| fd.get("spread_bps"))
            .and_then(|v| v.as_f64())
    }
}

/// Order type for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// An order derived from a confirmed signal. `client_order_id` doubles as the
/// idempotency key and equals the `signal_id` when it fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    #[serde(default)]
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub ts_ms: Millis,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// Liquidity classification of a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    Maker,
    Taker,
    Unknown,
}

/// An execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub exec_price: f64,
    pub fee: f64,
    pub liquidity: Liquidity,
    pub ts_ms: Millis,
}

/// Open position, at most one net per symbol at any instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_ts_ms: Millis,
    /// Mid at entry; the price-move reference for `gross_pnl`.
    pub entry_px: f64,
    /// Slippage-adjusted executed price.
    pub entry_exec_px: f64,
    pub qty: f64,
    pub entry_fee: f64,
    pub entry_slip_cost: f64,
    pub entry_notional: f64,
    pub entry_maker_probability: f64,
    pub entry_scenario: Scenario,
    pub entry_signal_id: String,
}

impl Position {
    /// Unrealized PnL in basis points of the entry price at `mid`.
    #[inline]
    pub fn unrealized_pnl_bps(&self, mid: f64) -> f64 {
        if self.entry_px <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (mid - self.entry_px) / self.entry_px * 10_000.0
    }
}

/// Why a position was closed, in priority order of the exit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Timeout,
    StopLoss,
    TakeProfit,
    ReverseSignal,
    RolloverClose,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Timeout => "timeout",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::ReverseSignal => "reverse_signal",
            ExitReason::RolloverClose => "rollover_close",
        }
    }
}

/// A closed round-trip trade. `gross_pnl` is the atomic truth; `net_pnl`
/// must satisfy `net = gross - entry_fee - exit_fee - slippage_cost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub signal_id: String,
    pub side: Side,
    pub entry_ts_ms: Millis,
    pub exit_ts_ms: Millis,
    pub entry_px: f64,
    pub exit_px: f64,
    pub qty: f64,
    pub entry_notional: f64,
    pub gross_pnl: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub slippage_cost: f64,
    pub net_pnl: f64,
    pub reason: ExitReason,
    pub scenario_2x2: Scenario,
    /// Business date under the configured rollover timezone/hour.
    pub business_date: String,
    pub hold_sec: i64,
}

impl TradeRecord {
    /// Round-trip identity: net = gross - entry_fee - exit_fee -
    /// slippage_cost, within 1e-9.
    #[inline]
    pub fn pnl_identity_holds(&self) -> bool {
        (self.net_pnl - (self.gross_pnl - self.entry_fee - self.exit_fee - self.slippage_cost))
            .abs()
            < 1e-9
    }
}
