//! Feature Normalizer
//!
//! Pure record transform between recorded/legacy feature encodings and the
//! canonical [`FeatureRow`]. Legacy names (`ofi_z`, `cvd_z`, `lag_ms_*`) are
//! renamed, missing quality fields get their documented defaults
//! (`consistency=1.0`, `warmup=false`, `spread_bps=2.0`). Idempotent: a
//! canonical row passes through unchanged.

use crate::models::{FeatureRow, Millis, Scenario};
use serde::Deserialize;

const DEFAULT_CONSISTENCY: f64 = 1.0;
const DEFAULT_SPREAD_BPS: f64 = 2.0;

/// Loosely-typed wire form accepted from recorded feature files.
#[derive(Debug, Deserialize)]
struct FeatureWire {
    symbol: String,
    ts_ms: Millis,
    #[serde(default, alias = "price")]
    mid: Option<f64>,
    #[serde(default)]
    best_bid: Option<f64>,
    #[serde(default)]
    best_ask: Option<f64>,
    #[serde(default)]
    spread_bps: Option<f64>,
    #[serde(default, alias = "ofi_z")]
    z_ofi: Option<f64>,
    #[serde(default, alias = "cvd_z")]
    z_cvd: Option<f64>,
    #[serde(default)]
    fusion_score: Option<f64>,
    #[serde(default)]
    return_1s: Option<f64>,
    #[serde(default)]
    lag_ms_price: Option<i64>,
    #[serde(default)]
    lag_ms_orderbook: Option<i64>,
    #[serde(default)]
    lag_sec: Option<f64>,
    #[serde(default)]
    is_gap_second: Option<bool>,
    #[serde(default)]
    consistency: Option<f64>,
    #[serde(default)]
    warmup: Option<bool>,
    #[serde(default)]
    scenario_2x2: Option<String>,
}

/// Decode one recorded feature object into the canonical row.
///
/// Returns `None` when the record has no usable mid price.
pub fn feature_from_value(value: &serde_json::Value) -> Option<FeatureRow> {
    let wire: FeatureWire = serde_json::from_value(value.clone()).ok()?;
    feature_from_wire(wire)
}

/// Decode one recorded feature JSONL line.
pub fn feature_from_line(line: &str) -> Option<FeatureRow> {
    let wire: FeatureWire = serde_json::from_str(line).ok()?;
    feature_from_wire(wire)
}

fn feature_from_wire(wire: FeatureWire) -> Option<FeatureRow> {
    let mid = wire.mid.filter(|m| *m > 0.0)?;
    let spread_bps = wire.spread_bps.unwrap_or(DEFAULT_SPREAD_BPS);
    let half_spread = mid * spread_bps / 10_000.0 / 2.0;
    let best_bid = wire.best_bid.unwrap_or(mid - half_spread);
    let best_ask = wire.best_ask.unwrap_or(mid + half_spread);

    // Aggregated legacy lag: the max of the per-feed lags, in seconds.
    let lag_ms_price = wire.lag_ms_price.unwrap_or(0);
    let lag_ms_orderbook = wire.lag_ms_orderbook.unwrap_or(0);
    let lag_sec = wire
        .lag_sec
        .unwrap_or_else(|| lag_ms_price.max(lag_ms_orderbook) as f64 / 1_000.0);

    let return_1s = wire.return_1s.unwrap_or(0.0);
    let scenario = wire
        .scenario_2x2
        .as_deref()
        .and_then(Scenario::parse)
        .unwrap_or(Scenario::QuietLow);

    Some(FeatureRow {
        symbol: wire.symbol,
        ts_ms: wire.ts_ms,
        mid,
        best_bid,
        best_ask,
        spread_bps,
        z_ofi: wire.z_ofi.unwrap_or(0.0),
        z_cvd: wire.z_cvd.unwrap_or(0.0),
        fusion_score: wire.fusion_score.unwrap_or(0.0),
        return_1s,
        lag_ms_price,
        lag_ms_orderbook,
        lag_sec,
        is_gap_second: wire.is_gap_second.unwrap_or(false),
        consistency: wire.consistency.unwrap_or(DEFAULT_CONSISTENCY),
        warmup: wire.warmup.unwrap_or(false),
        scenario_2x2: scenario,
    })
}
