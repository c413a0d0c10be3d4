//! Broker Adapter
//!
//! Uniform order-submission surface with two variants fronting the same
//! deterministic fill core: the backtest adapter fills immediately at the
//! caller-provided mark, the paper (testnet/live) adapter speaks HTTP but
//! synthesizes the identical fills when `dry_run` is set. Quantities and
//! prices are normalized to the exchange grid before submission and
//! min-notional violations are rejected locally.

pub mod backtest;
pub mod paper;
pub mod rate_limit;

pub use backtest::BacktestAdapter;
pub use paper::PaperAdapter;
pub use rate_limit::{AdapterLimiter, TokenBucket};

use crate::errors::PipelineError;
use crate::exec::{default_mid_for_symbol, FeeEngine, SlippageEngine};
use crate::metrics;
use crate::models::{Fill, Millis, Order, OrderType, Scenario, Side, Signal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;

/// The polymorphic adapter surface shared by all variants.
#[async_trait]
pub trait OrderAdapter: Send {
    /// Submit an order; returns the accepted `client_order_id`.
    async fn submit(&mut self, order: Order) -> Result<String, PipelineError>;
    async fn cancel(&mut self, client_order_id: &str) -> Result<(), PipelineError>;
    /// Drain fills observed since the last call.
    fn fetch_fills(&mut self) -> Vec<Fill>;
    /// Net position per symbol.
    fn positions(&self) -> HashMap<String, f64>;
    async fn close(&mut self) -> Result<(), PipelineError>;
}

/// Exchange grid constraints for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_notional: f64,
}

impl SymbolFilters {
    /// Static defaults mirroring the USDT-perp majors; anything unknown gets
    /// the conservative generic grid.
    pub fn for_symbol(symbol: &str) -> Self {
        let upper = symbol.to_ascii_uppercase();
        if upper.contains("BTC") {
            Self {
                tick_size: 0.1,
                lot_size: 0.000_01,
                min_notional: 10.0,
            }
        } else if upper.contains("ETH") {
            Self {
                tick_size: 0.01,
                lot_size: 0.000_1,
                min_notional: 10.0,
            }
        } else {
            Self {
                tick_size: 0.01,
                lot_size: 0.001,
                min_notional: 10.0,
            }
        }
    }
}

/// Round down to a grid step, damping float error.
#[inline]
pub fn round_to_grid(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    ((value / step) + 1e-9).floor() * step
}

/// Normalize an order to the exchange grid. Rejects min-notional violations
/// locally, before anything touches the wire.
pub fn normalize_order(order: &mut Order, filters: &SymbolFilters) -> Result<(), PipelineError> {
    order.qty = round_to_grid(order.qty, filters.lot_size);
    if let Some(price) = order.price {
        order.price = Some(round_to_grid(price, filters.tick_size));
    }
    if order.qty <= 0.0 {
        return Err(PipelineError::AdapterRejected(format!(
            "{}: qty rounds to zero on lot grid {}",
            order.client_order_id, filters.lot_size
        )));
    }
    let reference_px = order
        .price
        .or_else(|| order.meta.get("mid_price").and_then(|v| v.as_f64()))
        .unwrap_or_else(|| default_mid_for_symbol(&order.symbol));
    let notional = order.qty * reference_px;
    if notional < filters.min_notional {
        return Err(PipelineError::AdapterRejected(format!(
            "{}: notional {:.4} below min {:.2}",
            order.client_order_id, notional, filters.min_notional
        )));
    }
    Ok(())
}

/// Convert a confirmed signal into an order, the single place where signals
/// become order intent. Returns `None` for anything not actionable.
pub fn signal_to_order(signal: &Signal, order_size_usd: f64) -> Option<Order> {
    if !signal.confirm || signal.gating != 1 {
        return None;
    }
    let side = signal.side_hint.as_side()?;
    let mid = signal
        .meta_mid_price()
        .unwrap_or_else(|| default_mid_for_symbol(&signal.symbol));
    if mid <= 0.0 {
        return None;
    }
    let qty = order_size_usd / mid;

    let mut meta = serde_json::Map::new();
    meta.insert("mid_price".into(), json!(mid));
    meta.insert("score".into(), json!(signal.score));
    meta.insert("signal_id".into(), json!(signal.signal_id));
    if let Some(scenario) = signal.meta_scenario() {
        meta.insert("scenario_2x2".into(), json!(scenario.as_str()));
    }
    if let Some(spread) = signal.meta_spread_bps() {
        meta.insert("spread_bps".into(), json!(spread));
    }

    Some(Order {
        client_order_id: signal.signal_id.clone(),
        symbol: signal.symbol.clone(),
        side,
        qty,
        price: None,
        order_type: OrderType::Market,
        ts_ms: signal.ts_ms,
        meta,
    })
}

/// Adapter lifecycle event, one JSONL line per transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub ts_ms: Millis,
    pub kind: AdapterEventKind,
    pub client_order_id: String,
    pub symbol: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterEventKind {
    Submit,
    Ack,
    Fill,
    Reject,
}

/// Append-only `adapter_event-*.jsonl` stream per symbol.
pub struct AdapterEventLog {
    root: PathBuf,
    run_id: String,
    open: HashMap<String, File>,
}

impl AdapterEventLog {
    pub fn new(output_dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: output_dir.into(),
            run_id: run_id.into(),
            open: HashMap::new(),
        }
    }

    pub fn record(&mut self, event: &AdapterEvent) -> Result<()> {
        if !self.open.contains_key(&event.symbol) {
            let dir = self.root.join("ready").join("adapter").join(&event.symbol);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create adapter dir {}", dir.display()))?;
            let path = dir.join(format!("adapter_event-{}.jsonl", self.run_id));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open adapter event log {}", path.display()))?;
            self.open.insert(event.symbol.clone(), file);
        }
        let file = self.open.get_mut(&event.symbol).expect("log just opened");
        let mut line = serde_json::to_vec(event).context("serialize adapter event")?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<()> {
        for file in self.open.values_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// The deterministic fill core both adapter variants front: marks keyed by
/// symbol, shared fee/slippage engines, and a caller-driven clock.
pub struct FillSynth {
    fees: FeeEngine,
    slippage: SlippageEngine,
    marks: HashMap<String, MarkState>,
    now_ms: Millis,
}

#[derive(Debug, Clone, Copy)]
pub struct MarkState {
    pub ts_ms: Millis,
    pub mid: f64,
    pub scenario: Option<Scenario>,
    pub spread_bps: f64,
}

impl FillSynth {
    pub fn new(bt: &crate::config::BacktestConfig) -> Self {
        Self {
            fees: FeeEngine::new(bt),
            slippage: SlippageEngine::new(bt),
            marks: HashMap::new(),
            now_ms: 0,
        }
    }

    /// Advance the adapter clock and record the market state used for fills.
    pub fn set_mark(
        &mut self,
        symbol: &str,
        ts_ms: Millis,
        mid: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
    ) {
        self.now_ms = self.now_ms.max(ts_ms);
        self.marks.insert(
            symbol.to_string(),
            MarkState {
                ts_ms,
                mid,
                scenario,
                spread_bps,
            },
        );
    }

    pub fn now_ms(&self) -> Millis {
        self.now_ms
    }

    /// Fill an order at the current mark, adjusted by the cost models.
    pub fn synthesize(&mut self, order: &Order) -> Result<Fill, PipelineError> {
        let mark = self.marks.get(&order.symbol).copied().ok_or_else(|| {
            PipelineError::AdapterRejected(format!(
                "{}: no mark price for {}",
                order.client_order_id, order.symbol
            ))
        })?;
        let exec_price = self
            .slippage
            .apply(order.side, mark.mid, mark.scenario, mark.spread_bps);
        let assessment = self.fees.assess(
            order.qty * mark.mid,
            mark.scenario,
            mark.spread_bps,
            order.side,
        );
        Ok(Fill {
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            exec_price,
            fee: assessment.fee,
            liquidity: assessment.liquidity,
            ts_ms: self.now_ms,
        })
    }
}

pub(crate) fn record_submit_metrics(result: &str, reason: &str) {
    metrics::global().incr(&metrics::labelled(
        metrics::EXECUTOR_SUBMIT_TOTAL,
        &[("result", result), ("reason", reason)],
    ));
}

pub(crate) fn apply_fill_to_positions(positions: &mut HashMap<String, f64>, fill: &Fill) {
    let entry = positions.entry(fill.symbol.clone()).or_insert(0.0);
    *entry += match fill.side {
        Side::Buy => fill.qty,
        Side::Sell => -fill.qty,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionCode, Regime, SideHint, SIGNAL_SCHEMA_VERSION};

    #[test]
    fn grid_rounding_rounds_down() {
        assert!((round_to_grid(0.001234, 0.000_01) - 0.00123).abs() < 1e-12);
        assert!((round_to_grid(50_000.07, 0.1) - 50_000.0).abs() < 1e-9);
        // exact multiples survive
        assert!((round_to_grid(0.002, 0.001) - 0.002).abs() < 1e-12);
    }

    #[test]
    fn min_notional_rejected_locally() {
        let mut order = Order {
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            qty: 0.000_01,
            price: None,
            order_type: OrderType::Market,
            ts_ms: 0,
            meta: {
                let mut m = serde_json::Map::new();
                m.insert("mid_price".into(), json!(50_000.0));
                m
            },
        };
        let filters = SymbolFilters::for_symbol("BTCUSDT");
        // 0.00001 * 50000 = 0.5 < 10
        match normalize_order(&mut order, &filters) {
            Err(PipelineError::AdapterRejected(msg)) => assert!(msg.contains("below min")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn signal_to_order_only_accepts_confirmed() {
        let mut signal = Signal {
            schema_version: SIGNAL_SCHEMA_VERSION.into(),
            ts_ms: 1_700_000_000_000,
            symbol: "BTCUSDT".into(),
            signal_id: "sig-1".into(),
            run_id: "run".into(),
            seq: 0,
            side_hint: SideHint::Buy,
            score: 2.0,
            regime: Regime::Trend,
            div_type: None,
            gating: 1,
            confirm: true,
            cooldown_ms: 0,
            expiry_ms: 0,
            decision_code: DecisionCode::Ok,
            decision_reason: String::new(),
            config_hash: "cafebabecafebabe".into(),
            meta: {
                let mut m = serde_json::Map::new();
                m.insert("mid_price".into(), json!(50_000.0));
                m
            },
        };

        let order = signal_to_order(&signal, 100.0).unwrap();
        assert_eq!(order.client_order_id, "sig-1");
        assert!((order.qty - 0.002).abs() < 1e-12);
        assert_eq!(order.order_type, OrderType::Market);

        signal.confirm = false;
        assert!(signal_to_order(&signal, 100.0).is_none());

        signal.confirm = true;
        signal.side_hint = SideHint::Flat;
        assert!(signal_to_order(&signal, 100.0).is_none());
    }

    #[test]
    fn fill_synth_requires_a_mark() {
        let bt = crate::config::Config::default().backtest;
        let mut synth = FillSynth::new(&bt);
        let order = Order {
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            qty: 0.002,
            price: None,
            order_type: OrderType::Market,
            ts_ms: 0,
            meta: serde_json::Map::new(),
        };
        assert!(synth.synthesize(&order).is_err());

        synth.set_mark("BTCUSDT", 1_000, 50_000.0, None, 1.0);
        let fill = synth.synthesize(&order).unwrap();
        assert_eq!(fill.ts_ms, 1_000);
        assert!(fill.exec_price >= 50_000.0); // buy slips upward
    }

    #[test]
    fn event_log_writes_per_symbol_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = AdapterEventLog::new(tmp.path(), "run-1");
        log.record(&AdapterEvent {
            ts_ms: 1,
            kind: AdapterEventKind::Submit,
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            detail: json!({"qty": 0.002}),
        })
        .unwrap();
        log.sync_all().unwrap();
        let path = tmp
            .path()
            .join("ready/adapter/BTCUSDT/adapter_event-run-1.jsonl");
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"submit\""));
    }
}
