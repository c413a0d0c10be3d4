//! Equivalence Harness
//!
//! Runs the backtest execution path and the dry-run paper path side by side
//! over the same `(run_id, signal tape, mark stream, seed, config)` and
//! asserts they are indistinguishable: fill counts, per-index fill fields
//! within 1e-8, terminal positions, aggregate fee bps within 1 bps, and
//! terminal realized PnL. The first divergence is named by
//! `(symbol, ts_ms, field)` and fails the run.

use crate::adapter::{signal_to_order, BacktestAdapter, OrderAdapter, PaperAdapter};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::{Fill, Millis, Scenario, Signal};
use crate::sink::select_top1;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

pub const EPSILON: f64 = 1e-8;
pub const FEE_BPS_TOLERANCE: f64 = 1.0;

/// One mid-price observation on the shared tape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPoint {
    pub symbol: String,
    pub ts_ms: Millis,
    pub mid: f64,
    pub scenario: Option<Scenario>,
    pub spread_bps: f64,
}

/// First divergent observation between the two paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub symbol: String,
    pub ts_ms: Millis,
    pub field: String,
    pub backtest_value: f64,
    pub dry_run_value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EquivalenceReport {
    pub orders_submitted: usize,
    pub fills_backtest: usize,
    pub fills_dry_run: usize,
    pub contract_violations: u64,
    pub top1_dropped: usize,
    pub fee_bps_backtest: f64,
    pub fee_bps_dry_run: f64,
    pub pnl_backtest: f64,
    pub pnl_dry_run: f64,
    pub first_divergence: Option<Divergence>,
    pub failures: Vec<String>,
}

impl EquivalenceReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run both paths over the same tape and compare.
pub async fn run_equivalence(
    cfg: &Config,
    tape: &[Signal],
    marks: &[MarkPoint],
) -> Result<EquivalenceReport, PipelineError> {
    let mut report = EquivalenceReport::default();

    // Hard contract: no order may derive from a violating signal.
    let mut clean: Vec<Signal> = Vec::with_capacity(tape.len());
    for signal in tape {
        if signal.confirm && !signal.contract_ok() {
            report.contract_violations += 1;
            metrics::global().incr(metrics::CONTRACT_VIOLATIONS_TOTAL);
            warn!(signal_id = %signal.signal_id, "contract violation on equivalence tape");
            continue;
        }
        if signal.confirm {
            clean.push(signal.clone());
        }
    }

    // Top-1 idempotency under (symbol, ts_ms) collisions.
    let before = clean.len();
    let confirmed = select_top1(clean);
    report.top1_dropped = before - confirmed.len();

    let mut dry_cfg = cfg.clone();
    dry_cfg.adapter.dry_run = true;

    let mut backtest = BacktestAdapter::new(cfg, None);
    let mut dry_run = PaperAdapter::new(&dry_cfg, None);

    // Merge marks and signals into one time-ordered event tape; marks at a
    // given timestamp are applied before the signals carrying it.
    enum Event<'a> {
        Mark(&'a MarkPoint),
        Signal(&'a Signal),
    }
    let mut events: Vec<(Millis, u8, Event)> = Vec::new();
    for mark in marks {
        events.push((mark.ts_ms, 0, Event::Mark(mark)));
    }
    for signal in &confirmed {
        events.push((signal.ts_ms, 1, Event::Signal(signal)));
    }
    events.sort_by_key(|(ts, priority, _)| (*ts, *priority));

    let mut fills_a: Vec<Fill> = Vec::new();
    let mut fills_b: Vec<Fill> = Vec::new();

    for (_, _, event) in events {
        match event {
            Event::Mark(mark) => {
                backtest.set_mark(
                    &mark.symbol,
                    mark.ts_ms,
                    mark.mid,
                    mark.scenario,
                    mark.spread_bps,
                );
                dry_run.set_mark(
                    &mark.symbol,
                    mark.ts_ms,
                    mark.mid,
                    mark.scenario,
                    mark.spread_bps,
                );
            }
            Event::Signal(signal) => {
                let Some(order) = signal_to_order(signal, cfg.executor.order_size_usd) else {
                    continue;
                };
                report.orders_submitted += 1;
                let res_a = backtest.submit(order.clone()).await;
                let res_b = dry_run.submit(order.clone()).await;
                if res_a.is_ok() != res_b.is_ok() {
                    report.failures.push(format!(
                        "submit outcome diverged for {} ({} vs {})",
                        order.client_order_id,
                        res_a.is_ok(),
                        res_b.is_ok()
                    ));
                }
                fills_a.extend(backtest.fetch_fills());
                fills_b.extend(dry_run.fetch_fills());
            }
        }
    }

    report.fills_backtest = fills_a.len();
    report.fills_dry_run = fills_b.len();

    if fills_a.len() != fills_b.len() {
        report
            .failures
            .push(format!("fill count {} vs {}", fills_a.len(), fills_b.len()));
    }

    // Per-index fill comparison.
    for (fill_a, fill_b) in fills_a.iter().zip(fills_b.iter()) {
        if let Some(divergence) = compare_fills(fill_a, fill_b) {
            report.failures.push(format!(
                "fill divergence at ({}, {}): {} {} vs {}",
                divergence.symbol,
                divergence.ts_ms,
                divergence.field,
                divergence.backtest_value,
                divergence.dry_run_value
            ));
            if report.first_divergence.is_none() {
                report.first_divergence = Some(divergence);
            }
            break;
        }
    }

    // Terminal positions.
    let pos_a = backtest.positions();
    let pos_b = dry_run.positions();
    let symbols: std::collections::BTreeSet<&String> = pos_a.keys().chain(pos_b.keys()).collect();
    for symbol in symbols {
        let qty_a = pos_a.get(symbol).copied().unwrap_or(0.0);
        let qty_b = pos_b.get(symbol).copied().unwrap_or(0.0);
        if (qty_a - qty_b).abs() > EPSILON {
            report.failures.push(format!(
                "terminal position {} diverged: {} vs {}",
                symbol, qty_a, qty_b
            ));
        }
    }

    // Aggregate fees in bps of traded notional.
    report.fee_bps_backtest = fee_bps(&fills_a);
    report.fee_bps_dry_run = fee_bps(&fills_b);
    if (report.fee_bps_backtest - report.fee_bps_dry_run).abs() > FEE_BPS_TOLERANCE {
        report.failures.push(format!(
            "aggregate fee bps diverged: {:.4} vs {:.4}",
            report.fee_bps_backtest, report.fee_bps_dry_run
        ));
    }

    // Terminal realized PnL: cash delta of the fill stream, open positions
    // marked at their last observed mid.
    let last_mids = last_mids(marks);
    report.pnl_backtest = realized_pnl(&fills_a, &pos_a, &last_mids);
    report.pnl_dry_run = realized_pnl(&fills_b, &pos_b, &last_mids);
    if (report.pnl_backtest - report.pnl_dry_run).abs() > EPSILON {
        report.failures.push(format!(
            "terminal PnL diverged: {:.10} vs {:.10}",
            report.pnl_backtest, report.pnl_dry_run
        ));
    }

    backtest.close().await?;
    dry_run.close().await?;

    if report.passed() {
        info!(
            orders = report.orders_submitted,
            fills = report.fills_backtest,
            "equivalence holds"
        );
    } else {
        warn!(failures = report.failures.len(), "equivalence FAILED");
    }
    Ok(report)
}

fn compare_fills(a: &Fill, b: &Fill) -> Option<Divergence> {
    let fields: [(&str, f64, f64); 4] = [
        ("price", a.exec_price, b.exec_price),
        ("qty", a.qty, b.qty),
        ("fee", a.fee, b.fee),
        ("ts_ms", a.ts_ms as f64, b.ts_ms as f64),
    ];
    for (field, va, vb) in fields {
        if (va - vb).abs() > EPSILON {
            return Some(Divergence {
                symbol: a.symbol.clone(),
                ts_ms: a.ts_ms,
                field: field.to_string(),
                backtest_value: va,
                dry_run_value: vb,
            });
        }
    }
    if a.side != b.side {
        return Some(Divergence {
            symbol: a.symbol.clone(),
            ts_ms: a.ts_ms,
            field: "side".to_string(),
            backtest_value: a.side.sign(),
            dry_run_value: b.side.sign(),
        });
    }
    None
}

fn fee_bps(fills: &[Fill]) -> f64 {
    let notional: f64 = fills.iter().map(|f| f.qty * f.exec_price).sum();
    if notional <= 0.0 {
        return 0.0;
    }
    let fees: f64 = fills.iter().map(|f| f.fee).sum();
    fees / notional * 10_000.0
}

fn last_mids(marks: &[MarkPoint]) -> HashMap<String, f64> {
    let mut mids: BTreeMap<String, (Millis, f64)> = BTreeMap::new();
    for mark in marks {
        let entry = mids.entry(mark.symbol.clone()).or_insert((mark.ts_ms, mark.mid));
        if mark.ts_ms >= entry.0 {
            *entry = (mark.ts_ms, mark.mid);
        }
    }
    mids.into_iter().map(|(k, (_, mid))| (k, mid)).collect()
}

fn realized_pnl(
    fills: &[Fill],
    terminal_positions: &HashMap<String, f64>,
    last_mids: &HashMap<String, f64>,
) -> f64 {
    let mut cash = 0.0;
    for fill in fills {
        cash -= fill.side.sign() * fill.qty * fill.exec_price;
        cash -= fill.fee;
    }
    let mut marked = 0.0;
    for (symbol, qty) in terminal_positions {
        if let Some(mid) = last_mids.get(symbol) {
            marked += qty * mid;
        }
    }
    cash + marked
}
