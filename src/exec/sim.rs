//! Trade Simulator
//!
//! Deterministic position/PnL engine. Consumes actionable signals plus a
//! mid-price stream and maintains at most one net position per symbol.
//! Exit rules are evaluated on every tick in a fixed priority ladder;
//! `gross_pnl` is the mid-to-mid price move and stays the atomic truth,
//! with fees and slippage deducted exactly once into `net_pnl`.
//!
//! Given the same signal tape, mid stream, config, and seed, two runs are
//! bit-identical.

use crate::config::{Config, GatingMode};
use crate::errors::PipelineError;
use crate::exec::{default_mid_for_symbol, FeeEngine, RolloverCalendar, SlippageEngine};
use crate::metrics;
use crate::models::{
    ExitReason, Millis, Position, Scenario, Side, Signal, TradeRecord,
};
use crate::signal::is_actionable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::Path;
use tracing::{debug, warn};

/// Latest observed market state for one symbol.
#[derive(Debug, Clone, Copy)]
struct Mark {
    ts_ms: Millis,
    mid: f64,
    scenario: Option<Scenario>,
    spread_bps: f64,
}

/// Aggregate trade statistics for the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub fees_paid: f64,
    pub slippage_cost: f64,
    pub by_reason: BTreeMap<String, u64>,
    pub contract_violations: u64,
    pub expired_skipped: u64,
}

pub struct TradeSimulator {
    cfg: Config,
    gating_mode: GatingMode,
    fees: FeeEngine,
    slippage: SlippageEngine,
    rollover: RolloverCalendar,
    positions: HashMap<String, Position>,
    marks: HashMap<String, Mark>,
    trades: Vec<TradeRecord>,
    contract_violations: u64,
    expired_skipped: u64,
}

impl TradeSimulator {
    pub fn new(cfg: &Config) -> Result<Self, PipelineError> {
        let rollover = RolloverCalendar::new(
            &cfg.backtest.rollover_timezone,
            cfg.backtest.rollover_hour,
        )?;
        Ok(Self {
            gating_mode: cfg.effective_gating_mode(),
            fees: FeeEngine::new(&cfg.backtest),
            slippage: SlippageEngine::new(&cfg.backtest),
            rollover,
            positions: HashMap::new(),
            marks: HashMap::new(),
            trades: Vec::new(),
            contract_violations: 0,
            expired_skipped: 0,
            cfg: cfg.clone(),
        })
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn contract_violations(&self) -> u64 {
        self.contract_violations
    }

    /// Process one mid-price tick: rollover first (against the previous
    /// mark), then the exit ladder at the new price.
    pub fn on_tick(
        &mut self,
        symbol: &str,
        ts_ms: Millis,
        mid: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
    ) {
        // Rollover close happens at the LAST observed mid and market ts,
        // never at the tick that revealed the boundary.
        if let Some(prev) = self.marks.get(symbol).copied() {
            if self.positions.contains_key(symbol)
                && self.rollover.crosses_boundary(prev.ts_ms, ts_ms)
            {
                self.close_position(symbol, prev.mid, prev.ts_ms, ExitReason::RolloverClose);
            }
        }

        self.marks.insert(
            symbol.to_string(),
            Mark {
                ts_ms,
                mid,
                scenario,
                spread_bps,
            },
        );

        let Some(pos) = self.positions.get(symbol) else {
            return;
        };
        let bt = &self.cfg.backtest;
        let held_sec = (ts_ms - pos.entry_ts_ms) / 1_000;
        let pnl_bps = pos.unrealized_pnl_bps(mid);

        // Exit priority ladder; the first satisfied rule wins.
        let exit = if held_sec >= bt.max_hold_time_sec {
            Some(ExitReason::Timeout)
        } else if bt.force_timeout_exit && held_sec >= bt.min_hold_time_sec {
            Some(ExitReason::Timeout)
        } else if pnl_bps <= -bt.stop_loss_bps {
            // Stop-loss is never gated by min hold time.
            Some(ExitReason::StopLoss)
        } else if pnl_bps >= bt.take_profit_bps && held_sec >= bt.min_hold_time_sec {
            Some(ExitReason::TakeProfit)
        } else {
            None
        };

        if let Some(reason) = exit {
            self.close_position(symbol, mid, ts_ms, reason);
        }
    }

    /// Process one signal. Contract-violating signals are rejected and
    /// counted; they never become orders. The run is failed at the end when
    /// any were seen.
    pub fn on_signal(&mut self, signal: &Signal) {
        if signal.confirm && !signal.contract_ok() {
            self.contract_violations += 1;
            metrics::global().incr(metrics::CONTRACT_VIOLATIONS_TOTAL);
            warn!(
                signal_id = %signal.signal_id,
                gating = signal.gating,
                code = %signal.decision_code,
                "contract-violating signal rejected before execution"
            );
            return;
        }
        if !is_actionable(signal, self.gating_mode) {
            return;
        }
        let Some(side) = signal.side_hint.as_side() else {
            return;
        };

        // Freshness: a tape can replay stale signals after the market moved on.
        if let Some(mark) = self.marks.get(&signal.symbol) {
            if mark.ts_ms > signal.expiry_ms {
                self.expired_skipped += 1;
                debug!(signal_id = %signal.signal_id, "expired signal skipped");
                return;
            }
        }

        let mark = self.marks.get(&signal.symbol).copied();
        let mid = signal
            .meta_mid_price()
            .or(mark.map(|m| m.mid))
            .unwrap_or_else(|| default_mid_for_symbol(&signal.symbol));
        let scenario = signal.meta_scenario().or(mark.and_then(|m| m.scenario));
        let spread_bps = signal
            .meta_spread_bps()
            .or(mark.map(|m| m.spread_bps))
            .unwrap_or(2.0);

        match self.positions.get(&signal.symbol) {
            Some(pos) if pos.side == side => {
                // Already positioned this way; no pyramiding.
            }
            Some(pos) => {
                // Reverse-signal exit: respect the deadband and min hold.
                let bt = &self.cfg.backtest;
                let held_sec = (signal.ts_ms - pos.entry_ts_ms) / 1_000;
                let pnl_bps = pos.unrealized_pnl_bps(mid);
                if pnl_bps.abs() > bt.deadband_bps && held_sec >= bt.min_hold_time_sec {
                    self.close_position(
                        &signal.symbol,
                        mid,
                        signal.ts_ms,
                        ExitReason::ReverseSignal,
                    );
                    self.open_position(signal, side, mid, scenario, spread_bps);
                }
            }
            None => {
                self.open_position(signal, side, mid, scenario, spread_bps);
            }
        }
    }

    fn open_position(
        &mut self,
        signal: &Signal,
        side: Side,
        mid: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
    ) {
        let bt = &self.cfg.backtest;
        if mid <= 0.0 || bt.notional_per_trade <= 0.0 {
            return;
        }
        let qty = bt.notional_per_trade / mid;
        let exec_px = self.slippage.apply(side, mid, scenario, spread_bps);
        let entry_slip_cost = qty * (exec_px - mid).abs();
        let entry_notional = qty * mid;
        let assessment = self.fees.assess(entry_notional, scenario, spread_bps, side);

        let position = Position {
            symbol: signal.symbol.clone(),
            side,
            entry_ts_ms: signal.ts_ms,
            entry_px: mid,
            entry_exec_px: exec_px,
            qty,
            entry_fee: assessment.fee,
            entry_slip_cost,
            entry_notional,
            entry_maker_probability: assessment.maker_probability,
            entry_scenario: scenario.unwrap_or(Scenario::QuietLow),
            entry_signal_id: signal.signal_id.clone(),
        };
        debug!(
            symbol = %position.symbol,
            side = %side,
            qty = qty,
            entry_px = mid,
            "position opened"
        );
        self.positions.insert(signal.symbol.clone(), position);
    }

    fn close_position(&mut self, symbol: &str, exit_mid: f64, exit_ts_ms: Millis, reason: ExitReason) {
        let Some(pos) = self.positions.remove(symbol) else {
            return;
        };
        let closing_side = pos.side.opposite();
        let (scenario, spread_bps) = self
            .marks
            .get(symbol)
            .map(|m| (m.scenario, m.spread_bps))
            .unwrap_or((Some(pos.entry_scenario), 2.0));

        let exit_exec_px = self
            .slippage
            .apply(closing_side, exit_mid, scenario, spread_bps);
        let exit_slip_cost = pos.qty * (exit_exec_px - exit_mid).abs();
        let exit_notional = pos.qty * exit_mid;
        let exit_fee = self
            .fees
            .assess(exit_notional, scenario, spread_bps, closing_side)
            .fee;

        let gross_pnl = pos.side.sign() * (exit_mid - pos.entry_px) * pos.qty;
        let slippage_cost = pos.entry_slip_cost + exit_slip_cost;
        let net_pnl = gross_pnl - pos.entry_fee - exit_fee - slippage_cost;

        let trade = TradeRecord {
            symbol: symbol.to_string(),
            signal_id: pos.entry_signal_id.clone(),
            side: pos.side,
            entry_ts_ms: pos.entry_ts_ms,
            exit_ts_ms,
            entry_px: pos.entry_px,
            exit_px: exit_mid,
            qty: pos.qty,
            entry_notional: pos.entry_notional,
            gross_pnl,
            entry_fee: pos.entry_fee,
            exit_fee,
            slippage_cost,
            net_pnl,
            reason,
            scenario_2x2: pos.entry_scenario,
            business_date: self.rollover.business_date(exit_ts_ms).to_string(),
            hold_sec: (exit_ts_ms - pos.entry_ts_ms) / 1_000,
        };
        debug_assert!(trade.pnl_identity_holds());
        debug!(
            symbol = %trade.symbol,
            reason = ?trade.reason,
            net_pnl = trade.net_pnl,
            "position closed"
        );
        self.trades.push(trade);
    }

    /// Force-close every open position at its last observed mark, stamped
    /// with the last market `ts_ms`.
    pub fn close_all(&mut self) {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        for symbol in symbols {
            if let Some(mark) = self.marks.get(&symbol).copied() {
                self.close_position(&symbol, mark.mid, mark.ts_ms, ExitReason::RolloverClose);
            }
        }
    }

    pub fn stats(&self) -> TradeStats {
        let mut stats = TradeStats {
            trades: self.trades.len(),
            contract_violations: self.contract_violations,
            expired_skipped: self.expired_skipped,
            ..TradeStats::default()
        };
        for trade in &self.trades {
            if trade.net_pnl > 0.0 {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }
            stats.gross_pnl += trade.gross_pnl;
            stats.net_pnl += trade.net_pnl;
            stats.fees_paid += trade.entry_fee + trade.exit_fee;
            stats.slippage_cost += trade.slippage_cost;
            *stats
                .by_reason
                .entry(trade.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Serialize the closed trades, one JSON object per line. Byte-identical
    /// across identical runs.
    pub fn write_trades_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("create {}", path.display()))?;
        for trade in &self.trades {
            let mut line = serde_json::to_vec(trade).context("serialize trade")?;
            line.push(b'\n');
            file.write_all(&line).context("append trade line")?;
        }
        file.flush().context("flush trades")?;
        Ok(())
    }
}
