//! Signal Core
//!
//! Per-symbol scoring/gating/confirmation state machine. Every feature row
//! produces exactly one signal — rejected rows emit `confirm=false` with the
//! failing decision code so the sinks capture the full decision trail.
//! Checks run in a fixed order and the first failure short-circuits.
//!
//! Gating failures here are ordinary values, never errors. The only error
//! this module can produce is a hard contract violation at emit time, and
//! that one is fatal.

use crate::config::{Config, GatingMode};
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::{
    DecisionCode, FeatureRow, Millis, Regime, SideHint, Signal, SIGNAL_ID_MAX_LEN,
    SIGNAL_SCHEMA_VERSION,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::{error, trace};

/// Freshness horizon stamped into `expiry_ms`; consumers skip anything
/// older than this relative to their own clock.
const SIGNAL_TTL_MS: i64 = 60_000;

/// Mutable per-symbol state. Owned exclusively by the core.
#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    pub seen_rows: u64,
    /// Timestamp of the last *admitted* signal.
    pub last_emit_ts: Millis,
    pub cooldown_until: Millis,
    pub last_side_hint: Option<SideHint>,
    pub last_abs_score: f64,
    pub consecutive_same_dir: u32,
}

/// Per-run gate statistics: emitted signal counts per decision code.
pub type GateStats = BTreeMap<String, u64>;

/// The signal core. One instance per run; per-symbol state inside.
pub struct SignalCore {
    cfg: Config,
    run_id: String,
    config_hash: String,
    seq: u64,
    states: HashMap<String, SymbolState>,
    gate_stats: GateStats,
}

impl SignalCore {
    pub fn new(cfg: Config, run_id: impl Into<String>) -> Self {
        let config_hash = cfg.config_hash();
        Self {
            cfg,
            run_id: run_id.into(),
            config_hash,
            seq: 0,
            states: HashMap::new(),
            gate_stats: GateStats::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn gate_stats(&self) -> &GateStats {
        &self.gate_stats
    }

    /// Evaluate one feature row. Always returns a signal; errs only on a
    /// hard contract violation (which is a bug, not an input condition).
    pub fn on_feature(&mut self, row: &FeatureRow) -> Result<Signal, PipelineError> {
        let state = self.states.entry(row.symbol.clone()).or_default();
        state.seen_rows += 1;

        let fusion = &self.cfg.components.fusion;
        let score = fusion.w_ofi * row.z_ofi + fusion.w_cvd * row.z_cvd;

        let thresholds = if row.scenario_2x2.is_active() {
            &self.cfg.signal.thresholds.active
        } else {
            &self.cfg.signal.thresholds.quiet
        };
        let side_hint = if score >= thresholds.buy {
            SideHint::Buy
        } else if score <= thresholds.sell {
            SideHint::Sell
        } else {
            SideHint::Flat
        };

        let regime = classify_regime(row, score);

        // The cascade: first failure wins, later checks are skipped.
        let decision = self.evaluate(row, score, side_hint);

        let state = self.states.get_mut(&row.symbol).expect("state exists");
        let (gating, confirm) = match decision.code {
            DecisionCode::Ok => (1u8, true),
            DecisionCode::FailMinConsecutive => (1u8, false),
            _ => (0u8, false),
        };

        // State transitions.
        match decision.code {
            DecisionCode::Ok => {
                let cooldown_ms = (fusion.adaptive_cooldown_k * fusion.expected_hold_sec * 1_000.0)
                    .round() as i64;
                state.last_emit_ts = row.ts_ms;
                state.cooldown_until = row.ts_ms + cooldown_ms;
                state.consecutive_same_dir = if state.last_side_hint == Some(side_hint) {
                    state.consecutive_same_dir + 1
                } else {
                    1
                };
                state.last_side_hint = Some(side_hint);
                state.last_abs_score = score.abs();
            }
            DecisionCode::FailMinConsecutive => {
                state.consecutive_same_dir = if state.last_side_hint == Some(side_hint) {
                    state.consecutive_same_dir + 1
                } else {
                    1
                };
                state.last_side_hint = Some(side_hint);
            }
            _ => {}
        }

        let cooldown_ms = if confirm {
            state.cooldown_until - row.ts_ms
        } else {
            0
        };

        let seq = self.seq;
        self.seq += 1;

        let mut meta = serde_json::Map::new();
        meta.insert("z_ofi".into(), json!(row.z_ofi));
        meta.insert("z_cvd".into(), json!(row.z_cvd));
        meta.insert("mid_price".into(), json!(row.mid));

        let signal = Signal {
            schema_version: SIGNAL_SCHEMA_VERSION.to_string(),
            ts_ms: row.ts_ms,
            symbol: row.symbol.clone(),
            signal_id: make_signal_id(&self.run_id, row.ts_ms, seq, &row.symbol),
            run_id: self.run_id.clone(),
            seq,
            side_hint,
            score,
            regime,
            div_type: None,
            gating,
            confirm,
            cooldown_ms,
            expiry_ms: row.ts_ms + SIGNAL_TTL_MS,
            decision_code: decision.code,
            decision_reason: decision.reason,
            config_hash: self.config_hash.clone(),
            meta,
        };

        *self
            .gate_stats
            .entry(signal.decision_code.as_str().to_string())
            .or_insert(0) += 1;

        self.check_contract(&signal)?;
        trace!(
            symbol = %signal.symbol,
            ts_ms = signal.ts_ms,
            code = %signal.decision_code,
            score = signal.score,
            "signal emitted"
        );
        Ok(signal)
    }

    fn evaluate(&self, row: &FeatureRow, score: f64, side_hint: SideHint) -> Decision {
        let sig = &self.cfg.signal;
        let fusion = &self.cfg.components.fusion;
        let state = self.states.get(&row.symbol).expect("state exists");

        // 1. Warmup.
        if row.warmup || state.seen_rows < sig.warmup_min {
            return Decision::fail(
                DecisionCode::FailWarmup,
                format!("seen {} rows < warmup_min {}", state.seen_rows, sig.warmup_min),
            );
        }

        // 2. Quality gates, in fixed order: lag, spread, consistency.
        if row.lag_sec > sig.lag_max_sec {
            return Decision::fail(
                DecisionCode::FailLag,
                format!("lag {:.2}s > {:.2}s", row.lag_sec, sig.lag_max_sec),
            );
        }
        if row.spread_bps > sig.spread_max_bps {
            return Decision::fail(
                DecisionCode::FailSpread,
                format!("spread {:.2}bps > {:.2}bps", row.spread_bps, sig.spread_max_bps),
            );
        }
        if row.consistency < sig.consistency_min {
            return Decision::fail(
                DecisionCode::FailConsistency,
                format!(
                    "consistency {:.2} < {:.2}",
                    row.consistency, sig.consistency_min
                ),
            );
        }

        // 5. Weak-signal filter (3/4 — fusion and side proposal — are inputs).
        if score.abs() < sig.weak_signal_threshold {
            return Decision::fail(
                DecisionCode::FailWeak,
                format!(
                    "|score| {:.3} < {:.3}",
                    score.abs(),
                    sig.weak_signal_threshold
                ),
            );
        }
        if side_hint == SideHint::Flat {
            return Decision::fail(
                DecisionCode::FailGating,
                "score inside entry thresholds".to_string(),
            );
        }

        // 6. Dedupe against the last admitted signal.
        if row.ts_ms - state.last_emit_ts < sig.dedupe_ms
            && state.last_side_hint == Some(side_hint)
            && state.last_emit_ts > 0
        {
            return Decision::fail(
                DecisionCode::FailDedupe,
                format!("{}ms since last emit", row.ts_ms - state.last_emit_ts),
            );
        }

        // 7. Cooldown.
        if row.ts_ms < state.cooldown_until {
            return Decision::fail(
                DecisionCode::FailCooldown,
                format!("cooldown until {}", state.cooldown_until),
            );
        }

        // 8. Flip hysteresis: direction changes need extra conviction.
        if let Some(last_side) = state.last_side_hint {
            if last_side != side_hint
                && score.abs() < state.last_abs_score + fusion.flip_rearm_margin
            {
                return Decision::fail(
                    DecisionCode::FailFlipRearm,
                    format!(
                        "|score| {:.3} < {:.3} rearm bar",
                        score.abs(),
                        state.last_abs_score + fusion.flip_rearm_margin
                    ),
                );
            }
        }

        // 9. Consecutive-same-direction minimum.
        let candidate_consecutive = if state.last_side_hint == Some(side_hint) {
            state.consecutive_same_dir + 1
        } else {
            1
        };
        if candidate_consecutive < sig.min_consecutive_same_dir {
            return Decision::fail(
                DecisionCode::FailMinConsecutive,
                format!(
                    "{} consecutive < {}",
                    candidate_consecutive, sig.min_consecutive_same_dir
                ),
            );
        }

        // 10. Admit.
        Decision {
            code: DecisionCode::Ok,
            reason: String::new(),
        }
    }

    /// Defensive assertion of the hard contract at emit time.
    fn check_contract(&self, signal: &Signal) -> Result<(), PipelineError> {
        debug_assert!(signal.contract_ok(), "emit-time contract violation");
        if !signal.contract_ok() {
            metrics::global().incr(metrics::CONTRACT_VIOLATIONS_TOTAL);
            error!(
                signal_id = %signal.signal_id,
                gating = signal.gating,
                code = %signal.decision_code,
                "contract violation at emit"
            );
            return Err(PipelineError::ContractViolation(format!(
                "signal {} confirm=true with gating={} code={}",
                signal.signal_id, signal.gating, signal.decision_code
            )));
        }
        Ok(())
    }
}

struct Decision {
    code: DecisionCode,
    reason: String,
}

impl Decision {
    fn fail(code: DecisionCode, reason: String) -> Self {
        Self { code, reason }
    }
}

/// Coarse regime from the row's scenario and score alignment with the
/// 1-second return: flow pushing with the move is trend, against it revert.
fn classify_regime(row: &FeatureRow, score: f64) -> Regime {
    if !row.scenario_2x2.is_high_vol() && score.abs() < 1.0 {
        Regime::Quiet
    } else if score * row.return_1s >= 0.0 {
        Regime::Trend
    } else {
        Regime::Revert
    }
}

/// Deterministic, collision-resistant-enough id:
/// `run_id[:10] - ts_ms%10^6 - seq%100 - symbol[-4:]`, max 36 chars.
pub fn make_signal_id(run_id: &str, ts_ms: Millis, seq: u64, symbol: &str) -> String {
    let run_short: String = run_id.chars().take(10).collect();
    let ts_short = ts_ms.rem_euclid(1_000_000);
    let seq_short = seq % 100;
    let sym_tail: String = {
        let chars: Vec<char> = symbol.chars().collect();
        let start = chars.len().saturating_sub(4);
        chars[start..].iter().collect()
    };
    let id = format!("{}-{:06}-{:02}-{}", run_short, ts_short, seq_short, sym_tail);
    id.chars().take(SIGNAL_ID_MAX_LEN).collect()
}

/// Whether the downstream executor may act on this signal under the
/// configured gating mode. Never affects what was stamped on the record.
pub fn is_actionable(signal: &Signal, mode: GatingMode) -> bool {
    if signal.side_hint.as_side().is_none() {
        return false;
    }
    if signal.confirm {
        return true;
    }
    match mode {
        GatingMode::Strict => false,
        GatingMode::IgnoreSoft => signal.decision_code.is_soft(),
        GatingMode::IgnoreAll => !signal.decision_code.is_hard_always_block(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scenario;

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.signal.warmup_min = 2;
        cfg.signal.weak_signal_threshold = 0.5;
        cfg.signal.dedupe_ms = 1_500;
        cfg.signal.min_consecutive_same_dir = 1;
        cfg.signal.thresholds.active.buy = 1.0;
        cfg.signal.thresholds.active.sell = -1.0;
        cfg.signal.thresholds.quiet.buy = 1.0;
        cfg.signal.thresholds.quiet.sell = -1.0;
        cfg.components.fusion.w_ofi = 1.0;
        cfg.components.fusion.w_cvd = 1.0;
        cfg.components.fusion.adaptive_cooldown_k = 0.0;
        cfg.components.fusion.flip_rearm_margin = 0.3;
        cfg
    }

    fn row(ts_ms: Millis, z_ofi: f64, z_cvd: f64) -> FeatureRow {
        FeatureRow {
            symbol: "BTCUSDT".into(),
            ts_ms,
            mid: 50_000.0,
            best_bid: 49_999.0,
            best_ask: 50_001.0,
            spread_bps: 0.4,
            z_ofi,
            z_cvd,
            fusion_score: 0.0,
            return_1s: 1.0,
            lag_ms_price: 100,
            lag_ms_orderbook: 100,
            lag_sec: 0.1,
            is_gap_second: false,
            consistency: 1.0,
            warmup: false,
            scenario_2x2: Scenario::QuietLow,
        }
    }

    const T0: Millis = 1_700_000_000_000;

    #[test]
    fn warmup_gates_first_rows() {
        let mut core = SignalCore::new(base_config(), "run-a");
        let s = core.on_feature(&row(T0, 2.0, 2.0)).unwrap();
        assert_eq!(s.decision_code, DecisionCode::FailWarmup);
        assert_eq!(s.gating, 0);
        assert!(!s.confirm);

        let s = core.on_feature(&row(T0 + 1_000, 2.0, 2.0)).unwrap();
        assert_eq!(s.decision_code, DecisionCode::Ok);
        assert!(s.confirm);
        assert_eq!(s.gating, 1);
    }

    #[test]
    fn quality_gate_order_is_lag_spread_consistency() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap(); // burn warmup

        let mut r = row(T0 + 1_000, 2.0, 2.0);
        r.lag_sec = 99.0;
        r.spread_bps = 999.0;
        r.consistency = 0.0;
        let s = core.on_feature(&r).unwrap();
        assert_eq!(s.decision_code, DecisionCode::FailLag);

        let mut r = row(T0 + 2_000, 2.0, 2.0);
        r.spread_bps = 999.0;
        r.consistency = 0.0;
        let s = core.on_feature(&r).unwrap();
        assert_eq!(s.decision_code, DecisionCode::FailSpread);

        let mut r = row(T0 + 3_000, 2.0, 2.0);
        r.consistency = 0.0;
        let s = core.on_feature(&r).unwrap();
        assert_eq!(s.decision_code, DecisionCode::FailConsistency);
    }

    #[test]
    fn weak_signal_rejected_but_emitted() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let s = core.on_feature(&row(T0 + 1_000, 0.1, 0.1)).unwrap();
        assert_eq!(s.decision_code, DecisionCode::FailWeak);
        assert!(!s.confirm);
    }

    #[test]
    fn dedupe_suppresses_same_side_within_window() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let s1 = core.on_feature(&row(T0 + 1_000, 2.0, 2.0)).unwrap();
        assert!(s1.confirm);
        let s2 = core.on_feature(&row(T0 + 2_000, 2.0, 2.0)).unwrap();
        assert_eq!(s2.decision_code, DecisionCode::FailDedupe);
        // outside the window the same side confirms again
        let s3 = core.on_feature(&row(T0 + 3_000, 2.0, 2.0)).unwrap();
        assert!(s3.confirm, "got {:?}", s3.decision_code);
    }

    #[test]
    fn cooldown_blocks_after_admit() {
        let mut cfg = base_config();
        cfg.components.fusion.adaptive_cooldown_k = 1.0;
        cfg.components.fusion.expected_hold_sec = 10.0;
        cfg.signal.dedupe_ms = 0;
        let mut core = SignalCore::new(cfg, "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let s1 = core.on_feature(&row(T0 + 1_000, 2.0, 2.0)).unwrap();
        assert!(s1.confirm);
        assert_eq!(s1.cooldown_ms, 10_000);
        // opposite side inside cooldown (dedupe only matches same side)
        let s2 = core.on_feature(&row(T0 + 2_000, -3.0, -3.0)).unwrap();
        assert_eq!(s2.decision_code, DecisionCode::FailCooldown);
    }

    #[test]
    fn flip_needs_rearm_margin() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let s1 = core.on_feature(&row(T0 + 1_000, 1.0, 1.0)).unwrap();
        assert!(s1.confirm); // score 2.0
        // flip with |score| 2.1 < 2.0 + 0.3 margin
        let s2 = core.on_feature(&row(T0 + 3_000, -1.05, -1.05)).unwrap();
        assert_eq!(s2.decision_code, DecisionCode::FailFlipRearm);
        // flip with enough conviction
        let s3 = core.on_feature(&row(T0 + 5_000, -1.5, -1.5)).unwrap();
        assert!(s3.confirm, "got {:?}", s3.decision_code);
    }

    #[test]
    fn min_consecutive_emits_unconfirmed_with_gating_set() {
        let mut cfg = base_config();
        cfg.signal.min_consecutive_same_dir = 2;
        cfg.signal.dedupe_ms = 0;
        let mut core = SignalCore::new(cfg, "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let s1 = core.on_feature(&row(T0 + 1_000, 2.0, 2.0)).unwrap();
        assert_eq!(s1.decision_code, DecisionCode::FailMinConsecutive);
        assert_eq!(s1.gating, 1);
        assert!(!s1.confirm);
        let s2 = core.on_feature(&row(T0 + 2_000, 2.0, 2.0)).unwrap();
        assert!(s2.confirm, "got {:?}", s2.decision_code);
    }

    #[test]
    fn signal_id_is_deterministic_and_bounded() {
        let id = make_signal_id("0123456789abcdef", 1_700_000_123_456, 105, "BTCUSDT");
        assert_eq!(id, "0123456789-123456-05-USDT");
        assert!(id.len() <= SIGNAL_ID_MAX_LEN);
        let again = make_signal_id("0123456789abcdef", 1_700_000_123_456, 105, "BTCUSDT");
        assert_eq!(id, again);
    }

    #[test]
    fn every_row_emits_exactly_one_signal() {
        let mut core = SignalCore::new(base_config(), "run-a");
        let mut seqs = Vec::new();
        for i in 0..20 {
            let s = core.on_feature(&row(T0 + i * 1_000, 0.2, 0.2)).unwrap();
            seqs.push(s.seq);
        }
        assert_eq!(seqs.len(), 20);
        for (i, seq) in seqs.iter().enumerate() {
            assert_eq!(*seq, i as u64);
        }
    }

    #[test]
    fn gate_stats_accumulate() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 2.0, 2.0)).unwrap();
        core.on_feature(&row(T0 + 1_000, 2.0, 2.0)).unwrap();
        assert_eq!(core.gate_stats().get("FAIL_WARMUP"), Some(&1));
        assert_eq!(core.gate_stats().get("OK"), Some(&1));
    }

    #[test]
    fn actionability_respects_gating_mode() {
        let mut core = SignalCore::new(base_config(), "run-a");
        core.on_feature(&row(T0, 0.0, 0.0)).unwrap();
        let weak = core.on_feature(&row(T0 + 1_000, 0.2, 0.2)).unwrap();
        assert_eq!(weak.decision_code, DecisionCode::FailWeak);
        assert!(!is_actionable(&weak, GatingMode::Strict));
        assert!(is_actionable(&weak, GatingMode::IgnoreSoft));
        assert!(is_actionable(&weak, GatingMode::IgnoreAll));

        let mut lagged = row(T0 + 2_000, 2.0, 2.0);
        lagged.lag_sec = 99.0;
        let hard = core.on_feature(&lagged).unwrap();
        assert_eq!(hard.decision_code, DecisionCode::FailLag);
        assert!(!is_actionable(&hard, GatingMode::IgnoreAll));
    }
}
