//! Dual Signal Sink
//!
//! Every admitted signal is persisted twice: an append-only JSONL log
//! rotated by hour (cheap to replay, written first) and an indexed SQLite
//! store. A dedicated worker thread owns both write handles; the pipeline
//! publishes into a bounded channel, which applies back-pressure when the
//! worker falls behind. Per-symbol emission order equals append order
//! equals insert order.

pub mod dual;
pub mod jsonl;
pub mod store;

pub use dual::{DualSinkWriter, SinkHandle, SinkHealth};
pub use jsonl::JsonlSignalWriter;
pub use store::SqliteSignalStore;

use crate::models::Signal;
use std::collections::HashMap;

/// Top-1 rule: among signals sharing `(symbol, ts_ms)` keep only the one
/// with the largest `|score|`; ties break to the earlier `seq`. Input order
/// is otherwise preserved.
pub fn select_top1(signals: Vec<Signal>) -> Vec<Signal> {
    let mut winners: HashMap<(String, i64), usize> = HashMap::new();
    let mut keep: Vec<Option<Signal>> = Vec::with_capacity(signals.len());

    for signal in signals {
        let key = (signal.symbol.clone(), signal.ts_ms);
        match winners.get(&key) {
            Some(&idx) => {
                let current = keep[idx].as_ref().expect("winner slot occupied");
                let new_wins = signal.score.abs() > current.score.abs()
                    || (signal.score.abs() == current.score.abs() && signal.seq < current.seq);
                if new_wins {
                    keep[idx] = Some(signal);
                }
                // loser is dropped either way
            }
            None => {
                winners.insert(key, keep.len());
                keep.push(Some(signal));
            }
        }
    }

    keep.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionCode, Regime, SideHint, SIGNAL_SCHEMA_VERSION};

    pub(crate) fn test_signal(symbol: &str, ts_ms: i64, seq: u64, score: f64) -> Signal {
        Signal {
            schema_version: SIGNAL_SCHEMA_VERSION.into(),
            ts_ms,
            symbol: symbol.into(),
            signal_id: format!("run-{:06}-{:02}-{}", ts_ms % 1_000_000, seq % 100, symbol),
            run_id: "run".into(),
            seq,
            side_hint: if score >= 0.0 {
                SideHint::Buy
            } else {
                SideHint::Sell
            },
            score,
            regime: Regime::Trend,
            div_type: None,
            gating: 1,
            confirm: true,
            cooldown_ms: 0,
            expiry_ms: ts_ms + 60_000,
            decision_code: DecisionCode::Ok,
            decision_reason: String::new(),
            config_hash: "cafebabecafebabe".into(),
            meta: serde_json::Map::new(),
        }
    }

    #[test]
    fn top1_keeps_largest_abs_score() {
        let t = 1_700_000_000_000;
        let signals = vec![
            test_signal("BTCUSDT", t, 0, 1.0),
            test_signal("BTCUSDT", t, 1, 3.0),
            test_signal("BTCUSDT", t, 2, -2.0),
        ];
        let kept = select_top1(signals);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 3.0);
    }

    #[test]
    fn top1_ties_break_to_earlier_seq() {
        let t = 1_700_000_000_000;
        let signals = vec![
            test_signal("BTCUSDT", t, 5, -2.0),
            test_signal("BTCUSDT", t, 3, 2.0),
        ];
        let kept = select_top1(signals);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].seq, 3);
    }

    #[test]
    fn top1_distinct_timestamps_untouched() {
        let t = 1_700_000_000_000;
        let signals = vec![
            test_signal("BTCUSDT", t, 0, 1.0),
            test_signal("BTCUSDT", t + 1_000, 1, 0.5),
            test_signal("ETHUSDT", t, 2, 0.7),
        ];
        let kept = select_top1(signals);
        assert_eq!(kept.len(), 3);
    }
}
