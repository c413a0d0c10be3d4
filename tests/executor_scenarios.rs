//! Executor behavior over full tick+signal streams: exit-priority ordering,
//! PnL identities, and bit-identical determinism of repeated runs.

use alphaflow_backend::config::{AccountingMode, Config, FeeModel};
use alphaflow_backend::exec::TradeSimulator;
use alphaflow_backend::models::{
    DecisionCode, ExitReason, Millis, Regime, Scenario, SideHint, Signal, SIGNAL_SCHEMA_VERSION,
};
use serde_json::json;

const T0: Millis = 1_700_000_000_000;

fn confirmed(symbol: &str, ts_ms: Millis, side: SideHint, mid: f64) -> Signal {
    let mut meta = serde_json::Map::new();
    meta.insert("mid_price".into(), json!(mid));
    meta.insert(
        "_feature_data".into(),
        json!({"scenario_2x2": "A_L", "spread_bps": 1.5}),
    );
    Signal {
        schema_version: SIGNAL_SCHEMA_VERSION.into(),
        ts_ms,
        symbol: symbol.into(),
        signal_id: format!("sig-{}-{}", symbol, ts_ms),
        run_id: "run-exec".into(),
        seq: (ts_ms % 1_000_000) as u64,
        side_hint: side,
        score: if side == SideHint::Sell { -2.5 } else { 2.5 },
        regime: Regime::Trend,
        div_type: None,
        gating: 1,
        confirm: true,
        cooldown_ms: 0,
        expiry_ms: ts_ms + 600_000,
        decision_code: DecisionCode::Ok,
        decision_reason: String::new(),
        config_hash: "cafebabecafebabe".into(),
        meta,
    }
}

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.backtest.notional_per_trade = 100.0;
    cfg.backtest.taker_fee_bps = 5.0;
    cfg.backtest.slippage_bps = 1.0;
    cfg.backtest.stop_loss_bps = 10.0;
    cfg.backtest.take_profit_bps = 12.0;
    cfg.backtest.min_hold_time_sec = 60;
    cfg.backtest.max_hold_time_sec = 600;
    cfg.backtest.deadband_bps = 2.0;
    cfg
}

#[test]
fn stop_loss_fires_immediately_under_min_hold() {
    let mut sim = TradeSimulator::new(&base_config()).unwrap();
    sim.on_tick("BTCUSDT", T0, 50_000.0, Some(Scenario::ActiveLow), 1.5);
    sim.on_signal(&confirmed("BTCUSDT", T0, SideHint::Buy, 50_000.0));

    sim.on_tick("BTCUSDT", T0 + 1_000, 49_950.0, Some(Scenario::ActiveLow), 1.5);
    assert_eq!(sim.trades().len(), 1);
    let trade = &sim.trades()[0];
    assert_eq!(trade.reason, ExitReason::StopLoss);
    assert_eq!(trade.exit_ts_ms, T0 + 1_000);
    assert!(trade.pnl_identity_holds());
}

#[test]
fn force_timeout_wins_over_take_profit_at_min_hold() {
    let mut cfg = base_config();
    cfg.backtest.min_hold_time_sec = 240;
    cfg.backtest.force_timeout_exit = true;
    let mut sim = TradeSimulator::new(&cfg).unwrap();
    sim.on_tick("BTCUSDT", T0, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed("BTCUSDT", T0, SideHint::Buy, 50_000.0));

    // TP condition (+12 bps) and min-hold both satisfied at t+250s
    sim.on_tick("BTCUSDT", T0 + 250_000, 50_060.0, None, 1.0);
    assert_eq!(sim.trades().len(), 1);
    assert_eq!(sim.trades()[0].reason, ExitReason::Timeout);
}

#[test]
fn max_hold_timeout_dominates_everything() {
    let mut cfg = base_config();
    cfg.backtest.max_hold_time_sec = 120;
    let mut sim = TradeSimulator::new(&cfg).unwrap();
    sim.on_tick("BTCUSDT", T0, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed("BTCUSDT", T0, SideHint::Buy, 50_000.0));

    // deep loss AND max hold exceeded: max-hold is priority 1
    sim.on_tick("BTCUSDT", T0 + 121_000, 49_800.0, None, 1.0);
    assert_eq!(sim.trades()[0].reason, ExitReason::Timeout);
}

#[test]
fn exit_reason_is_first_rule_met_over_stream() {
    // walk a price path that grazes TP before min_hold, then dips to SL
    let mut sim = TradeSimulator::new(&base_config()).unwrap();
    sim.on_tick("BTCUSDT", T0, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed("BTCUSDT", T0, SideHint::Buy, 50_000.0));

    sim.on_tick("BTCUSDT", T0 + 10_000, 50_070.0, None, 1.0); // +14bps, min_hold not met
    assert!(sim.trades().is_empty());
    sim.on_tick("BTCUSDT", T0 + 20_000, 49_945.0, None, 1.0); // -11bps
    assert_eq!(sim.trades().len(), 1);
    assert_eq!(sim.trades()[0].reason, ExitReason::StopLoss);
}

#[test]
fn pnl_round_trip_identity_across_many_trades() {
    let mut cfg = base_config();
    cfg.backtest.fee_model = FeeModel::MakerTaker;
    cfg.backtest.min_hold_time_sec = 0;
    let mut sim = TradeSimulator::new(&cfg).unwrap();

    let mut mid = 50_000.0;
    for i in 0..200i64 {
        let ts = T0 + i * 15_000;
        mid += ((i * 37 + 11) % 23 - 11) as f64; // deterministic wiggle
        sim.on_tick("BTCUSDT", ts, mid, Some(Scenario::QuietHigh), 2.0);
        if i % 5 == 0 {
            let side = if (i / 5) % 2 == 0 { SideHint::Buy } else { SideHint::Sell };
            sim.on_signal(&confirmed("BTCUSDT", ts, side, mid));
        }
    }
    sim.close_all();

    assert!(!sim.trades().is_empty());
    for trade in sim.trades() {
        assert!(
            trade.pnl_identity_holds(),
            "identity broken on {:?}",
            trade
        );
    }
    let stats = sim.stats();
    assert_eq!(stats.trades, sim.trades().len());
    let reason_total: u64 = stats.by_reason.values().sum();
    assert_eq!(reason_total as usize, stats.trades);
}

#[test]
fn bernoulli_fee_model_is_deterministic_across_runs() {
    let mut cfg = base_config();
    cfg.backtest.fee_model = FeeModel::MakerTaker;
    cfg.backtest.fee_maker_taker.accounting_mode = AccountingMode::Bernoulli;
    cfg.backtest.fee_maker_taker.bernoulli_seed = 42;
    cfg.backtest.min_hold_time_sec = 0;

    let run = || -> Vec<u8> {
        let mut sim = TradeSimulator::new(&cfg).unwrap();
        let mut mid = 50_000.0;
        for i in 0..100i64 {
            let ts = T0 + i * 20_000;
            mid += ((i * 13 + 7) % 19 - 9) as f64;
            sim.on_tick("BTCUSDT", ts, mid, Some(Scenario::ActiveHigh), 2.0);
            if i % 4 == 0 {
                let side = if (i / 4) % 2 == 0 { SideHint::Buy } else { SideHint::Sell };
                sim.on_signal(&confirmed("BTCUSDT", ts, side, mid));
            }
        }
        sim.close_all();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trades.jsonl");
        sim.write_trades_jsonl(&path).unwrap();
        std::fs::read(&path).unwrap()
    };

    let first = run();
    let second = run();
    assert!(!first.is_empty());
    assert_eq!(first, second, "trades.jsonl must be byte-identical across runs");
}

#[test]
fn one_net_position_per_symbol() {
    let mut cfg = base_config();
    cfg.backtest.min_hold_time_sec = 0;
    let mut sim = TradeSimulator::new(&cfg).unwrap();
    sim.on_tick("BTCUSDT", T0, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed("BTCUSDT", T0, SideHint::Buy, 50_000.0));
    // a second confirmed buy must not pyramid
    sim.on_tick("BTCUSDT", T0 + 5_000, 50_010.0, None, 1.0);
    sim.on_signal(&confirmed("BTCUSDT", T0 + 5_000, SideHint::Buy, 50_010.0));
    assert_eq!(sim.positions().len(), 1);
    let pos = sim.positions().get("BTCUSDT").unwrap();
    assert_eq!(pos.entry_ts_ms, T0);
}
