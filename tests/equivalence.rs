//! Backtest ≡ dry-run equivalence over a replayed feature tape, end to end:
//! features -> signal core -> tape -> both execution paths.

use alphaflow_backend::config::{AccountingMode, Config, FeeModel};
use alphaflow_backend::equiv::{run_equivalence, MarkPoint, EPSILON};
use alphaflow_backend::models::Millis;
use alphaflow_backend::replay::clock::Clock;
use alphaflow_backend::replay::{Pace, ReplayFeeder};
use std::fs;
use std::io::Write as _;
use std::path::Path;

const T0: Millis = 1_700_000_000_000;

fn equiv_config() -> Config {
    let mut cfg = Config::default();
    cfg.signal.warmup_min = 1;
    cfg.signal.dedupe_ms = 0;
    cfg.signal.thresholds.quiet.buy = 1.0;
    cfg.signal.thresholds.quiet.sell = -1.0;
    cfg.signal.thresholds.active.buy = 1.0;
    cfg.signal.thresholds.active.sell = -1.0;
    cfg.components.fusion.w_ofi = 1.0;
    cfg.components.fusion.w_cvd = 1.0;
    cfg.components.fusion.adaptive_cooldown_k = 0.0;
    cfg.components.fusion.flip_rearm_margin = 0.0;
    cfg.executor.order_size_usd = 100.0;
    cfg.adapter.rate_limit.place.rps = 1_000.0;
    cfg.adapter.rate_limit.place.burst = 1_000;
    cfg.backtest.fee_model = FeeModel::MakerTaker;
    cfg.backtest.fee_maker_taker.accounting_mode = AccountingMode::Bernoulli;
    cfg.backtest.fee_maker_taker.bernoulli_seed = 7;
    cfg.backtest.slippage_bps = 1.0;
    cfg
}

fn write_tape(dir: &Path, n: usize) {
    let mut file = fs::File::create(dir.join("features-0.jsonl")).unwrap();
    for i in 0..n {
        // alternate strong buy / strong sell flow so every row confirms
        let z = if i % 2 == 0 { 2.0 } else { -2.0 };
        let mid = 50_000.0 + (i as f64) * 5.0;
        writeln!(
            file,
            r#"{{"symbol":"BTCUSDT","ts_ms":{},"mid":{},"spread_bps":1.0,"z_ofi":{},"z_cvd":{},"scenario_2x2":"A_L","return_1s":1.0}}"#,
            T0 + (i as i64) * 30_000,
            mid,
            z,
            z
        )
        .unwrap();
    }
}

#[tokio::test]
async fn backtest_equals_dry_run_on_replayed_tape() {
    let tmp = tempfile::tempdir().unwrap();
    write_tape(tmp.path(), 20);

    let cfg = equiv_config();
    let mut feeder = ReplayFeeder::new(cfg.clone(), "run-eq", None, Clock::sim_from(0));
    let signals = feeder
        .replay_dir(tmp.path(), &["BTCUSDT".to_string()], Pace::AsFast)
        .unwrap();
    assert_eq!(signals.len(), 20);
    let confirmed = signals.iter().filter(|s| s.confirm).count();
    assert!(confirmed > 0, "tape must carry confirmed signals");

    let marks: Vec<MarkPoint> = signals
        .iter()
        .map(|s| MarkPoint {
            symbol: s.symbol.clone(),
            ts_ms: s.ts_ms,
            mid: s.meta_mid_price().unwrap(),
            scenario: s.meta_scenario(),
            spread_bps: s.meta_spread_bps().unwrap_or(2.0),
        })
        .collect();

    let report = run_equivalence(&cfg, &signals, &marks).await.unwrap();
    assert!(report.passed(), "failures: {:?}", report.failures);
    assert_eq!(report.fills_backtest, report.fills_dry_run);
    assert!(report.first_divergence.is_none());
    assert!((report.fee_bps_backtest - report.fee_bps_dry_run).abs() < 1.0);
    assert!((report.pnl_backtest - report.pnl_dry_run).abs() < EPSILON);
    assert_eq!(report.contract_violations, 0);
}

#[tokio::test]
async fn short_tape_with_reversals_stays_clean() {
    let tmp = tempfile::tempdir().unwrap();
    write_tape(tmp.path(), 6);
    let cfg = equiv_config();
    let mut feeder = ReplayFeeder::new(cfg.clone(), "run-eq2", None, Clock::sim_from(0));
    let signals = feeder
        .replay_dir(tmp.path(), &[], Pace::AsFast)
        .unwrap();
    let marks: Vec<MarkPoint> = signals
        .iter()
        .map(|s| MarkPoint {
            symbol: s.symbol.clone(),
            ts_ms: s.ts_ms,
            mid: s.meta_mid_price().unwrap(),
            scenario: s.meta_scenario(),
            spread_bps: 1.0,
        })
        .collect();
    let report = run_equivalence(&cfg, &signals, &marks).await.unwrap();
    assert!(report.first_divergence.is_none());
    assert!(report.passed(), "{:?}", report.failures);
}
