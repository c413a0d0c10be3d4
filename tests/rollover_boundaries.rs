//! Business-date rollover matrix: month, year, leap day, DST spring-forward
//! and fall-back, and non-UTC rollover hours, exercised both on the
//! calendar directly and through forced closes in the trade simulator.

use alphaflow_backend::config::Config;
use alphaflow_backend::exec::{RolloverCalendar, TradeSimulator};
use alphaflow_backend::models::{
    DecisionCode, ExitReason, Millis, Regime, SideHint, Signal, SIGNAL_SCHEMA_VERSION,
};
use serde_json::json;

fn ms(iso_utc: &str) -> Millis {
    chrono::DateTime::parse_from_rfc3339(iso_utc)
        .unwrap()
        .timestamp_millis()
}

fn confirmed(ts_ms: Millis, side: SideHint, mid: f64) -> Signal {
    let mut meta = serde_json::Map::new();
    meta.insert("mid_price".into(), json!(mid));
    Signal {
        schema_version: SIGNAL_SCHEMA_VERSION.into(),
        ts_ms,
        symbol: "BTCUSDT".into(),
        signal_id: format!("sig-{}", ts_ms),
        run_id: "run-roll".into(),
        seq: 0,
        side_hint: side,
        score: 2.0,
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

fn sim_with(tz: &str, hour: u32) -> TradeSimulator {
    let mut cfg = Config::default();
    cfg.backtest.rollover_timezone = tz.into();
    cfg.backtest.rollover_hour = hour;
    cfg.backtest.max_hold_time_sec = 24 * 3_600;
    cfg.backtest.min_hold_time_sec = 0;
    cfg.backtest.stop_loss_bps = 10_000.0;
    cfg.backtest.take_profit_bps = 10_000.0;
    TradeSimulator::new(&cfg).unwrap()
}

#[test]
fn business_date_matrix_is_stable() {
    let utc = RolloverCalendar::new("UTC", 0).unwrap();
    let cases = [
        // (timestamp, expected business date)
        ("2024-01-31T23:59:59Z", "2024-01-31"), // month end
        ("2024-02-01T00:00:01Z", "2024-02-01"), // month start
        ("2023-12-31T23:59:59Z", "2023-12-31"), // year end
        ("2024-01-01T00:00:01Z", "2024-01-01"), // year start
        ("2024-02-29T12:00:00Z", "2024-02-29"), // leap day
        ("2024-03-01T00:00:01Z", "2024-03-01"), // day after leap day
    ];
    for (ts, expected) in cases {
        assert_eq!(utc.business_date(ms(ts)).to_string(), expected, "{}", ts);
    }
}

#[test]
fn new_york_rollover_with_dst_fall_back() {
    // 2024-11-03: 01:30 local happens twice (05:30Z EDT, 06:30Z EST).
    let cal = RolloverCalendar::new("America/New_York", 0).unwrap();
    let edt = cal.business_date(ms("2024-11-03T05:30:00Z"));
    let est = cal.business_date(ms("2024-11-03T06:30:00Z"));
    assert_eq!(edt.to_string(), "2024-11-03");
    assert_eq!(edt, est, "duplicated local hour must not split the day");

    // the boundary itself: 03:59:59Z is still Nov 2 local (23:59 EDT)
    assert_eq!(
        cal.business_date(ms("2024-11-03T03:59:59Z")).to_string(),
        "2024-11-02"
    );
    assert_eq!(
        cal.business_date(ms("2024-11-03T04:00:00Z")).to_string(),
        "2024-11-03"
    );
}

#[test]
fn new_york_rollover_with_dst_spring_forward() {
    // 2024-03-10: 02:00-03:00 local never exists; dates stay contiguous.
    let cal = RolloverCalendar::new("America/New_York", 0).unwrap();
    let before = cal.business_date(ms("2024-03-10T06:59:00Z")); // 01:59 EST
    let after = cal.business_date(ms("2024-03-10T07:00:00Z")); // 03:00 EDT
    assert_eq!(before, after);
    assert_eq!(before.to_string(), "2024-03-10");
}

#[test]
fn trades_in_duplicated_hour_attribute_to_one_business_day() {
    // Scenario: open during the first 01:30 EDT pass, rollover-hour 0,
    // tick again at the repeated 01:30 EST. Same business day, so the
    // position must NOT be force-closed between them.
    let mut sim = sim_with("America/New_York", 0);
    let first_pass = ms("2024-11-03T05:30:00Z");
    let second_pass = ms("2024-11-03T06:30:00Z");

    sim.on_tick("BTCUSDT", first_pass, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed(first_pass, SideHint::Buy, 50_000.0));
    sim.on_tick("BTCUSDT", second_pass, 50_005.0, None, 1.0);
    assert!(sim.trades().is_empty(), "no rollover inside one business day");

    sim.close_all();
    assert_eq!(sim.trades().len(), 1);
    assert_eq!(sim.trades()[0].business_date, "2024-11-03");
}

#[test]
fn last_bar_close_then_next_day_open_across_boundary() {
    let mut sim = sim_with("UTC", 0);
    let last_bar = ms("2024-02-29T23:59:30Z");
    let next_open = ms("2024-03-01T00:00:30Z");

    sim.on_tick("BTCUSDT", last_bar, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed(last_bar, SideHint::Buy, 50_000.0));

    // first tick of the new business day forces the close at the LAST bar
    sim.on_tick("BTCUSDT", next_open, 50_100.0, None, 1.0);
    assert_eq!(sim.trades().len(), 1);
    let trade = &sim.trades()[0];
    assert_eq!(trade.reason, ExitReason::RolloverClose);
    assert_eq!(trade.exit_ts_ms, last_bar);
    assert_eq!(trade.exit_px, 50_000.0);
    assert_eq!(trade.business_date, "2024-02-29");

    // and the next-day entry is a fresh position on the new date
    sim.on_signal(&confirmed(next_open, SideHint::Buy, 50_100.0));
    assert_eq!(sim.positions().len(), 1);
    assert_eq!(sim.positions()["BTCUSDT"].entry_ts_ms, next_open);
}

#[test]
fn tokyo_rollover_hour_8_shifts_the_boundary() {
    let mut sim = sim_with("Asia/Tokyo", 8);
    // 22:30Z = 07:30 JST next calendar day, still previous business day
    let before = ms("2024-06-10T22:30:00Z");
    // 23:30Z = 08:30 JST, new business day
    let after = ms("2024-06-10T23:30:00Z");

    sim.on_tick("BTCUSDT", before, 50_000.0, None, 1.0);
    sim.on_signal(&confirmed(before, SideHint::Buy, 50_000.0));
    sim.on_tick("BTCUSDT", after, 50_010.0, None, 1.0);

    assert_eq!(sim.trades().len(), 1);
    assert_eq!(sim.trades()[0].reason, ExitReason::RolloverClose);
    assert_eq!(sim.trades()[0].business_date, "2024-06-10");
}
