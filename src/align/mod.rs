//! Per-Second Feature Aligner
//!
//! Joins the interleaved price/orderbook/flow stream into one canonical
//! feature row per (symbol, second). Seconds with no observation are
//! fabricated from last-known-good state and tagged `is_gap_second`;
//! `return_1s` is always computed against the last non-gap mid so stale
//! bars never leak into returns. The 2x2 scenario label thresholds the two
//! axes independently: spread for Active/Quiet, |return_1s| for High/Low.

pub mod normalize;

use crate::config::AlignerConfig;
use crate::metrics;
use crate::models::{FeatureRow, Millis, Scenario};
use crate::reader::{RawRow, RowKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Feed lag above this is counted as a bad-lag second (non-fatal, tagged).
const LAG_WARN_SEC: f64 = 5.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignerStats {
    pub rows_in: u64,
    pub features_out: u64,
    pub gap_seconds: u64,
    pub lag_bad_seconds: u64,
    pub inconsistent_buckets: u64,
}

/// Accumulator for the bucket currently being filled for one symbol.
#[derive(Debug, Clone, Default)]
struct Bucket {
    second: i64,
    mid: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    z_ofi: Option<f64>,
    z_cvd: Option<f64>,
    last_price_event_ms: Option<Millis>,
    last_book_event_ms: Option<Millis>,
    saw_price: bool,
    saw_book: bool,
}

/// Last-known-good state carried across buckets for one symbol.
#[derive(Debug, Clone)]
struct LastGood {
    mid: f64,
    best_bid: f64,
    best_ask: f64,
    z_ofi: f64,
    z_cvd: f64,
    /// Mid of the last non-gap second; denominator for `return_1s`.
    last_nongap_mid: f64,
    last_emitted_second: i64,
}

struct SymbolLane {
    bucket: Option<Bucket>,
    last_good: Option<LastGood>,
}

/// The aligner. Feed rows in ascending `ts_ms` per symbol via [`push`],
/// collect emitted feature rows, then [`finish`] to flush open buckets.
///
/// [`push`]: Aligner::push
/// [`finish`]: Aligner::finish
pub struct Aligner {
    cfg: AlignerConfig,
    lanes: HashMap<String, SymbolLane>,
    pub stats: AlignerStats,
}

impl Aligner {
    pub fn new(cfg: AlignerConfig) -> Self {
        Self {
            cfg,
            lanes: HashMap::new(),
            stats: AlignerStats::default(),
        }
    }

    /// Ingest one raw row; returns any feature rows whose buckets closed.
    pub fn push(&mut self, row: &RawRow) -> Vec<FeatureRow> {
        self.stats.rows_in += 1;
        let second = row.ts_ms.div_euclid(1_000);
        let mut emitted = Vec::new();

        let lane = self
            .lanes
            .entry(row.symbol.clone())
            .or_insert_with(|| SymbolLane {
                bucket: None,
                last_good: None,
            });

        match lane.bucket.as_ref().map(|b| b.second) {
            Some(open_second) if open_second == second => {
                fill_bucket(lane.bucket.as_mut().expect("bucket open"), row);
            }
            Some(open_second) if open_second < second => {
                let closed = lane.bucket.take().expect("bucket open");
                emitted.extend(Self::close_bucket(
                    &self.cfg,
                    &mut self.stats,
                    &row.symbol,
                    lane,
                    closed,
                ));
                // Fabricate gap seconds between the closed bucket and this row.
                emitted.extend(Self::fill_gaps(&self.cfg, &mut self.stats, &row.symbol, lane, second));
                let mut fresh = Bucket {
                    second,
                    ..Bucket::default()
                };
                fill_bucket(&mut fresh, row);
                lane.bucket = Some(fresh);
            }
            Some(open_second) => {
                // Late row for an already-progressing bucket; the reader
                // guarantees per-symbol order, so this only happens for
                // sub-second reordering inside the same stream. Drop it.
                debug!(
                    symbol = %row.symbol,
                    row_second = second,
                    bucket_second = open_second,
                    "late row dropped by aligner"
                );
            }
            None => {
                let mut fresh = Bucket {
                    second,
                    ..Bucket::default()
                };
                fill_bucket(&mut fresh, row);
                lane.bucket = Some(fresh);
            }
        }

        emitted
    }

    /// Flush every open bucket.
    pub fn finish(&mut self) -> Vec<FeatureRow> {
        let mut emitted = Vec::new();
        let symbols: Vec<String> = self.lanes.keys().cloned().collect();
        for symbol in symbols {
            let lane = self.lanes.get_mut(&symbol).unwrap();
            if let Some(bucket) = lane.bucket.take() {
                emitted.extend(Self::close_bucket(
                    &self.cfg,
                    &mut self.stats,
                    &symbol,
                    lane,
                    bucket,
                ));
            }
        }
        emitted
    }

    /// Convenience: run a whole ordered stream through the aligner.
    pub fn align_all(&mut self, rows: impl IntoIterator<Item = RawRow>) -> Vec<FeatureRow> {
        let mut out = Vec::new();
        for row in rows {
            out.extend(self.push(&row));
        }
        out.extend(self.finish());
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.ts_ms.cmp(&b.ts_ms)));
        out
    }

    fn close_bucket(
        cfg: &AlignerConfig,
        stats: &mut AlignerStats,
        symbol: &str,
        lane: &mut SymbolLane,
        bucket: Bucket,
    ) -> Vec<FeatureRow> {
        let boundary_ms = (bucket.second + 1) * 1_000;

        let prior = lane.last_good.clone();
        let mid = bucket
            .mid
            .or(prior.as_ref().map(|g| g.mid))
            .unwrap_or(0.0);
        if mid <= 0.0 {
            // Nothing known yet for this symbol; cannot fabricate a row.
            return Vec::new();
        }
        let best_bid = bucket
            .best_bid
            .or(prior.as_ref().map(|g| g.best_bid))
            .unwrap_or(mid);
        let best_ask = bucket
            .best_ask
            .or(prior.as_ref().map(|g| g.best_ask))
            .unwrap_or(mid);
        let z_ofi = bucket.z_ofi.or(prior.as_ref().map(|g| g.z_ofi)).unwrap_or(0.0);
        let z_cvd = bucket.z_cvd.or(prior.as_ref().map(|g| g.z_cvd)).unwrap_or(0.0);

        let spread_bps = if mid > 0.0 {
            ((best_ask - best_bid) / mid * 10_000.0).max(0.0)
        } else {
            0.0
        };

        let last_nongap_mid = prior.as_ref().map(|g| g.last_nongap_mid).unwrap_or(mid);
        let has_observation = bucket.saw_price;
        let return_1s = if has_observation && last_nongap_mid > 0.0 {
            (mid - last_nongap_mid) / last_nongap_mid * 10_000.0
        } else {
            0.0
        };

        let lag_ms_price = bucket
            .last_price_event_ms
            .map(|e| (boundary_ms - e).max(0))
            .unwrap_or(0);
        let lag_ms_orderbook = bucket
            .last_book_event_ms
            .map(|e| (boundary_ms - e).max(0))
            .unwrap_or(0);
        let lag_sec = (lag_ms_price.max(lag_ms_orderbook)) as f64 / 1_000.0;
        if lag_sec > LAG_WARN_SEC {
            stats.lag_bad_seconds += 1;
            metrics::global().incr(metrics::ALIGNER_LAG_BAD_TOTAL);
        }

        let present = bucket.saw_price as u32 + bucket.saw_book as u32;
        let consistency = (present as f64 / cfg.expected_subfeeds.max(1) as f64).min(1.0);
        if consistency < 1.0 {
            stats.inconsistent_buckets += 1;
        }

        let scenario = Scenario::from_axes(
            spread_bps >= cfg.active_spread_bps_threshold,
            return_1s.abs() >= cfg.high_vol_return_bps_threshold,
        );

        let row = FeatureRow {
            symbol: symbol.to_string(),
            ts_ms: bucket.second * 1_000,
            mid,
            best_bid,
            best_ask,
            spread_bps,
            z_ofi,
            z_cvd,
            fusion_score: 0.0,
            return_1s,
            lag_ms_price,
            lag_ms_orderbook,
            lag_sec,
            is_gap_second: !has_observation,
            consistency,
            warmup: false,
            scenario_2x2: scenario,
        };

        lane.last_good = Some(LastGood {
            mid,
            best_bid,
            best_ask,
            z_ofi,
            z_cvd,
            last_nongap_mid: if has_observation { mid } else { last_nongap_mid },
            last_emitted_second: bucket.second,
        });
        stats.features_out += 1;
        vec![row]
    }

    fn fill_gaps(
        cfg: &AlignerConfig,
        stats: &mut AlignerStats,
        symbol: &str,
        lane: &mut SymbolLane,
        next_second: i64,
    ) -> Vec<FeatureRow> {
        let Some(good) = lane.last_good.clone() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let first_missing = good.last_emitted_second + 1;
        let gap_span = next_second - first_missing;
        if gap_span <= 0 {
            return out;
        }
        let fill = gap_span.min(cfg.max_gap_fill_sec);
        for sec in first_missing..first_missing + fill {
            let scenario = Scenario::from_axes(
                spread_bps_of(&good) >= cfg.active_spread_bps_threshold,
                false,
            );
            out.push(FeatureRow {
                symbol: symbol.to_string(),
                ts_ms: sec * 1_000,
                mid: good.mid,
                best_bid: good.best_bid,
                best_ask: good.best_ask,
                spread_bps: spread_bps_of(&good),
                z_ofi: good.z_ofi,
                z_cvd: good.z_cvd,
                fusion_score: 0.0,
                return_1s: 0.0,
                lag_ms_price: 0,
                lag_ms_orderbook: 0,
                lag_sec: 0.0,
                is_gap_second: true,
                consistency: 0.0,
                warmup: false,
                scenario_2x2: scenario,
            });
            stats.gap_seconds += 1;
            stats.features_out += 1;
            metrics::global().incr(metrics::ALIGNER_GAP_SECONDS_TOTAL);
        }
        if let Some(g) = lane.last_good.as_mut() {
            g.last_emitted_second = (first_missing + fill - 1).max(g.last_emitted_second);
        }
        out
    }
}

#[inline]
fn spread_bps_of(good: &LastGood) -> f64 {
    if good.mid > 0.0 {
        ((good.best_ask - good.best_bid) / good.mid * 10_000.0).max(0.0)
    } else {
        0.0
    }
}

fn fill_bucket(bucket: &mut Bucket, row: &RawRow) {
    match row.kind {
        Some(RowKind::Price) => {
            if let Some(mid) = row.mid {
                bucket.mid = Some(mid);
                bucket.saw_price = true;
                bucket.last_price_event_ms = Some(row.event_ts_ms.unwrap_or(row.ts_ms));
            }
        }
        Some(RowKind::Orderbook) => {
            if row.best_bid.is_some() || row.best_ask.is_some() {
                bucket.best_bid = row.best_bid.or(bucket.best_bid);
                bucket.best_ask = row.best_ask.or(bucket.best_ask);
                bucket.saw_book = true;
                bucket.last_book_event_ms = Some(row.event_ts_ms.unwrap_or(row.ts_ms));
            }
        }
        Some(RowKind::Flow) | None => {
            bucket.z_ofi = row.z_ofi.or(bucket.z_ofi);
            bucket.z_cvd = row.z_cvd.or(bucket.z_cvd);
        }
    }
}
