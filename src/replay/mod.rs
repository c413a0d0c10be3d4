//! Replay Feeder
//!
//! Drives the signal core from recorded feature files (sim clock) or a live
//! stream (wall clock), attaches the `_feature_data` scenario context to
//! every emitted signal, publishes into the dual sink, and records the run
//! manifest with the exact resolved parameter values.

pub mod clock;

use crate::align::normalize::feature_from_line;
use crate::config::Config;
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::{FeatureRow, Millis, Signal};
use crate::signal::SignalCore;
use crate::sink::SinkHandle;
use anyhow::{Context, Result};
use chrono::{TimeZone, Timelike, Utc};
use clock::Clock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Replay pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Consume the tape as fast as possible (sim clock).
    AsFast,
    /// Sleep the inter-row gaps (wall-clock shadowing).
    Wall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeederStats {
    pub rows_fed: u64,
    pub signals_emitted: u64,
    pub confirmed: u64,
    pub files_read: usize,
}

/// Feeds feature rows into the signal core and fans the result out.
pub struct ReplayFeeder {
    core: SignalCore,
    sink: Option<SinkHandle>,
    pub clock: Clock,
    pub stats: FeederStats,
}

impl ReplayFeeder {
    pub fn new(cfg: Config, run_id: impl Into<String>, sink: Option<SinkHandle>, clock: Clock) -> Self {
        Self {
            core: SignalCore::new(cfg, run_id),
            sink,
            clock,
            stats: FeederStats::default(),
        }
    }

    pub fn core(&self) -> &SignalCore {
        &self.core
    }

    /// Feed one row: advance the clock, evaluate, attach scenario context,
    /// publish. Returns the emitted signal.
    pub fn feed_row(&mut self, row: &FeatureRow) -> Result<Signal, PipelineError> {
        self.clock.advance_to(row.ts_ms);
        let mut signal = self.core.on_feature(row)?;

        // Scenario context for downstream cost/slippage models.
        signal.meta.insert(
            "_feature_data".into(),
            json!({
                "spread_bps": row.spread_bps,
                "vol_bps": row.return_1s.abs(),
                "scenario_2x2": row.scenario_2x2.as_str(),
                "fee_tier": "default",
                "session": session_label(row.ts_ms),
                "return_1s": row.return_1s,
                "mid_price": row.mid,
            }),
        );

        if let Some(sink) = &self.sink {
            sink.publish(signal.clone())?;
        }

        self.stats.rows_fed += 1;
        self.stats.signals_emitted += 1;
        if signal.confirm {
            self.stats.confirmed += 1;
        }
        Ok(signal)
    }

    /// Replay every feature JSONL file under `features_dir`, ascending
    /// `(ts_ms, symbol)`. Returns all emitted signals.
    pub fn replay_dir(
        &mut self,
        features_dir: &Path,
        symbols: &[String],
        pace: Pace,
    ) -> Result<Vec<Signal>, PipelineError> {
        let mut rows = Vec::new();
        let files = match feature_files(features_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "feature source scan failed");
                Vec::new()
            }
        };
        if files.is_empty() {
            return Err(PipelineError::SourceMissing {
                symbols: symbols.to_vec(),
                t_min_ms: 0,
                t_max_ms: i64::MAX,
            });
        }
        self.stats.files_read = files.len();

        for path in &files {
            let raw = fs::read_to_string(path).map_err(|e| PipelineError::CorruptRow {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
            for line in raw.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match feature_from_line(line) {
                    Some(row) => {
                        if symbols.is_empty() || symbols.contains(&row.symbol) {
                            rows.push(row);
                        }
                    }
                    None => {
                        metrics::global().incr(metrics::READER_CORRUPT_ROWS_TOTAL);
                        warn!(path = %path.display(), "unusable feature line dropped");
                    }
                }
            }
        }
        rows.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.symbol.cmp(&b.symbol)));

        let mut signals = Vec::with_capacity(rows.len());
        let mut last_ts: Option<Millis> = None;
        for row in &rows {
            if pace == Pace::Wall {
                if let Some(prev) = last_ts {
                    let gap = (row.ts_ms - prev).clamp(0, 5_000);
                    if gap > 0 {
                        std::thread::sleep(std::time::Duration::from_millis(gap as u64));
                    }
                }
                last_ts = Some(row.ts_ms);
            }
            signals.push(self.feed_row(row)?);
        }
        info!(
            rows = rows.len(),
            confirmed = self.stats.confirmed,
            "replay complete"
        );
        Ok(signals)
    }

    /// Close the sink (if any) and hand back the core for stats extraction.
    pub fn finish(self) -> (SignalCore, FeederStats, Option<crate::sink::SinkHealth>) {
        let health = self.sink.map(|s| s.close());
        (self.core, self.stats, health)
    }
}

fn feature_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "jsonl").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

/// Trading-session tag by UTC hour; carried in `_feature_data` only.
fn session_label(ts_ms: Millis) -> &'static str {
    let hour = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.hour())
        .unwrap_or(0);
    match hour {
        0..=6 => "asia",
        7..=12 => "eu",
        13..=20 => "us",
        _ => "asia",
    }
}

/// End-of-run manifest, `<output_dir>/<run-RUN_ID>/run_manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub git_commit: Option<String>,
    pub data_fingerprint: String,
    pub config: serde_json::Value,
    pub effective_params: serde_json::Value,
    pub reader_stats: serde_json::Value,
    pub aligner_stats: serde_json::Value,
    pub feeder_stats: serde_json::Value,
    pub trade_stats: serde_json::Value,
    pub metrics: serde_json::Value,
    pub sink_health: serde_json::Value,
    pub data_source_info: serde_json::Value,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now().to_rfc3339(),
            git_commit: std::env::var("GIT_COMMIT").ok(),
            ..Self::default()
        }
    }

    /// Attach the full metric snapshot and the per-code gate stats.
    pub fn finalize(&mut self, gate_stats: &crate::signal::GateStats) {
        self.finished_at = Utc::now().to_rfc3339();
        let mut snapshot = serde_json::Map::new();
        for (name, value) in metrics::global().snapshot() {
            snapshot.insert(name, json!(value));
        }
        snapshot.insert("gate_stats".into(), json!(gate_stats));
        self.metrics = serde_json::Value::Object(snapshot);
    }

    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        let run_dir = output_dir.join(format!("run-{}", self.run_id));
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run dir {}", run_dir.display()))?;
        let path = run_dir.join("run_manifest.json");
        let body = serde_json::to_vec_pretty(self).context("serialize manifest")?;
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Stable digest over the consumed input files (name + size), for the
/// manifest's `data_fingerprint`.
pub fn fingerprint_paths(paths: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    for path in sorted {
        hasher.update(path.display().to_string().as_bytes());
        if let Ok(meta) = fs::metadata(path) {
            hasher.update(meta.len().to_le_bytes());
        }
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scenario;
    use std::io::Write as _;

    const T0: Millis = 1_700_000_000_000;

    fn write_features(dir: &Path, n: usize) {
        let mut f = fs::File::create(dir.join("features-000.jsonl")).unwrap();
        for i in 0..n {
            writeln!(
                f,
                r#"{{"symbol":"BTCUSDT","ts_ms":{},"mid":50000.0,"spread_bps":0.5,"z_ofi":2.0,"z_cvd":2.0,"scenario_2x2":"Q_L","return_1s":1.0}}"#,
                T0 + (i as i64) * 1_000
            )
            .unwrap();
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.signal.warmup_min = 1;
        cfg.signal.thresholds.quiet.buy = 1.0;
        cfg.signal.thresholds.quiet.sell = -1.0;
        cfg.components.fusion.w_ofi = 1.0;
        cfg.components.fusion.w_cvd = 1.0;
        cfg.components.fusion.adaptive_cooldown_k = 0.0;
        cfg.signal.dedupe_ms = 0;
        cfg
    }

    #[test]
    fn replay_attaches_feature_data() {
        let tmp = tempfile::tempdir().unwrap();
        write_features(tmp.path(), 3);
        let mut feeder = ReplayFeeder::new(
            test_config(),
            "run-x",
            None,
            Clock::sim_from(0),
        );
        let signals = feeder
            .replay_dir(tmp.path(), &["BTCUSDT".to_string()], Pace::AsFast)
            .unwrap();
        assert_eq!(signals.len(), 3);
        let fd = signals[0].meta.get("_feature_data").unwrap();
        assert_eq!(fd["scenario_2x2"], "Q_L");
        assert_eq!(fd["mid_price"], 50_000.0);
        assert!(fd["session"].is_string());
        // sim clock tracked the tape
        assert_eq!(feeder.clock.now_ms(), T0 + 2_000);
    }

    #[test]
    fn replay_empty_dir_is_source_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut feeder =
            ReplayFeeder::new(test_config(), "run-x", None, Clock::sim_from(0));
        match feeder.replay_dir(tmp.path(), &[], Pace::AsFast) {
            Err(PipelineError::SourceMissing { .. }) => {}
            other => panic!("expected SourceMissing, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn manifest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = RunManifest::new("run-y");
        manifest.effective_params = json!({"backtest": {"taker_fee_bps": 5.0}});
        manifest.finalize(&Default::default());
        let path = manifest.write(tmp.path()).unwrap();
        assert!(path.ends_with("run-run-y/run_manifest.json"));
        let raw = fs::read_to_string(path).unwrap();
        let parsed: RunManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.run_id, "run-y");
    }

    #[test]
    fn scenario_context_survives_into_meta_reader() {
        // meta_scenario() resolves the nested _feature_data label
        let tmp = tempfile::tempdir().unwrap();
        write_features(tmp.path(), 2);
        let mut feeder =
            ReplayFeeder::new(test_config(), "run-z", None, Clock::sim_from(0));
        let signals = feeder
            .replay_dir(tmp.path(), &[], Pace::AsFast)
            .unwrap();
        assert_eq!(signals[1].meta_scenario(), Some(Scenario::QuietLow));
        assert_eq!(signals[1].meta_spread_bps(), Some(0.5));
    }
}
