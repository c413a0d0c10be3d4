//! Hour-Rotated JSONL Signal Log
//!
//! One file per symbol per UTC hour under
//! `<output_dir>/ready/signal/<SYMBOL>/signals-YYYYMMDD-HH.jsonl`.
//! Append-only; every line is one UTF-8 JSON object in canonical key order,
//! `\n`-terminated, written with a single buffered write so a crash never
//! leaves a partial line. Rotation fsyncs the outgoing file before the new
//! one is opened. The legacy per-minute name `signals_YYYYMMDD_HHMM.jsonl`
//! is accepted on read but never written.

use crate::models::{Millis, Signal};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

struct OpenLog {
    hour_index: i64,
    file: File,
}

/// Append-only writer. Holds one open file per symbol; the dual-sink worker
/// is the only owner.
pub struct JsonlSignalWriter {
    root: PathBuf,
    open: HashMap<String, OpenLog>,
}

impl JsonlSignalWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: output_dir.into(),
            open: HashMap::new(),
        }
    }

    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.root.join("ready").join("signal").join(symbol)
    }

    /// Append one signal, rotating on the UTC hour boundary.
    pub fn write(&mut self, signal: &Signal) -> Result<()> {
        let hour_index = signal.ts_ms.div_euclid(3_600_000);

        let needs_rotation = match self.open.get(&signal.symbol) {
            Some(log) => log.hour_index != hour_index,
            None => true,
        };
        if needs_rotation {
            if let Some(mut old) = self.open.remove(&signal.symbol) {
                // Crash-safe rotation: settle the outgoing file first.
                old.file.flush().context("flush outgoing signal log")?;
                old.file.sync_all().context("fsync outgoing signal log")?;
            }
            let dir = self.symbol_dir(&signal.symbol);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create signal dir {}", dir.display()))?;
            let path = dir.join(hourly_file_name(signal.ts_ms));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open signal log {}", path.display()))?;
            debug!(path = %path.display(), "rotated signal log");
            self.open.insert(
                signal.symbol.clone(),
                OpenLog { hour_index, file },
            );
        }

        let log = self.open.get_mut(&signal.symbol).expect("log just opened");
        let mut line = serde_json::to_vec(signal).context("serialize signal")?;
        line.push(b'\n');
        // Single write of the complete line, then flush: line-atomic.
        log.file.write_all(&line).context("append signal line")?;
        log.file.flush().context("flush signal line")?;
        Ok(())
    }

    /// Flush and fsync every open file. Called on drain/close.
    pub fn sync_all(&mut self) -> Result<()> {
        for log in self.open.values_mut() {
            log.file.flush()?;
            log.file.sync_all()?;
        }
        Ok(())
    }
}

/// Written file name for the hour containing `ts_ms`.
pub fn hourly_file_name(ts_ms: Millis) -> String {
    let dt = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    format!("signals-{}.jsonl", dt.format("%Y%m%d-%H"))
}

/// Accepts both the written hourly name and the legacy per-minute name.
pub fn is_signal_file_name(name: &str) -> bool {
    if !name.ends_with(".jsonl") {
        return false;
    }
    let stem = &name[..name.len() - ".jsonl".len()];
    if let Some(rest) = stem.strip_prefix("signals-") {
        // signals-YYYYMMDD-HH
        let bytes = rest.as_bytes();
        return bytes.len() == 11
            && bytes[8] == b'-'
            && rest[..8].chars().all(|c| c.is_ascii_digit())
            && rest[9..].chars().all(|c| c.is_ascii_digit());
    }
    if let Some(rest) = stem.strip_prefix("signals_") {
        // legacy signals_YYYYMMDD_HHMM
        let bytes = rest.as_bytes();
        return bytes.len() == 13
            && bytes[8] == b'_'
            && rest[..8].chars().all(|c| c.is_ascii_digit())
            && rest[9..].chars().all(|c| c.is_ascii_digit());
    }
    false
}

/// Read every signal logged for one symbol, oldest first. Does NOT apply
/// Top-1; call [`crate::sink::select_top1`] — de-duplication is a read-side
/// contract for the JSONL sink.
pub fn read_symbol_signals(output_dir: &Path, symbol: &str) -> Result<Vec<Signal>> {
    let dir = output_dir.join("ready").join("signal").join(symbol);
    let mut signals = Vec::new();
    let Ok(entries) = fs::read_dir(&dir) else {
        return Ok(signals);
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(is_signal_file_name)
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    for path in files {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read signal log {}", path.display()))?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Signal>(line) {
                Ok(signal) => signals.push(signal),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping bad signal line"),
            }
        }
    }

    signals.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then(a.seq.cmp(&b.seq)));
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionCode, Regime, SideHint, SIGNAL_SCHEMA_VERSION};

    fn signal(ts_ms: Millis, seq: u64) -> Signal {
        Signal {
            schema_version: SIGNAL_SCHEMA_VERSION.into(),
            ts_ms,
            symbol: "BTCUSDT".into(),
            signal_id: format!("id-{}", seq),
            run_id: "run".into(),
            seq,
            side_hint: SideHint::Buy,
            score: 1.0,
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
    fn file_names() {
        // 2024-01-02T03:04:05Z
        assert_eq!(hourly_file_name(1_704_164_645_000), "signals-20240102-03.jsonl");
        assert!(is_signal_file_name("signals-20240102-03.jsonl"));
        assert!(is_signal_file_name("signals_20240102_0304.jsonl"));
        assert!(!is_signal_file_name("signals-2024-01-02.jsonl"));
        assert!(!is_signal_file_name("trades-20240102-03.jsonl"));
    }

    #[test]
    fn write_rotates_on_hour_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = JsonlSignalWriter::new(tmp.path());

        let t_hour_a = 1_704_164_645_000; // 03:04:05
        let t_hour_b = 1_704_168_245_000; // 04:04:05
        writer.write(&signal(t_hour_a, 0)).unwrap();
        writer.write(&signal(t_hour_a + 1_000, 1)).unwrap();
        writer.write(&signal(t_hour_b, 2)).unwrap();
        writer.sync_all().unwrap();

        let dir = tmp.path().join("ready").join("signal").join("BTCUSDT");
        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "signals-20240102-03.jsonl".to_string(),
                "signals-20240102-04.jsonl".to_string()
            ]
        );

        let read = read_symbol_signals(tmp.path(), "BTCUSDT").unwrap();
        assert_eq!(read.len(), 3);
        assert!(read.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));
    }

    #[test]
    fn lines_are_newline_terminated_json() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = JsonlSignalWriter::new(tmp.path());
        writer.write(&signal(1_704_164_645_000, 0)).unwrap();
        writer.sync_all().unwrap();

        let path = tmp
            .path()
            .join("ready/signal/BTCUSDT/signals-20240102-03.jsonl");
        let raw = fs::read_to_string(path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(!raw.trim_end().contains('\n'));
        let value: serde_json::Value = serde_json::from_str(raw.trim_end()).unwrap();
        // canonical leading key
        assert_eq!(value["schema_version"], "signal/v2");
    }

    #[test]
    fn legacy_minute_files_are_read() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("ready/signal/BTCUSDT");
        fs::create_dir_all(&dir).unwrap();
        let line = serde_json::to_string(&signal(1_704_164_645_000, 9)).unwrap();
        fs::write(dir.join("signals_20240102_0304.jsonl"), format!("{}\n", line)).unwrap();

        let read = read_symbol_signals(tmp.path(), "BTCUSDT").unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].seq, 9);
    }
}
