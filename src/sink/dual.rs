//! Dual-Sink Worker
//!
//! One worker thread owns both write handles. Producers publish signals into
//! a bounded channel; a full queue blocks the publisher, which is the
//! back-pressure contract. Batches flush on size or max-latency. The JSONL
//! log is written first (it is the cheaper sink to replay), then the SQLite
//! batch commits. Failed writes retry with bounded exponential backoff and
//! exhaust into the deadletter NDJSON log; the stream itself never halts.

use crate::config::{SinkConfig, SinkKind};
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::Signal;
use crate::sink::jsonl::{read_symbol_signals, JsonlSignalWriter};
use crate::sink::store::SqliteSignalStore;
use crate::sink::select_top1;
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// End-of-run sink health, embedded in the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkHealth {
    pub published: u64,
    pub jsonl_written: u64,
    pub sqlite_written: u64,
    pub sqlite_top1_dropped: u64,
    pub deadlettered: u64,
    pub retries: u64,
}

/// Producer-side handle. Cloneable sender; `close` drains and joins.
pub struct SinkHandle {
    tx: Option<Sender<Signal>>,
    worker: Option<JoinHandle<SinkHealth>>,
}

impl SinkHandle {
    /// Publish one signal. Blocks when the queue is at capacity.
    pub fn publish(&self, signal: Signal) -> Result<(), PipelineError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::SinkWriteFailed("sink already closed".into()))?;
        tx.send(signal)
            .map_err(|_| PipelineError::SinkWriteFailed("sink worker gone".into()))
    }

    /// Drain the queue, fsync both sinks, and return the health summary.
    pub fn close(mut self) -> SinkHealth {
        self.tx.take(); // disconnect; worker drains and exits
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_else(|_| {
                error!("sink worker panicked");
                SinkHealth::default()
            }),
            None => SinkHealth::default(),
        }
    }
}

/// Spawner for the worker thread.
pub struct DualSinkWriter;

impl DualSinkWriter {
    pub fn spawn(cfg: SinkConfig) -> Result<SinkHandle> {
        let output_dir = PathBuf::from(&cfg.output_dir);
        fs::create_dir_all(&output_dir)?;

        let jsonl = match cfg.kind {
            SinkKind::Sqlite => None,
            _ => Some(JsonlSignalWriter::new(&output_dir)),
        };
        let store = match cfg.kind {
            SinkKind::Jsonl => None,
            _ => Some(SqliteSignalStore::open(
                &output_dir.join(&cfg.db_name),
                cfg.busy_timeout_ms,
            )?),
        };

        let (tx, rx) = bounded::<Signal>(cfg.queue_capacity);
        let worker = std::thread::Builder::new()
            .name("signal-sink".into())
            .spawn(move || worker_loop(cfg, output_dir, jsonl, store, rx))?;

        Ok(SinkHandle {
            tx: Some(tx),
            worker: Some(worker),
        })
    }
}

fn worker_loop(
    cfg: SinkConfig,
    output_dir: PathBuf,
    mut jsonl: Option<JsonlSignalWriter>,
    store: Option<SqliteSignalStore>,
    rx: Receiver<Signal>,
) -> SinkHealth {
    let mut health = SinkHealth::default();
    let mut batch: Vec<Signal> = Vec::with_capacity(cfg.batch_size);
    let max_latency = Duration::from_millis(cfg.batch_max_latency_ms);

    loop {
        match rx.recv_timeout(max_latency) {
            Ok(signal) => {
                health.published += 1;
                batch.push(signal);
                if batch.len() >= cfg.batch_size {
                    flush_batch(&cfg, &output_dir, &mut jsonl, &store, &mut batch, &mut health);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    flush_batch(&cfg, &output_dir, &mut jsonl, &store, &mut batch, &mut health);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&cfg, &output_dir, &mut jsonl, &store, &mut batch, &mut health);
                break;
            }
        }
    }

    if let Some(writer) = jsonl.as_mut() {
        if let Err(e) = writer.sync_all() {
            warn!(error = %e, "final jsonl fsync failed");
        }
    }
    if let Some(store) = store.as_ref() {
        if let Err(e) = store.optimize() {
            warn!(error = %e, "final sqlite checkpoint failed");
        }
    }
    info!(
        published = health.published,
        jsonl = health.jsonl_written,
        sqlite = health.sqlite_written,
        deadlettered = health.deadlettered,
        "sink worker drained"
    );
    health
}

fn flush_batch(
    cfg: &SinkConfig,
    output_dir: &Path,
    jsonl: &mut Option<JsonlSignalWriter>,
    store: &Option<SqliteSignalStore>,
    batch: &mut Vec<Signal>,
    health: &mut SinkHealth,
) {
    if batch.is_empty() {
        return;
    }
    let signals = std::mem::take(batch);

    // Write-ahead: the replayable sink first.
    if let Some(writer) = jsonl.as_mut() {
        for signal in &signals {
            match retry(cfg.write_retries, health, || writer.write(signal)) {
                Ok(()) => health.jsonl_written += 1,
                Err(e) => {
                    warn!(signal_id = %signal.signal_id, error = %e, "jsonl write exhausted retries");
                    deadletter(output_dir, std::slice::from_ref(signal), health);
                }
            }
        }
    }

    if let Some(store) = store.as_ref() {
        match retry(cfg.write_retries, health, || store.store_batch(&signals)) {
            Ok(inserted) => {
                health.sqlite_written += inserted as u64;
                health.sqlite_top1_dropped += (signals.len() - inserted) as u64;
            }
            Err(e) => {
                warn!(batch = signals.len(), error = %e, "sqlite batch exhausted retries");
                deadletter(output_dir, &signals, health);
            }
        }
    }
}

fn retry<T>(
    max_retries: u32,
    health: &mut SinkHealth,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                health.retries += 1;
                metrics::global().incr(metrics::SINK_WRITE_RETRIES_TOTAL);
                let backoff = Duration::from_millis(50u64.saturating_mul(1 << attempt.min(6)));
                warn!(attempt, error = %e, "sink write failed, backing off");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Route lost signals to `deadletter/signals/*.ndjson`. Failure to write the
/// deadletter log itself is the only condition that escalates to an error
/// log; the stream still continues.
fn deadletter(output_dir: &Path, signals: &[Signal], health: &mut SinkHealth) {
    let dir = output_dir.join("deadletter").join("signals");
    if let Err(e) = fs::create_dir_all(&dir) {
        error!(error = %e, "cannot create deadletter dir");
        return;
    }
    let path = dir.join("signals.ndjson");
    let file = OpenOptions::new().create(true).append(true).open(&path);
    match file {
        Ok(mut f) => {
            for signal in signals {
                if let Ok(mut line) = serde_json::to_vec(signal) {
                    line.push(b'\n');
                    if let Err(e) = f.write_all(&line) {
                        error!(error = %e, "deadletter write failed");
                        return;
                    }
                }
                health.deadlettered += 1;
                metrics::global().incr(metrics::SINK_DEADLETTER_TOTAL);
            }
            let _ = f.flush();
        }
        Err(e) => error!(error = %e, path = %path.display(), "cannot open deadletter log"),
    }
}

/// Cross-sink consistency report for one run: counts within 0.1% and
/// canonical-field byte equality for every common `signal_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub jsonl_count: usize,
    pub sqlite_count: usize,
    pub mismatched_fields: Vec<String>,
    pub count_ratio_ok: bool,
}

impl ConsistencyReport {
    pub fn passed(&self) -> bool {
        self.count_ratio_ok && self.mismatched_fields.is_empty()
    }
}

/// Compare both sinks for a run. JSONL is read with Top-1 applied, matching
/// the store's write-side enforcement.
pub fn verify_consistency(
    output_dir: &Path,
    store: &SqliteSignalStore,
    run_id: &str,
    symbols: &[String],
) -> Result<ConsistencyReport> {
    let mut jsonl_signals = Vec::new();
    for symbol in symbols {
        jsonl_signals.extend(
            read_symbol_signals(output_dir, symbol)?
                .into_iter()
                .filter(|s| s.run_id == run_id),
        );
    }
    let jsonl_signals = select_top1(jsonl_signals);
    let sqlite_signals = store.read_by_run(run_id)?;

    let jsonl_count = jsonl_signals.len();
    let sqlite_count = sqlite_signals.len();
    let count_ratio_ok = {
        let diff = jsonl_count.abs_diff(sqlite_count) as f64;
        diff / (jsonl_count.max(1) as f64) <= 0.001
    };

    let by_id: BTreeMap<&str, &Signal> = sqlite_signals
        .iter()
        .map(|s| (s.signal_id.as_str(), s))
        .collect();

    let mut mismatched = Vec::new();
    for signal in &jsonl_signals {
        if let Some(other) = by_id.get(signal.signal_id.as_str()) {
            if signal.canonical_fields() != other.canonical_fields() {
                mismatched.push(signal.signal_id.clone());
            }
        }
    }

    Ok(ConsistencyReport {
        jsonl_count,
        sqlite_count,
        mismatched_fields: mismatched,
        count_ratio_ok,
    })
}
