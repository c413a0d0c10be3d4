//! SQLite Signal Store
//!
//! Indexed half of the dual sink. WAL journal mode, generous busy_timeout,
//! `WITHOUT ROWID` clustering on the `(symbol, ts_ms, signal_id)` primary
//! key, batched single-transaction writes, and write-side Top-1 enforcement:
//! when several signals share `(symbol, ts_ms)`, losers are deleted before
//! the winner is upserted.

use crate::models::{DecisionCode, Millis, Regime, SideHint, Signal};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS signals (
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    signal_id TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    side_hint TEXT NOT NULL,
    score REAL NOT NULL,
    regime TEXT NOT NULL,
    div_type TEXT,
    gating INTEGER NOT NULL,
    confirm INTEGER NOT NULL,
    cooldown_ms INTEGER NOT NULL,
    expiry_ms INTEGER NOT NULL,
    decision_code TEXT NOT NULL,
    decision_reason TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    meta TEXT,
    PRIMARY KEY (symbol, ts_ms, signal_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_signals_run_id
    ON signals(run_id, symbol, ts_ms);
"#;

/// The store. The dual-sink worker holds the only instance; the connection
/// never crosses threads.
pub struct SqliteSignalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignalStore {
    pub fn open(db_path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir {}", parent.display()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("open signal db {}", db_path.display()))?;

        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
            .context("set busy_timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initialize signal schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode = %journal_mode, "WAL mode not active");
        }
        info!(db = %db_path.display(), "signal store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Write a batch in one transaction, enforcing Top-1 per
    /// `(symbol, ts_ms)`. Returns the number of rows actually inserted.
    pub fn store_batch(&self, signals: &[Signal]) -> Result<usize> {
        if signals.is_empty() {
            return Ok(0);
        }

        // Pre-serialize outside the lock.
        let metas: Vec<Option<String>> = signals
            .iter()
            .map(|s| {
                if s.meta.is_empty() {
                    None
                } else {
                    serde_json::to_string(&s.meta).ok()
                }
            })
            .collect();

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = Self::store_batch_locked(&conn, signals, &metas);
        match result {
            Ok(inserted) => {
                conn.execute("COMMIT", [])?;
                Ok(inserted)
            }
            Err(e) => {
                // Leave no open transaction behind; the caller retries the
                // whole batch.
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn store_batch_locked(
        conn: &Connection,
        signals: &[Signal],
        metas: &[Option<String>],
    ) -> Result<usize> {
        let mut inserted = 0usize;
        for (signal, meta_json) in signals.iter().zip(metas.iter()) {
            // Top-1: does an incumbent with this (symbol, ts_ms) beat us?
            let incumbent: Option<(f64, i64)> = {
                let mut stmt = conn.prepare_cached(
                    "SELECT score, seq FROM signals WHERE symbol = ?1 AND ts_ms = ?2 LIMIT 1",
                )?;
                let mut rows = stmt.query(params![signal.symbol, signal.ts_ms])?;
                match rows.next()? {
                    Some(row) => Some((row.get(0)?, row.get(1)?)),
                    None => None,
                }
            };

            if let Some((inc_score, inc_seq)) = incumbent {
                let incumbent_wins = inc_score.abs() > signal.score.abs()
                    || (inc_score.abs() == signal.score.abs() && inc_seq <= signal.seq as i64);
                if incumbent_wins {
                    continue;
                }
                // Delete losers before the winner goes in.
                conn.execute(
                    "DELETE FROM signals WHERE symbol = ?1 AND ts_ms = ?2",
                    params![signal.symbol, signal.ts_ms],
                )?;
            }

            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO signals
                 (symbol, ts_ms, signal_id, schema_version, run_id, seq, side_hint, score,
                  regime, div_type, gating, confirm, cooldown_ms, expiry_ms, decision_code,
                  decision_reason, config_hash, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            stmt.execute(params![
                signal.symbol,
                signal.ts_ms,
                signal.signal_id,
                signal.schema_version,
                signal.run_id,
                signal.seq as i64,
                signal.side_hint.as_str(),
                signal.score,
                signal.regime.as_str(),
                signal.div_type,
                signal.gating as i64,
                signal.confirm as i64,
                signal.cooldown_ms,
                signal.expiry_ms,
                signal.decision_code.as_str(),
                signal.decision_reason,
                signal.config_hash,
                meta_json,
            ])?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn count_all(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM signals", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn count_by_run(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Signals for one symbol in a window, ascending `ts_ms`.
    pub fn read_signals(
        &self,
        symbol: &str,
        t_min_ms: Millis,
        t_max_ms: Millis,
    ) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, ts_ms, signal_id, schema_version, run_id, seq, side_hint, score,
                    regime, div_type, gating, confirm, cooldown_ms, expiry_ms, decision_code,
                    decision_reason, config_hash, meta
             FROM signals
             WHERE symbol = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3
             ORDER BY ts_ms, seq",
        )?;
        let signals = stmt
            .query_map(params![symbol, t_min_ms, t_max_ms], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(signals)
    }

    /// Every signal of a run, ascending `(symbol, ts_ms)`.
    pub fn read_by_run(&self, run_id: &str) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, ts_ms, signal_id, schema_version, run_id, seq, side_hint, score,
                    regime, div_type, gating, confirm, cooldown_ms, expiry_ms, decision_code,
                    decision_reason, config_hash, meta
             FROM signals
             WHERE run_id = ?1
             ORDER BY symbol, ts_ms, seq",
        )?;
        let signals = stmt
            .query_map([run_id], row_to_signal)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(signals)
    }

    /// Per-decision-code counts for a run, for gate statistics.
    pub fn gate_stats(&self, run_id: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT decision_code, COUNT(*) FROM signals
             WHERE run_id = ?1 GROUP BY decision_code ORDER BY decision_code",
        )?;
        let stats = stmt
            .query_map([run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(stats)
    }

    /// Per-decision-code counts over every run in the store.
    pub fn gate_stats_all(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT decision_code, COUNT(*) FROM signals
             GROUP BY decision_code ORDER BY decision_code",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(stats)
    }

    /// Checkpoint the WAL; run at close.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize; PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
    let side_hint_str: String = row.get(6)?;
    let regime_str: String = row.get(8)?;
    let code_str: String = row.get(14)?;
    let meta_str: Option<String> = row.get(17)?;

    let side_hint: SideHint = parse_enum(&side_hint_str)?;
    let regime: Regime = parse_enum(&regime_str)?;
    let decision_code: DecisionCode = parse_enum(&code_str)?;
    let meta = match meta_str {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        None => serde_json::Map::new(),
    };

    Ok(Signal {
        symbol: row.get(0)?,
        ts_ms: row.get(1)?,
        signal_id: row.get(2)?,
        schema_version: row.get(3)?,
        run_id: row.get(4)?,
        seq: row.get::<_, i64>(5)? as u64,
        side_hint,
        score: row.get(7)?,
        regime,
        div_type: row.get(9)?,
        gating: row.get::<_, i64>(10)? as u8,
        confirm: row.get::<_, i64>(11)? != 0,
        cooldown_ms: row.get(12)?,
        expiry_ms: row.get(13)?,
        decision_code,
        decision_reason: row.get(15)?,
        config_hash: row.get(16)?,
        meta,
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
