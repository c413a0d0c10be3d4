//! Partitioned Source Reader
//!
//! Produces an ordered stream of raw per-second rows from the harvester's
//! partition layout:
//!
//! ```text
//! <root>/<layer>/date=YYYY-MM-DD/hour=HH/symbol=S/kind=K/*.jsonl
//! ```
//!
//! Two layers exist: `ready` (authoritative) and `preview`. When both carry
//! the same `(symbol, ts_ms, row_id)`, `ready` wins. Rows are deduplicated
//! through a retention bucket bounded in hours, corrupt lines are dropped
//! and counted, and consumed file paths are sampled for reproducibility.
//! Files are decoded in parallel but the stream is emitted in strict
//! ascending `ts_ms` per symbol.

use crate::config::ReaderConfig;
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::Millis;
use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Which partition kind a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Price,
    Orderbook,
    Flow,
}

impl RowKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            RowKind::Price => "price",
            RowKind::Orderbook => "orderbook",
            RowKind::Flow => "flow",
        }
    }
}

/// Source layer, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLayer {
    Ready,
    Preview,
}

impl SourceLayer {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SourceLayer::Ready => "ready",
            SourceLayer::Preview => "preview",
        }
    }
}

/// One raw row as harvested. Field presence depends on `kind`; the
/// normalizer maps legacy names before the aligner sees anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub symbol: String,
    pub ts_ms: Millis,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(skip)]
    pub kind: Option<RowKind>,
    #[serde(skip)]
    pub layer: Option<SourceLayer>,
    #[serde(default, alias = "price")]
    pub mid: Option<f64>,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
    #[serde(default, alias = "ofi_z")]
    pub z_ofi: Option<f64>,
    #[serde(default, alias = "cvd_z")]
    pub z_cvd: Option<f64>,
    /// Harvester event-time, for lag computation against the bucket.
    #[serde(default)]
    pub event_ts_ms: Option<Millis>,
}

impl RawRow {
    /// Dedup key: stable `row_id` when present, else `(symbol, ts_ms, kind)`.
    pub fn dedupe_key(&self) -> String {
        match &self.row_id {
            Some(id) => format!("{}|{}", self.symbol, id),
            None => format!(
                "{}|{}|{}",
                self.symbol,
                self.ts_ms,
                self.kind.map(|k| k.dir_name()).unwrap_or("?")
            ),
        }
    }
}

/// Window request handed to [`Reader::iterate`].
#[derive(Debug, Clone)]
pub struct ReaderRequest {
    pub symbols: Vec<String>,
    pub t_min_ms: Millis,
    pub t_max_ms: Millis,
    pub kinds: Vec<RowKind>,
    pub source_priority: Vec<SourceLayer>,
    pub include_preview: bool,
}

impl ReaderRequest {
    pub fn new(symbols: Vec<String>, t_min_ms: Millis, t_max_ms: Millis) -> Self {
        Self {
            symbols,
            t_min_ms,
            t_max_ms,
            kinds: vec![RowKind::Price, RowKind::Orderbook, RowKind::Flow],
            source_priority: vec![SourceLayer::Ready, SourceLayer::Preview],
            include_preview: true,
        }
    }
}

/// Read-side statistics, embedded in the run manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderStats {
    pub files_consumed: usize,
    /// First file per partition actually read, capped.
    pub sampled_paths: Vec<String>,
    pub rows_emitted: u64,
    pub corrupt_rows: u64,
    pub duplicates_dropped: u64,
    pub preview_rows: u64,
}

const SAMPLED_PATHS_CAP: usize = 64;

/// Bounded memory of already-seen dedup keys, keyed by the hour bucket of
/// the row they came from. Hours older than the retention window are pruned.
#[derive(Debug, Default)]
pub struct RetentionBucket {
    by_hour: BTreeMap<i64, HashSet<String>>,
    retention_hours: i64,
}

impl RetentionBucket {
    pub fn new(retention_hours: i64) -> Self {
        Self {
            by_hour: BTreeMap::new(),
            retention_hours: retention_hours.max(1),
        }
    }

    /// Insert a key; returns false when the key was already present in any
    /// retained hour (i.e. the row is a duplicate).
    pub fn insert(&mut self, ts_ms: Millis, key: &str) -> bool {
        let hour = ts_ms.div_euclid(3_600_000);
        if self.by_hour.values().any(|set| set.contains(key)) {
            return false;
        }
        self.by_hour.entry(hour).or_default().insert(key.to_string());
        self.prune(hour);
        true
    }

    fn prune(&mut self, current_hour: i64) {
        let cutoff = current_hour - self.retention_hours;
        while let Some((&oldest, _)) = self.by_hour.first_key_value() {
            if oldest < cutoff {
                self.by_hour.remove(&oldest);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn retained_hours(&self) -> usize {
        self.by_hour.len()
    }
}

/// Ordered row stream. Single-consumer; draining is non-blocking.
pub struct ReaderStream {
    rows: VecDeque<RawRow>,
    pub stats: ReaderStats,
}

impl Iterator for ReaderStream {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        self.rows.pop_front()
    }
}

/// The partitioned reader.
pub struct Reader {
    root: PathBuf,
    cfg: ReaderConfig,
}

impl Reader {
    pub fn new(root: impl Into<PathBuf>, cfg: ReaderConfig) -> Self {
        Self {
            root: root.into(),
            cfg,
        }
    }

    /// Scan the window and return the ordered, deduplicated stream.
    ///
    /// Fails with `SourceMissing` when no layer has any file in the window.
    pub fn iterate(&self, req: &ReaderRequest) -> Result<ReaderStream, PipelineError> {
        let mut stats = ReaderStats::default();
        let mut files: Vec<(PathBuf, RowKind, SourceLayer)> = Vec::new();

        let layers: Vec<SourceLayer> = req
            .source_priority
            .iter()
            .copied()
            .filter(|l| req.include_preview || *l != SourceLayer::Preview)
            .collect();

        for layer in &layers {
            for part in self.partitions_in_window(req, *layer) {
                let Ok(entries) = fs::read_dir(&part.path) else {
                    continue;
                };
                let mut first_in_partition = true;
                let mut part_files: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|x| x == "jsonl").unwrap_or(false))
                    .collect();
                part_files.sort();
                for path in part_files {
                    if first_in_partition && stats.sampled_paths.len() < SAMPLED_PATHS_CAP {
                        stats.sampled_paths.push(path.display().to_string());
                        first_in_partition = false;
                    }
                    files.push((path, part.kind, *layer));
                }
            }
        }

        if files.is_empty() {
            return Err(PipelineError::SourceMissing {
                symbols: req.symbols.clone(),
                t_min_ms: req.t_min_ms,
                t_max_ms: req.t_max_ms,
            });
        }
        stats.files_consumed = files.len();

        // Parallel decode; ordering is restored by the sort below.
        let decoded: Vec<(Vec<RawRow>, u64)> = files
            .par_iter()
            .map(|(path, kind, layer)| decode_file(path, *kind, *layer, req))
            .collect();

        let mut rows: Vec<RawRow> = Vec::new();
        for (mut file_rows, corrupt) in decoded {
            stats.corrupt_rows += corrupt;
            rows.append(&mut file_rows);
        }
        metrics::global().incr_by(metrics::READER_CORRUPT_ROWS_TOTAL, stats.corrupt_rows);

        // `ready` rows must claim dedup keys before `preview` rows do, so
        // order by layer priority first, then restore time order.
        rows.sort_by(|a, b| {
            let pa = layer_rank(a.layer);
            let pb = layer_rank(b.layer);
            pa.cmp(&pb)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.ts_ms.cmp(&b.ts_ms))
        });

        let mut retention = RetentionBucket::new(self.cfg.retention_hours);
        let mut deduped: Vec<RawRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if retention.insert(row.ts_ms, &row.dedupe_key()) {
                if row.layer == Some(SourceLayer::Preview) {
                    stats.preview_rows += 1;
                }
                deduped.push(row);
            } else {
                stats.duplicates_dropped += 1;
            }
        }
        metrics::global().incr_by(
            metrics::READER_DUPLICATES_DROPPED_TOTAL,
            stats.duplicates_dropped,
        );

        deduped.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.ts_ms.cmp(&b.ts_ms))
                .then_with(|| kind_rank(a.kind).cmp(&kind_rank(b.kind)))
        });
        stats.rows_emitted = deduped.len() as u64;

        debug!(
            files = stats.files_consumed,
            rows = stats.rows_emitted,
            corrupt = stats.corrupt_rows,
            duplicates = stats.duplicates_dropped,
            "reader window scan complete"
        );

        Ok(ReaderStream {
            rows: deduped.into(),
            stats,
        })
    }

    /// Bounded wait for the source root to appear, for live tailing.
    /// Exceeding `reader.open_timeout_ms` raises `Timeout`.
    pub fn wait_for_source(&self) -> Result<(), PipelineError> {
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis(self.cfg.open_timeout_ms);
        while !self.root.exists() {
            if std::time::Instant::now() >= deadline {
                return Err(PipelineError::Timeout(format!(
                    "source root {} not available within {}ms",
                    self.root.display(),
                    self.cfg.open_timeout_ms
                )));
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        Ok(())
    }

    fn partitions_in_window(&self, req: &ReaderRequest, layer: SourceLayer) -> Vec<Partition> {
        let mut out = Vec::new();
        let start = Utc
            .timestamp_millis_opt(req.t_min_ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
        let end = Utc
            .timestamp_millis_opt(req.t_max_ms)
            .single()
            .unwrap_or(start);

        let mut cursor: DateTime<Utc> = start
            .with_minute(0)
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(start);
        while cursor <= end {
            let date_dir = format!("date={}", cursor.format("%Y-%m-%d"));
            let hour_dir = format!("hour={:02}", cursor.hour());
            for symbol in &req.symbols {
                for kind in &req.kinds {
                    let path = self
                        .root
                        .join(layer.dir_name())
                        .join(&date_dir)
                        .join(&hour_dir)
                        .join(format!("symbol={}", symbol))
                        .join(format!("kind={}", kind.dir_name()));
                    if path.is_dir() {
                        out.push(Partition { path, kind: *kind });
                    }
                }
            }
            cursor += Duration::hours(1);
        }
        out
    }
}

struct Partition {
    path: PathBuf,
    kind: RowKind,
}

#[inline]
fn layer_rank(layer: Option<SourceLayer>) -> u8 {
    match layer {
        Some(SourceLayer::Ready) => 0,
        Some(SourceLayer::Preview) => 1,
        None => 2,
    }
}

#[inline]
fn kind_rank(kind: Option<RowKind>) -> u8 {
    // Price before orderbook before flow within the same millisecond, so the
    // aligner sees a deterministic interleave.
    match kind {
        Some(RowKind::Price) => 0,
        Some(RowKind::Orderbook) => 1,
        Some(RowKind::Flow) => 2,
        None => 3,
    }
}

fn decode_file(
    path: &Path,
    kind: RowKind,
    layer: SourceLayer,
    req: &ReaderRequest,
) -> (Vec<RawRow>, u64) {
    let Ok(raw) = fs::read_to_string(path) else {
        warn!(path = %path.display(), "unreadable source file, skipping");
        return (Vec::new(), 1);
    };

    let mut rows = Vec::new();
    let mut corrupt = 0u64;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRow>(line) {
            Ok(mut row) => {
                if row.symbol.is_empty() {
                    if let Some(sym) = symbol_from_path(path) {
                        row.symbol = sym;
                    }
                }
                if row.ts_ms < req.t_min_ms || row.ts_ms > req.t_max_ms {
                    continue;
                }
                if !req.symbols.is_empty() && !req.symbols.contains(&row.symbol) {
                    continue;
                }
                row.kind = Some(kind);
                row.layer = Some(layer);
                rows.push(row);
            }
            Err(e) => {
                corrupt += 1;
                debug!(path = %path.display(), error = %e, "corrupt row dropped");
            }
        }
    }
    (rows, corrupt)
}

fn symbol_from_path(path: &Path) -> Option<String> {
    path.ancestors().find_map(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("symbol="))
            .map(|s| s.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_partition(
        root: &Path,
        layer: &str,
        date: &str,
        hour: u32,
        symbol: &str,
        kind: &str,
        lines: &[&str],
    ) {
        let dir = root
            .join(layer)
            .join(format!("date={}", date))
            .join(format!("hour={:02}", hour))
            .join(format!("symbol={}", symbol))
            .join(format!("kind={}", kind));
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join("part-000.jsonl")).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    // 2024-01-02T03:00:00Z
    const T0: Millis = 1_704_164_400_000;

    #[test]
    fn ready_wins_over_preview_for_same_row_id() {
        let tmp = tempfile::tempdir().unwrap();
        write_partition(
            tmp.path(),
            "ready",
            "2024-01-02",
            3,
            "BTCUSDT",
            "price",
            &[&format!(
                r#"{{"symbol":"BTCUSDT","ts_ms":{},"row_id":"r1","mid":50000.0}}"#,
                T0
            )],
        );
        write_partition(
            tmp.path(),
            "preview",
            "2024-01-02",
            3,
            "BTCUSDT",
            "price",
            &[&format!(
                r#"{{"symbol":"BTCUSDT","ts_ms":{},"row_id":"r1","mid":49000.0}}"#,
                T0
            )],
        );

        let reader = Reader::new(tmp.path(), ReaderConfig::default());
        let req = ReaderRequest::new(vec!["BTCUSDT".into()], T0 - 1_000, T0 + 1_000);
        let stream = reader.iterate(&req).unwrap();
        let rows: Vec<RawRow> = stream.collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].layer, Some(SourceLayer::Ready));
        assert_eq!(rows[0].mid, Some(50000.0));
    }

    #[test]
    fn corrupt_rows_dropped_and_counted() {
        let tmp = tempfile::tempdir().unwrap();
        write_partition(
            tmp.path(),
            "ready",
            "2024-01-02",
            3,
            "BTCUSDT",
            "price",
            &[
                &format!(r#"{{"symbol":"BTCUSDT","ts_ms":{},"mid":50000.0}}"#, T0),
                "{not json at all",
            ],
        );

        let reader = Reader::new(tmp.path(), ReaderConfig::default());
        let req = ReaderRequest::new(vec!["BTCUSDT".into()], T0 - 1_000, T0 + 1_000);
        let stream = reader.iterate(&req).unwrap();
        assert_eq!(stream.stats.corrupt_rows, 1);
        assert_eq!(stream.stats.rows_emitted, 1);
    }

    #[test]
    fn missing_window_is_source_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let reader = Reader::new(tmp.path(), ReaderConfig::default());
        let req = ReaderRequest::new(vec!["BTCUSDT".into()], T0, T0 + 1_000);
        match reader.iterate(&req) {
            Err(PipelineError::SourceMissing { .. }) => {}
            other => panic!("expected SourceMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn emits_strictly_ascending_per_symbol() {
        let tmp = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..5)
            .rev()
            .map(|i| {
                format!(
                    r#"{{"symbol":"BTCUSDT","ts_ms":{},"mid":50000.0,"row_id":"r{}"}}"#,
                    T0 + i * 1_000,
                    i
                )
            })
            .collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        write_partition(tmp.path(), "ready", "2024-01-02", 3, "BTCUSDT", "price", &refs);

        let reader = Reader::new(tmp.path(), ReaderConfig::default());
        let req = ReaderRequest::new(vec!["BTCUSDT".into()], T0 - 1, T0 + 10_000);
        let rows: Vec<RawRow> = reader.iterate(&req).unwrap().collect();
        assert_eq!(rows.len(), 5);
        for pair in rows.windows(2) {
            assert!(pair[0].ts_ms < pair[1].ts_ms);
        }
    }

    #[test]
    fn legacy_field_names_are_aliased() {
        let row: RawRow = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","ts_ms":1704164400000,"ofi_z":1.5,"cvd_z":-0.5}"#,
        )
        .unwrap();
        assert_eq!(row.z_ofi, Some(1.5));
        assert_eq!(row.z_cvd, Some(-0.5));
    }

    #[test]
    fn retention_bucket_prunes_old_hours() {
        let mut bucket = RetentionBucket::new(2);
        assert!(bucket.insert(0, "a"));
        assert!(bucket.insert(3_600_000, "b"));
        assert!(bucket.insert(4 * 3_600_000, "c"));
        assert!(bucket.retained_hours() <= 3);
        // pruned hour forgets its keys
        assert!(bucket.insert(4 * 3_600_000 + 1, "a"));
    }
}
