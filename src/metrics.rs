//! Process-Wide Metrics Registry
//!
//! Lazily initialized global registry of atomic counters, gauges, and
//! latency trackers. Registration is idempotent: a second registration with
//! the same name returns the existing collector, so double-init never
//! raises. Tests snapshot and reset between cases without leaking counters.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

// Counter names used across the pipeline. Label sets are encoded into the
// name as `{k="v"}` so snapshots stay flat and diffable.
pub const READER_CORRUPT_ROWS_TOTAL: &str = "reader_corrupt_rows_total";
pub const READER_DUPLICATES_DROPPED_TOTAL: &str = "reader_duplicates_dropped_total";
pub const ALIGNER_GAP_SECONDS_TOTAL: &str = "aligner_gap_seconds_total";
pub const ALIGNER_LAG_BAD_TOTAL: &str = "aligner_lag_bad_total";
pub const CONTRACT_VIOLATIONS_TOTAL: &str = "contract_violations_total";
pub const SINK_WRITE_RETRIES_TOTAL: &str = "sink_write_retries_total";
pub const SINK_DEADLETTER_TOTAL: &str = "sink_deadletter_total";
pub const EXECUTOR_SUBMIT_TOTAL: &str = "executor_submit_total";
pub const EXECUTOR_THROTTLE_TOTAL: &str = "executor_throttle_total";
pub const EXECUTOR_LATENCY_SECONDS: &str = "executor_latency_seconds";
pub const EXECUTOR_CURRENT_RATE_LIMIT: &str = "executor_current_rate_limit";

/// Build a labelled metric name, e.g.
/// `labelled("executor_submit_total", &[("result", "ok")])`.
pub fn labelled(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let body: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", name, body.join(","))
}

/// Simple percentile tracker over recorded samples (microseconds).
#[derive(Debug, Default, Clone)]
pub struct LatencyTracker {
    samples: Vec<u64>,
}

impl LatencyTracker {
    pub fn record(&mut self, micros: u64) {
        self.samples.push(micros);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
        sorted[idx]
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

/// The registry itself. One per process; obtain via [`global`].
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: Mutex<BTreeMap<String, Arc<AtomicI64>>>,
    latencies: Mutex<BTreeMap<String, LatencyTracker>>,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            gauges: Mutex::new(BTreeMap::new()),
            latencies: Mutex::new(BTreeMap::new()),
        }
    }

    /// Idempotent: returns the existing counter when the name is known.
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    #[inline]
    pub fn incr(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_by(&self, name: &str, n: u64) {
        self.counter(name).fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Idempotent gauge registration.
    pub fn gauge(&self, name: &str) -> Arc<AtomicI64> {
        let mut gauges = self.gauges.lock();
        gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    #[inline]
    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauge(name).store(value, Ordering::Relaxed);
    }

    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .lock()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn observe_latency(&self, name: &str, micros: u64) {
        self.latencies
            .lock()
            .entry(name.to_string())
            .or_default()
            .record(micros);
    }

    pub fn latency_p99_micros(&self, name: &str) -> u64 {
        self.latencies
            .lock()
            .get(name)
            .map(|t| t.percentile(0.99))
            .unwrap_or(0)
    }

    /// Flat snapshot of all counters and gauges, for the run manifest.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for (name, c) in self.counters.lock().iter() {
            out.insert(name.clone(), c.load(Ordering::Relaxed) as i64);
        }
        for (name, g) in self.gauges.lock().iter() {
            out.insert(name.clone(), g.load(Ordering::Relaxed));
        }
        out
    }

    /// Zero every collector. Tests call this between cases; existing
    /// `Arc` handles stay valid and observe the reset.
    pub fn reset(&self) {
        for (_, c) in self.counters.lock().iter() {
            c.store(0, Ordering::Relaxed);
        }
        for (_, g) in self.gauges.lock().iter() {
            g.store(0, Ordering::Relaxed);
        }
        self.latencies.lock().clear();
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: MetricsRegistry = MetricsRegistry::new();
}

/// The process-wide registry. The only truly global mutable in the pipeline.
#[inline]
pub fn global() -> &'static MetricsRegistry {
    &GLOBAL_REGISTRY
}
