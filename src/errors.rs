//! Error Taxonomy
//!
//! Kinds, not call sites: each variant maps to one recovery policy.
//! Gating failures inside the signal core are NOT errors — they are ordinary
//! `confirm=false` signal values. Only contract violations, invalid
//! configuration, and unrecoverable I/O terminate a run.

use thiserror::Error;

/// Typed pipeline errors. `is_fatal()` decides whether a run dies or the
/// stream continues with a counter bump.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected configuration. Fatal at startup, process exit code 2.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No source layer had any file in the requested window.
    #[error("no source data for {symbols:?} in [{t_min_ms}, {t_max_ms}]")]
    SourceMissing {
        symbols: Vec<String>,
        t_min_ms: i64,
        t_max_ms: i64,
    },

    /// Unparsable source record. The row is dropped and counted; never fatal.
    #[error("corrupt row in {path}: {detail}")]
    CorruptRow { path: String, detail: String },

    /// A signal violating the hard contract, or an order derived from one.
    /// Fatal, never recovered.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A sink write failed after bounded retries; the batch went to the
    /// deadletter log and the stream continued.
    #[error("sink write failed: {0}")]
    SinkWriteFailed(String),

    /// Order-local rejection (validation, min-notional, remote reject).
    #[error("adapter rejected: {0}")]
    AdapterRejected(String),

    /// Retryable remote failure. Becomes `AdapterRejected` after N attempts.
    #[error("adapter transient failure: {0}")]
    AdapterTransient(String),

    /// Token bucket exhausted; the order was dropped, never queued.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Operation-local timeout; logged, next signal proceeds.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl PipelineError {
    /// Whether this error terminates the run.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::ConfigInvalid(_)
                | PipelineError::ContractViolation(_)
                | PipelineError::SourceMissing { .. }
        )
    }

    /// Process exit code contract: 0 success, 1 hard violation / fatal
    /// pipeline error, 2 configuration failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::ConfigInvalid(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classes() {
        assert!(PipelineError::ConfigInvalid("x".into()).is_fatal());
        assert!(PipelineError::ContractViolation("x".into()).is_fatal());
        assert!(!PipelineError::SinkWriteFailed("x".into()).is_fatal());
        assert!(!PipelineError::RateLimited("x".into()).is_fatal());
        assert!(!PipelineError::CorruptRow {
            path: "p".into(),
            detail: "d".into()
        }
        .is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(PipelineError::ConfigInvalid("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::ContractViolation("x".into()).exit_code(), 1);
    }
}
