//! Adapter Rate Limiting
//!
//! Token buckets per action (`place`, `cancel`), refilled from the caller's
//! clock rather than the system clock so backtest and dry-run runs make
//! identical throttling decisions. Over-limit submissions are rejected,
//! never queued.

use crate::config::{AdapterRateLimits, RateLimitSpec};
use crate::metrics;
use crate::models::Millis;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    rps: f64,
    burst: f64,
    tokens: f64,
    last_refill_ms: Option<Millis>,
}

impl TokenBucket {
    pub fn new(spec: RateLimitSpec) -> Self {
        Self {
            rps: spec.rps,
            burst: spec.burst as f64,
            tokens: spec.burst as f64,
            last_refill_ms: None,
        }
    }

    /// Take one token at `now_ms`. Deterministic: refill depends only on the
    /// provided timestamps.
    pub fn try_acquire(&mut self, now_ms: Millis) -> bool {
        if let Some(last) = self.last_refill_ms {
            let elapsed_ms = (now_ms - last).max(0) as f64;
            self.tokens = (self.tokens + elapsed_ms * self.rps / 1_000.0).min(self.burst);
        }
        self.last_refill_ms = Some(now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn rps(&self) -> f64 {
        self.rps
    }
}

/// The per-action buckets one adapter instance owns.
#[derive(Debug, Clone)]
pub struct AdapterLimiter {
    pub place: TokenBucket,
    pub cancel: TokenBucket,
}

impl AdapterLimiter {
    pub fn new(limits: &AdapterRateLimits) -> Self {
        let limiter = Self {
            place: TokenBucket::new(limits.place),
            cancel: TokenBucket::new(limits.cancel),
        };
        metrics::global().set_gauge(
            metrics::EXECUTOR_CURRENT_RATE_LIMIT,
            limits.place.rps.round() as i64,
        );
        limiter
    }
}
