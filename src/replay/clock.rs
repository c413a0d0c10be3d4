//! Time Provider
//!
//! Monotonic simulated clock with millisecond resolution plus the wall/sim
//! switch. During backtest runs the sim clock is the ONLY clock the
//! executor and adapters consult; nothing downstream may call system time.

use crate::models::Millis;
use std::fmt;

/// Monotonic simulation clock.
///
/// # Determinism Contract
/// - `now_ms()` returns simulation time, never system time
/// - `advance_to()` only moves forward; backward movement is a bug
#[derive(Debug, Clone)]
pub struct SimClock {
    current: Millis,
}

impl SimClock {
    #[inline]
    pub fn new(start_ms: Millis) -> Self {
        Self { current: start_ms }
    }

    #[inline]
    pub fn now_ms(&self) -> Millis {
        self.current
    }

    #[inline]
    pub fn advance_to(&mut self, new_time_ms: Millis) {
        debug_assert!(
            new_time_ms >= self.current,
            "SimClock: cannot go backward from {} to {}",
            self.current,
            new_time_ms
        );
        if new_time_ms > self.current {
            self.current = new_time_ms;
        }
    }

    #[inline]
    pub fn advance_by(&mut self, delta_ms: Millis) {
        debug_assert!(delta_ms >= 0, "SimClock: delta must be non-negative");
        self.current += delta_ms;
    }

    #[inline]
    pub fn elapsed_since(&self, past_ms: Millis) -> Millis {
        (self.current - past_ms).max(0)
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.current)
    }
}

/// Wall vs sim time source, shared by feeder, simulator, and adapters.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Live mode: system UTC.
    Wall,
    /// Backtest mode: stream-driven counter.
    Sim(SimClock),
}

impl Clock {
    pub fn sim_from(start_ms: Millis) -> Self {
        Clock::Sim(SimClock::new(start_ms))
    }

    #[inline]
    pub fn now_ms(&self) -> Millis {
        match self {
            Clock::Wall => chrono::Utc::now().timestamp_millis(),
            Clock::Sim(clock) => clock.now_ms(),
        }
    }

    /// Advance the sim clock; a no-op on the wall clock.
    #[inline]
    pub fn advance_to(&mut self, ts_ms: Millis) {
        if let Clock::Sim(clock) = self {
            clock.advance_to(ts_ms);
        }
    }

    #[inline]
    pub fn is_sim(&self) -> bool {
        matches!(self, Clock::Sim(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_is_monotonic() {
        let mut clock = SimClock::new(1_000);
        clock.advance_to(2_000);
        assert_eq!(clock.now_ms(), 2_000);
        clock.advance_by(500);
        assert_eq!(clock.now_ms(), 2_500);
        // equal time is allowed and a no-op
        clock.advance_to(2_500);
        assert_eq!(clock.now_ms(), 2_500);
    }

    #[test]
    #[should_panic(expected = "cannot go backward")]
    fn sim_clock_backward_panics_in_debug() {
        let mut clock = SimClock::new(1_000);
        clock.advance_to(500);
    }

    #[test]
    fn clock_enum_advances_only_sim() {
        let mut clock = Clock::sim_from(10);
        clock.advance_to(99);
        assert_eq!(clock.now_ms(), 99);
        assert!(clock.is_sim());

        let mut wall = Clock::Wall;
        wall.advance_to(0); // no-op, no panic
        assert!(!wall.is_sim());
    }
}
