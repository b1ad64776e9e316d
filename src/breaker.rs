//! Origin circuit breaker.
//!
//! A process-wide `CLOSED → OPEN → HALF_OPEN` state machine, shared across
//! requests behind a single mutex. `can_attempt()` is the only path that may
//! move the breaker from `OPEN` to `HALF_OPEN` — callers must not infer
//! half-open eligibility themselves, they must call it and act on the
//! result.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The breaker's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests are allowed; failures are being counted.
    Closed,
    /// Requests are denied until the recovery timeout elapses.
    Open,
    /// A single trial request is being allowed to test recovery.
    HalfOpen,
}

impl BreakerState {
    /// The numeric encoding used by the metrics gauge, matching the
    /// distilled system's `{"CLOSED": 0, "OPEN": 1, "HALF_OPEN": 2}` map.
    pub fn as_gauge_value(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

/// A circuit breaker guarding calls to the origin.
///
/// One instance is created per process at startup and shared via `Arc`
/// across every request task; all mutation happens under `Mutex<Inner>` so
/// state transitions are race-free under concurrent callers.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    /// Creates a new breaker in the `CLOSED` state.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Returns the current state without mutating it.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Returns whether an origin attempt should be made right now.
    ///
    /// In `OPEN`, this is the only function that may advance the breaker to
    /// `HALF_OPEN` once `recovery_timeout` has elapsed since the last
    /// failure.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    log::info!("circuit breaker entering HALF_OPEN for a recovery attempt");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful origin call.
    ///
    /// From `HALF_OPEN` this closes the breaker and resets the failure
    /// count; from `CLOSED` it simply resets the count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                log::info!("circuit breaker reset to CLOSED after successful recovery");
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Records a failed origin call.
    ///
    /// From `CLOSED`, advances the failure count and trips to `OPEN` once
    /// the threshold is met. From `HALF_OPEN`, a single failure reopens the
    /// breaker and resets the recovery timer.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    log::warn!(
                        "circuit breaker tripped OPEN after {} failures",
                        inner.failure_count
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                log::warn!("circuit breaker trial failed, returning to OPEN");
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_stays_closed_below_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_attempt());
    }

    #[test]
    fn trips_open_at_threshold() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_attempt());
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // Two more failures after the reset should not yet trip (threshold 3).
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_success_closes() {
        let b = CircuitBreaker::new(1, Duration::from_millis(1));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.can_attempt());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_resets_timer() {
        let b = CircuitBreaker::new(1, Duration::from_millis(1));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.can_attempt());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Immediately after reopening, the recovery timer should not have
        // elapsed yet.
        assert!(!b.can_attempt());
    }

    #[test]
    fn open_denies_until_recovery_timeout_elapses() {
        let b = CircuitBreaker::new(1, Duration::from_millis(50));
        b.record_failure();
        assert!(!b.can_attempt());
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.can_attempt());
    }
}
