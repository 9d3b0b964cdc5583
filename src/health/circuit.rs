//! Per-backend circuit breaker.
//!
//! Removes a failing backend from rotation until a back-off window elapses
//! and a recovery probe succeeds.
//!
//! ```text
//! Closed    → Open:      consecutive failures reach the threshold
//! Open      → HalfOpen:  try_reset() once the back-off window has elapsed
//! HalfOpen  → Closed:    probe success
//! HalfOpen  → Open:      probe failure, back-off rescheduled
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, backend is taking traffic
    Closed,
    /// Backend has failed, removed from rotation
    Open,
    /// Testing whether the backend has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Initial back-off before an open circuit allows a recovery probe.
const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the exponential back-off.
const MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Successes required in HalfOpen before the circuit closes.
const SUCCESS_THRESHOLD: u32 = 1;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    consecutive_fails: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    next_retry: Option<Instant>,
}

impl Inner {
    fn transition_to(&mut self, new_state: CircuitState) {
        if self.state != new_state {
            self.state = new_state;
            self.last_state_change = Instant::now();
        }
    }
}

/// Failure accounting for a single backend.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
}

impl CircuitBreaker {
    /// Create a circuit breaker that opens after `failure_threshold`
    /// consecutive failures.
    pub fn new(failure_threshold: u32) -> Self {
        let failure_threshold = failure_threshold.max(1);
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                consecutive_fails: 0,
                last_failure: None,
                last_state_change: Instant::now(),
                next_retry: None,
            }),
            failure_threshold,
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the backend behind this circuit may take traffic.
    ///
    /// Open circuits stay unavailable even after the back-off window has
    /// elapsed; only an explicit [`try_reset`](Self::try_reset) flips them
    /// to HalfOpen.
    pub fn is_available(&self) -> bool {
        matches!(
            self.inner.lock().state,
            CircuitState::Closed | CircuitState::HalfOpen
        )
    }

    /// Record a successful connection or probe.
    pub fn record_success(&self) -> CircuitState {
        let mut inner = self.inner.lock();

        inner.success_count += 1;
        inner.consecutive_fails = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if inner.success_count >= SUCCESS_THRESHOLD {
                    inner.transition_to(CircuitState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Open => {
                // Open circuits should not see traffic; if one does, treat
                // the success as a recovery probe.
                inner.transition_to(CircuitState::HalfOpen);
                inner.success_count = 1;
            }
        }

        inner.state
    }

    /// Record a failed connection or probe.
    pub fn record_failure(&self) -> CircuitState {
        let mut inner = self.inner.lock();

        inner.failure_count += 1;
        inner.consecutive_fails += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_fails >= self.failure_threshold {
                    inner.transition_to(CircuitState::Open);
                    self.schedule_retry(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.transition_to(CircuitState::Open);
                self.schedule_retry(&mut inner);
                inner.success_count = 0;
            }
            CircuitState::Open => {
                self.schedule_retry(&mut inner);
            }
        }

        inner.state
    }

    /// Attempt the Open → HalfOpen transition for a recovery probe.
    ///
    /// Returns true iff the circuit was Open and its back-off window has
    /// elapsed.
    pub fn try_reset(&self) -> bool {
        let mut inner = self.inner.lock();

        let elapsed = matches!(inner.next_retry, Some(t) if Instant::now() >= t);
        if inner.state == CircuitState::Open && elapsed {
            inner.transition_to(CircuitState::HalfOpen);
            inner.success_count = 0;
            return true;
        }

        false
    }

    /// Forcefully reset the circuit to Closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition_to(CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.consecutive_fails = 0;
        inner.next_retry = None;
    }

    /// Snapshot of counters and timestamps.
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            consecutive_fails: inner.consecutive_fails,
            last_failure: inner.last_failure,
            last_state_change: inner.last_state_change,
            next_retry: inner.next_retry,
        }
    }

    // Exponential back-off: 10s, 20s, 40s, 60s (cap).
    fn schedule_retry(&self, inner: &mut Inner) {
        let exp = (inner.consecutive_fails / self.failure_threshold).min(31);
        let backoff = RETRY_TIMEOUT
            .saturating_mul(1u32 << exp)
            .min(MAX_RETRY_TIMEOUT);
        inner.next_retry = Some(Instant::now() + backoff);
    }
}

/// Point-in-time circuit breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Total failures recorded
    pub failure_count: u32,
    /// Total successes recorded
    pub success_count: u32,
    /// Failures since the last success
    pub consecutive_fails: u32,
    /// When the last failure was recorded
    pub last_failure: Option<Instant>,
    /// When the state last changed
    pub last_state_change: Instant,
    /// Earliest time a recovery probe is allowed
    pub next_retry: Option<Instant>,
}
