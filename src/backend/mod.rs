//! Upstream proxy records.
//!
//! A [`Backend`] is one upstream SOCKS5 proxy endpoint with its mutable
//! health, latency, and circuit state. The health checker and the forwarders
//! both write to it concurrently; all fields live behind the record's own
//! locks so pool snapshots stay cheap.

mod pool;

pub use pool::Pool;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::health::{CircuitBreaker, CircuitState};

/// Smoothing factor for the response-time moving average.
const EMA_ALPHA: f64 = 0.3;

/// Number of recent connection outcomes kept for the success rate.
const OUTCOME_WINDOW: usize = 10;

/// Rolling metrics over real client connections through one backend.
pub struct ConnectionMetrics {
    inner: Mutex<MetricsInner>,
}

struct MetricsInner {
    total_attempts: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    avg_response_time: Duration,
    recent_outcomes: VecDeque<bool>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                total_attempts: 0,
                success_count: 0,
                failure_count: 0,
                timeout_count: 0,
                last_success: None,
                last_failure: None,
                avg_response_time: Duration::ZERO,
                recent_outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            }),
        }
    }

    /// Record a successful connection and fold its setup time into the
    /// moving average. The first sample initializes the average.
    pub fn record_success(&self, response_time: Duration) {
        let mut inner = self.inner.lock();

        inner.total_attempts += 1;
        inner.success_count += 1;
        inner.last_success = Some(Instant::now());

        if inner.avg_response_time.is_zero() {
            inner.avg_response_time = response_time;
        } else {
            let avg = response_time.as_secs_f64() * EMA_ALPHA
                + inner.avg_response_time.as_secs_f64() * (1.0 - EMA_ALPHA);
            inner.avg_response_time = Duration::from_secs_f64(avg);
        }

        push_outcome(&mut inner.recent_outcomes, true);
    }

    /// Record a failed connection.
    pub fn record_failure(&self, is_timeout: bool) {
        let mut inner = self.inner.lock();

        inner.total_attempts += 1;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if is_timeout {
            inner.timeout_count += 1;
        }

        push_outcome(&mut inner.recent_outcomes, false);
    }

    /// Success rate over the outcome window, 0.0 to 1.0.
    ///
    /// With no recorded outcomes the backend is assumed healthy (1.0).
    pub fn success_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.recent_outcomes.is_empty() {
            return 1.0;
        }
        let successes = inner.recent_outcomes.iter().filter(|&&ok| ok).count();
        successes as f64 / inner.recent_outcomes.len() as f64
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MetricsStats {
        let inner = self.inner.lock();
        let success_rate = if inner.recent_outcomes.is_empty() {
            1.0
        } else {
            let successes = inner.recent_outcomes.iter().filter(|&&ok| ok).count();
            successes as f64 / inner.recent_outcomes.len() as f64
        };

        MetricsStats {
            total_attempts: inner.total_attempts,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            timeout_count: inner.timeout_count,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
            avg_response_time: inner.avg_response_time,
            success_rate,
        }
    }
}

fn push_outcome(window: &mut VecDeque<bool>, outcome: bool) {
    if window.len() >= OUTCOME_WINDOW {
        window.pop_front();
    }
    window.push_back(outcome);
}

/// Point-in-time connection statistics for a backend.
#[derive(Debug, Clone)]
pub struct MetricsStats {
    /// Connections attempted through this backend
    pub total_attempts: u64,
    /// Successful connections
    pub success_count: u64,
    /// Failed connections
    pub failure_count: u64,
    /// Failures that were timeouts
    pub timeout_count: u64,
    /// When the last success happened
    pub last_success: Option<Instant>,
    /// When the last failure happened
    pub last_failure: Option<Instant>,
    /// Moving average of connection setup time
    pub avg_response_time: Duration,
    /// Success rate over the recent outcome window
    pub success_rate: f64,
}

struct BackendState {
    healthy: bool,
    latency: Duration,
    consecutive_failures: u32,
    last_checked: Option<Instant>,
    in_use: bool,
}

/// One upstream SOCKS5 proxy with health and latency tracking.
pub struct Backend {
    address: String,
    name: String,
    state: RwLock<BackendState>,
    circuit: CircuitBreaker,
    metrics: ConnectionMetrics,
}

impl Backend {
    /// Create a backend. New backends start healthy (optimistic) with an
    /// unmeasured latency of zero.
    pub fn new(address: impl Into<String>, name: impl Into<String>, failure_threshold: u32) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            state: RwLock::new(BackendState {
                healthy: true,
                latency: Duration::ZERO,
                consecutive_failures: 0,
                last_checked: None,
                in_use: false,
            }),
            circuit: CircuitBreaker::new(failure_threshold),
            metrics: ConnectionMetrics::new(),
        }
    }

    /// Endpoint address, `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Human label, possibly empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this backend may be selected: healthy and its circuit is
    /// Closed or HalfOpen.
    pub fn is_available(&self) -> bool {
        self.state.read().healthy && self.circuit.is_available()
    }

    /// Measured latency of the last successful probe. Zero means not yet
    /// measured.
    pub fn latency(&self) -> Duration {
        self.state.read().latency
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.state.read().consecutive_failures
    }

    /// When the backend was last probed or marked.
    pub fn last_checked(&self) -> Option<Instant> {
        self.state.read().last_checked
    }

    /// Whether a real client connection has ever succeeded through this
    /// backend.
    pub fn is_in_use(&self) -> bool {
        self.state.read().in_use
    }

    /// Record a successful health probe: restores health, stores the measured
    /// latency, resets the failure streak, and feeds the circuit.
    pub fn mark_success(&self, latency: Duration) {
        {
            let mut state = self.state.write();
            state.healthy = true;
            state.latency = latency;
            state.consecutive_failures = 0;
            state.last_checked = Some(Instant::now());
        }
        self.circuit.record_success();
    }

    /// Record a failed health probe. Marks the backend unhealthy once the
    /// failure streak reaches `threshold`, and feeds the circuit.
    pub fn mark_failure(&self, threshold: u32) {
        {
            let mut state = self.state.write();
            state.consecutive_failures += 1;
            state.last_checked = Some(Instant::now());
            if state.consecutive_failures >= threshold {
                state.healthy = false;
            }
        }
        self.circuit.record_failure();
    }

    /// Record a successful real client connection. Updates the rolling
    /// metrics with the setup time, restores health, and feeds the circuit.
    pub fn record_connection_success(&self, setup_time: Duration) {
        self.metrics.record_success(setup_time);
        self.circuit.record_success();

        let mut state = self.state.write();
        state.healthy = true;
        state.consecutive_failures = 0;
        state.in_use = true;
    }

    /// Record a failed real client connection. Updates the rolling metrics
    /// and feeds the circuit; if the circuit opens, the backend goes
    /// unhealthy.
    pub fn record_connection_failure(&self, is_timeout: bool) {
        self.metrics.record_failure(is_timeout);
        let circuit_state = self.circuit.record_failure();

        let mut state = self.state.write();
        state.consecutive_failures += 1;
        if circuit_state == CircuitState::Open {
            state.healthy = false;
        }
    }

    /// Attempt the Open → HalfOpen circuit transition for a recovery probe.
    pub fn try_recovery(&self) -> bool {
        self.circuit.try_reset()
    }

    /// Current circuit breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Snapshot of the rolling connection metrics.
    pub fn connection_metrics(&self) -> MetricsStats {
        self.metrics.stats()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("healthy", &self.state.read().healthy)
            .field("latency", &self.state.read().latency)
            .field("circuit", &self.circuit.state())
            .finish()
    }
}
