//! Backend health tracking.
//!
//! The [`CircuitBreaker`] keeps per-backend failure accounting; the
//! [`HealthChecker`] actively probes every backend on a timer and drives
//! circuit recovery.

mod checker;
mod circuit;

pub use checker::HealthChecker;
pub use circuit::{CircuitBreaker, CircuitState, CircuitStats};
