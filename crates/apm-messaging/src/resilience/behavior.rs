//! Unified circuit-breaker interface.
//!
//! Consumers that need uniform access to any breaker (health reporting,
//! metrics collection) work with `&dyn CircuitBreakerBehavior`; hot paths
//! hold the concrete type for static dispatch.

use crate::resilience::{CircuitBreakerMetrics, CircuitState};
use std::time::Duration;

/// Object-safe interface implemented by every circuit breaker.
///
/// Covers the full lifecycle: pre-flight gating (`should_allow`), outcome
/// recording, observability (`state`, `metrics`, `is_healthy`), and the
/// emergency overrides.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    /// Name of the component this breaker protects
    fn name(&self) -> &str;

    /// Current state of the three-state machine
    fn state(&self) -> CircuitState;

    /// Whether the next call may proceed.
    ///
    /// `true` in Closed and HalfOpen; `true` in Open only once the recovery
    /// timeout has elapsed (which transitions the breaker to HalfOpen).
    fn should_allow(&self) -> bool;

    /// Record a successful operation and its duration
    fn record_success(&self, duration: Duration);

    /// Record a failed operation and its duration
    fn record_failure(&self, duration: Duration);

    /// Whether the protected component is currently considered healthy
    fn is_healthy(&self) -> bool;

    /// Force the circuit open (kill switch)
    fn force_open(&self);

    /// Force the circuit closed (manual recovery)
    fn force_closed(&self);

    /// Counter snapshot for observability
    fn metrics(&self) -> CircuitBreakerMetrics;
}
