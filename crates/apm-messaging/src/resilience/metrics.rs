//! Circuit-breaker metrics snapshots and collection hooks.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Point-in-time counters for a single circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls attempted through this breaker
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Current consecutive-failure streak
    pub consecutive_failures: u64,
    /// Calls admitted while half-open
    pub half_open_calls: u64,
    /// Cumulative duration of all recorded operations
    pub total_duration: Duration,
    pub current_state: CircuitState,
    /// Failure fraction over all calls, 0.0 to 1.0
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Whether the counters describe a healthy component.
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            // Closed is healthy while the failure rate stays reasonable
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            // Half-open is actively probing recovery
            CircuitState::HalfOpen => true,
        }
    }

    /// One-line summary for log output.
    pub fn format_summary(&self) -> String {
        format!(
            "state={} calls={} success={:.1}% failures={} avg={:.2}ms",
            self.current_state,
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.average_duration.as_secs_f64() * 1000.0
        )
    }
}

/// Hook for forwarding breaker metrics into a monitoring pipeline.
pub trait MetricsCollector {
    /// Record a metrics snapshot
    fn record_circuit_breaker_metrics(&self, name: &str, metrics: &CircuitBreakerMetrics);

    /// Record a state transition
    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState);
}

/// Collector that emits snapshots as structured tracing events.
#[derive(Debug, Default)]
pub struct TracingMetricsExporter;

impl MetricsCollector for TracingMetricsExporter {
    fn record_circuit_breaker_metrics(&self, name: &str, metrics: &CircuitBreakerMetrics) {
        tracing::info!(
            circuit_breaker = name,
            total_calls = metrics.total_calls,
            failure_count = metrics.failure_count,
            failure_rate = metrics.failure_rate,
            state = %metrics.current_state,
            "Circuit breaker metrics"
        );
    }

    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(
            circuit_breaker = name,
            from_state = %from,
            to_state = %to,
            "Circuit breaker state transition"
        );
    }
}
