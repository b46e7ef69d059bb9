//! # Resilience Primitives
//!
//! The generic circuit breaker used to throttle failing send paths. The
//! breaker runs a three-state machine:
//!
//! - **Closed** — normal operation; consecutive failures are counted
//! - **Open** — failure threshold reached; calls are rejected fast until the
//!   recovery timeout elapses
//! - **HalfOpen** — probing; successes close the circuit, a single failure
//!   re-opens it and restarts the recovery clock
//!
//! On success in Closed or HalfOpen the consecutive-failure counter is
//! decremented (floor 0), so a mostly-healthy component is not tripped by
//! occasional failures.

mod behavior;
mod metrics;

pub use behavior::CircuitBreakerBehavior;
pub use metrics::{CircuitBreakerMetrics, MetricsCollector, TracingMetricsExporter};

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            2 => Self::HalfOpen,
            // Unknown encodings degrade to Open, the safe state
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Tunables for one circuit breaker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing recovery
    pub timeout: Duration,
    /// Successes required in half-open before closing
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    half_open_calls: u64,
    total_duration: Duration,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            half_open_calls: 0,
            total_duration: Duration::ZERO,
        }
    }
}

/// A named circuit breaker guarding one component.
///
/// All methods take `&self`; the state machine lives behind an internal
/// mutex so the breaker can be shared via `Arc` across workers.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// The component name this breaker protects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, with the Open → HalfOpen clock applied.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.apply_recovery_clock(&mut inner);
        inner.state
    }

    /// Gate the next call.
    ///
    /// Closed and HalfOpen allow the call. Open allows it only once the
    /// recovery timeout has elapsed, transitioning to HalfOpen.
    pub fn should_allow(&self) -> bool {
        let mut inner = self.lock();
        self.apply_recovery_clock(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                inner.half_open_calls += 1;
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Record a successful operation.
    pub fn record_success_manual(&self, duration: Duration) {
        let mut inner = self.lock();
        self.apply_recovery_clock(&mut inner);
        inner.total_calls += 1;
        inner.success_count += 1;
        inner.total_duration += duration;
        inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                info!(circuit_breaker = %self.name, "Circuit closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    /// Record a failed operation, opening the circuit at the threshold.
    pub fn record_failure_manual(&self, duration: Duration) {
        let mut inner = self.lock();
        self.apply_recovery_clock(&mut inner);
        inner.total_calls += 1;
        inner.failure_count += 1;
        inner.total_duration += duration;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    warn!(
                        circuit_breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // One failed probe re-opens and restarts the recovery clock
                warn!(circuit_breaker = %self.name, "Probe failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Healthy means the breaker would let work through.
    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Emergency kill switch.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        warn!(circuit_breaker = %self.name, "Circuit forced open");
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Emergency recovery.
    pub fn force_closed(&self) {
        let mut inner = self.lock();
        info!(circuit_breaker = %self.name, "Circuit forced closed");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
    }

    /// Snapshot of counters and rates for observability.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.lock();
        self.apply_recovery_clock(&mut inner);
        let total = inner.total_calls;
        let failure_rate = if total > 0 {
            inner.failure_count as f64 / total as f64
        } else {
            0.0
        };
        CircuitBreakerMetrics {
            total_calls: total,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            consecutive_failures: inner.consecutive_failures,
            half_open_calls: inner.half_open_calls,
            total_duration: inner.total_duration,
            current_state: inner.state,
            failure_rate,
            success_rate: if total > 0 { 1.0 - failure_rate } else { 0.0 },
            average_duration: if total > 0 {
                inner.total_duration / total as u32
            } else {
                Duration::ZERO
            },
        }
    }

    /// Open → HalfOpen once the recovery timeout has elapsed.
    ///
    /// The failure counter resets on entry to HalfOpen so a recovered
    /// component starts from a clean slate.
    fn apply_recovery_clock(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
            if elapsed >= self.config.timeout {
                debug!(circuit_breaker = %self.name, "Recovery timeout elapsed; probing");
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        self.name()
    }

    fn state(&self) -> CircuitState {
        self.state()
    }

    fn should_allow(&self) -> bool {
        self.should_allow()
    }

    fn record_success(&self, duration: Duration) {
        self.record_success_manual(duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.record_failure_manual(duration);
    }

    fn is_healthy(&self) -> bool {
        self.is_healthy()
    }

    fn force_open(&self) {
        self.force_open();
    }

    fn force_closed(&self) {
        self.force_closed();
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        self.metrics()
    }
}
