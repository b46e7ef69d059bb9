//! # Messaging Configuration
//!
//! Per-component configuration structs with serde defaults, plus the
//! aggregate [`MessagingConfig`] loadable from TOML. Every component is
//! instantiated per agent with injected configuration and a durable-path
//! root; there is no process-wide singleton.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{MessagingError, MessagingResult};
use crate::protocol::MessageType;

/// Default durable-file root shared by all components.
pub const DEFAULT_ROOT_DIR: &str = ".apm-auto/queues";

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT_DIR)
}

/// Priority-queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Entry ceiling before the overflow policy runs
    pub max_size: usize,
    /// Directory holding the per-agent queue logs
    pub queue_dir: PathBuf,
    /// Interval between log compactions, in milliseconds
    pub compaction_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            queue_dir: default_root(),
            compaction_interval_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }
}

/// Delivery-tracker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Retries before a tracked message is failed
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Directory holding the per-agent delivery snapshots
    pub state_dir: PathBuf,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 4_000,
            state_dir: default_root(),
        }
    }
}

impl DeliveryConfig {
    /// Backoff delay for the k-th retry: `min(base * 2^(k-1), max)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self.base_retry_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Retry policy for one message type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Backoff before the next attempt: `base * multiplier^retry_count`,
    /// capped at `max_delay_ms`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry_count.min(31) as i32);
        let delay = (self.base_delay_ms as f64 * factor).round() as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Built-in per-type policy table.
    pub fn default_for(message_type: MessageType) -> Self {
        match message_type {
            MessageType::TaskAssignment | MessageType::ErrorReport => Self {
                max_retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 8_000,
                backoff_multiplier: 2.0,
            },
            MessageType::TaskUpdate | MessageType::StateSync => Self {
                max_retries: 2,
                base_delay_ms: 1_000,
                max_delay_ms: 4_000,
                backoff_multiplier: 2.0,
            },
            MessageType::HandoffRequest => Self {
                max_retries: 2,
                base_delay_ms: 2_000,
                max_delay_ms: 8_000,
                backoff_multiplier: 2.0,
            },
            // Fire-and-forget replies are never retried
            MessageType::Ack | MessageType::Nack => Self {
                max_retries: 0,
                base_delay_ms: 0,
                max_delay_ms: 0,
                backoff_multiplier: 1.0,
            },
        }
    }
}

/// Error-handler and circuit-breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    /// Directory receiving sender-side DLQ artefacts
    pub dlq_path: PathBuf,
    pub enable_retries: bool,
    /// Per-type overrides; unlisted types use the built-in table
    pub retry_policies: HashMap<MessageType, RetryPolicy>,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_ms: u64,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            dlq_path: default_root(),
            enable_retries: true,
            retry_policies: HashMap::new(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
        }
    }
}

impl ErrorHandlerConfig {
    /// Effective retry policy for a message type.
    pub fn policy_for(&self, message_type: MessageType) -> RetryPolicy {
        self.retry_policies
            .get(&message_type)
            .copied()
            .unwrap_or_else(|| RetryPolicy::default_for(message_type))
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    /// Circuit breaker configuration derived from this handler config.
    pub fn circuit_breaker_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            timeout: self.circuit_breaker_timeout(),
            success_threshold: 1,
        }
    }
}

/// Dead-letter-queue tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Entry ceiling before the oldest entry is auto-purged
    pub max_size: usize,
    pub retention_days: i64,
    /// Entry counts that trigger warning / critical alerts
    pub warning_threshold: usize,
    pub critical_threshold: usize,
    /// Directory holding the per-agent DLQ files
    pub dlq_dir: PathBuf,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            retention_days: 7,
            warning_threshold: 10,
            critical_threshold: 100,
            dlq_dir: default_root(),
        }
    }
}

/// Aggregate configuration for one agent's messaging stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub error_handler: ErrorHandlerConfig,
    pub dlq: DlqConfig,
}

impl MessagingConfig {
    /// Load from a TOML string.
    pub fn from_toml_str(raw: &str) -> MessagingResult<Self> {
        toml::from_str(raw).map_err(|e| MessagingError::Configuration(e.to_string()))
    }

    /// Load from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> MessagingResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Point every component's durable directory at one root.
    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.queue.queue_dir = root.clone();
        self.delivery.state_dir = root.clone();
        self.error_handler.dlq_path = root.clone();
        self.dlq.dlq_dir = root;
        self
    }
}
