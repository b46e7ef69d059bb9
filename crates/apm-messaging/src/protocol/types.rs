//! Closed enum sets of the protocol.
//!
//! Every enum here round-trips through serde to the exact wire spellings;
//! unknown values fail deserialization rather than being coerced.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The closed set of message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskAssignment,
    TaskUpdate,
    StateSync,
    ErrorReport,
    HandoffRequest,
    Ack,
    Nack,
}

impl MessageType {
    /// Acknowledgement timeout for this message type.
    ///
    /// `None` for ACK/NACK, which are fire-and-forget and never tracked.
    pub fn ack_timeout(&self) -> Option<Duration> {
        match self {
            Self::TaskAssignment | Self::HandoffRequest => Some(Duration::from_secs(60)),
            Self::TaskUpdate | Self::StateSync => Some(Duration::from_secs(30)),
            Self::ErrorReport => Some(Duration::from_secs(10)),
            Self::Ack | Self::Nack => None,
        }
    }

    /// ACK and NACK are never themselves tracked for delivery.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, Self::Ack | Self::Nack)
    }

    /// Wire spelling of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignment => "TASK_ASSIGNMENT",
            Self::TaskUpdate => "TASK_UPDATE",
            Self::StateSync => "STATE_SYNC",
            Self::ErrorReport => "ERROR_REPORT",
            Self::HandoffRequest => "HANDOFF_REQUEST",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery priority. HIGH strictly precedes NORMAL strictly precedes LOW at
/// dequeue time regardless of enqueue order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dequeue scan order, most urgent first.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        };
        write!(f, "{s}")
    }
}

/// Agent roles. `*` is the wildcard used in broadcast receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    Manager,
    Implementation,
    AdHoc,
    #[serde(rename = "*")]
    Any,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Manager => "Manager",
            Self::Implementation => "Implementation",
            Self::AdHoc => "AdHoc",
            Self::Any => "*",
        };
        write!(f, "{s}")
    }
}

/// Task progress states carried by TASK_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Blocked,
    PendingReview,
    Completed,
    Failed,
}

/// How a task assignment is expected to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    #[serde(rename = "single-step")]
    SingleStep,
    #[serde(rename = "multi-step")]
    MultiStep,
}

/// Entity kinds that STATE_SYNC can mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntityType {
    Agent,
    Task,
    MemoryLog,
    Configuration,
}

/// STATE_SYNC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Why a task is being handed off to another agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    ContextWindowLimit,
    SpecializationRequired,
    LoadBalancing,
}

/// Receiver-side ACK status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Processed,
    Queued,
}

/// Terminal failure classifications recorded in DLQ entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetriesExceeded,
    ReceiverTerminated,
    SchemaValidationFailed,
    CircuitBreakerOpen,
    PermanentProtocolError,
    NackNotRecoverable,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::ReceiverTerminated => "receiver_terminated",
            Self::SchemaValidationFailed => "schema_validation_failed",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::PermanentProtocolError => "permanent_protocol_error",
            Self::NackNotRecoverable => "nack_not_recoverable",
        };
        write!(f, "{s}")
    }
}
