//! Type-specific message payloads.
//!
//! Payloads form a sum type discriminated by the envelope's `messageType`
//! field. The enum is adjacently tagged so the wire JSON carries
//! `"messageType": …` next to `"payload": {…}` exactly as receivers expect,
//! while Rust code pattern-matches on the variant with no runtime casts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorSeverity;
use crate::protocol::types::{
    AckStatus, ExecutionType, HandoffReason, MessageType, SyncEntityType, SyncOperation,
    TaskStatus,
};

/// The payload sum type. Flattened into the envelope so that `messageType`
/// and `payload` appear as sibling envelope fields on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    TaskAssignment(TaskAssignmentPayload),
    TaskUpdate(TaskUpdatePayload),
    StateSync(StateSyncPayload),
    ErrorReport(ErrorReportPayload),
    HandoffRequest(HandoffRequestPayload),
    Ack(AckPayload),
    Nack(NackPayload),
}

impl MessagePayload {
    /// The discriminant tag for this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::TaskAssignment(_) => MessageType::TaskAssignment,
            Self::TaskUpdate(_) => MessageType::TaskUpdate,
            Self::StateSync(_) => MessageType::StateSync,
            Self::ErrorReport(_) => MessageType::ErrorReport,
            Self::HandoffRequest(_) => MessageType::HandoffRequest,
            Self::Ack(_) => MessageType::Ack,
            Self::Nack(_) => MessageType::Nack,
        }
    }
}

/// Manager assigns a task to an implementation agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignmentPayload {
    pub task_id: String,
    /// Reference into the implementation plan, e.g. `Phase 2 / Task 2.3`
    pub task_ref: String,
    pub description: String,
    pub memory_log_path: String,
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    pub context: Value,
}

/// Implementation agent reports progress back to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdatePayload {
    pub task_id: String,
    /// Fractional completion in `[0.0, 1.0]`
    pub progress: f64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
}

/// Replicates an entity mutation to a peer agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncPayload {
    pub entity_type: SyncEntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<Value>,
    pub sync_timestamp: DateTime<Utc>,
}

/// Structured error escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReportPayload {
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub error_message: String,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

/// Context transferred alongside a handoff request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffContext {
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Ask another agent to take over a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequestPayload {
    pub task_id: String,
    pub reason: HandoffReason,
    pub source_agent: String,
    pub target_agent: String,
    pub handoff_context: HandoffContext,
}

/// Positive acknowledgement of a previously received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub acknowledged_message_id: String,
    pub status: AckStatus,
    pub timestamp: DateTime<Utc>,
    /// Processing time in milliseconds, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Negative acknowledgement. `canRetry = false` is terminal for the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackPayload {
    pub rejected_message_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub can_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}
