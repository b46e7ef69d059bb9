//! # Agent Message Protocol
//!
//! Wire-level protocol for inter-agent messaging: the message envelope, the
//! payload sum type discriminated by `messageType`, the closed enum sets, and
//! the pure predicates used by semantic validation.
//!
//! The protocol is versioned (`1.x.x`); receivers reject envelopes whose
//! major version differs from [`constants::PROTOCOL_VERSION`].

pub mod constants;
mod envelope;
mod payloads;
mod predicates;
mod types;

pub use envelope::{AgentRef, MessageEnvelope, MessageMetadata};
pub use payloads::{
    AckPayload, ErrorReportPayload, HandoffContext, HandoffRequestPayload, MessagePayload,
    NackPayload, StateSyncPayload, TaskAssignmentPayload, TaskUpdatePayload,
};
pub use predicates::{
    generate_correlation_id, generate_message_id, protocol_major, requires_correlation_id,
    validate_agent_id, validate_completed_status, validate_handoff_target, validate_message_id,
    validate_protocol_version, validate_task_progress, validate_timestamp,
};
pub use types::{
    AckStatus, AgentType, ExecutionType, FailureReason, HandoffReason, MessageType, Priority,
    SyncEntityType, SyncOperation, TaskStatus,
};
