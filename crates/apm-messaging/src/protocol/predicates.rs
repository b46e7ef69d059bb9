//! Pure protocol predicates used by semantic validation.
//!
//! Each predicate answers one question about one field with no side effects;
//! the validator turns failed predicates into structured issues.

use chrono::{DateTime, Utc};

use crate::protocol::constants::{
    AGENT_ID_PATTERN, MESSAGE_ID_PATTERN, PROTOCOL_VERSION, TIMESTAMP_PATTERN,
};
use crate::protocol::types::{MessageType, TaskStatus};

/// Parse the major component of a `major.minor.patch` version string.
pub fn protocol_major(version: &str) -> Option<u32> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    // minor and patch must at least parse as numbers
    parts.next()?.parse::<u32>().ok()?;
    parts.next()?.parse::<u32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(major)
}

/// A peer version is compatible when its major equals our major.
pub fn validate_protocol_version(version: &str) -> bool {
    let host_major = protocol_major(PROTOCOL_VERSION).unwrap_or(1);
    matches!(protocol_major(version), Some(major) if major == host_major)
}

/// Agent IDs are alphanumeric/underscore, or the `*` wildcard.
pub fn validate_agent_id(agent_id: &str) -> bool {
    agent_id == "*" || AGENT_ID_PATTERN.is_match(agent_id)
}

/// Message IDs follow `msg_{YYYYMMDD}_{HHMMSS}_{alnum}`.
pub fn validate_message_id(message_id: &str) -> bool {
    MESSAGE_ID_PATTERN.is_match(message_id)
}

/// Timestamps are ISO-8601 UTC.
pub fn validate_timestamp(timestamp: &str) -> bool {
    TIMESTAMP_PATTERN.is_match(timestamp)
}

/// Message types that must carry a correlation id.
pub fn requires_correlation_id(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::TaskAssignment
            | MessageType::HandoffRequest
            | MessageType::Ack
            | MessageType::Nack
    )
}

/// Progress is a fraction in `[0.0, 1.0]`.
pub fn validate_task_progress(progress: f64) -> bool {
    progress.is_finite() && (0.0..=1.0).contains(&progress)
}

/// `status = completed` implies `progress = 1.0`.
pub fn validate_completed_status(status: TaskStatus, progress: f64) -> bool {
    status != TaskStatus::Completed || progress == 1.0
}

/// A handoff must move the task between two distinct agents.
pub fn validate_handoff_target(source_agent: &str, target_agent: &str) -> bool {
    source_agent != target_agent
}

/// Generate a fresh message id: `msg_{YYYYMMDD}_{HHMMSS}_{6 alnum}`.
pub fn generate_message_id(now: DateTime<Utc>) -> String {
    format!("msg_{}_{}", now.format("%Y%m%d_%H%M%S"), random_suffix(6))
}

/// Generate a fresh correlation id: `req_{epoch_ms}_{6 alnum}`.
pub fn generate_correlation_id(now: DateTime<Utc>) -> String {
    format!("req_{}_{}", now.timestamp_millis(), random_suffix(6))
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect()
}
