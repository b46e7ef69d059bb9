//! # Messaging Error Types
//!
//! Error taxonomy for the messaging core. Every failure surfaced to a caller
//! carries a machine-readable [`ErrorCode`] plus a human-readable message, so
//! that handlers can branch on the code (retry vs dead-letter) without string
//! matching.
//!
//! The taxonomy is split into five families: validation, routing, protocol,
//! task, and system. Severity and recoverability are derived from the code,
//! not stored alongside it, which keeps the two from drifting apart.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the messaging crate.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Severity attached to validation issues and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{s}")
    }
}

/// Machine-readable error codes for every failure class the core can produce.
///
/// Serialized in SCREAMING_SNAKE_CASE to match the wire-level `errorCode`
/// fields in validation reports, NACK payloads, and DLQ entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation family
    MissingField,
    InvalidFieldType,
    InvalidEnumValue,
    SchemaMismatch,
    SizeExceeded,
    MalformedMessageId,
    MalformedTimestamp,
    MalformedAgentId,
    BusinessRuleViolation,

    // Routing family
    AgentNotFound,
    InvalidReceiver,
    ChannelUnavailable,
    BroadcastPartialFailure,

    // Protocol family
    VersionUnsupported,
    MalformedMessage,
    MissingCorrelation,
    DeliveryTimeout,
    DuplicateMessageId,
    UnexpectedMessageType,

    // Task family
    TaskNotFound,
    TaskAlreadyAssigned,
    TaskExecutionFailed,
    MissingDependency,
    TaskTimeout,
    InvalidStateTransition,

    // System family
    FilesystemError,
    DiskFull,
    PermissionDenied,
    ChannelLocked,
    Internal,
}

impl ErrorCode {
    /// Default severity for this code.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::VersionUnsupported | Self::DiskFull | Self::PermissionDenied => {
                ErrorSeverity::Critical
            }
            Self::SizeExceeded
            | Self::MalformedMessage
            | Self::SchemaMismatch
            | Self::AgentNotFound
            | Self::ChannelUnavailable
            | Self::TaskExecutionFailed
            | Self::FilesystemError
            | Self::Internal => ErrorSeverity::High,
            Self::MissingField
            | Self::InvalidFieldType
            | Self::InvalidEnumValue
            | Self::MalformedMessageId
            | Self::MalformedTimestamp
            | Self::MalformedAgentId
            | Self::BusinessRuleViolation
            | Self::InvalidReceiver
            | Self::MissingCorrelation
            | Self::DeliveryTimeout
            | Self::UnexpectedMessageType
            | Self::TaskNotFound
            | Self::TaskAlreadyAssigned
            | Self::MissingDependency
            | Self::TaskTimeout
            | Self::InvalidStateTransition
            | Self::ChannelLocked => ErrorSeverity::Medium,
            Self::BroadcastPartialFailure | Self::DuplicateMessageId => ErrorSeverity::Low,
        }
    }

    /// Whether a failure with this code is worth retrying.
    ///
    /// Non-recoverable codes route straight to the dead letter queue; the
    /// retry/backoff path is reserved for transient conditions.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            Self::VersionUnsupported
                | Self::MalformedMessage
                | Self::SchemaMismatch
                | Self::SizeExceeded
                | Self::InvalidReceiver
                | Self::DuplicateMessageId
                | Self::UnexpectedMessageType
                | Self::PermissionDenied
                | Self::InvalidStateTransition
        )
    }

    /// Wire spelling of the code (SCREAMING_SNAKE_CASE).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingField => "MISSING_FIELD",
            Self::InvalidFieldType => "INVALID_FIELD_TYPE",
            Self::InvalidEnumValue => "INVALID_ENUM_VALUE",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::SizeExceeded => "SIZE_EXCEEDED",
            Self::MalformedMessageId => "MALFORMED_MESSAGE_ID",
            Self::MalformedTimestamp => "MALFORMED_TIMESTAMP",
            Self::MalformedAgentId => "MALFORMED_AGENT_ID",
            Self::BusinessRuleViolation => "BUSINESS_RULE_VIOLATION",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::InvalidReceiver => "INVALID_RECEIVER",
            Self::ChannelUnavailable => "CHANNEL_UNAVAILABLE",
            Self::BroadcastPartialFailure => "BROADCAST_PARTIAL_FAILURE",
            Self::VersionUnsupported => "VERSION_UNSUPPORTED",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::MissingCorrelation => "MISSING_CORRELATION",
            Self::DeliveryTimeout => "DELIVERY_TIMEOUT",
            Self::DuplicateMessageId => "DUPLICATE_MESSAGE_ID",
            Self::UnexpectedMessageType => "UNEXPECTED_MESSAGE_TYPE",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::TaskAlreadyAssigned => "TASK_ALREADY_ASSIGNED",
            Self::TaskExecutionFailed => "TASK_EXECUTION_FAILED",
            Self::MissingDependency => "MISSING_DEPENDENCY",
            Self::TaskTimeout => "TASK_TIMEOUT",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::FilesystemError => "FILESYSTEM_ERROR",
            Self::DiskFull => "DISK_FULL",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ChannelLocked => "CHANNEL_LOCKED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operational error type for the messaging crate.
///
/// Validation failures are reported through `ValidationReport` rather than
/// this enum; `MessagingError` covers the operational paths (queueing,
/// persistence, delivery, protocol rejection).
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Message failed validation and cannot enter the pipeline
    #[error("Validation failed ({code}): {message}")]
    Validation { code: ErrorCode, message: String },

    /// Wire-level protocol violation (version, framing, correlation)
    #[error("Protocol error ({code}): {message}")]
    Protocol { code: ErrorCode, message: String },

    /// Serialized envelope exceeds the wire size limit
    #[error("Message size {size} exceeds limit of {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },

    /// Queue is at capacity and the overflow policy rejected the message
    #[error("Queue for agent '{agent_id}' is full ({capacity} entries)")]
    QueueFull { agent_id: String, capacity: usize },

    /// Circuit breaker is open and the operation was rejected fast
    #[error("Circuit breaker open for component '{component}'")]
    CircuitBreakerOpen { component: String },

    /// Requested entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A state machine rejected the requested transition
    #[error("Invalid transition for {entity}: {reason}")]
    InvalidTransition { entity: String, reason: String },

    /// Component has been shut down and no longer accepts work
    #[error("Component '{0}' is shut down")]
    Shutdown(&'static str),

    /// Durable-state I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure outside the validation pipeline
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Catch-all for internal invariant violations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MessagingError {
    /// Convenience constructor for validation failures.
    pub fn validation(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Convenience constructor for protocol failures.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Convenience constructor for fast-fail when a breaker is open.
    pub fn circuit_breaker_open(component: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen {
            component: component.into(),
        }
    }

    /// The error code carried by this error, when one applies.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Validation { code, .. } | Self::Protocol { code, .. } => Some(*code),
            Self::SizeExceeded { .. } => Some(ErrorCode::SizeExceeded),
            Self::NotFound { .. } => None,
            Self::InvalidTransition { .. } => Some(ErrorCode::InvalidStateTransition),
            Self::Io(_) => Some(ErrorCode::FilesystemError),
            _ => None,
        }
    }

    /// Process exit code for thin enclosing programs.
    ///
    /// 1 = validation error, 2 = I/O failure, 3 = unrecoverable protocol
    /// error. Success (0) is never produced here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::SizeExceeded { .. } => 1,
            Self::Io(_) | Self::Serialization(_) | Self::Configuration(_) => 2,
            Self::Protocol { .. } => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_spelling_matches_serde() {
        let json = serde_json::to_string(&ErrorCode::SizeExceeded).unwrap();
        assert_eq!(json, "\"SIZE_EXCEEDED\"");
        assert_eq!(ErrorCode::SizeExceeded.as_str(), "SIZE_EXCEEDED");

        let parsed: ErrorCode = serde_json::from_str("\"MALFORMED_MESSAGE\"").unwrap();
        assert_eq!(parsed, ErrorCode::MalformedMessage);
    }

    #[test]
    fn test_recoverability_split() {
        // Transient conditions retry
        assert!(ErrorCode::ChannelUnavailable.recoverable());
        assert!(ErrorCode::DeliveryTimeout.recoverable());
        assert!(ErrorCode::FilesystemError.recoverable());

        // Permanent conditions go straight to the DLQ
        assert!(!ErrorCode::VersionUnsupported.recoverable());
        assert!(!ErrorCode::MalformedMessage.recoverable());
        assert!(!ErrorCode::SizeExceeded.recoverable());
    }

    #[test]
    fn test_exit_codes() {
        let validation = MessagingError::validation(ErrorCode::MissingField, "taskId");
        assert_eq!(validation.exit_code(), 1);

        let io = MessagingError::Io(std::io::Error::other("disk"));
        assert_eq!(io.exit_code(), 2);

        let protocol = MessagingError::protocol(ErrorCode::VersionUnsupported, "2.0.0");
        assert_eq!(protocol.exit_code(), 3);
    }

    #[test]
    fn test_severity_is_derived_from_code() {
        assert_eq!(ErrorCode::VersionUnsupported.severity(), ErrorSeverity::Critical);
        assert_eq!(ErrorCode::DeliveryTimeout.severity(), ErrorSeverity::Medium);
        assert_eq!(ErrorCode::DuplicateMessageId.severity(), ErrorSeverity::Low);
    }
}
