//! # Message Validation
//!
//! Three cumulative validation levels, selectable per call:
//!
//! 1. **Syntax** — non-empty, valid UTF-8, parseable JSON
//! 2. **Schema** — all fields present with correct types and enum values,
//!    envelope size within limits
//! 3. **Semantic** — protocol version compatibility, well-formed identifiers,
//!    correlation requirements, and per-message-type business rules
//!
//! Failures are discrete [`ValidationIssue`] records with an error code,
//! the offending field, expected/actual values, and a remediation
//! suggestion. Warnings never fail validation; they surface conditions a
//! well-behaved sender should fix.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorCode, ErrorSeverity};
use crate::protocol::constants::{LARGE_MESSAGE_WARNING_SIZE, MAX_MESSAGE_SIZE};
use crate::protocol::{
    requires_correlation_id, validate_agent_id, validate_completed_status, validate_handoff_target,
    validate_message_id, validate_protocol_version, validate_task_progress, validate_timestamp,
    MessageEnvelope, MessagePayload, MessageType,
};

/// How deep a validation pass goes. Levels are cumulative: `Semantic`
/// implies `Schema` implies `Syntax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Syntax,
    Schema,
    Semantic,
}

/// A single validation finding, error or warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub error_code: ErrorCode,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn new(error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            field: None,
            expected: None,
            actual: None,
            suggestion: None,
        }
    }

    fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    fn suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Severity derived from the issue's code.
    pub fn severity(&self) -> ErrorSeverity {
        self.error_code.severity()
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    /// The deepest level actually evaluated.
    pub level: ValidationLevel,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn passed(level: ValidationLevel, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            valid: true,
            level,
            errors: Vec::new(),
            warnings,
        }
    }

    fn failed(level: ValidationLevel, errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            valid: false,
            level,
            errors,
            warnings,
        }
    }
}

/// Stateless three-level message validator.
#[derive(Debug, Clone, Default)]
pub struct MessageValidator;

impl MessageValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a raw byte line, including the UTF-8 check.
    pub fn validate_bytes(&self, raw: &[u8], level: ValidationLevel) -> ValidationReport {
        match std::str::from_utf8(raw) {
            Ok(text) => self.validate(text, level),
            Err(e) => ValidationReport::failed(
                ValidationLevel::Syntax,
                vec![ValidationIssue::new(
                    ErrorCode::MalformedMessage,
                    format!("Message is not valid UTF-8: {e}"),
                )
                .suggestion("Encode messages as UTF-8 JSON")],
                Vec::new(),
            ),
        }
    }

    /// Validate a raw line up to the requested level.
    ///
    /// Validation stops at the first failing level; the report's `level`
    /// records how deep the pass got.
    pub fn validate(&self, raw: &str, level: ValidationLevel) -> ValidationReport {
        // Level 1: syntax
        let value = match self.check_syntax(raw) {
            Ok(value) => value,
            Err(issue) => {
                return ValidationReport::failed(ValidationLevel::Syntax, vec![issue], Vec::new())
            }
        };
        if level == ValidationLevel::Syntax {
            return ValidationReport::passed(ValidationLevel::Syntax, Vec::new());
        }

        // Level 2: schema
        let mut warnings = Vec::new();
        let errors = self.check_schema(raw, &value, &mut warnings);
        if !errors.is_empty() {
            return ValidationReport::failed(ValidationLevel::Schema, errors, warnings);
        }
        if level == ValidationLevel::Schema {
            return ValidationReport::passed(ValidationLevel::Schema, warnings);
        }

        // Level 3: semantics
        let envelope: MessageEnvelope = match serde_json::from_value(value.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return ValidationReport::failed(
                    ValidationLevel::Schema,
                    vec![ValidationIssue::new(
                        ErrorCode::SchemaMismatch,
                        format!("Envelope failed to deserialize: {e}"),
                    )],
                    warnings,
                );
            }
        };
        let errors = self.check_semantics(&value, &envelope, &mut warnings);
        if errors.is_empty() {
            ValidationReport::passed(ValidationLevel::Semantic, warnings)
        } else {
            ValidationReport::failed(ValidationLevel::Semantic, errors, warnings)
        }
    }

    // =========================================================================
    // Level 1: syntax
    // =========================================================================

    fn check_syntax(&self, raw: &str) -> Result<Value, ValidationIssue> {
        if raw.trim().is_empty() {
            return Err(ValidationIssue::new(
                ErrorCode::MalformedMessage,
                "Message is empty",
            ));
        }
        serde_json::from_str(raw).map_err(|e| {
            ValidationIssue::new(ErrorCode::MalformedMessage, format!("Invalid JSON: {e}"))
                .suggestion("Emit exactly one JSON object per line")
        })
    }

    // =========================================================================
    // Level 2: schema
    // =========================================================================

    fn check_schema(&self, raw: &str, value: &Value, warnings: &mut Vec<ValidationIssue>) -> Vec<ValidationIssue> {
        let mut errors = Vec::new();

        let size = raw.len();
        if size > MAX_MESSAGE_SIZE {
            errors.push(
                ValidationIssue::new(
                    ErrorCode::SizeExceeded,
                    format!("Envelope is {size} bytes; the limit is {MAX_MESSAGE_SIZE}"),
                )
                .expected(format!("<= {MAX_MESSAGE_SIZE}"))
                .actual(size.to_string())
                .suggestion("Reference large artefacts by path instead of inlining them"),
            );
        } else if size > LARGE_MESSAGE_WARNING_SIZE {
            warnings.push(
                ValidationIssue::new(
                    ErrorCode::SizeExceeded,
                    format!("Envelope is {size} bytes; consider trimming the payload"),
                )
                .actual(size.to_string()),
            );
        }

        let Some(object) = value.as_object() else {
            errors.push(
                ValidationIssue::new(ErrorCode::SchemaMismatch, "Envelope must be a JSON object")
                    .actual(json_type_name(value)),
            );
            return errors;
        };

        self.require_string(object, "protocolVersion", &mut errors);
        self.require_string(object, "messageId", &mut errors);
        self.require_string(object, "timestamp", &mut errors);
        self.check_agent_ref(object.get("sender"), "sender", &mut errors);
        self.check_agent_ref(object.get("receiver"), "receiver", &mut errors);
        self.check_enum_field(
            object,
            "messageType",
            &["TASK_ASSIGNMENT", "TASK_UPDATE", "STATE_SYNC", "ERROR_REPORT", "HANDOFF_REQUEST", "ACK", "NACK"],
            &mut errors,
        );
        self.check_enum_field(object, "priority", &["HIGH", "NORMAL", "LOW"], &mut errors);

        if let Some(correlation) = object.get("correlationId") {
            if !correlation.is_string() {
                errors.push(type_error("correlationId", "string", correlation));
            }
        }
        if let Some(metadata) = object.get("metadata") {
            if !metadata.is_object() {
                errors.push(type_error("metadata", "object", metadata));
            }
        }

        match object.get("payload") {
            Some(payload) if payload.is_object() => {
                if let Some(Value::String(tag)) = object.get("messageType") {
                    self.check_payload_schema(tag, payload, &mut errors);
                }
            }
            Some(payload) => errors.push(type_error("payload", "object", payload)),
            None => errors.push(missing_field("payload")),
        }

        errors
    }

    fn require_string(
        &self,
        object: &serde_json::Map<String, Value>,
        field: &str,
        errors: &mut Vec<ValidationIssue>,
    ) {
        match object.get(field) {
            Some(Value::String(_)) => {}
            Some(other) => errors.push(type_error(field, "string", other)),
            None => errors.push(missing_field(field)),
        }
    }

    fn check_agent_ref(&self, value: Option<&Value>, field: &str, errors: &mut Vec<ValidationIssue>) {
        let Some(value) = value else {
            errors.push(missing_field(field));
            return;
        };
        let Some(object) = value.as_object() else {
            errors.push(type_error(field, "object", value));
            return;
        };
        match object.get("agentId") {
            Some(Value::String(_)) => {}
            Some(other) => errors.push(type_error(&format!("{field}.agentId"), "string", other)),
            None => errors.push(missing_field(&format!("{field}.agentId"))),
        }
        match object.get("type") {
            Some(Value::String(t)) => {
                if !matches!(t.as_str(), "Manager" | "Implementation" | "AdHoc" | "*") {
                    errors.push(
                        ValidationIssue::new(
                            ErrorCode::InvalidEnumValue,
                            format!("Unknown agent type '{t}'"),
                        )
                        .field(format!("{field}.type"))
                        .expected("Manager | Implementation | AdHoc | *")
                        .actual(t.clone()),
                    );
                }
            }
            Some(other) => errors.push(type_error(&format!("{field}.type"), "string", other)),
            None => errors.push(missing_field(&format!("{field}.type"))),
        }
    }

    fn check_enum_field(
        &self,
        object: &serde_json::Map<String, Value>,
        field: &str,
        allowed: &[&str],
        errors: &mut Vec<ValidationIssue>,
    ) {
        match object.get(field) {
            Some(Value::String(s)) => {
                if !allowed.contains(&s.as_str()) {
                    errors.push(
                        ValidationIssue::new(
                            ErrorCode::InvalidEnumValue,
                            format!("'{s}' is not a valid value for {field}"),
                        )
                        .field(field)
                        .expected(allowed.join(" | "))
                        .actual(s.clone()),
                    );
                }
            }
            Some(other) => errors.push(type_error(field, "string", other)),
            None => errors.push(missing_field(field)),
        }
    }

    /// Per-type payload field checks, dispatched on the message-type tag.
    fn check_payload_schema(&self, tag: &str, payload: &Value, errors: &mut Vec<ValidationIssue>) {
        let Some(object) = payload.as_object() else {
            return;
        };
        let mut require = |field: &str, kind: FieldKind| {
            check_payload_field(object, field, kind, errors);
        };
        match tag {
            "TASK_ASSIGNMENT" => {
                require("taskId", FieldKind::String);
                require("taskRef", FieldKind::String);
                require("description", FieldKind::String);
                require("memoryLogPath", FieldKind::String);
                require("executionType", FieldKind::Enum(&["single-step", "multi-step"]));
                require("context", FieldKind::Any);
            }
            "TASK_UPDATE" => {
                require("taskId", FieldKind::String);
                require("progress", FieldKind::Number);
                require(
                    "status",
                    FieldKind::Enum(&["in_progress", "blocked", "pending_review", "completed", "failed"]),
                );
            }
            "STATE_SYNC" => {
                require(
                    "entityType",
                    FieldKind::Enum(&["agent", "task", "memory_log", "configuration"]),
                );
                require("entityId", FieldKind::String);
                require("operation", FieldKind::Enum(&["create", "update", "delete"]));
                require("state", FieldKind::Any);
                require("syncTimestamp", FieldKind::String);
            }
            "ERROR_REPORT" => {
                require("errorType", FieldKind::String);
                require("errorMessage", FieldKind::String);
                require("severity", FieldKind::Enum(&["critical", "high", "medium", "low"]));
                require("recoverable", FieldKind::Bool);
            }
            "HANDOFF_REQUEST" => {
                require("taskId", FieldKind::String);
                require(
                    "reason",
                    FieldKind::Enum(&["context_window_limit", "specialization_required", "load_balancing"]),
                );
                require("sourceAgent", FieldKind::String);
                require("targetAgent", FieldKind::String);
                require("handoffContext", FieldKind::Object);
            }
            "ACK" => {
                require("acknowledgedMessageId", FieldKind::String);
                require("status", FieldKind::Enum(&["received", "processed", "queued"]));
                require("timestamp", FieldKind::String);
            }
            "NACK" => {
                require("rejectedMessageId", FieldKind::String);
                require("reason", FieldKind::String);
                require("timestamp", FieldKind::String);
            }
            // Unknown tags were already reported by the messageType enum check
            _ => {}
        }
    }

    // =========================================================================
    // Level 3: semantics
    // =========================================================================

    fn check_semantics(
        &self,
        value: &Value,
        envelope: &MessageEnvelope,
        warnings: &mut Vec<ValidationIssue>,
    ) -> Vec<ValidationIssue> {
        let mut errors = Vec::new();

        if !validate_protocol_version(&envelope.protocol_version) {
            errors.push(
                ValidationIssue::new(
                    ErrorCode::VersionUnsupported,
                    format!("Protocol version '{}' is incompatible", envelope.protocol_version),
                )
                .field("protocolVersion")
                .expected(format!("major {}", crate::protocol::constants::PROTOCOL_VERSION))
                .actual(envelope.protocol_version.clone())
                .suggestion("Upgrade the sending agent to a compatible protocol major"),
            );
        }

        if !validate_message_id(&envelope.message_id) {
            errors.push(
                ValidationIssue::new(
                    ErrorCode::MalformedMessageId,
                    format!("Message id '{}' does not match msg_YYYYMMDD_HHMMSS_xxx", envelope.message_id),
                )
                .field("messageId")
                .actual(envelope.message_id.clone()),
            );
        }

        // Regex the raw timestamp string; serde already proved it parses.
        if let Some(raw_ts) = value.get("timestamp").and_then(Value::as_str) {
            if !validate_timestamp(raw_ts) {
                errors.push(
                    ValidationIssue::new(
                        ErrorCode::MalformedTimestamp,
                        format!("Timestamp '{raw_ts}' is not ISO-8601 UTC"),
                    )
                    .field("timestamp")
                    .actual(raw_ts.to_string())
                    .suggestion("Use ISO-8601 UTC, e.g. 2026-08-01T14:22:33Z"),
                );
            }
        }

        if !validate_agent_id(&envelope.sender.agent_id) {
            errors.push(malformed_agent("sender.agentId", &envelope.sender.agent_id));
        }
        if envelope.sender.is_broadcast() {
            errors.push(
                ValidationIssue::new(ErrorCode::InvalidReceiver, "Sender may not be the broadcast wildcard")
                    .field("sender.agentId"),
            );
        }
        if !validate_agent_id(&envelope.receiver.agent_id) {
            errors.push(malformed_agent("receiver.agentId", &envelope.receiver.agent_id));
        }

        let message_type = envelope.message_type();
        if envelope.correlation_id.is_none() && requires_correlation_id(message_type) {
            let issue = ValidationIssue::new(
                ErrorCode::MissingCorrelation,
                format!("{message_type} messages should carry a correlationId"),
            )
            .field("correlationId")
            .suggestion("Copy the correlationId (or messageId) of the message being answered");
            // For replies the pairing is best-effort; for requests it is required.
            match message_type {
                MessageType::Ack | MessageType::Nack => warnings.push(issue),
                _ => errors.push(issue),
            }
        }

        self.check_payload_semantics(envelope, &mut errors, warnings);
        errors
    }

    fn check_payload_semantics(
        &self,
        envelope: &MessageEnvelope,
        errors: &mut Vec<ValidationIssue>,
        warnings: &mut Vec<ValidationIssue>,
    ) {
        match &envelope.body {
            MessagePayload::TaskUpdate(update) => {
                if !validate_task_progress(update.progress) {
                    errors.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            format!("Progress {} is outside [0.0, 1.0]", update.progress),
                        )
                        .field("payload.progress")
                        .expected("0.0 ..= 1.0")
                        .actual(update.progress.to_string()),
                    );
                } else if !validate_completed_status(update.status, update.progress) {
                    errors.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "status 'completed' requires progress = 1.0",
                        )
                        .field("payload.progress")
                        .expected("1.0")
                        .actual(update.progress.to_string()),
                    );
                }
                if update.status == crate::protocol::TaskStatus::Blocked
                    && update.blockers.as_ref().map_or(true, |b| b.is_empty())
                {
                    warnings.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "Blocked update does not name any blockers",
                        )
                        .field("payload.blockers")
                        .suggestion("List what the task is blocked on"),
                    );
                }
            }
            MessagePayload::HandoffRequest(handoff) => {
                if !validate_handoff_target(&handoff.source_agent, &handoff.target_agent) {
                    errors.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "Handoff source and target must be different agents",
                        )
                        .field("payload.targetAgent")
                        .actual(handoff.target_agent.clone()),
                    );
                }
                if handoff.handoff_context.completed_steps.is_empty() {
                    warnings.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "Handoff context lists no completed steps",
                        )
                        .field("payload.handoffContext.completedSteps"),
                    );
                }
            }
            MessagePayload::Nack(nack) => {
                if nack.suggested_fix.is_none() {
                    warnings.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "NACK does not suggest a fix",
                        )
                        .field("payload.suggestedFix")
                        .suggestion("Tell the sender how to repair the rejected message"),
                    );
                }
                if nack.can_retry && nack.reason.to_lowercase().contains("permanent") {
                    warnings.push(
                        ValidationIssue::new(
                            ErrorCode::BusinessRuleViolation,
                            "canRetry=true contradicts a permanent-sounding reason",
                        )
                        .field("payload.canRetry")
                        .actual(nack.reason.clone()),
                    );
                }
            }
            _ => {}
        }
    }
}

// =============================================================================
// Issue helpers
// =============================================================================

enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Enum(&'static [&'static str]),
    Any,
}

fn check_payload_field(
    object: &serde_json::Map<String, Value>,
    field: &str,
    kind: FieldKind,
    errors: &mut Vec<ValidationIssue>,
) {
    let path = format!("payload.{field}");
    let Some(value) = object.get(field) else {
        errors.push(missing_field(&path));
        return;
    };
    match kind {
        FieldKind::String if !value.is_string() => errors.push(type_error(&path, "string", value)),
        FieldKind::Number if !value.is_number() => errors.push(type_error(&path, "number", value)),
        FieldKind::Bool if !value.is_boolean() => errors.push(type_error(&path, "boolean", value)),
        FieldKind::Object if !value.is_object() => errors.push(type_error(&path, "object", value)),
        FieldKind::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            Some(s) => errors.push(
                ValidationIssue::new(
                    ErrorCode::InvalidEnumValue,
                    format!("'{s}' is not a valid value for {path}"),
                )
                .field(path.clone())
                .expected(allowed.join(" | "))
                .actual(s.to_string()),
            ),
            None => errors.push(type_error(&path, "string", value)),
        },
        _ => {}
    }
}

fn malformed_agent(field: &str, actual: &str) -> ValidationIssue {
    ValidationIssue::new(
        ErrorCode::MalformedAgentId,
        format!("Field '{field}' is not a valid agent id"),
    )
    .field(field)
    .actual(actual.to_string())
}

fn missing_field(field: &str) -> ValidationIssue {
    ValidationIssue::new(ErrorCode::MissingField, format!("Required field '{field}' is missing"))
        .field(field)
        .suggestion(format!("Add '{field}' to the message"))
}

fn type_error(field: &str, expected: &str, actual: &Value) -> ValidationIssue {
    ValidationIssue::new(
        ErrorCode::InvalidFieldType,
        format!("Field '{field}' must be a {expected}"),
    )
    .field(field)
    .expected(expected)
    .actual(json_type_name(actual))
}

fn json_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}
