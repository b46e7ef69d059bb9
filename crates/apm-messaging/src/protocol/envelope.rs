//! The message envelope: routing, versioning, and typing around a payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::payloads::{AckPayload, MessagePayload, NackPayload};
use crate::protocol::predicates::{generate_correlation_id, generate_message_id};
use crate::protocol::types::{AckStatus, AgentType, MessageType, Priority};

/// An agent address: identifier plus role.
///
/// `agent_id = "*"` together with [`AgentType::Any`] addresses every agent
/// (broadcast). Wildcards are legal in receivers only; validation rejects
/// them in the sender position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
}

impl AgentRef {
    pub fn new(agent_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
        }
    }

    /// Broadcast address (`*` / `*`).
    pub fn broadcast() -> Self {
        Self::new("*", AgentType::Any)
    }

    pub fn is_broadcast(&self) -> bool {
        self.agent_id == "*"
    }

    /// Whether this (possibly wildcarded) address matches a concrete agent.
    pub fn matches(&self, agent_id: &str, agent_type: AgentType) -> bool {
        let id_ok = self.agent_id == "*" || self.agent_id == agent_id;
        let type_ok = self.agent_type == AgentType::Any || self.agent_type == agent_type;
        id_ok && type_ok
    }
}

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.agent_id, self.agent_type)
    }
}

/// Optional envelope metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Time-to-live in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// The outer message record carried on every wire line.
///
/// `messageType` and `payload` are flattened in from [`MessagePayload`], so
/// the serialized form matches the wire contract while the in-memory form
/// stays a proper sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub protocol_version: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sender: AgentRef,
    pub receiver: AgentRef,
    #[serde(flatten)]
    pub body: MessagePayload,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl MessageEnvelope {
    /// Construct a new envelope stamped with a fresh message id, the current
    /// UTC time, and this implementation's protocol version.
    ///
    /// Request types that require correlation (TASK_ASSIGNMENT and
    /// HANDOFF_REQUEST) get a generated correlation id; replies should be
    /// built with [`MessageEnvelope::acknowledge`] / [`MessageEnvelope::reject`]
    /// instead so they inherit the request's correlation.
    pub fn new(sender: AgentRef, receiver: AgentRef, body: MessagePayload, priority: Priority) -> Self {
        let now = Utc::now();
        let correlation_id = match body.message_type() {
            MessageType::TaskAssignment | MessageType::HandoffRequest => {
                Some(generate_correlation_id(now))
            }
            _ => None,
        };
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            message_id: generate_message_id(now),
            correlation_id,
            timestamp: now,
            sender,
            receiver,
            body,
            priority,
            metadata: None,
        }
    }

    /// The message type tag of the payload.
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Retry count recorded in metadata, zero when absent.
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.retry_count)
            .unwrap_or(0)
    }

    /// Record a retry count, creating metadata on first use.
    pub fn set_retry_count(&mut self, count: u32) {
        self.metadata.get_or_insert_with(Default::default).retry_count = Some(count);
    }

    /// Build an ACK reply to this envelope.
    ///
    /// The reply flips sender/receiver and inherits the request's correlation
    /// id (falling back to the request's message id, so every ACK correlates).
    pub fn acknowledge(&self, from: AgentRef, status: AckStatus) -> MessageEnvelope {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.message_id.clone());
        let mut reply = MessageEnvelope::new(
            from,
            self.sender.clone(),
            MessagePayload::Ack(AckPayload {
                acknowledged_message_id: self.message_id.clone(),
                status,
                timestamp: Utc::now(),
                processing_time: None,
                notes: None,
            }),
            Priority::High,
        );
        reply.correlation_id = Some(correlation);
        reply
    }

    /// Build a NACK reply to this envelope.
    ///
    /// Receivers answer business-rule violations this way; `can_retry = false`
    /// tells the sender the rejection is terminal.
    pub fn reject(
        &self,
        from: AgentRef,
        reason: impl Into<String>,
        can_retry: bool,
        suggested_fix: Option<String>,
    ) -> MessageEnvelope {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.message_id.clone());
        let mut reply = MessageEnvelope::new(
            from,
            self.sender.clone(),
            MessagePayload::Nack(NackPayload {
                rejected_message_id: self.message_id.clone(),
                reason: reason.into(),
                timestamp: Utc::now(),
                error_code: None,
                can_retry,
                suggested_fix,
            }),
            Priority::High,
        );
        reply.correlation_id = Some(correlation);
        reply
    }
}
