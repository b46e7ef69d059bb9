//! Coordination event records.
//!
//! Every handoff lifecycle change and task unblock emits one event into the
//! coordinator's history, which enclosing programs query by task or agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kinds, spelled the way they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationEventKind {
    #[serde(rename = "handoff-created")]
    HandoffCreated,
    #[serde(rename = "handoff-ready")]
    HandoffReady,
    #[serde(rename = "handoff-completed")]
    HandoffCompleted,
    #[serde(rename = "handoff-failed")]
    HandoffFailed,
    #[serde(rename = "task-unblocked")]
    TaskUnblocked,
}

impl std::fmt::Display for CoordinationEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HandoffCreated => "handoff-created",
            Self::HandoffReady => "handoff-ready",
            Self::HandoffCompleted => "handoff-completed",
            Self::HandoffFailed => "handoff-failed",
            Self::TaskUnblocked => "task-unblocked",
        };
        write!(f, "{s}")
    }
}

/// One coordination event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationEvent {
    pub kind: CoordinationEventKind,
    /// Set for handoff lifecycle events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<String>,
    /// The task this event concerns (requesting task for handoff events)
    pub task_id: String,
    /// The agent this event concerns, when one applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
