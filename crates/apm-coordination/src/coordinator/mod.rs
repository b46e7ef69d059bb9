//! # Cross-Agent Coordinator
//!
//! Runs the handoff state machine over the task graph's cross-agent
//! dependencies. One handoff exists per `(dependency, requesting)` pair
//! whose endpoints run on different agents; a requesting task may proceed
//! only when every handoff addressed to it is `Ready` or `Completed`.
//!
//! State machine per handoff:
//!
//! ```text
//! Pending --(dependency completes)--> Ready --(ack received)--> Completed
//! Pending --(dependency fails)-----> Failed
//! ```
//!
//! `Completed` and `Failed` are terminal.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{CoordinationEvent, CoordinationEventKind};
use crate::resolver::DependencyResolver;

/// Handoff lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffState {
    Pending,
    Ready,
    Completed,
    Failed,
}

impl HandoffState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Ready => "Ready",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// A directed dependency between a requesting task on one agent and a
/// providing task on another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    /// `"<dependencyTask>-><requestingTask>"`
    pub handoff_id: String,
    pub requesting_task: String,
    pub requesting_agent: String,
    pub dependency_task: String,
    pub providing_agent: String,
    pub status: HandoffState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-agent view of the coordination state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCoordinationState {
    pub agent_id: String,
    /// Tasks of this agent blocked on other agents' work
    pub blocked_tasks: Vec<String>,
    /// Completed tasks of this agent that other agents depend on
    pub completed_outputs: Vec<String>,
    /// Pending handoffs this agent is waiting for
    pub pending_handoffs: Vec<Handoff>,
    /// Non-terminal handoffs this agent must provide
    pub providing_handoffs: Vec<Handoff>,
}

/// Coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("Handoff not found: {0}")]
    HandoffNotFound(String),

    #[error("Handoff '{handoff_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        handoff_id: String,
        from: HandoffState,
        to: HandoffState,
    },
}

#[derive(Debug, Default)]
struct CoordinatorState {
    handoffs: BTreeMap<String, Handoff>,
    completed_tasks: HashSet<String>,
    failed_tasks: HashSet<String>,
    events: Vec<CoordinationEvent>,
    initialized: bool,
}

/// Handoff coordinator over one resolved task graph.
#[derive(Debug)]
pub struct AgentCoordinator {
    resolver: Arc<DependencyResolver>,
    state: Mutex<CoordinatorState>,
}

impl AgentCoordinator {
    pub fn new(resolver: Arc<DependencyResolver>) -> Self {
        Self {
            resolver,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Create one handoff per cross-agent dependency whose requesting task
    /// has not already completed. A handoff whose providing task is already
    /// complete starts `Ready`.
    ///
    /// Idempotent: re-initializing creates only handoffs that appeared
    /// since the last call.
    pub fn initialize(&self, completed_tasks: &HashSet<String>) {
        let mut state = self.lock();
        state.completed_tasks.extend(completed_tasks.iter().cloned());

        let now = Utc::now();
        for dependency in self.resolver.cross_agent_dependencies() {
            if state.completed_tasks.contains(&dependency.task_id) {
                continue;
            }
            let handoff_id = format!("{}->{}", dependency.depends_on, dependency.task_id);
            if state.handoffs.contains_key(&handoff_id) {
                continue;
            }

            let dep_complete = state.completed_tasks.contains(&dependency.depends_on);
            let handoff = Handoff {
                handoff_id: handoff_id.clone(),
                requesting_task: dependency.task_id.clone(),
                requesting_agent: dependency.task_agent.clone(),
                dependency_task: dependency.depends_on.clone(),
                providing_agent: dependency.dependency_agent.clone(),
                status: if dep_complete { HandoffState::Ready } else { HandoffState::Pending },
                created_at: now,
                ready_at: dep_complete.then_some(now),
                completed_at: None,
                error: None,
            };
            debug!(
                handoff_id = %handoff_id,
                status = %handoff.status,
                "Created handoff"
            );
            emit(
                &mut state,
                CoordinationEventKind::HandoffCreated,
                Some(handoff_id.clone()),
                handoff.requesting_task.clone(),
                Some(handoff.requesting_agent.clone()),
            );
            state.handoffs.insert(handoff_id, handoff);
        }
        state.initialized = true;
        info!(
            handoffs = state.handoffs.len(),
            completed = state.completed_tasks.len(),
            "Coordinator initialized"
        );
    }

    /// Record a task completion: every pending handoff waiting on it
    /// becomes `Ready`, and requesting tasks that are now fully unblocked
    /// emit `task-unblocked`.
    pub fn mark_task_completed(&self, task_id: &str, agent_id: &str) {
        let mut state = self.lock();
        state.completed_tasks.insert(task_id.to_string());
        debug!(task_id, agent_id, "Task completed");

        let now = Utc::now();
        let mut candidates: Vec<(String, String, String)> = Vec::new();
        for handoff in state.handoffs.values_mut() {
            if handoff.status == HandoffState::Pending && handoff.dependency_task == task_id {
                handoff.status = HandoffState::Ready;
                handoff.ready_at = Some(now);
                candidates.push((
                    handoff.handoff_id.clone(),
                    handoff.requesting_task.clone(),
                    handoff.requesting_agent.clone(),
                ));
            }
        }

        for (handoff_id, requesting_task, requesting_agent) in &candidates {
            emit(
                &mut state,
                CoordinationEventKind::HandoffReady,
                Some(handoff_id.clone()),
                requesting_task.clone(),
                Some(requesting_agent.clone()),
            );
        }

        // A task may have several handoffs; announce the unblock once each
        let mut announced: HashSet<&str> = HashSet::new();
        for (_, requesting_task, requesting_agent) in &candidates {
            if !announced.insert(requesting_task.as_str()) {
                continue;
            }
            if can_proceed(&state, requesting_task) {
                info!(task_id = %requesting_task, "Task unblocked");
                emit(
                    &mut state,
                    CoordinationEventKind::TaskUnblocked,
                    None,
                    requesting_task.clone(),
                    Some(requesting_agent.clone()),
                );
            }
        }
    }

    /// Record a task failure: every pending handoff waiting on it fails.
    pub fn mark_task_failed(&self, task_id: &str, agent_id: &str, error: impl Into<String>) {
        let mut state = self.lock();
        state.failed_tasks.insert(task_id.to_string());
        let error = error.into();
        warn!(task_id, agent_id, error = %error, "Task failed; failing dependent handoffs");

        let mut failed: Vec<(String, String, String)> = Vec::new();
        for handoff in state.handoffs.values_mut() {
            if handoff.status == HandoffState::Pending && handoff.dependency_task == task_id {
                handoff.status = HandoffState::Failed;
                handoff.error = Some(error.clone());
                failed.push((
                    handoff.handoff_id.clone(),
                    handoff.requesting_task.clone(),
                    handoff.requesting_agent.clone(),
                ));
            }
        }
        for (handoff_id, requesting_task, requesting_agent) in failed {
            emit(
                &mut state,
                CoordinationEventKind::HandoffFailed,
                Some(handoff_id),
                requesting_task,
                Some(requesting_agent),
            );
        }
    }

    /// Acknowledge a `Ready` handoff, completing it.
    pub fn complete_handoff(&self, handoff_id: &str) -> Result<(), CoordinationError> {
        let mut state = self.lock();
        let handoff = state
            .handoffs
            .get_mut(handoff_id)
            .ok_or_else(|| CoordinationError::HandoffNotFound(handoff_id.to_string()))?;

        if handoff.status != HandoffState::Ready {
            return Err(CoordinationError::InvalidTransition {
                handoff_id: handoff_id.to_string(),
                from: handoff.status,
                to: HandoffState::Completed,
            });
        }
        handoff.status = HandoffState::Completed;
        handoff.completed_at = Some(Utc::now());
        let requesting_task = handoff.requesting_task.clone();
        let requesting_agent = handoff.requesting_agent.clone();
        info!(handoff_id, task_id = %requesting_task, "Handoff completed");
        emit(
            &mut state,
            CoordinationEventKind::HandoffCompleted,
            Some(handoff_id.to_string()),
            requesting_task,
            Some(requesting_agent),
        );
        Ok(())
    }

    /// Whether every handoff addressed to this task is `Ready` or
    /// `Completed`.
    pub fn can_task_proceed(&self, task_id: &str) -> bool {
        can_proceed(&self.lock(), task_id)
    }

    /// Tasks of this agent blocked on at least one pending handoff.
    pub fn blocked_tasks(&self, agent_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut blocked: Vec<String> = state
            .handoffs
            .values()
            .filter(|h| h.requesting_agent == agent_id && h.status == HandoffState::Pending)
            .map(|h| h.requesting_task.clone())
            .collect();
        blocked.sort();
        blocked.dedup();
        blocked
    }

    /// Dependency tasks still blocking the given task.
    pub fn blocking_dependencies(&self, task_id: &str) -> Vec<String> {
        let state = self.lock();
        state
            .handoffs
            .values()
            .filter(|h| h.requesting_task == task_id && h.status == HandoffState::Pending)
            .map(|h| h.dependency_task.clone())
            .collect()
    }

    /// Aggregated view of one agent's coordination state.
    pub fn agent_coordination_state(&self, agent_id: &str) -> AgentCoordinationState {
        let state = self.lock();
        let mut blocked: Vec<String> = state
            .handoffs
            .values()
            .filter(|h| h.requesting_agent == agent_id && h.status == HandoffState::Pending)
            .map(|h| h.requesting_task.clone())
            .collect();
        blocked.sort();
        blocked.dedup();

        // Outputs relevant to others: completed tasks of this agent that
        // some handoff depends on
        let mut completed_outputs: Vec<String> = state
            .handoffs
            .values()
            .filter(|h| h.providing_agent == agent_id)
            .filter(|h| state.completed_tasks.contains(&h.dependency_task))
            .map(|h| h.dependency_task.clone())
            .collect();
        completed_outputs.sort();
        completed_outputs.dedup();

        AgentCoordinationState {
            agent_id: agent_id.to_string(),
            blocked_tasks: blocked,
            completed_outputs,
            pending_handoffs: state
                .handoffs
                .values()
                .filter(|h| h.requesting_agent == agent_id && h.status == HandoffState::Pending)
                .cloned()
                .collect(),
            providing_handoffs: state
                .handoffs
                .values()
                .filter(|h| h.providing_agent == agent_id && !h.status.is_terminal())
                .cloned()
                .collect(),
        }
    }

    pub fn handoff(&self, handoff_id: &str) -> Option<Handoff> {
        self.lock().handoffs.get(handoff_id).cloned()
    }

    /// All handoffs, ordered by id.
    pub fn handoffs(&self) -> Vec<Handoff> {
        self.lock().handoffs.values().cloned().collect()
    }

    /// Full event history, oldest first.
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.lock().events.clone()
    }

    /// Events concerning one task.
    pub fn events_for_task(&self, task_id: &str) -> Vec<CoordinationEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Events concerning one agent.
    pub fn events_for_agent(&self, agent_id: &str) -> Vec<CoordinationEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn can_proceed(state: &CoordinatorState, task_id: &str) -> bool {
    state
        .handoffs
        .values()
        .filter(|h| h.requesting_task == task_id)
        .all(|h| matches!(h.status, HandoffState::Ready | HandoffState::Completed))
}

fn emit(
    state: &mut CoordinatorState,
    kind: CoordinationEventKind,
    handoff_id: Option<String>,
    task_id: String,
    agent_id: Option<String>,
) {
    debug!(event = %kind, task_id = %task_id, "Coordination event");
    state.events.push(CoordinationEvent {
        kind,
        handoff_id,
        task_id,
        agent_id,
        timestamp: Utc::now(),
    });
}
