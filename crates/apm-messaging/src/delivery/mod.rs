//! # Delivery Tracker
//!
//! Tracks every sent message until it is acknowledged, terminally rejected,
//! or timed out. Each tracked message owns one timer task; when it fires the
//! tracker re-evaluates the delivery under the instance lock, so cancelling
//! (via ACK, NACK, or shutdown) deterministically prevents the callback from
//! acting on a delivery that is no longer tracked.
//!
//! ## Retry schedule
//!
//! The k-th retry fires after `min(base * 2^(k-1), max)`. The first
//! evaluation happens at the message type's ack timeout; subsequent
//! evaluations chain on the backoff delays until `max_retries` is reached,
//! at which point the tracker emits `MESSAGE_FAILED` and the caller moves
//! the message to the DLQ.
//!
//! ## Durability
//!
//! The full delivery map is snapshotted to
//! `<stateDir>/<agentId>-delivery-state.json` (write-tmp-rename) on every
//! change. On restart each restored delivery re-arms its timer from the
//! persisted `nextRetryAt`/`timeoutAt`, and deliveries whose deadline has
//! already passed are re-evaluated exactly as if the timer had fired.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::errors::{ErrorCode, MessagingError, MessagingResult};
use crate::protocol::{AckStatus, FailureReason, MessageEnvelope, MessagePayload, MessageType};

/// Bounded in-memory event history.
const HISTORY_LIMIT: usize = 1_000;

/// Lifecycle events emitted for tracked messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryEventKind {
    MessageSent,
    MessageAcknowledged,
    MessageRetry,
    MessageFailed,
}

/// Event context; which fields are set depends on the event kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_status: Option<AckStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nack_error_code: Option<String>,
    /// Timestamps of every retry attempt, oldest first (set on failure)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_attempts: Vec<DateTime<Utc>>,
}

/// One emitted delivery event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub kind: DeliveryEventKind,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: DeliveryEventContext,
}

/// Persistent state of one in-flight message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryState {
    pub message: MessageEnvelope,
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
    /// Timestamps of retries scheduled so far
    #[serde(default)]
    pub attempts: Vec<DateTime<Utc>>,
}

/// Snapshot written to disk on every change.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliverySnapshot {
    deliveries: HashMap<String, DeliveryState>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct Tracked {
    state: DeliveryState,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct TrackerState {
    deliveries: HashMap<String, Tracked>,
    history: VecDeque<DeliveryEvent>,
    shutdown: bool,
}

/// Per-agent delivery tracker.
///
/// Constructed with [`DeliveryTracker::open`], which returns an `Arc` so
/// timer tasks can hold the tracker across awaits.
#[derive(Debug)]
pub struct DeliveryTracker {
    agent_id: String,
    config: DeliveryConfig,
    snapshot_path: PathBuf,
    state: Arc<Mutex<TrackerState>>,
    events_tx: mpsc::UnboundedSender<DeliveryEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DeliveryEvent>>>,
    /// Weak self-handle so timer tasks can call back without keeping the
    /// tracker alive
    self_ref: Weak<Self>,
}

impl DeliveryTracker {
    /// Open the tracker for an agent, restoring any persisted deliveries
    /// and re-arming their timers.
    pub async fn open(
        agent_id: impl Into<String>,
        config: DeliveryConfig,
    ) -> MessagingResult<Arc<Self>> {
        let agent_id = agent_id.into();
        tokio::fs::create_dir_all(&config.state_dir).await?;
        let snapshot_path = config
            .state_dir
            .join(format!("{agent_id}-delivery-state.json"));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new_cyclic(|weak| Self {
            agent_id,
            config,
            snapshot_path,
            state: Arc::new(Mutex::new(TrackerState {
                deliveries: HashMap::new(),
                history: VecDeque::new(),
                shutdown: false,
            })),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            self_ref: weak.clone(),
        });
        tracker.restore().await?;
        Ok(tracker)
    }

    /// Take the event receiver. The first caller gets the stream; delivery
    /// events are also kept in the bounded in-memory history.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<DeliveryEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Begin tracking a sent message and arm its ack timeout.
    ///
    /// ACK/NACK messages are fire-and-forget and are not tracked.
    pub async fn track_sent_message(&self, message: &MessageEnvelope) -> MessagingResult<()> {
        let message_type = message.message_type();
        let Some(timeout) = message_type.ack_timeout() else {
            debug!(
                agent_id = %self.agent_id,
                message_id = %message.message_id,
                message_type = %message_type,
                "Fire-and-forget message; not tracking"
            );
            return Ok(());
        };

        let now = Utc::now();
        let state = DeliveryState {
            message: message.clone(),
            sent_at: now,
            retry_count: 0,
            next_retry_at: None,
            timeout_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(60)),
            attempts: Vec::new(),
        };

        {
            let mut tracker_state = self.state.lock().await;
            if tracker_state.shutdown {
                return Err(MessagingError::Shutdown("delivery tracker"));
            }
            if tracker_state.deliveries.contains_key(&message.message_id) {
                return Err(MessagingError::protocol(
                    ErrorCode::DuplicateMessageId,
                    format!("Message '{}' is already tracked", message.message_id),
                ));
            }
            let timer = self.arm_evaluation(&message.message_id, timeout);
            tracker_state.deliveries.insert(
                message.message_id.clone(),
                Tracked {
                    state,
                    timer: Some(timer),
                },
            );
            self.emit(
                &mut tracker_state,
                DeliveryEvent {
                    kind: DeliveryEventKind::MessageSent,
                    message_id: message.message_id.clone(),
                    correlation_id: message.correlation_id.clone(),
                    message_type,
                    timestamp: now,
                    context: DeliveryEventContext::default(),
                },
            );
            self.persist(&tracker_state).await?;
        }
        Ok(())
    }

    /// Handle an incoming ACK. Duplicate ACKs are safe: they log a warning
    /// and change nothing.
    pub async fn handle_ack(&self, ack: &MessageEnvelope) -> MessagingResult<()> {
        let MessagePayload::Ack(payload) = &ack.body else {
            return Err(MessagingError::protocol(
                ErrorCode::UnexpectedMessageType,
                format!("handle_ack received {}", ack.message_type()),
            ));
        };

        let mut state = self.state.lock().await;
        let Some(mut tracked) = state.deliveries.remove(&payload.acknowledged_message_id) else {
            warn!(
                agent_id = %self.agent_id,
                message_id = %payload.acknowledged_message_id,
                "ACK for untracked message (duplicate or expired); ignoring"
            );
            return Ok(());
        };
        if let Some(timer) = tracked.timer.take() {
            timer.abort();
        }
        debug!(
            agent_id = %self.agent_id,
            message_id = %payload.acknowledged_message_id,
            ack_status = ?payload.status,
            "Delivery acknowledged"
        );
        self.emit(
            &mut state,
            DeliveryEvent {
                kind: DeliveryEventKind::MessageAcknowledged,
                message_id: payload.acknowledged_message_id.clone(),
                correlation_id: tracked.state.message.correlation_id.clone(),
                message_type: tracked.state.message.message_type(),
                timestamp: Utc::now(),
                context: DeliveryEventContext {
                    retry_count: Some(tracked.state.retry_count),
                    ack_status: Some(payload.status),
                    ..Default::default()
                },
            },
        );
        self.persist(&state).await
    }

    /// Handle an incoming NACK.
    ///
    /// `canRetry = false` drops tracking immediately and emits
    /// `MESSAGE_FAILED`; otherwise the normal retry decision applies.
    pub async fn handle_nack(&self, nack: &MessageEnvelope) -> MessagingResult<()> {
        let MessagePayload::Nack(payload) = &nack.body else {
            return Err(MessagingError::protocol(
                ErrorCode::UnexpectedMessageType,
                format!("handle_nack received {}", nack.message_type()),
            ));
        };

        let mut state = self.state.lock().await;
        if !state.deliveries.contains_key(&payload.rejected_message_id) {
            warn!(
                agent_id = %self.agent_id,
                message_id = %payload.rejected_message_id,
                "NACK for untracked message; ignoring"
            );
            return Ok(());
        }

        if !payload.can_retry {
            self.fail_delivery(
                &mut state,
                &payload.rejected_message_id,
                FailureReason::NackNotRecoverable,
                payload.error_code.clone(),
            );
            return self.persist(&state).await;
        }
        self.retry_or_fail(&mut state, &payload.rejected_message_id, payload.error_code.clone());
        self.persist(&state).await
    }

    /// Timer callback: re-evaluate one delivery.
    ///
    /// A delivery that was acknowledged (or failed) between timer fire and
    /// lock acquisition is simply gone from the map, making cancellation
    /// deterministic.
    async fn evaluate(&self, message_id: String) {
        let mut state = self.state.lock().await;
        if state.shutdown || !state.deliveries.contains_key(&message_id) {
            return;
        }
        self.retry_or_fail(&mut state, &message_id, None);
        if let Err(e) = self.persist(&state).await {
            warn!(agent_id = %self.agent_id, error = %e, "Failed to persist delivery state");
        }
    }

    /// Core retry decision: schedule the next attempt or fail terminally.
    fn retry_or_fail(
        &self,
        state: &mut TrackerState,
        message_id: &str,
        nack_error_code: Option<String>,
    ) {
        let retries_so_far = match state.deliveries.get(message_id) {
            Some(tracked) => tracked.state.retry_count,
            None => return,
        };
        if retries_so_far >= self.config.max_retries {
            self.fail_delivery(state, message_id, FailureReason::MaxRetriesExceeded, nack_error_code);
            return;
        }

        let now = Utc::now();
        let retry_count = retries_so_far + 1;
        let delay = self.config.retry_delay(retry_count);
        let timer = self.arm_evaluation(message_id, delay);
        let (correlation_id, message_type) = {
            let Some(tracked) = state.deliveries.get_mut(message_id) else {
                timer.abort();
                return;
            };
            tracked.state.retry_count = retry_count;
            tracked.state.next_retry_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
            tracked.state.attempts.push(now);
            if let Some(old) = tracked.timer.replace(timer) {
                old.abort();
            }
            (
                tracked.state.message.correlation_id.clone(),
                tracked.state.message.message_type(),
            )
        };
        info!(
            agent_id = %self.agent_id,
            message_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling delivery retry"
        );
        self.emit(
            state,
            DeliveryEvent {
                kind: DeliveryEventKind::MessageRetry,
                message_id: message_id.to_string(),
                correlation_id,
                message_type,
                timestamp: now,
                context: DeliveryEventContext {
                    retry_count: Some(retry_count),
                    nack_error_code,
                    ..Default::default()
                },
            },
        );
    }

    /// Drop tracking and emit `MESSAGE_FAILED`.
    fn fail_delivery(
        &self,
        state: &mut TrackerState,
        message_id: &str,
        reason: FailureReason,
        nack_error_code: Option<String>,
    ) {
        let Some(mut tracked) = state.deliveries.remove(message_id) else {
            return;
        };
        if let Some(timer) = tracked.timer.take() {
            timer.abort();
        }
        warn!(
            agent_id = %self.agent_id,
            message_id,
            reason = %reason,
            retry_count = tracked.state.retry_count,
            "Delivery failed terminally"
        );
        self.emit(
            state,
            DeliveryEvent {
                kind: DeliveryEventKind::MessageFailed,
                message_id: message_id.to_string(),
                correlation_id: tracked.state.message.correlation_id.clone(),
                message_type: tracked.state.message.message_type(),
                timestamp: Utc::now(),
                context: DeliveryEventContext {
                    retry_count: Some(tracked.state.retry_count),
                    failure_reason: Some(reason),
                    ack_status: None,
                    nack_error_code,
                    retry_attempts: tracked.state.attempts.clone(),
                },
            },
        );
    }

    fn arm_evaluation(&self, message_id: &str, delay: Duration) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A tracker that is already gone needs no evaluation
            if let Some(tracker) = weak.upgrade() {
                tracker.evaluate(message_id).await;
            }
        })
    }

    /// Restore persisted deliveries and re-arm their timers.
    async fn restore(&self) -> MessagingResult<()> {
        let contents = match tokio::fs::read_to_string(&self.snapshot_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: DeliverySnapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "Delivery snapshot unreadable; starting empty"
                );
                return Ok(());
            }
        };

        let now = Utc::now();
        let mut overdue = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (message_id, delivery) in snapshot.deliveries {
                let deadline = delivery.next_retry_at.unwrap_or(delivery.timeout_at);
                let timer = if deadline > now {
                    let delay = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                    Some(self.arm_evaluation(&message_id, delay))
                } else {
                    // Deadline passed while we were down; evaluate as if the
                    // original timer had just fired
                    overdue.push(message_id.clone());
                    None
                };
                state.deliveries.insert(
                    message_id,
                    Tracked {
                        state: delivery,
                        timer,
                    },
                );
            }
            if !state.deliveries.is_empty() {
                info!(
                    agent_id = %self.agent_id,
                    restored = state.deliveries.len(),
                    overdue = overdue.len(),
                    "Restored delivery state"
                );
            }
        }
        for message_id in overdue {
            let weak = self.self_ref.clone();
            tokio::spawn(async move {
                if let Some(tracker) = weak.upgrade() {
                    tracker.evaluate(message_id).await;
                }
            });
        }
        Ok(())
    }

    /// Number of currently tracked deliveries.
    pub async fn tracked_count(&self) -> usize {
        self.state.lock().await.deliveries.len()
    }

    pub async fn is_tracked(&self, message_id: &str) -> bool {
        self.state.lock().await.deliveries.contains_key(message_id)
    }

    /// Snapshot of one delivery's state.
    pub async fn delivery_state(&self, message_id: &str) -> Option<DeliveryState> {
        self.state
            .lock()
            .await
            .deliveries
            .get(message_id)
            .map(|t| t.state.clone())
    }

    /// Full event history, oldest first.
    pub async fn history(&self) -> Vec<DeliveryEvent> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    /// Event history for one message id.
    pub async fn history_for(&self, message_id: &str) -> Vec<DeliveryEvent> {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|e| e.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Cancel every timer, flush the snapshot, and refuse further tracking.
    pub async fn shutdown(&self) -> MessagingResult<()> {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        for tracked in state.deliveries.values_mut() {
            if let Some(timer) = tracked.timer.take() {
                timer.abort();
            }
        }
        self.persist(&state).await?;
        info!(agent_id = %self.agent_id, "Delivery tracker shut down");
        Ok(())
    }

    fn emit(&self, state: &mut TrackerState, event: DeliveryEvent) {
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // Receiver may be gone; history still records the event
        let _ = self.events_tx.send(event);
    }

    /// Write the snapshot via write-tmp-rename.
    async fn persist(&self, state: &TrackerState) -> MessagingResult<()> {
        let snapshot = DeliverySnapshot {
            deliveries: state
                .deliveries
                .iter()
                .map(|(id, tracked)| (id.clone(), tracked.state.clone()))
                .collect(),
            last_updated: Utc::now(),
        };
        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentRef, AgentType, Priority, TaskStatus, TaskUpdatePayload};
    use tempfile::TempDir;

    fn update_message() -> MessageEnvelope {
        MessageEnvelope::new(
            AgentRef::new("agent_a", AgentType::Implementation),
            AgentRef::new("manager", AgentType::Manager),
            MessagePayload::TaskUpdate(TaskUpdatePayload {
                task_id: "task_1".to_string(),
                progress: 0.5,
                status: TaskStatus::InProgress,
                step: None,
                notes: None,
                files: None,
                blockers: None,
                eta: None,
            }),
            Priority::Normal,
        )
    }

    fn ack_for(message: &MessageEnvelope) -> MessageEnvelope {
        message.acknowledge(
            AgentRef::new("manager", AgentType::Manager),
            AckStatus::Processed,
        )
    }

    fn nack_for(message: &MessageEnvelope, can_retry: bool) -> MessageEnvelope {
        let mut nack = message.reject(
            AgentRef::new("manager", AgentType::Manager),
            "rejected",
            can_retry,
            None,
        );
        if let MessagePayload::Nack(payload) = &mut nack.body {
            payload.error_code = Some("E_TEST".to_string());
        }
        nack
    }

    fn config_in(dir: &TempDir) -> DeliveryConfig {
        DeliveryConfig {
            max_retries: 3,
            base_retry_delay_ms: 10,
            max_retry_delay_ms: 40,
            state_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_track_and_ack() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        assert!(tracker.is_tracked(&message.message_id).await);

        tracker.handle_ack(&ack_for(&message)).await.unwrap();
        assert!(!tracker.is_tracked(&message.message_id).await);

        let history = tracker.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, DeliveryEventKind::MessageSent);
        assert_eq!(history[1].kind, DeliveryEventKind::MessageAcknowledged);
        assert_eq!(history[1].context.ack_status, Some(AckStatus::Processed));
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_safe() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        let ack = ack_for(&message);
        tracker.handle_ack(&ack).await.unwrap();
        // Second ACK: no error, no new events
        tracker.handle_ack(&ack).await.unwrap();
        assert_eq!(tracker.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ack_and_nack_are_never_tracked() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        let ack = ack_for(&message);
        tracker.track_sent_message(&ack).await.unwrap();
        assert_eq!(tracker.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_tracking_rejected() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        let err = tracker.track_sent_message(&message).await.unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Protocol { code: ErrorCode::DuplicateMessageId, .. }
        ));
    }

    #[tokio::test]
    async fn test_terminal_nack_fails_immediately() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        tracker.handle_nack(&nack_for(&message, false)).await.unwrap();

        assert!(!tracker.is_tracked(&message.message_id).await);
        let history = tracker.history().await;
        let failed = history.last().unwrap();
        assert_eq!(failed.kind, DeliveryEventKind::MessageFailed);
        assert_eq!(failed.context.failure_reason, Some(FailureReason::NackNotRecoverable));
        assert_eq!(failed.context.nack_error_code.as_deref(), Some("E_TEST"));
    }

    #[tokio::test]
    async fn test_recoverable_nack_schedules_retry() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        tracker.handle_nack(&nack_for(&message, true)).await.unwrap();

        let state = tracker.delivery_state(&message.message_id).await.unwrap();
        assert_eq!(state.retry_count, 1);
        assert!(state.next_retry_at.is_some());
        assert_eq!(state.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_chain_until_failure() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();

        // TASK_UPDATE ack timeout is 30 s; then retries at 10/20/40 ms
        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!tracker.is_tracked(&message.message_id).await);
        let history = tracker.history_for(&message.message_id).await;
        let retries: Vec<_> = history
            .iter()
            .filter(|e| e.kind == DeliveryEventKind::MessageRetry)
            .collect();
        assert_eq!(retries.len(), 3);
        assert_eq!(retries[0].context.retry_count, Some(1));
        assert_eq!(retries[2].context.retry_count, Some(3));

        let failed = history.last().unwrap();
        assert_eq!(failed.kind, DeliveryEventKind::MessageFailed);
        assert_eq!(failed.context.failure_reason, Some(FailureReason::MaxRetriesExceeded));
        assert_eq!(failed.context.retry_attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_event_channel_receives_events() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();
        let mut events = tracker.take_event_receiver().unwrap();

        let message = update_message();
        tracker.track_sent_message(&message).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, DeliveryEventKind::MessageSent);
        assert_eq!(event.message_id, message.message_id);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_tracking() {
        let dir = TempDir::new().unwrap();
        let tracker = DeliveryTracker::open("agent_a", config_in(&dir)).await.unwrap();
        tracker.shutdown().await.unwrap();

        let err = tracker.track_sent_message(&update_message()).await.unwrap_err();
        assert!(matches!(err, MessagingError::Shutdown(_)));
    }
}
