//! # Per-Agent Priority Queue
//!
//! Three FIFO lists keyed by priority, backed by an append-only NDJSON log
//! that is replayed on startup and compacted on an interval. HIGH strictly
//! precedes NORMAL strictly precedes LOW at dequeue time; within a priority
//! the order is FIFO.
//!
//! ## Overflow policy
//!
//! At capacity the queue drops the oldest LOW entry to admit the newcomer.
//! If no LOW entry exists and the newcomer is HIGH, the oldest NORMAL entry
//! is dropped instead; otherwise the newcomer is rejected.
//!
//! ## Durability
//!
//! Every enqueue appends one line to `<queueDir>/<agentId>-queue.ndjson`.
//! Dequeues only drop the entry from the in-memory lists; the log is rewritten
//! atomically (write-tmp-rename) by the periodic compactor, which keeps
//! exactly the live entries. Replay skips lines flagged `processed` and
//! tolerates unparseable trailing lines from a crashed writer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::errors::{MessagingError, MessagingResult};
use crate::protocol::{MessageEnvelope, Priority};
use crate::serialization::{MessageSerializer, QueueMetadata};

/// Number of recent dequeues the wait-time average covers.
const WAIT_WINDOW: usize = 100;

/// Fill fraction above which enqueues log a warning.
const DEPTH_WARNING_RATIO: f64 = 0.9;

#[derive(Debug, Clone)]
struct QueueEntry {
    entry_id: String,
    message: MessageEnvelope,
    queued_at: DateTime<Utc>,
    priority: Priority,
    retry_count: u32,
}

impl QueueEntry {
    fn metadata(&self, processed: bool) -> QueueMetadata {
        QueueMetadata {
            queued_at: self.queued_at,
            priority: self.priority,
            retry_count: self.retry_count,
            entry_id: Some(self.entry_id.clone()),
            processed,
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    total_enqueued: u64,
    total_dequeued: u64,
    total_dropped: u64,
    wait_samples: VecDeque<Duration>,
}

#[derive(Debug)]
struct QueueState {
    high: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    low: VecDeque<QueueEntry>,
    counters: QueueCounters,
    shutdown: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            counters: QueueCounters::default(),
            shutdown: false,
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn list_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn front(&self) -> Option<&QueueEntry> {
        self.high
            .front()
            .or_else(|| self.normal.front())
            .or_else(|| self.low.front())
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// All live entries, most-urgent priority first, FIFO within priority.
    fn live_entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.high.iter().chain(self.normal.iter()).chain(self.low.iter())
    }
}

/// Counts and depth snapshot for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub depth: usize,
    pub high_depth: usize,
    pub normal_depth: usize,
    pub low_depth: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
    /// Mean wait over the recent dequeue window, milliseconds
    pub mean_wait_ms: u64,
    /// Age of the oldest live entry, milliseconds
    pub oldest_age_ms: u64,
}

/// Durable three-priority FIFO queue for one agent.
#[derive(Debug)]
pub struct MessageQueue {
    agent_id: String,
    config: QueueConfig,
    log_path: PathBuf,
    serializer: Arc<MessageSerializer>,
    state: Arc<Mutex<QueueState>>,
    compactor: StdMutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    /// Open (or create) the queue for an agent, replaying its durable log
    /// and starting the periodic compactor.
    pub async fn open(agent_id: impl Into<String>, config: QueueConfig) -> MessagingResult<Self> {
        let agent_id = agent_id.into();
        tokio::fs::create_dir_all(&config.queue_dir).await?;
        let log_path = config.queue_dir.join(format!("{agent_id}-queue.ndjson"));

        let serializer = Arc::new(MessageSerializer::new());
        let mut state = QueueState::new();
        replay_log(&log_path, &serializer, &mut state).await?;
        let replayed = state.len();
        if replayed > 0 {
            info!(agent_id = %agent_id, entries = replayed, "Replayed queue log");
        }

        let state = Arc::new(Mutex::new(state));
        let queue = Self {
            agent_id,
            config,
            log_path,
            serializer,
            state,
            compactor: StdMutex::new(None),
        };
        queue.start_compactor();
        Ok(queue)
    }

    fn start_compactor(&self) {
        let state = Arc::clone(&self.state);
        let serializer = Arc::clone(&self.serializer);
        let log_path = self.log_path.clone();
        let agent_id = self.agent_id.clone();
        let interval = self.config.compaction_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would compact an untouched log
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = compact_log(&state, &serializer, &log_path).await {
                    warn!(agent_id = %agent_id, error = %e, "Queue compaction failed");
                }
            }
        });
        *self.lock_compactor() = Some(handle);
    }

    /// Enqueue a message at its envelope priority.
    pub async fn enqueue(&self, message: MessageEnvelope) -> MessagingResult<()> {
        let priority = message.priority;
        self.enqueue_with_priority(message, priority).await
    }

    /// Enqueue a message at an explicit priority, running the overflow
    /// policy when the queue is at capacity.
    pub async fn enqueue_with_priority(
        &self,
        message: MessageEnvelope,
        priority: Priority,
    ) -> MessagingResult<()> {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return Err(MessagingError::Shutdown("queue"));
        }

        if state.len() >= self.config.max_size {
            self.evict_for(&mut state, priority)?;
        }

        let entry = QueueEntry {
            entry_id: Uuid::new_v4().to_string(),
            message,
            queued_at: Utc::now(),
            priority,
            retry_count: 0,
        };

        let line = self.serializer.serialize(&entry.message, &entry.metadata(false))?;
        append_line(&self.log_path, &line).await?;

        debug!(
            agent_id = %self.agent_id,
            message_id = %entry.message.message_id,
            priority = %priority,
            "Enqueued message"
        );
        state.list_mut(priority).push_back(entry);
        state.counters.total_enqueued += 1;

        let depth = state.len();
        if depth as f64 > self.config.max_size as f64 * DEPTH_WARNING_RATIO {
            warn!(
                agent_id = %self.agent_id,
                depth,
                max_size = self.config.max_size,
                "Queue is above 90% capacity"
            );
        }
        Ok(())
    }

    /// Overflow policy: drop the oldest LOW; failing that, drop the oldest
    /// NORMAL for a HIGH newcomer; otherwise reject.
    fn evict_for(&self, state: &mut QueueState, incoming: Priority) -> MessagingResult<()> {
        let victim = if state.low.front().is_some() {
            state.low.pop_front()
        } else if incoming == Priority::High {
            state.normal.pop_front()
        } else {
            None
        };
        match victim {
            Some(victim) => {
                state.counters.total_dropped += 1;
                warn!(
                    agent_id = %self.agent_id,
                    dropped_message_id = %victim.message.message_id,
                    dropped_priority = %victim.priority,
                    incoming_priority = %incoming,
                    "Queue overflow dropped a message"
                );
                Ok(())
            }
            None => Err(MessagingError::QueueFull {
                agent_id: self.agent_id.clone(),
                capacity: self.config.max_size,
            }),
        }
    }

    /// Remove and return the oldest message of the most urgent non-empty
    /// priority. `None` when the queue is empty.
    pub async fn dequeue(&self) -> Option<MessageEnvelope> {
        let mut state = self.state.lock().await;
        let entry = state.pop()?;
        state.counters.total_dequeued += 1;

        let wait = (Utc::now() - entry.queued_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let samples = &mut state.counters.wait_samples;
        if samples.len() == WAIT_WINDOW {
            samples.pop_front();
        }
        samples.push_back(wait);

        debug!(
            agent_id = %self.agent_id,
            message_id = %entry.message.message_id,
            wait_ms = wait.as_millis() as u64,
            "Dequeued message"
        );
        Some(entry.message)
    }

    /// The message `dequeue` would return, without removing it.
    pub async fn peek(&self) -> Option<MessageEnvelope> {
        let state = self.state.lock().await;
        state.front().map(|entry| entry.message.clone())
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Depth per priority: `(high, normal, low)`.
    pub async fn size_by_priority(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.high.len(), state.normal.len(), state.low.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Drop every live entry and truncate the durable log.
    pub async fn clear(&self) -> MessagingResult<()> {
        let mut state = self.state.lock().await;
        state.high.clear();
        state.normal.clear();
        state.low.clear();
        write_atomic(&self.log_path, String::new()).await?;
        info!(agent_id = %self.agent_id, "Queue cleared");
        Ok(())
    }

    /// Observability snapshot.
    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock().await;
        let samples = &state.counters.wait_samples;
        let mean_wait_ms = if samples.is_empty() {
            0
        } else {
            (samples.iter().map(Duration::as_millis).sum::<u128>() / samples.len() as u128) as u64
        };
        let oldest_age_ms = state
            .live_entries()
            .map(|entry| (Utc::now() - entry.queued_at).num_milliseconds().max(0) as u64)
            .max()
            .unwrap_or(0);
        QueueMetrics {
            depth: state.len(),
            high_depth: state.high.len(),
            normal_depth: state.normal.len(),
            low_depth: state.low.len(),
            total_enqueued: state.counters.total_enqueued,
            total_dequeued: state.counters.total_dequeued,
            total_dropped: state.counters.total_dropped,
            mean_wait_ms,
            oldest_age_ms,
        }
    }

    /// Force one compaction pass outside the interval schedule.
    pub async fn compact(&self) -> MessagingResult<()> {
        compact_log(&self.state, &self.serializer, &self.log_path).await
    }

    /// Stop the compactor, flush the log one final time, and refuse
    /// further enqueues.
    pub async fn shutdown(&self) -> MessagingResult<()> {
        if let Some(handle) = self.lock_compactor().take() {
            handle.abort();
        }
        {
            let mut state = self.state.lock().await;
            state.shutdown = true;
        }
        compact_log(&self.state, &self.serializer, &self.log_path).await?;
        info!(agent_id = %self.agent_id, "Queue shut down");
        Ok(())
    }

    fn lock_compactor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.compactor.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_compactor().take() {
            handle.abort();
        }
    }
}

async fn append_line(path: &PathBuf, line: &str) -> MessagingResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// Atomic replace via the write-tmp-rename pattern.
async fn write_atomic(path: &PathBuf, contents: String) -> MessagingResult<()> {
    let tmp = path.with_extension("ndjson.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Rewrite the log to contain exactly the currently-live entries.
async fn compact_log(
    state: &Arc<Mutex<QueueState>>,
    serializer: &Arc<MessageSerializer>,
    log_path: &PathBuf,
) -> MessagingResult<()> {
    let lines = {
        let state = state.lock().await;
        let mut lines = String::new();
        for entry in state.live_entries() {
            lines.push_str(&serializer.serialize(&entry.message, &entry.metadata(false))?);
            lines.push('\n');
        }
        lines
    };
    write_atomic(log_path, lines).await?;
    debug!(log = %log_path.display(), "Compacted queue log");
    Ok(())
}

/// Replay the durable log into fresh in-memory state.
///
/// Entries flagged `processed` are skipped, as are empty or unparseable
/// lines (a crashed writer can leave a partial final line).
async fn replay_log(
    log_path: &PathBuf,
    serializer: &Arc<MessageSerializer>,
    state: &mut QueueState,
) -> MessagingResult<()> {
    let contents = match tokio::fs::read_to_string(log_path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let decoded = match serializer.deserialize(line) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable queue log line");
                continue;
            }
        };
        if decoded.queue_metadata.processed {
            continue;
        }
        let entry = QueueEntry {
            entry_id: decoded
                .queue_metadata
                .entry_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            queued_at: decoded.queue_metadata.queued_at,
            priority: decoded.queue_metadata.priority,
            retry_count: decoded.queue_metadata.retry_count,
            message: decoded.message,
        };
        let priority = entry.priority;
        state.list_mut(priority).push_back(entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentRef, AgentType, MessagePayload, TaskStatus, TaskUpdatePayload};
    use tempfile::TempDir;

    fn test_message(task_id: &str, priority: Priority) -> MessageEnvelope {
        MessageEnvelope::new(
            AgentRef::new("manager", AgentType::Manager),
            AgentRef::new("agent_a", AgentType::Implementation),
            MessagePayload::TaskUpdate(TaskUpdatePayload {
                task_id: task_id.to_string(),
                progress: 0.1,
                status: TaskStatus::InProgress,
                step: None,
                notes: None,
                files: None,
                blockers: None,
                eta: None,
            }),
            priority,
        )
    }

    fn config_in(dir: &TempDir, max_size: usize) -> QueueConfig {
        QueueConfig {
            max_size,
            queue_dir: dir.path().to_path_buf(),
            compaction_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let low = test_message("t_low", Priority::Low);
        let high = test_message("t_high", Priority::High);
        let normal = test_message("t_norm", Priority::Normal);
        queue.enqueue(low.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();
        queue.enqueue(normal.clone()).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().message_id, high.message_id);
        assert_eq!(queue.dequeue().await.unwrap().message_id, normal.message_id);
        assert_eq!(queue.dequeue().await.unwrap().message_id, low.message_id);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let first = test_message("t1", Priority::Normal);
        let second = test_message("t2", Priority::Normal);
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().message_id, first.message_id);
        assert_eq!(queue.dequeue().await.unwrap().message_id, second.message_id);
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let message = test_message("t1", Priority::High);
        queue.enqueue(message.clone()).await.unwrap();

        assert_eq!(queue.peek().await.unwrap().message_id, message.message_id);
        assert_eq!(queue.size().await, 1);
        assert_eq!(queue.dequeue().await.unwrap().message_id, message.message_id);
    }

    #[tokio::test]
    async fn test_overflow_rejects_low_when_no_low_queued() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 3)).await.unwrap();

        for i in 0..3 {
            queue.enqueue(test_message(&format!("t{i}"), Priority::Normal)).await.unwrap();
        }
        let err = queue.enqueue(test_message("t_low", Priority::Low)).await.unwrap_err();
        assert!(matches!(err, MessagingError::QueueFull { .. }));
        assert_eq!(queue.size().await, 3);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_low_first() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 3)).await.unwrap();

        queue.enqueue(test_message("t_low1", Priority::Low)).await.unwrap();
        queue.enqueue(test_message("t_low2", Priority::Low)).await.unwrap();
        queue.enqueue(test_message("t_norm", Priority::Normal)).await.unwrap();

        // At capacity; a NORMAL newcomer displaces the oldest LOW
        queue.enqueue(test_message("t_new", Priority::Normal)).await.unwrap();
        assert_eq!(queue.size().await, 3);
        let (_, normal, low) = queue.size_by_priority().await;
        assert_eq!(normal, 2);
        assert_eq!(low, 1);
        assert_eq!(queue.metrics().await.total_dropped, 1);
    }

    #[tokio::test]
    async fn test_overflow_high_displaces_normal() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 2)).await.unwrap();

        queue.enqueue(test_message("t1", Priority::Normal)).await.unwrap();
        queue.enqueue(test_message("t2", Priority::Normal)).await.unwrap();
        queue.enqueue(test_message("t_high", Priority::High)).await.unwrap();

        let (high, normal, _) = queue.size_by_priority().await;
        assert_eq!(high, 1);
        assert_eq!(normal, 1);
    }

    #[tokio::test]
    async fn test_clear_truncates_log() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 10)).await.unwrap();
        queue.enqueue(test_message("t1", Priority::Normal)).await.unwrap();
        queue.clear().await.unwrap();

        assert!(queue.is_empty().await);
        let log = std::fs::read_to_string(dir.path().join("agent_a-queue.ndjson")).unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 10)).await.unwrap();
        queue.shutdown().await.unwrap();

        let err = queue.enqueue(test_message("t1", Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, MessagingError::Shutdown(_)));
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let dir = TempDir::new().unwrap();
        let queue = MessageQueue::open("agent_a", config_in(&dir, 10)).await.unwrap();
        queue.enqueue(test_message("t1", Priority::High)).await.unwrap();
        queue.enqueue(test_message("t2", Priority::Low)).await.unwrap();
        queue.dequeue().await.unwrap();

        let metrics = queue.metrics().await;
        assert_eq!(metrics.total_enqueued, 2);
        assert_eq!(metrics.total_dequeued, 1);
        assert_eq!(metrics.depth, 1);
        assert_eq!(metrics.low_depth, 1);
    }
}
