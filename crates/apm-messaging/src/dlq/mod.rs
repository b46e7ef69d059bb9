//! # Dead Letter Queue
//!
//! Durable store for terminally failed messages, keyed by message id
//! (duplicate adds are no-ops). Supports filtered listing, manual retry,
//! discard with justification, snapshot export, retention-based purging,
//! and size-based auto-purge of the oldest entry.
//!
//! ## Persistence
//!
//! Adds append one line to `<dlqDir>/<agentId>-dlq.ndjson`; deletions
//! rewrite the file atomically. Every mutating operation also appends one
//! record to the immutable audit trail
//! `<dlqDir>/<agentId>-dlq-audit.ndjson`, so an operator can reconstruct
//! the full history of the queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DlqConfig;
use crate::errors::{MessagingError, MessagingResult};
use crate::protocol::{FailureReason, MessageEnvelope};
use crate::resilience::CircuitState;

/// One attempt from a failed message's retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Failure context recorded alongside the quarantined message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntryMetadata {
    pub failure_reason: FailureReason,
    pub failure_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Ordered retry attempts, oldest first
    #[serde(default)]
    pub retry_history: Vec<RetryAttempt>,
    pub failed_at: DateTime<Utc>,
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_state: Option<CircuitState>,
}

/// One DLQ entry. The entry id is the failed message's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub entry_id: String,
    pub message: MessageEnvelope,
    pub metadata: DlqEntryMetadata,
    pub added_at: DateTime<Utc>,
}

/// Filter for [`DeadLetterQueue::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub error_code: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub receiver_id: Option<String>,
    pub failed_after: Option<DateTime<Utc>>,
    pub failed_before: Option<DateTime<Utc>>,
}

impl DlqFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(code) = &self.error_code {
            if entry.metadata.error_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(reason) = self.failure_reason {
            if entry.metadata.failure_reason != reason {
                return false;
            }
        }
        if let Some(receiver) = &self.receiver_id {
            if &entry.metadata.receiver_id != receiver {
                return false;
            }
        }
        if let Some(after) = self.failed_after {
            if entry.metadata.failed_at < after {
                return false;
            }
        }
        if let Some(before) = self.failed_before {
            if entry.metadata.failed_at > before {
                return false;
            }
        }
        true
    }
}

/// Mutating operations recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqOperation {
    Add,
    Retry,
    Discard,
    Purge,
}

/// One audit-trail record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqAuditRecord {
    pub operation: DlqOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Aggregated DLQ statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    pub total_entries: usize,
    /// Age of the oldest entry in milliseconds; 0 when empty
    pub oldest_entry_age_ms: u64,
    pub by_failure_reason: HashMap<String, usize>,
    pub by_error_code: HashMap<String, usize>,
    /// Up to five most frequent failure reasons, most frequent first
    pub top_failure_reasons: Vec<(String, usize)>,
    /// Entries added in the last 24 hours, per hour
    pub growth_rate_per_hour: f64,
}

/// Export snapshot shape written by [`DeadLetterQueue::export`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DlqExport {
    agent_id: String,
    exported_at: DateTime<Utc>,
    total_entries: usize,
    entries: Vec<DlqEntry>,
}

#[derive(Debug, Default)]
struct DlqState {
    entries: HashMap<String, DlqEntry>,
}

/// Per-agent dead letter queue.
#[derive(Debug)]
pub struct DeadLetterQueue {
    agent_id: String,
    config: DlqConfig,
    entries_path: PathBuf,
    audit_path: PathBuf,
    state: Arc<Mutex<DlqState>>,
}

impl DeadLetterQueue {
    /// Open (or create) the DLQ for an agent, replaying its entry log.
    pub async fn open(agent_id: impl Into<String>, config: DlqConfig) -> MessagingResult<Self> {
        let agent_id = agent_id.into();
        tokio::fs::create_dir_all(&config.dlq_dir).await?;
        let entries_path = config.dlq_dir.join(format!("{agent_id}-dlq.ndjson"));
        let audit_path = config.dlq_dir.join(format!("{agent_id}-dlq-audit.ndjson"));

        let mut state = DlqState::default();
        match tokio::fs::read_to_string(&entries_path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<DlqEntry>(line) {
                        Ok(entry) => {
                            state.entries.insert(entry.entry_id.clone(), entry);
                        }
                        Err(e) => warn!(error = %e, "Skipping unparseable DLQ log line"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !state.entries.is_empty() {
            info!(agent_id = %agent_id, entries = state.entries.len(), "Replayed DLQ log");
        }

        Ok(Self {
            agent_id,
            config,
            entries_path,
            audit_path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Quarantine a failed message.
    ///
    /// Returns `false` (a no-op) when the message id is already present, so
    /// a message id never appears in more than one entry. When the queue is
    /// at its size limit the oldest entry is purged first: exported to
    /// `purged-<entryId>.json` and recorded in the audit trail.
    pub async fn add(
        &self,
        message: &MessageEnvelope,
        metadata: DlqEntryMetadata,
    ) -> MessagingResult<bool> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&message.message_id) {
            debug!(
                agent_id = %self.agent_id,
                entry_id = %message.message_id,
                "Duplicate DLQ add ignored"
            );
            return Ok(false);
        }

        if state.entries.len() >= self.config.max_size {
            self.purge_oldest(&mut state).await?;
        }

        let entry = DlqEntry {
            entry_id: message.message_id.clone(),
            message: message.clone(),
            metadata,
            added_at: Utc::now(),
        };
        let line = serde_json::to_string(&entry)?;
        append_line(&self.entries_path, &line).await?;
        self.append_audit(DlqAuditRecord {
            operation: DlqOperation::Add,
            entry_id: Some(entry.entry_id.clone()),
            timestamp: Utc::now(),
            actor: None,
            reason: Some(entry.metadata.failure_reason.to_string()),
            details: None,
        })
        .await?;
        state.entries.insert(entry.entry_id.clone(), entry);

        self.alert_on_depth(state.entries.len());
        Ok(true)
    }

    /// Size-based auto-purge: export and drop the oldest entry.
    async fn purge_oldest(&self, state: &mut DlqState) -> MessagingResult<()> {
        let oldest_id = state
            .entries
            .values()
            .min_by_key(|entry| entry.added_at)
            .map(|entry| entry.entry_id.clone());
        let Some(entry_id) = oldest_id else {
            return Ok(());
        };
        let Some(entry) = state.entries.remove(&entry_id) else {
            return Ok(());
        };

        let export_path = self.config.dlq_dir.join(format!("purged-{entry_id}.json"));
        tokio::fs::write(&export_path, serde_json::to_vec_pretty(&entry)?).await?;
        self.rewrite_entries(state).await?;
        self.append_audit(DlqAuditRecord {
            operation: DlqOperation::Purge,
            entry_id: Some(entry_id.clone()),
            timestamp: Utc::now(),
            actor: None,
            reason: Some("size_limit".to_string()),
            details: Some(export_path.display().to_string()),
        })
        .await?;
        warn!(
            agent_id = %self.agent_id,
            entry_id = %entry_id,
            "DLQ at capacity; purged oldest entry"
        );
        Ok(())
    }

    fn alert_on_depth(&self, depth: usize) {
        if depth >= self.config.critical_threshold {
            error!(
                agent_id = %self.agent_id,
                depth,
                threshold = self.config.critical_threshold,
                "DLQ depth is critical"
            );
        } else if depth >= self.config.warning_threshold {
            warn!(
                agent_id = %self.agent_id,
                depth,
                threshold = self.config.warning_threshold,
                "DLQ depth above warning threshold"
            );
        }
    }

    /// Entries matching the filter, oldest first.
    pub async fn list(&self, filter: Option<&DlqFilter>) -> Vec<DlqEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|entry| filter.map_or(true, |f| f.matches(entry)))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.added_at);
        entries
    }

    pub async fn get(&self, entry_id: &str) -> Option<DlqEntry> {
        self.state.lock().await.entries.get(entry_id).cloned()
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Remove an entry for re-sending and return its original message.
    pub async fn retry(&self, entry_id: &str, actor: Option<&str>) -> MessagingResult<MessageEnvelope> {
        let mut state = self.state.lock().await;
        let entry = state.entries.remove(entry_id).ok_or_else(|| MessagingError::NotFound {
            kind: "DLQ entry",
            id: entry_id.to_string(),
        })?;
        self.rewrite_entries(&mut state).await?;
        self.append_audit(DlqAuditRecord {
            operation: DlqOperation::Retry,
            entry_id: Some(entry_id.to_string()),
            timestamp: Utc::now(),
            actor: actor.map(str::to_string),
            reason: None,
            details: None,
        })
        .await?;
        info!(agent_id = %self.agent_id, entry_id, "DLQ entry released for retry");
        Ok(entry.message)
    }

    /// Remove an entry permanently.
    pub async fn discard(
        &self,
        entry_id: &str,
        actor: Option<&str>,
        justification: Option<&str>,
    ) -> MessagingResult<()> {
        let mut state = self.state.lock().await;
        if state.entries.remove(entry_id).is_none() {
            return Err(MessagingError::NotFound {
                kind: "DLQ entry",
                id: entry_id.to_string(),
            });
        }
        self.rewrite_entries(&mut state).await?;
        self.append_audit(DlqAuditRecord {
            operation: DlqOperation::Discard,
            entry_id: Some(entry_id.to_string()),
            timestamp: Utc::now(),
            actor: actor.map(str::to_string),
            reason: justification.map(str::to_string),
            details: None,
        })
        .await?;
        info!(agent_id = %self.agent_id, entry_id, "DLQ entry discarded");
        Ok(())
    }

    /// Write a full snapshot to `path`; returns the number of entries.
    pub async fn export(&self, path: impl AsRef<Path>) -> MessagingResult<usize> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.added_at);
        let export = DlqExport {
            agent_id: self.agent_id.clone(),
            exported_at: Utc::now(),
            total_entries: entries.len(),
            entries,
        };
        tokio::fs::write(path.as_ref(), serde_json::to_vec_pretty(&export)?).await?;
        Ok(export.total_entries)
    }

    /// Remove every entry older than the retention window, exporting the
    /// batch to `expired-<iso>.json` and writing one audit record.
    pub async fn purge_expired(&self) -> MessagingResult<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days);
        let mut state = self.state.lock().await;
        let expired_ids: Vec<_> = state
            .entries
            .values()
            .filter(|entry| entry.added_at < cutoff)
            .map(|entry| entry.entry_id.clone())
            .collect();
        if expired_ids.is_empty() {
            return Ok(0);
        }

        let mut expired: Vec<DlqEntry> = expired_ids
            .iter()
            .filter_map(|id| state.entries.remove(id))
            .collect();
        expired.sort_by_key(|entry| entry.added_at);

        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let export_path = self.config.dlq_dir.join(format!("expired-{stamp}.json"));
        tokio::fs::write(&export_path, serde_json::to_vec_pretty(&expired)?).await?;
        self.rewrite_entries(&mut state).await?;
        self.append_audit(DlqAuditRecord {
            operation: DlqOperation::Purge,
            entry_id: None,
            timestamp: Utc::now(),
            actor: None,
            reason: Some("retention_expired".to_string()),
            details: Some(format!("{} entries -> {}", expired.len(), export_path.display())),
        })
        .await?;
        info!(
            agent_id = %self.agent_id,
            purged = expired.len(),
            retention_days = self.config.retention_days,
            "Purged expired DLQ entries"
        );
        Ok(expired.len())
    }

    /// Aggregated statistics: counts, groupings, and growth rate.
    pub async fn stats(&self) -> DlqStats {
        let state = self.state.lock().await;
        let now = Utc::now();

        let mut by_failure_reason: HashMap<String, usize> = HashMap::new();
        let mut by_error_code: HashMap<String, usize> = HashMap::new();
        let mut last_24h = 0usize;
        for entry in state.entries.values() {
            *by_failure_reason
                .entry(entry.metadata.failure_reason.to_string())
                .or_default() += 1;
            if let Some(code) = &entry.metadata.error_code {
                *by_error_code.entry(code.clone()).or_default() += 1;
            }
            if now - entry.added_at <= ChronoDuration::hours(24) {
                last_24h += 1;
            }
        }

        let mut top: Vec<(String, usize)> = by_failure_reason
            .iter()
            .map(|(reason, count)| (reason.clone(), *count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(5);

        DlqStats {
            total_entries: state.entries.len(),
            oldest_entry_age_ms: state
                .entries
                .values()
                .map(|entry| (now - entry.added_at).num_milliseconds().max(0) as u64)
                .max()
                .unwrap_or(0),
            by_failure_reason,
            by_error_code,
            top_failure_reasons: top,
            growth_rate_per_hour: last_24h as f64 / 24.0,
        }
    }

    /// Read back the audit trail (for operators and tests).
    pub async fn audit_trail(&self) -> MessagingResult<Vec<DlqAuditRecord>> {
        let contents = match tokio::fs::read_to_string(&self.audit_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unparseable audit line"),
            }
        }
        Ok(records)
    }

    /// Final flush; the DLQ keeps no timers.
    pub async fn shutdown(&self) -> MessagingResult<()> {
        let mut state = self.state.lock().await;
        self.rewrite_entries(&mut state).await?;
        info!(agent_id = %self.agent_id, "DLQ shut down");
        Ok(())
    }

    /// Atomic rewrite after a deletion.
    async fn rewrite_entries(&self, state: &mut DlqState) -> MessagingResult<()> {
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.added_at);
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&serde_json::to_string(entry)?);
            contents.push('\n');
        }
        let tmp = self.entries_path.with_extension("ndjson.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.entries_path).await?;
        Ok(())
    }

    async fn append_audit(&self, record: DlqAuditRecord) -> MessagingResult<()> {
        append_line(&self.audit_path, &serde_json::to_string(&record)?).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AgentRef, AgentType, MessagePayload, Priority, TaskStatus, TaskUpdatePayload,
    };
    use tempfile::TempDir;

    fn failed_message(task_id: &str) -> MessageEnvelope {
        MessageEnvelope::new(
            AgentRef::new("manager", AgentType::Manager),
            AgentRef::new("agent_a", AgentType::Implementation),
            MessagePayload::TaskUpdate(TaskUpdatePayload {
                task_id: task_id.to_string(),
                progress: 0.0,
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

    fn metadata(reason: FailureReason) -> DlqEntryMetadata {
        DlqEntryMetadata {
            failure_reason: reason,
            failure_message: "delivery gave up".to_string(),
            error_code: Some("E_TIMEOUT".to_string()),
            retry_history: vec![RetryAttempt {
                attempted_at: Utc::now(),
                error: None,
            }],
            failed_at: Utc::now(),
            receiver_id: "agent_a".to_string(),
            receiver_state: None,
            circuit_breaker_state: None,
        }
    }

    fn config_in(dir: &TempDir, max_size: usize) -> DlqConfig {
        DlqConfig {
            max_size,
            retention_days: 7,
            warning_threshold: 10,
            critical_threshold: 100,
            dlq_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let message = failed_message("t1");
        assert!(dlq.add(&message, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap());

        let entry = dlq.get(&message.message_id).await.unwrap();
        assert_eq!(entry.entry_id, message.message_id);
        assert_eq!(entry.metadata.failure_reason, FailureReason::MaxRetriesExceeded);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let message = failed_message("t1");
        assert!(dlq.add(&message, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap());
        assert!(!dlq.add(&message, metadata(FailureReason::NackNotRecoverable)).await.unwrap());
        assert_eq!(dlq.size().await, 1);
        // First add's metadata wins
        let entry = dlq.get(&message.message_id).await.unwrap();
        assert_eq!(entry.metadata.failure_reason, FailureReason::MaxRetriesExceeded);
    }

    #[tokio::test]
    async fn test_auto_purge_at_capacity() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 3)).await.unwrap();

        let first = failed_message("t1");
        dlq.add(&first, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        for i in 2..=4 {
            dlq.add(&failed_message(&format!("t{i}")), metadata(FailureReason::MaxRetriesExceeded))
                .await
                .unwrap();
        }

        assert_eq!(dlq.size().await, 3);
        assert!(dlq.get(&first.message_id).await.is_none());

        // Export artefact exists for the purged entry
        let purged_path = dir.path().join(format!("purged-{}.json", first.message_id));
        assert!(purged_path.exists());

        // Audit trail holds one purge record for it
        let audit = dlq.audit_trail().await.unwrap();
        let purges: Vec<_> = audit.iter().filter(|r| r.operation == DlqOperation::Purge).collect();
        assert_eq!(purges.len(), 1);
        assert_eq!(purges[0].entry_id.as_deref(), Some(first.message_id.as_str()));
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        dlq.add(&failed_message("t1"), metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        let mut other = metadata(FailureReason::NackNotRecoverable);
        other.error_code = Some("E_SCHEMA".to_string());
        dlq.add(&failed_message("t2"), other).await.unwrap();

        assert_eq!(dlq.list(None).await.len(), 2);

        let filter = DlqFilter {
            failure_reason: Some(FailureReason::NackNotRecoverable),
            ..Default::default()
        };
        let filtered = dlq.list(Some(&filter)).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].metadata.error_code.as_deref(), Some("E_SCHEMA"));

        let by_code = DlqFilter {
            error_code: Some("E_TIMEOUT".to_string()),
            ..Default::default()
        };
        assert_eq!(dlq.list(Some(&by_code)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_removes_and_returns_message() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let message = failed_message("t1");
        dlq.add(&message, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();

        let released = dlq.retry(&message.message_id, Some("operator_1")).await.unwrap();
        assert_eq!(released.message_id, message.message_id);
        assert_eq!(dlq.size().await, 0);

        let audit = dlq.audit_trail().await.unwrap();
        let retry = audit.iter().find(|r| r.operation == DlqOperation::Retry).unwrap();
        assert_eq!(retry.actor.as_deref(), Some("operator_1"));
    }

    #[tokio::test]
    async fn test_retry_unknown_entry_fails() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();
        let err = dlq.retry("msg_20260801_000000_zzzzzz", None).await.unwrap_err();
        assert!(matches!(err, MessagingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_discard_records_justification() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let message = failed_message("t1");
        dlq.add(&message, metadata(FailureReason::SchemaValidationFailed)).await.unwrap();
        dlq.discard(&message.message_id, Some("operator_1"), Some("unfixable schema"))
            .await
            .unwrap();

        assert_eq!(dlq.size().await, 0);
        let audit = dlq.audit_trail().await.unwrap();
        let discard = audit.iter().find(|r| r.operation == DlqOperation::Discard).unwrap();
        assert_eq!(discard.reason.as_deref(), Some("unfixable schema"));
    }

    #[tokio::test]
    async fn test_export_snapshot() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();
        dlq.add(&failed_message("t1"), metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        dlq.add(&failed_message("t2"), metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();

        let export_path = dir.path().join("snapshot.json");
        let count = dlq.export(&export_path).await.unwrap();
        assert_eq!(count, 2);

        let raw = std::fs::read_to_string(&export_path).unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot["agentId"], "agent_a");
        assert_eq!(snapshot["totalEntries"], 2);
        assert_eq!(snapshot["entries"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        let stale = failed_message("t_old");
        dlq.add(&stale, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        // Backdate the entry past the retention window
        {
            let mut state = dlq.state.lock().await;
            state.entries.get_mut(&stale.message_id).unwrap().added_at =
                Utc::now() - ChronoDuration::days(8);
        }
        dlq.add(&failed_message("t_fresh"), metadata(FailureReason::MaxRetriesExceeded))
            .await
            .unwrap();

        let purged = dlq.purge_expired().await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(dlq.size().await, 1);
        assert!(dlq.get(&stale.message_id).await.is_none());

        let expired_exists = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().starts_with("expired-"));
        assert!(expired_exists);
    }

    #[tokio::test]
    async fn test_stats_groupings() {
        let dir = TempDir::new().unwrap();
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();

        dlq.add(&failed_message("t1"), metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        dlq.add(&failed_message("t2"), metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        dlq.add(&failed_message("t3"), metadata(FailureReason::CircuitBreakerOpen)).await.unwrap();

        let stats = dlq.stats().await;
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.by_failure_reason["max_retries_exceeded"], 2);
        assert_eq!(stats.by_failure_reason["circuit_breaker_open"], 1);
        assert_eq!(stats.top_failure_reasons[0].0, "max_retries_exceeded");
        assert!(stats.growth_rate_per_hour > 0.0);
        assert_eq!(stats.by_error_code["E_TIMEOUT"], 3);
    }

    #[tokio::test]
    async fn test_replay_after_reopen() {
        let dir = TempDir::new().unwrap();
        let message = failed_message("t1");
        {
            let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();
            dlq.add(&message, metadata(FailureReason::MaxRetriesExceeded)).await.unwrap();
        }
        let dlq = DeadLetterQueue::open("agent_a", config_in(&dir, 100)).await.unwrap();
        assert_eq!(dlq.size().await, 1);
        assert!(dlq.get(&message.message_id).await.is_some());
    }
}
