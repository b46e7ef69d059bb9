//! Failure-path scenarios: DLQ capacity purge with audit, malformed
//! receive handling, and circuit-breaker fast-fail and recovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tempfile::TempDir;

use apm_messaging::protocol::{
    AgentRef, AgentType, MessagePayload, TaskStatus, TaskUpdatePayload,
};
use apm_messaging::{
    DeadLetterQueue, DlqConfig, DlqEntryMetadata, DlqOperation, ErrorCode, ErrorHandlerConfig,
    FailureReason, MessageEnvelope, MessageSerializer, MessagingError, Priority, SendErrorHandler,
};

fn update(task_id: &str) -> MessageEnvelope {
    MessageEnvelope::new(
        AgentRef::new("manager", AgentType::Manager),
        AgentRef::new("agent_a", AgentType::Implementation),
        MessagePayload::TaskUpdate(TaskUpdatePayload {
            task_id: task_id.to_string(),
            progress: 0.2,
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

fn dlq_metadata() -> DlqEntryMetadata {
    DlqEntryMetadata {
        failure_reason: FailureReason::MaxRetriesExceeded,
        failure_message: "gave up".to_string(),
        error_code: None,
        retry_history: Vec::new(),
        failed_at: Utc::now(),
        receiver_id: "agent_a".to_string(),
        receiver_state: None,
        circuit_breaker_state: None,
    }
}

/// DLQ with maxSize 3: adding a fourth entry purges the oldest, leaves an
/// export artefact and one audit record, and keeps exactly the newest three.
#[tokio::test]
async fn dlq_capacity_purges_oldest_with_audit() -> Result<()> {
    let dir = TempDir::new()?;
    let dlq = DeadLetterQueue::open(
        "manager",
        DlqConfig {
            max_size: 3,
            dlq_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
    )
    .await?;

    let e1 = update("e1");
    let e2 = update("e2");
    let e3 = update("e3");
    let e4 = update("e4");
    for entry in [&e1, &e2, &e3, &e4] {
        dlq.add(entry, dlq_metadata()).await?;
    }

    assert_eq!(dlq.size().await, 3);
    let remaining: Vec<String> = dlq.list(None).await.into_iter().map(|e| e.entry_id).collect();
    assert_eq!(remaining, vec![e2.message_id.clone(), e3.message_id.clone(), e4.message_id.clone()]);

    let purged_path = dir.path().join(format!("purged-{}.json", e1.message_id));
    assert!(purged_path.exists());

    let audit = dlq.audit_trail().await?;
    let purges: Vec<_> = audit
        .iter()
        .filter(|r| r.operation == DlqOperation::Purge)
        .collect();
    assert_eq!(purges.len(), 1);
    assert_eq!(purges[0].entry_id.as_deref(), Some(e1.message_id.as_str()));
    Ok(())
}

/// A malformed received line produces a `malformed_*.json` artefact with
/// the raw line and a MALFORMED_MESSAGE record, creates no delivery state,
/// and shows up in the serializer's failure stats.
#[tokio::test]
async fn malformed_line_is_quarantined_sideways() -> Result<()> {
    let dir = TempDir::new()?;
    let serializer = MessageSerializer::new();
    let handler = SendErrorHandler::open(
        "agent_a",
        ErrorHandlerConfig {
            dlq_path: dir.path().to_path_buf(),
            ..Default::default()
        },
        None,
    )
    .await?;

    let raw = "{not json";
    let error = serializer.deserialize(raw).unwrap_err();
    assert!(matches!(
        error,
        MessagingError::Validation { code: ErrorCode::MalformedMessage, .. }
    ));
    assert_eq!(serializer.stats().deserialization_failures, 1);

    let artefact = handler.handle_receive_failure(raw, &error).await?;
    assert!(artefact
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("malformed_"));

    let contents: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&artefact)?)?;
    assert_eq!(contents["rawLine"], raw);
    assert_eq!(contents["error"]["errorCode"], "MALFORMED_MESSAGE");
    assert_eq!(handler.stats().receive_failures, 1);
    Ok(())
}

/// After `threshold` consecutive failures the next send fast-fails into the
/// DLQ; after the recovery timeout one success re-closes the circuit.
#[tokio::test]
async fn circuit_breaker_opens_and_recovers() -> Result<()> {
    let dir = TempDir::new()?;
    let dlq = Arc::new(
        DeadLetterQueue::open(
            "agent_a",
            DlqConfig {
                dlq_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
        )
        .await?,
    );
    let mut config = ErrorHandlerConfig {
        dlq_path: dir.path().to_path_buf(),
        circuit_breaker_threshold: 3,
        circuit_breaker_timeout_ms: 50,
        ..Default::default()
    };
    // Millisecond backoffs keep the warmup failures fast
    config.retry_policies.insert(
        apm_messaging::MessageType::TaskUpdate,
        apm_messaging::RetryPolicy {
            max_retries: 10,
            base_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        },
    );
    let handler = SendErrorHandler::open("agent_a", config, Some(dlq.clone())).await?;
    let transient = MessagingError::protocol(ErrorCode::ChannelUnavailable, "receiver offline");

    // Three transient failures trip the breaker (each sleeps its backoff)
    for i in 0..3 {
        let message = update(&format!("warmup_{i}"));
        handler.handle_send_failure(&message, &transient).await?;
    }
    assert!(!handler.circuit_breaker().is_healthy());

    // While open, the next failure routes straight to the DLQ
    let blocked = update("blocked");
    let should_retry = handler.handle_send_failure(&blocked, &transient).await?;
    assert!(!should_retry);
    let entry = dlq.get(&blocked.message_id).await.unwrap();
    assert_eq!(entry.metadata.failure_reason, FailureReason::CircuitBreakerOpen);

    // After the recovery timeout a success closes the circuit again
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(handler.circuit_breaker().should_allow());
    handler.record_send_success(Duration::from_millis(1));
    assert!(handler.circuit_breaker().is_healthy());
    Ok(())
}
