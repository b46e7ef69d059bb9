//! # Send/Receive Error Handler
//!
//! Decides what happens to a message that failed to send: fast-fail to the
//! DLQ when the circuit is open, quarantine for permanent errors, retry with
//! backoff for transient ones, and quarantine again once the per-type retry
//! budget is spent. Malformed received lines never re-enter the pipeline;
//! they are captured as side artefacts next to the DLQ files.
//!
//! The decision order is fixed:
//!
//! 1. circuit open → DLQ (`circuit_breaker_open`)
//! 2. non-recoverable error → DLQ (`permanent_protocol_error`)
//! 3. retry budget exhausted → DLQ (`max_retries_exceeded`)
//! 4. otherwise → sleep the backoff interval and signal retry

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ErrorHandlerConfig;
use crate::delivery::DeliveryEvent;
use crate::dlq::{DeadLetterQueue, DlqEntryMetadata, RetryAttempt};
use crate::errors::{ErrorCode, MessagingError, MessagingResult};
use crate::protocol::{
    generate_correlation_id, requires_correlation_id, FailureReason, MessageEnvelope,
};
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::validation::ValidationIssue;

/// Counters exposed by [`SendErrorHandler::stats`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerStats {
    pub send_failures: u64,
    pub receive_failures: u64,
    pub retries_granted: u64,
    pub dlq_routed: u64,
    pub recoveries_attempted: u64,
}

/// Per-agent failure handler with an embedded circuit breaker.
#[derive(Debug)]
pub struct SendErrorHandler {
    agent_id: String,
    config: ErrorHandlerConfig,
    circuit_breaker: Arc<CircuitBreaker>,
    dlq: Option<Arc<DeadLetterQueue>>,
    stats: StdMutex<HandlerStats>,
}

impl SendErrorHandler {
    /// Create the handler. When a [`DeadLetterQueue`] is supplied, terminal
    /// failures are quarantined there in addition to the artefact files.
    pub async fn open(
        agent_id: impl Into<String>,
        config: ErrorHandlerConfig,
        dlq: Option<Arc<DeadLetterQueue>>,
    ) -> MessagingResult<Self> {
        let agent_id = agent_id.into();
        tokio::fs::create_dir_all(&config.dlq_path).await?;
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            format!("{agent_id}-send"),
            config.circuit_breaker_config(),
        ));
        Ok(Self {
            agent_id,
            config,
            circuit_breaker,
            dlq,
            stats: StdMutex::new(HandlerStats::default()),
        })
    }

    /// The circuit breaker guarding this agent's send path.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Record a successful send on the breaker.
    pub fn record_send_success(&self, duration: Duration) {
        self.circuit_breaker.record_success_manual(duration);
    }

    /// Decide the fate of a failed send.
    ///
    /// Returns `true` when the caller should retry the send (after this
    /// method has already slept the backoff interval), `false` when the
    /// message has been routed to the DLQ.
    pub async fn handle_send_failure(
        &self,
        message: &MessageEnvelope,
        error: &MessagingError,
    ) -> MessagingResult<bool> {
        {
            let mut stats = self.lock_stats();
            stats.send_failures += 1;
        }

        // (a) Fast-fail while the circuit is open
        if !self.circuit_breaker.should_allow() {
            warn!(
                agent_id = %self.agent_id,
                message_id = %message.message_id,
                "Circuit open; routing message to DLQ"
            );
            self.quarantine(message, FailureReason::CircuitBreakerOpen, error).await?;
            return Ok(false);
        }

        self.circuit_breaker.record_failure_manual(Duration::ZERO);

        // (b) Permanent errors are not worth a retry
        let recoverable = error.code().map_or(true, |code| code.recoverable());
        if !recoverable {
            self.quarantine(message, FailureReason::PermanentProtocolError, error).await?;
            return Ok(false);
        }

        // (c) Retry budget per message type
        let policy = self.config.policy_for(message.message_type());
        let retry_count = message.retry_count();
        if !self.config.enable_retries || retry_count >= policy.max_retries {
            self.quarantine(message, FailureReason::MaxRetriesExceeded, error).await?;
            return Ok(false);
        }

        // (d) Back off, then let the caller retry
        let delay = policy.backoff_delay(retry_count);
        info!(
            agent_id = %self.agent_id,
            message_id = %message.message_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Send failed; backing off before retry"
        );
        tokio::time::sleep(delay).await;
        let mut stats = self.lock_stats();
        stats.retries_granted += 1;
        Ok(true)
    }

    /// Capture a malformed received line as a side artefact.
    ///
    /// The raw line never re-enters the queue; the artefact records it with
    /// a `MALFORMED_MESSAGE` error for operator inspection. Returns the
    /// artefact path.
    pub async fn handle_receive_failure(
        &self,
        raw_line: &str,
        error: &MessagingError,
    ) -> MessagingResult<PathBuf> {
        {
            let mut stats = self.lock_stats();
            stats.receive_failures += 1;
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = self.config.dlq_path.join(format!("malformed_{stamp}.json"));
        let artefact = json!({
            "receivedAt": Utc::now(),
            "agentId": self.agent_id,
            "rawLine": raw_line,
            "error": {
                "errorCode": ErrorCode::MalformedMessage,
                "errorMessage": error.to_string(),
            },
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&artefact)?).await?;
        warn!(
            agent_id = %self.agent_id,
            artefact = %path.display(),
            error = %error,
            "Captured malformed received line"
        );
        Ok(path)
    }

    /// Produce a corrected copy of a raw envelope for the enumerated
    /// recoverable defects; `None` when the issue is not auto-correctable.
    ///
    /// Corrections: missing `priority` → `NORMAL`; missing `metadata` →
    /// `{}`; malformed `timestamp` → current UTC; missing `correlationId`
    /// on a request type → freshly generated.
    pub fn attempt_recovery(&self, raw: &Value, issue: &ValidationIssue) -> Option<Value> {
        let object = raw.as_object()?;
        let field = issue.field.as_deref()?;

        let mut corrected = object.clone();
        match (issue.error_code, field) {
            (ErrorCode::MissingField, "priority") => {
                corrected.insert("priority".to_string(), json!("NORMAL"));
            }
            (ErrorCode::MissingField, "metadata") => {
                corrected.insert("metadata".to_string(), json!({}));
            }
            (ErrorCode::MalformedTimestamp, "timestamp") => {
                corrected.insert("timestamp".to_string(), json!(Utc::now()));
            }
            (ErrorCode::MissingCorrelation, "correlationId") => {
                let message_type = object
                    .get("messageType")
                    .and_then(Value::as_str)
                    .and_then(|tag| serde_json::from_value(json!(tag)).ok())?;
                if !requires_correlation_id(message_type) {
                    return None;
                }
                corrected.insert(
                    "correlationId".to_string(),
                    json!(generate_correlation_id(Utc::now())),
                );
            }
            _ => return None,
        }

        let mut stats = self.lock_stats();
        stats.recoveries_attempted += 1;
        debug!(
            agent_id = %self.agent_id,
            field,
            code = %issue.error_code,
            "Applied automatic message recovery"
        );
        Some(Value::Object(corrected))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HandlerStats {
        self.lock_stats().clone()
    }

    /// Write the `failed_*` artefact and, when a DLQ is attached, add the
    /// message to it.
    async fn quarantine(
        &self,
        message: &MessageEnvelope,
        reason: FailureReason,
        error: &MessagingError,
    ) -> MessagingResult<()> {
        {
            let mut stats = self.lock_stats();
            stats.dlq_routed += 1;
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = self
            .config
            .dlq_path
            .join(format!("failed_{}_{stamp}.json", message.message_id));
        let artefact = json!({
            "failedAt": Utc::now(),
            "agentId": self.agent_id,
            "failureReason": reason,
            "errorCode": error.code(),
            "errorMessage": error.to_string(),
            "message": message,
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&artefact)?).await?;

        if let Some(dlq) = &self.dlq {
            let metadata = DlqEntryMetadata {
                failure_reason: reason,
                failure_message: error.to_string(),
                error_code: error.code().map(|code| code.to_string()),
                retry_history: Vec::new(),
                failed_at: Utc::now(),
                receiver_id: message.receiver.agent_id.clone(),
                receiver_state: None,
                circuit_breaker_state: Some(self.circuit_breaker.state()),
            };
            dlq.add(message, metadata).await?;
        }
        Ok(())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, HandlerStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Build DLQ metadata from a tracker `MESSAGE_FAILED` event.
///
/// Used by the glue that listens to delivery events and quarantines the
/// failed message with its full retry history.
pub fn metadata_from_failure_event(
    event: &DeliveryEvent,
    receiver_id: impl Into<String>,
    circuit_breaker_state: Option<CircuitState>,
) -> DlqEntryMetadata {
    DlqEntryMetadata {
        failure_reason: event
            .context
            .failure_reason
            .unwrap_or(FailureReason::MaxRetriesExceeded),
        failure_message: format!(
            "delivery failed after {} retries",
            event.context.retry_count.unwrap_or(0)
        ),
        error_code: event.context.nack_error_code.clone(),
        retry_history: event
            .context
            .retry_attempts
            .iter()
            .map(|attempted_at| RetryAttempt {
                attempted_at: *attempted_at,
                error: None,
            })
            .collect(),
        failed_at: event.timestamp,
        receiver_id: receiver_id.into(),
        receiver_state: None,
        circuit_breaker_state,
    }
}
