//! # apm-messaging
//!
//! Inter-agent messaging core for the APM runtime: the versioned wire
//! protocol, three-level validation, envelope serialization with
//! transparent compression, per-agent durable priority queues, delivery
//! tracking with retries and ack timeouts, failure handling behind a
//! circuit breaker, and a dead letter queue with a full audit trail.
//!
//! Every component is instantiated per agent with injected configuration
//! and a durable-path root; there are no process-wide singletons. Delivery
//! is at-least-once: receivers must be idempotent on `messageId`.
//!
//! ## Typical wiring
//!
//! ```rust,ignore
//! let config = MessagingConfig::default().with_root_dir(".apm-auto/queues");
//! let queue = MessageQueue::open("agent_a", config.queue.clone()).await?;
//! let tracker = DeliveryTracker::open("agent_a", config.delivery.clone()).await?;
//! let dlq = Arc::new(DeadLetterQueue::open("agent_a", config.dlq.clone()).await?);
//! let handler = SendErrorHandler::open("agent_a", config.error_handler.clone(), Some(dlq)).await?;
//! ```

pub mod config;
pub mod delivery;
pub mod dlq;
pub mod errors;
pub mod handler;
pub mod protocol;
pub mod queue;
pub mod resilience;
pub mod serialization;
pub mod validation;

pub use config::{
    DeliveryConfig, DlqConfig, ErrorHandlerConfig, MessagingConfig, QueueConfig, RetryPolicy,
};
pub use delivery::{
    DeliveryEvent, DeliveryEventContext, DeliveryEventKind, DeliveryState, DeliveryTracker,
};
pub use dlq::{
    DeadLetterQueue, DlqAuditRecord, DlqEntry, DlqEntryMetadata, DlqFilter, DlqOperation,
    DlqStats, RetryAttempt,
};
pub use errors::{ErrorCode, ErrorSeverity, MessagingError, MessagingResult};
pub use handler::{metadata_from_failure_event, HandlerStats, SendErrorHandler};
pub use protocol::{
    AgentRef, AgentType, FailureReason, MessageEnvelope, MessageMetadata, MessagePayload,
    MessageType, Priority,
};
pub use queue::{MessageQueue, QueueMetrics};
pub use resilience::{
    CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitState,
};
pub use serialization::{MessageSerializer, QueueMetadata, QueuedEnvelope, SerializerStats};
pub use validation::{MessageValidator, ValidationIssue, ValidationLevel, ValidationReport};
