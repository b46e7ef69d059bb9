//! # Envelope Serialization
//!
//! Wraps a [`MessageEnvelope`] with queue metadata and encodes it as a single
//! newline-delimited JSON line. Payloads whose serialized line exceeds the
//! compression threshold are gzip-compressed and carried as a
//! `{"__compressed": true, "data": "<base64>"}` marker object, so decoders
//! need no out-of-band flag. Envelopes above the wire size limit are
//! rejected before compression is attempted.
//!
//! Deserialization mirrors the pipeline: syntax validation, marker
//! detection and decompression, schema validation, then the structural
//! check that both `message` and `queueMetadata` are present.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{ErrorCode, MessagingError, MessagingResult};
use crate::protocol::constants::{COMPRESSION_MARKER, COMPRESSION_THRESHOLD, MAX_MESSAGE_SIZE};
use crate::protocol::{MessageEnvelope, Priority};
use crate::validation::{MessageValidator, ValidationLevel};

/// Number of recent operations the rolling averages cover.
const STATS_WINDOW: usize = 100;

/// Queue bookkeeping carried next to the envelope on every queue-log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    pub queued_at: DateTime<Utc>,
    pub priority: Priority,
    pub retry_count: u32,
    /// Unique within one queue; absent on direct sender-to-receiver lines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    /// Set during compaction for entries that have already been consumed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub processed: bool,
}

impl QueueMetadata {
    pub fn new(priority: Priority) -> Self {
        Self {
            queued_at: Utc::now(),
            priority,
            retry_count: 0,
            entry_id: None,
            processed: false,
        }
    }
}

/// One decoded queue-log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEnvelope {
    pub message: MessageEnvelope,
    pub queue_metadata: QueueMetadata,
}

#[derive(Debug, Clone, Copy)]
struct OpSample {
    duration: Duration,
    original_size: usize,
    final_size: usize,
    compressed: bool,
}

#[derive(Debug, Default)]
struct StatsState {
    total_serialized: u64,
    total_deserialized: u64,
    serialization_failures: u64,
    deserialization_failures: u64,
    serialize_samples: VecDeque<OpSample>,
    deserialize_samples: VecDeque<OpSample>,
}

impl StatsState {
    fn push(samples: &mut VecDeque<OpSample>, sample: OpSample) {
        if samples.len() == STATS_WINDOW {
            samples.pop_front();
        }
        samples.push_back(sample);
    }
}

/// Snapshot of serializer throughput over the recent window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializerStats {
    pub total_serialized: u64,
    pub total_deserialized: u64,
    pub serialization_failures: u64,
    pub deserialization_failures: u64,
    /// Rolling averages over the last 100 serializations
    pub avg_serialize_micros: u64,
    pub avg_original_size: usize,
    pub avg_final_size: usize,
    pub compressed_ratio: f64,
    /// Rolling average over the last 100 deserializations
    pub avg_deserialize_micros: u64,
}

/// Envelope + queue-metadata codec with rolling operation statistics.
#[derive(Debug, Default)]
pub struct MessageSerializer {
    validator: MessageValidator,
    stats: Mutex<StatsState>,
}

impl MessageSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one queue-log line, compressing the payload when the line
    /// crosses the compression threshold.
    pub fn serialize(
        &self,
        message: &MessageEnvelope,
        metadata: &QueueMetadata,
    ) -> MessagingResult<String> {
        let start = Instant::now();
        let result = self.serialize_inner(message, metadata, start);
        if result.is_err() {
            let mut stats = self.lock_stats();
            stats.serialization_failures += 1;
        }
        result
    }

    fn serialize_inner(
        &self,
        message: &MessageEnvelope,
        metadata: &QueueMetadata,
        start: Instant,
    ) -> MessagingResult<String> {
        let mut value = serde_json::to_value(QueuedEnvelope {
            message: message.clone(),
            queue_metadata: metadata.clone(),
        })?;
        let mut line = serde_json::to_string(&value)?;
        let original_size = line.len();

        if original_size > MAX_MESSAGE_SIZE {
            warn!(
                message_id = %message.message_id,
                size = original_size,
                limit = MAX_MESSAGE_SIZE,
                "Rejecting oversized envelope"
            );
            return Err(MessagingError::SizeExceeded {
                size: original_size,
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let compressed = original_size > COMPRESSION_THRESHOLD;
        if compressed {
            let payload = value["message"]["payload"].take();
            value["message"]["payload"] = compress_payload(&payload)?;
            line = serde_json::to_string(&value)?;
        }

        let final_size = line.len();
        let duration = start.elapsed();
        let ratio = final_size as f64 / original_size as f64;
        debug!(
            message_id = %message.message_id,
            duration_micros = duration.as_micros() as u64,
            original_size,
            final_size,
            compressed,
            compression_ratio = ratio,
            "Serialized envelope"
        );

        let mut stats = self.lock_stats();
        stats.total_serialized += 1;
        let samples = &mut stats.serialize_samples;
        StatsState::push(
            samples,
            OpSample {
                duration,
                original_size,
                final_size,
                compressed,
            },
        );
        Ok(line)
    }

    /// Decode one queue-log line back into an envelope + metadata.
    pub fn deserialize(&self, line: &str) -> MessagingResult<QueuedEnvelope> {
        let start = Instant::now();
        let result = self.deserialize_inner(line, start);
        if result.is_err() {
            let mut stats = self.lock_stats();
            stats.deserialization_failures += 1;
        }
        result
    }

    fn deserialize_inner(&self, line: &str, start: Instant) -> MessagingResult<QueuedEnvelope> {
        let original_size = line.len();

        // Level 1: syntax
        let report = self.validator.validate(line, ValidationLevel::Syntax);
        if !report.valid {
            let detail = report
                .errors
                .first()
                .map(|e| e.error_message.clone())
                .unwrap_or_else(|| "invalid line".to_string());
            return Err(MessagingError::validation(ErrorCode::MalformedMessage, detail));
        }

        let mut value: Value = serde_json::from_str(line)?;

        // Structural: both halves of the queue line must be present
        if value.get("message").is_none() || value.get("queueMetadata").is_none() {
            return Err(MessagingError::validation(
                ErrorCode::SchemaMismatch,
                "Queue line must contain 'message' and 'queueMetadata'",
            ));
        }

        // Decompress when the payload carries the marker
        let was_compressed = value["message"]["payload"]
            .get(COMPRESSION_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if was_compressed {
            let data = value["message"]["payload"]
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    MessagingError::validation(
                        ErrorCode::SchemaMismatch,
                        "Compressed payload is missing its 'data' field",
                    )
                })?;
            value["message"]["payload"] = decompress_payload(data)?;
        }

        // Level 2: envelope schema
        let message_json = serde_json::to_string(&value["message"])?;
        let report = self.validator.validate(&message_json, ValidationLevel::Schema);
        if !report.valid {
            let first = report.errors.first();
            return Err(MessagingError::validation(
                first.map(|e| e.error_code).unwrap_or(ErrorCode::SchemaMismatch),
                first
                    .map(|e| e.error_message.clone())
                    .unwrap_or_else(|| "schema validation failed".to_string()),
            ));
        }

        let decoded: QueuedEnvelope = serde_json::from_value(value)?;

        let duration = start.elapsed();
        let mut stats = self.lock_stats();
        stats.total_deserialized += 1;
        let samples = &mut stats.deserialize_samples;
        StatsState::push(
            samples,
            OpSample {
                duration,
                original_size,
                final_size: original_size,
                compressed: was_compressed,
            },
        );
        Ok(decoded)
    }

    /// Rolling statistics over the recent operation window.
    pub fn stats(&self) -> SerializerStats {
        let stats = self.lock_stats();
        let ser = &stats.serialize_samples;
        let de = &stats.deserialize_samples;

        let avg =
            |samples: &VecDeque<OpSample>, f: fn(&OpSample) -> u64| -> u64 {
                if samples.is_empty() {
                    0
                } else {
                    samples.iter().map(f).sum::<u64>() / samples.len() as u64
                }
            };

        SerializerStats {
            total_serialized: stats.total_serialized,
            total_deserialized: stats.total_deserialized,
            serialization_failures: stats.serialization_failures,
            deserialization_failures: stats.deserialization_failures,
            avg_serialize_micros: avg(ser, |s| s.duration.as_micros() as u64),
            avg_original_size: avg(ser, |s| s.original_size as u64) as usize,
            avg_final_size: avg(ser, |s| s.final_size as u64) as usize,
            compressed_ratio: if ser.is_empty() {
                0.0
            } else {
                ser.iter().filter(|s| s.compressed).count() as f64 / ser.len() as f64
            },
            avg_deserialize_micros: avg(de, |s| s.duration.as_micros() as u64),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, StatsState> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn compress_payload(payload: &Value) -> MessagingResult<Value> {
    let raw = serde_json::to_vec(payload)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    Ok(serde_json::json!({
        COMPRESSION_MARKER: true,
        "data": BASE64.encode(compressed),
    }))
}

fn decompress_payload(data: &str) -> MessagingResult<Value> {
    let compressed = BASE64.decode(data).map_err(|e| {
        MessagingError::validation(
            ErrorCode::MalformedMessage,
            format!("Compressed payload is not valid base64: {e}"),
        )
    })?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = String::new();
    decoder.read_to_string(&mut raw).map_err(|e| {
        MessagingError::validation(
            ErrorCode::MalformedMessage,
            format!("Compressed payload failed to inflate: {e}"),
        )
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        AgentRef, AgentType, MessagePayload, TaskStatus, TaskUpdatePayload,
    };
    use serde_json::json;

    fn envelope_with_notes(notes: Option<String>) -> MessageEnvelope {
        MessageEnvelope::new(
            AgentRef::new("agent_a", AgentType::Implementation),
            AgentRef::new("manager", AgentType::Manager),
            MessagePayload::TaskUpdate(TaskUpdatePayload {
                task_id: "task_3_1".to_string(),
                progress: 0.75,
                status: TaskStatus::InProgress,
                step: None,
                notes,
                files: None,
                blockers: None,
                eta: None,
            }),
            Priority::Normal,
        )
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let serializer = MessageSerializer::new();
        let message = envelope_with_notes(None);
        let metadata = QueueMetadata::new(Priority::Normal);

        let line = serializer.serialize(&message, &metadata).unwrap();
        assert!(!line.contains(COMPRESSION_MARKER));

        let decoded = serializer.deserialize(&line).unwrap();
        assert_eq!(decoded.message, message);
        assert_eq!(decoded.queue_metadata.priority, Priority::Normal);
    }

    #[test]
    fn test_round_trip_compressed() {
        let serializer = MessageSerializer::new();
        // Push the line over the 10 KiB threshold
        let message = envelope_with_notes(Some("n".repeat(COMPRESSION_THRESHOLD * 2)));
        let metadata = QueueMetadata::new(Priority::High);

        let line = serializer.serialize(&message, &metadata).unwrap();
        assert!(line.contains(COMPRESSION_MARKER));
        // Repetitive payloads compress well below the original
        assert!(line.len() < COMPRESSION_THRESHOLD);

        let decoded = serializer.deserialize(&line).unwrap();
        assert_eq!(decoded.message, message);
    }

    #[test]
    fn test_oversize_rejected_before_compression() {
        let serializer = MessageSerializer::new();
        let message = envelope_with_notes(Some("n".repeat(MAX_MESSAGE_SIZE + 1)));
        let metadata = QueueMetadata::new(Priority::Normal);

        let err = serializer.serialize(&message, &metadata).unwrap_err();
        assert!(matches!(err, MessagingError::SizeExceeded { .. }));
        assert_eq!(serializer.stats().serialization_failures, 1);
    }

    #[test]
    fn test_structural_check_requires_both_halves() {
        let serializer = MessageSerializer::new();
        let err = serializer.deserialize("{\"message\": {}}").unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Validation { code: ErrorCode::SchemaMismatch, .. }
        ));
    }

    #[test]
    fn test_malformed_line_counts_as_failure() {
        let serializer = MessageSerializer::new();
        assert!(serializer.deserialize("{not json").is_err());
        assert_eq!(serializer.stats().deserialization_failures, 1);
        assert_eq!(serializer.stats().total_deserialized, 0);
    }

    #[test]
    fn test_corrupt_compressed_data_is_rejected() {
        let serializer = MessageSerializer::new();
        let message = envelope_with_notes(None);
        let metadata = QueueMetadata::new(Priority::Normal);
        let line = serializer.serialize(&message, &metadata).unwrap();

        let mut value: Value = serde_json::from_str(&line).unwrap();
        value["message"]["payload"] = json!({COMPRESSION_MARKER: true, "data": "!!!not-base64!!!"});
        let err = serializer.deserialize(&value.to_string()).unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Validation { code: ErrorCode::MalformedMessage, .. }
        ));
    }

    #[test]
    fn test_stats_track_rolling_averages() {
        let serializer = MessageSerializer::new();
        let metadata = QueueMetadata::new(Priority::Normal);
        for _ in 0..5 {
            let message = envelope_with_notes(None);
            let line = serializer.serialize(&message, &metadata).unwrap();
            serializer.deserialize(&line).unwrap();
        }
        let stats = serializer.stats();
        assert_eq!(stats.total_serialized, 5);
        assert_eq!(stats.total_deserialized, 5);
        assert!(stats.avg_original_size > 0);
        assert_eq!(stats.compressed_ratio, 0.0);
    }

    #[test]
    fn test_processed_flag_omitted_when_false() {
        let metadata = QueueMetadata::new(Priority::Low);
        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value.get("processed").is_none());

        let mut flagged = metadata;
        flagged.processed = true;
        let value = serde_json::to_value(&flagged).unwrap();
        assert_eq!(value["processed"], true);
    }
}
