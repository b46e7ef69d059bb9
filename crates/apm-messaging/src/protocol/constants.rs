//! Protocol constants and wire-format patterns.

use once_cell::sync::Lazy;
use regex::Regex;

/// Protocol version spoken by this implementation.
///
/// Receivers reject envelopes whose major version differs from ours.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Hard ceiling on a serialized envelope, pre-compression (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Payloads whose serialized line exceeds this are gzip-compressed (10 KiB).
pub const COMPRESSION_THRESHOLD: usize = 10 * 1024;

/// Envelopes above this size pass validation but emit a warning (100 KiB).
pub const LARGE_MESSAGE_WARNING_SIZE: usize = 100 * 1024;

/// JSON key marking a compressed payload on the wire.
pub const COMPRESSION_MARKER: &str = "__compressed";

/// Message IDs look like `msg_20260801_142233_a1b2c3`.
pub static MESSAGE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^msg_\d{8}_\d{6}_[A-Za-z0-9]+$").expect("valid message id pattern"));

/// ISO-8601 UTC timestamps: `2026-08-01T14:22:33Z` (fractional seconds and
/// an explicit `+00:00` offset are accepted).
pub static TIMESTAMP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|\+00:00)$")
        .expect("valid timestamp pattern")
});

/// Agent IDs are alphanumeric/underscore; `*` is the broadcast wildcard.
pub static AGENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid agent id pattern"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_pattern() {
        assert!(MESSAGE_ID_PATTERN.is_match("msg_20260801_142233_a1b2c3"));
        assert!(MESSAGE_ID_PATTERN.is_match("msg_20260801_142233_XyZ9"));
        assert!(!MESSAGE_ID_PATTERN.is_match("msg_2026_142233_a1b2c3"));
        assert!(!MESSAGE_ID_PATTERN.is_match("req_20260801_142233_a1b2c3"));
        assert!(!MESSAGE_ID_PATTERN.is_match("msg_20260801_142233_"));
    }

    #[test]
    fn test_timestamp_pattern() {
        assert!(TIMESTAMP_PATTERN.is_match("2026-08-01T14:22:33Z"));
        assert!(TIMESTAMP_PATTERN.is_match("2026-08-01T14:22:33.123Z"));
        assert!(TIMESTAMP_PATTERN.is_match("2026-08-01T14:22:33+00:00"));
        assert!(!TIMESTAMP_PATTERN.is_match("2026-08-01 14:22:33"));
        assert!(!TIMESTAMP_PATTERN.is_match("2026-08-01T14:22:33+02:00"));
    }

    #[test]
    fn test_agent_id_pattern() {
        assert!(AGENT_ID_PATTERN.is_match("Agent_1"));
        assert!(AGENT_ID_PATTERN.is_match("manager"));
        assert!(!AGENT_ID_PATTERN.is_match("agent-1"));
        assert!(!AGENT_ID_PATTERN.is_match(""));
    }
}
