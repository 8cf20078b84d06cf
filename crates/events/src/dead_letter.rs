//! Dead-letter records and subject naming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creatiflow_core::{CorrelationId, FailureDetail};

use crate::bus::{BusError, BusMessage};

pub const DEAD_LETTER_PREFIX: &str = "deadletter";

/// Filter matching every dead-letter subject.
pub const DEAD_LETTER_FILTER: &str = "deadletter.>";

pub fn dead_letter_subject(original_subject: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}.{original_subject}")
}

pub fn is_dead_letter_subject(subject: &str) -> bool {
    subject
        .strip_prefix(DEAD_LETTER_PREFIX)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Terminal sink entry for a message that exhausted its retry budget (or
/// failed fatally). The original payload is carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_subject: String,
    pub original_payload: serde_json::Value,
    pub attempt_count: u32,
    pub last_error: FailureDetail,
    pub first_failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        message: &BusMessage,
        attempt_count: u32,
        last_error: FailureDetail,
        first_failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original_subject: message.subject.clone(),
            original_payload: message.payload.clone(),
            attempt_count,
            last_error,
            first_failed_at,
        }
    }

    pub fn subject(&self) -> String {
        dead_letter_subject(&self.original_subject)
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, BusError> {
        serde_json::to_value(self).map_err(|e| BusError::Fatal(format!("dead-letter encode: {e}")))
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, BusError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| BusError::Fatal(format!("dead-letter decode: {e}")))
    }

    /// Correlation id of the original message, if its payload was an envelope.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.original_payload
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}
