//! Stage outcomes and the structured error vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::{AspectRatio, Locale, ProductId};
use crate::id::CampaignId;
use crate::work_unit::{IdempotencyKey, Stage, WorkUnit};

/// Structured error classification.
///
/// This is the only failure detail that leaves the pipeline: campaign status
/// and alerts carry a code plus a short message, never raw error chains.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Envelope or request failed validation.
    ValidationFailed,
    /// Content generator throttled the request.
    RateLimited,
    /// Content generator refused the input (or output broke compliance).
    InvalidInput,
    /// Asset generator quota exhausted.
    QuotaExceeded,
    /// External generation or compositing failure.
    ProviderError,
    /// Object store or persistence failure.
    StorageError,
    /// Publishing to the bus failed.
    BusUnavailable,
    /// Handler did not acknowledge within its ack window.
    AckTimeout,
    /// Retry budget exhausted without a more specific cause.
    RetriesExhausted,
    Internal,
}

/// Alert severity derived from an [`ErrorCode`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::ProviderError => "provider_error",
            ErrorCode::StorageError => "storage_error",
            ErrorCode::BusUnavailable => "bus_unavailable",
            ErrorCode::AckTimeout => "ack_timeout",
            ErrorCode::RetriesExhausted => "retries_exhausted",
            ErrorCode::Internal => "internal",
        }
    }

    /// Input problems are the submitter's to fix; capacity and infrastructure
    /// failures need an operator.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::ValidationFailed | ErrorCode::InvalidInput => Severity::Warning,
            ErrorCode::RateLimited | ErrorCode::AckTimeout | ErrorCode::RetriesExhausted => {
                Severity::Warning
            }
            ErrorCode::QuotaExceeded
            | ErrorCode::ProviderError
            | ErrorCode::StorageError
            | ErrorCode::BusUnavailable
            | ErrorCode::Internal => Severity::Critical,
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl FailureDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded { output_ref: String },
    Failed { error: FailureDetail },
}

/// Immutable record of one work unit's outcome.
///
/// Keyed by idempotency key; the first write wins and later writes for the
/// same key are no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub idempotency_key: IdempotencyKey,
    pub campaign_id: CampaignId,
    pub stage: Stage,
    pub locale: Locale,
    pub product_id: Option<ProductId>,
    pub aspect_ratio: Option<AspectRatio>,
    pub revision: u32,
    pub outcome: StageOutcome,
    /// Set once the next-stage fan-out for this result has been published.
    pub downstream_published: bool,
    pub recorded_at: DateTime<Utc>,
}

impl StageResult {
    pub fn succeeded(unit: &WorkUnit, output_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::for_unit(
            unit,
            StageOutcome::Succeeded {
                output_ref: output_ref.into(),
            },
            now,
        )
    }

    pub fn failed(unit: &WorkUnit, error: FailureDetail, now: DateTime<Utc>) -> Self {
        Self::for_unit(unit, StageOutcome::Failed { error }, now)
    }

    fn for_unit(unit: &WorkUnit, outcome: StageOutcome, now: DateTime<Utc>) -> Self {
        Self {
            idempotency_key: unit.idempotency_key,
            campaign_id: unit.campaign_id,
            stage: unit.stage,
            locale: unit.locale.clone(),
            product_id: unit.product_id.clone(),
            aspect_ratio: unit.aspect_ratio,
            revision: unit.revision,
            outcome,
            downstream_published: false,
            recorded_at: now,
        }
    }

    pub fn output_ref(&self) -> Option<&str> {
        match &self.outcome {
            StageOutcome::Succeeded { output_ref } => Some(output_ref),
            StageOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Succeeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_failures_are_critical() {
        assert_eq!(ErrorCode::QuotaExceeded.severity(), Severity::Critical);
        assert_eq!(ErrorCode::StorageError.severity(), Severity::Critical);
        assert_eq!(ErrorCode::ValidationFailed.severity(), Severity::Warning);
    }

    #[test]
    fn every_code_escalates_as_warning_or_critical() {
        let codes = [
            ErrorCode::ValidationFailed,
            ErrorCode::RateLimited,
            ErrorCode::InvalidInput,
            ErrorCode::QuotaExceeded,
            ErrorCode::ProviderError,
            ErrorCode::StorageError,
            ErrorCode::BusUnavailable,
            ErrorCode::AckTimeout,
            ErrorCode::RetriesExhausted,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert!(matches!(code.severity().as_str(), "warning" | "critical"), "{code}");
        }
        assert!(serde_json::from_str::<Severity>("\"info\"").is_err());
    }

    #[test]
    fn outcome_is_tagged_in_json() {
        let outcome = StageOutcome::Failed {
            error: FailureDetail::new(ErrorCode::RateLimited, "slow down"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"]["code"], "rate_limited");
    }
}
