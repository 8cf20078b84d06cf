use thiserror::Error;

use creatiflow_core::{Campaign, ErrorCode, FailureDetail, Stage, WorkUnit};

use crate::payload::StagePayload;

/// Everything a stage sees about one delivery.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub unit: &'a WorkUnit,
    pub campaign: &'a Campaign,
    pub payload: &'a StagePayload,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// Successful stage output: a reference into the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub output_ref: String,
}

impl StageOutput {
    pub fn new(output_ref: impl Into<String>) -> Self {
        Self {
            output_ref: output_ref.into(),
        }
    }
}

/// Input could not be turned into a typed request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid stage input: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Worth retrying (nak).
    #[error("recoverable: {0}")]
    Recoverable(FailureDetail),

    /// Retrying cannot help: dead-letter explicitly and ack.
    #[error("fatal: {0}")]
    Fatal(FailureDetail),

    /// Lost a conditional-update race; another attempt already did the work.
    #[error("concurrency conflict: {0}")]
    Conflict(String),
}

impl StageError {
    pub fn recoverable(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Recoverable(FailureDetail::new(code, msg))
    }

    pub fn fatal(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Fatal(FailureDetail::new(code, msg))
    }

    pub fn detail(&self) -> FailureDetail {
        match self {
            StageError::Recoverable(d) | StageError::Fatal(d) => d.clone(),
            StageError::Conflict(msg) => FailureDetail::new(ErrorCode::Internal, msg.clone()),
        }
    }
}

impl From<ValidationError> for StageError {
    fn from(value: ValidationError) -> Self {
        StageError::Fatal(FailureDetail::new(ErrorCode::ValidationFailed, value.0))
    }
}

/// Contract implemented by every processing stage.
///
/// `validate` turns raw input into a typed request without side effects.
/// `process` performs the stage's work and returns an output reference; any
/// external writes it makes must be keyed so that a repeat of the same unit
/// overwrites rather than duplicates. Persisting the result, publishing the
/// next stage and acknowledging the delivery are left to the caller, which
/// only acks after all of them succeed.
pub trait StageHandler: Send + Sync {
    type Request: Send;

    fn stage(&self) -> Stage;

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError>;

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError>;
}

impl<H> StageHandler for std::sync::Arc<H>
where
    H: StageHandler + ?Sized,
{
    type Request = H::Request;

    fn stage(&self) -> Stage {
        (**self).stage()
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        (**self).validate(input)
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        (**self).process(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_become_fatal() {
        let err: StageError = ValidationError::new("missing context_ref").into();
        match err {
            StageError::Fatal(detail) => assert_eq!(detail.code, ErrorCode::ValidationFailed),
            other => panic!("expected fatal, got {other:?}"),
        }
    }
}
