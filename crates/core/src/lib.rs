//! `creatiflow-core`: pipeline domain model.
//!
//! Pure types only: campaigns, work units, stage results and the completion
//! matrix that reconciles partial results into a campaign verdict. Nothing in
//! here performs IO.

pub mod campaign;
pub mod completion;
pub mod dimension;
pub mod error;
pub mod id;
pub mod result;
pub mod work_unit;

pub use campaign::{
    AudienceProfile, BrandConfig, Campaign, CampaignConfig, CampaignStatus, OutputSpec, Placement,
    Product,
};
pub use completion::{
    CompletionCounts, CompletionMatrix, RecordOutcome, ResolvedOutcome, RevisionTicket, TupleOutcome,
    TupleProgress, Verdict,
};
pub use dimension::{AspectRatio, CompletionTuple, Locale, ProductId};
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, CorrelationId};
pub use result::{ErrorCode, FailureDetail, Severity, StageOutcome, StageResult};
pub use work_unit::{
    TERMINAL_SUBJECT,
    AttemptStart, IdempotencyKey, Stage, WorkUnit, WorkUnitRecord, WorkUnitState,
};
