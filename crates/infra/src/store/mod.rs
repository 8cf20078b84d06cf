//! Persistence boundary for campaigns, completion matrices, work units and
//! stage results.
//!
//! Every mutation is either an upsert keyed by a natural key (idempotency key,
//! completion tuple) or a conditional update on the campaign row. Concurrent
//! replicas never coordinate beyond what these operations guarantee.

pub mod in_memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use creatiflow_core::{
    AttemptStart, Campaign, CampaignId, CampaignStatus, CompletionMatrix, CompletionTuple,
    CorrelationId, DomainError, FailureDetail, IdempotencyKey, RecordOutcome, RevisionTicket,
    Stage, StageOutcome, StageResult, TupleOutcome, Verdict, WorkUnit, WorkUnitRecord,
    WorkUnitState,
};

pub use in_memory::InMemoryPipelineStore;
pub use postgres::PostgresPipelineStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("campaign {0} not found")]
    NotFound(CampaignId),

    #[error("campaign {0} already exists")]
    AlreadyExists(CampaignId),

    /// A guarded update could not apply in the record's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend unreachable or failed; the caller may retry.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Result of an insert-if-absent keyed by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A record already existed; it is returned unchanged.
    Existing(StageResult),
}

/// Work units of one stage bucketed by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageUnitCounts {
    pub requested: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_permanent: usize,
}

impl StageUnitCounts {
    pub fn add(&mut self, state: WorkUnitState) {
        let slot = match state {
            WorkUnitState::Requested => &mut self.requested,
            WorkUnitState::InProgress => &mut self.in_progress,
            WorkUnitState::Succeeded => &mut self.succeeded,
            WorkUnitState::Failed => &mut self.failed,
            WorkUnitState::FailedPermanent => &mut self.failed_permanent,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.requested + self.in_progress + self.succeeded + self.failed + self.failed_permanent
    }
}

pub type UnitStateCounts = BTreeMap<Stage, StageUnitCounts>;

/// Move a unit record to the terminal state matching a freshly inserted
/// result. Records that are already terminal are left alone: a late success
/// after the bus dead-lettered the unit does not resurrect it.
pub(crate) fn apply_result(
    record: &mut WorkUnitRecord,
    result: &StageResult,
    now: DateTime<Utc>,
) -> Result<(), DomainError> {
    if record.state.is_terminal() {
        return Ok(());
    }
    match &result.outcome {
        StageOutcome::Succeeded { .. } => {
            if record.state != WorkUnitState::InProgress {
                record.begin_attempt(now)?;
            }
            record.succeed(now)
        }
        StageOutcome::Failed { error } => record.fail(error.clone(), true, now),
    }
}

/// Campaign-side effect of allocating a revision: finished campaigns re-open
/// into a new epoch, running ones keep theirs.
pub(crate) fn reopen_for_revision(campaign: &mut Campaign, now: DateTime<Utc>) -> Result<(), StoreError> {
    match campaign.status {
        CampaignStatus::Processing => Ok(()),
        status if status.is_reopenable() => {
            campaign.status = CampaignStatus::Processing;
            campaign.epoch += 1;
            campaign.failure = None;
            campaign.updated_at = now;
            Ok(())
        }
        status => Err(StoreError::Conflict(format!(
            "campaign {} cannot accept revisions while {status}",
            campaign.id
        ))),
    }
}

/// Status a settled matrix moves a processing campaign to.
pub(crate) fn settled_status(matrix: &CompletionMatrix) -> Option<CampaignStatus> {
    match matrix.verdict() {
        Verdict::Pending => None,
        Verdict::Completed => Some(CampaignStatus::Completed),
        Verdict::CompletedWithErrors => Some(CampaignStatus::CompletedWithErrors),
    }
}

/// Whether a ready notification may be claimed for `epoch`.
pub(crate) fn notification_claimable(campaign: &Campaign, epoch: u32) -> bool {
    matches!(
        campaign.status,
        CampaignStatus::Completed | CampaignStatus::CompletedWithErrors
    ) && campaign.epoch == epoch
        && campaign.notified_epoch != Some(epoch)
}

/// Persistence collaborator used by the coordinator, stage workers and the
/// completion tracker.
pub trait PipelineStore: Send + Sync {
    /// Connectivity probe used at startup.
    fn health_check(&self) -> Result<(), StoreError>;

    /// Persist a new campaign together with its required set.
    fn insert_campaign(&self, campaign: &Campaign, matrix: &CompletionMatrix) -> Result<(), StoreError>;

    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError>;

    fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Campaign>, StoreError>;

    /// Compare-and-swap the campaign status. Returns `false` when the current
    /// status is not in `from`.
    fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        failure: Option<FailureDetail>,
    ) -> Result<bool, StoreError>;

    /// Claim the ready notification for `epoch`. Succeeds for exactly one
    /// caller while the campaign is completed in that epoch.
    fn claim_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<bool, StoreError>;

    /// Give back a claim whose notification could not be published.
    fn release_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<(), StoreError>;

    fn completion_matrix(&self, id: CampaignId) -> Result<CompletionMatrix, StoreError>;

    fn record_outcome(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        revision: u32,
        outcome: TupleOutcome,
        source: IdempotencyKey,
    ) -> Result<RecordOutcome, StoreError>;

    /// Allocate the next revision of `tuple`, re-opening a finished campaign
    /// (new epoch) if needed.
    fn advance_revision(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        fresh_seed: u64,
    ) -> Result<RevisionTicket, StoreError>;

    /// Evaluate the verdict and, if every tuple is terminal, move the campaign
    /// out of `processing`. Returns the new status only to the caller that
    /// performed the transition.
    fn settle_campaign(&self, id: CampaignId) -> Result<Option<CampaignStatus>, StoreError>;

    /// Start an attempt on `unit`, creating its record on first sight.
    fn begin_attempt(&self, unit: &WorkUnit) -> Result<AttemptStart, StoreError>;

    fn fail_unit(&self, unit: &WorkUnit, error: &FailureDetail, permanent: bool) -> Result<(), StoreError>;

    fn work_unit(&self, key: IdempotencyKey) -> Result<Option<WorkUnitRecord>, StoreError>;

    fn unit_state_counts(&self, id: CampaignId) -> Result<UnitStateCounts, StoreError>;

    /// Insert `result` unless one exists for its key; the unit moves to
    /// `succeeded` or `failed_permanent` accordingly.
    fn record_stage_result(&self, result: &StageResult) -> Result<UpsertOutcome, StoreError>;

    fn get_stage_result(&self, key: IdempotencyKey) -> Result<Option<StageResult>, StoreError>;

    fn mark_downstream_published(&self, key: IdempotencyKey) -> Result<(), StoreError>;
}

impl<S> PipelineStore for Arc<S>
where
    S: PipelineStore + ?Sized,
{
    fn health_check(&self) -> Result<(), StoreError> {
        (**self).health_check()
    }

    fn insert_campaign(&self, campaign: &Campaign, matrix: &CompletionMatrix) -> Result<(), StoreError> {
        (**self).insert_campaign(campaign, matrix)
    }

    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError> {
        (**self).get_campaign(id)
    }

    fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Campaign>, StoreError> {
        (**self).find_by_correlation(correlation_id)
    }

    fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        failure: Option<FailureDetail>,
    ) -> Result<bool, StoreError> {
        (**self).transition_status(id, from, to, failure)
    }

    fn claim_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<bool, StoreError> {
        (**self).claim_ready_notification(id, epoch)
    }

    fn release_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<(), StoreError> {
        (**self).release_ready_notification(id, epoch)
    }

    fn completion_matrix(&self, id: CampaignId) -> Result<CompletionMatrix, StoreError> {
        (**self).completion_matrix(id)
    }

    fn record_outcome(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        revision: u32,
        outcome: TupleOutcome,
        source: IdempotencyKey,
    ) -> Result<RecordOutcome, StoreError> {
        (**self).record_outcome(id, tuple, revision, outcome, source)
    }

    fn advance_revision(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        fresh_seed: u64,
    ) -> Result<RevisionTicket, StoreError> {
        (**self).advance_revision(id, tuple, fresh_seed)
    }

    fn settle_campaign(&self, id: CampaignId) -> Result<Option<CampaignStatus>, StoreError> {
        (**self).settle_campaign(id)
    }

    fn begin_attempt(&self, unit: &WorkUnit) -> Result<AttemptStart, StoreError> {
        (**self).begin_attempt(unit)
    }

    fn fail_unit(&self, unit: &WorkUnit, error: &FailureDetail, permanent: bool) -> Result<(), StoreError> {
        (**self).fail_unit(unit, error, permanent)
    }

    fn work_unit(&self, key: IdempotencyKey) -> Result<Option<WorkUnitRecord>, StoreError> {
        (**self).work_unit(key)
    }

    fn unit_state_counts(&self, id: CampaignId) -> Result<UnitStateCounts, StoreError> {
        (**self).unit_state_counts(id)
    }

    fn record_stage_result(&self, result: &StageResult) -> Result<UpsertOutcome, StoreError> {
        (**self).record_stage_result(result)
    }

    fn get_stage_result(&self, key: IdempotencyKey) -> Result<Option<StageResult>, StoreError> {
        (**self).get_stage_result(key)
    }

    fn mark_downstream_published(&self, key: IdempotencyKey) -> Result<(), StoreError> {
        (**self).mark_downstream_published(key)
    }
}
