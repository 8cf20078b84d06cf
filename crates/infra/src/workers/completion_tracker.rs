//! Completion tracker: folds terminal results into the completion matrix and
//! emits the ready notification once per processing round.
//!
//! Two inputs:
//! - [`TERMINAL_SUBJECT`]: a finished tuple, recorded as done
//! - dead letters of stage subjects: every tuple the failed unit covers is
//!   recorded as permanently failed, so the campaign still settles
//!
//! Recording is an idempotent upsert pinned to the unit's revision; stale
//! revisions are ignored. After every message the tracker re-evaluates the
//! campaign, including on duplicates, so a notification that failed to
//! publish is retried by the redelivery.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use creatiflow_core::{
    CampaignId, CampaignStatus, CompletionTuple, ErrorCode, FailureDetail, IdempotencyKey,
    RecordOutcome, Stage, TERMINAL_SUBJECT, TupleOutcome, WorkUnit,
};
use creatiflow_events::dead_letter::DEAD_LETTER_FILTER;
use creatiflow_events::{
    BusError, ConsumerOptions, DeadLetterRecord, Delivery, MessageBus, MessageEnvelope, StagePayload,
    is_dead_letter_subject,
};

use crate::config::StageConfig;
use crate::store::{PipelineStore, StoreError};

use super::{DeliveryProcessor, Disposition};

/// Subject of the campaign-level "ready for review" event.
pub const READY_FOR_REVIEW_SUBJECT: &str = "campaign.ready_for_review";

pub const TERMINAL_DURABLE: &str = "completion-tracker";
pub const DEAD_LETTER_DURABLE: &str = "completion-tracker-dlq";

const READY_EVENT: &str = "ready_for_review";

/// Payload of the ready notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyNotice {
    pub status: CampaignStatus,
    pub epoch: u32,
    pub required_count: usize,
    pub done_count: usize,
    pub failed_count: usize,
}

fn storage_failure(err: &StoreError) -> FailureDetail {
    FailureDetail::new(ErrorCode::StorageError, err.to_string())
}

pub struct CompletionTracker {
    store: Arc<dyn PipelineStore>,
    bus: Arc<dyn MessageBus>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn PipelineStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    pub fn terminal_options(config: &StageConfig) -> ConsumerOptions {
        config.consumer_options(TERMINAL_SUBJECT, TERMINAL_DURABLE)
    }

    pub fn dead_letter_options(config: &StageConfig) -> ConsumerOptions {
        config.consumer_options(DEAD_LETTER_FILTER, DEAD_LETTER_DURABLE)
    }

    fn on_terminal(&self, payload: &serde_json::Value) -> Result<Disposition, FailureDetail> {
        let unit = match decode_unit(payload) {
            Ok(unit) => unit,
            Err(reason) => {
                error!(%reason, "undecodable terminal result discarded");
                return Ok(Disposition::Discarded);
            }
        };
        let Some(tuple) = unit.tuple() else {
            error!(idempotency_key = %unit.idempotency_key, "terminal result without a tuple discarded");
            return Ok(Disposition::Discarded);
        };
        self.apply(&unit, &[tuple], TupleOutcome::Done)
    }

    fn on_dead_letter(&self, payload: &serde_json::Value) -> Result<Disposition, FailureDetail> {
        let record = match DeadLetterRecord::from_payload(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "undecodable dead-letter record ignored");
                return Ok(Disposition::Discarded);
            }
        };

        if record.original_subject == TERMINAL_SUBJECT {
            // The result itself was produced; only counting it failed.
            return self.on_terminal(&record.original_payload);
        }
        if Stage::from_request_subject(&record.original_subject).is_none() {
            return Ok(Disposition::Discarded);
        }
        let unit = match decode_unit(&record.original_payload) {
            Ok(unit) => unit,
            Err(reason) => {
                warn!(subject = %record.original_subject, %reason, "dead letter cannot be attributed to a unit");
                return Ok(Disposition::Discarded);
            }
        };

        match self.store.fail_unit(&unit, &record.last_error, true) {
            Ok(()) => {}
            Err(e) if e.is_transient() => return Err(storage_failure(&e)),
            Err(e) => warn!(error = %e, idempotency_key = %unit.idempotency_key, "unit state not updated"),
        }

        let matrix = match self.store.completion_matrix(unit.campaign_id) {
            Ok(m) => m,
            Err(StoreError::NotFound(_)) => return Ok(Disposition::Discarded),
            Err(e) => return Err(storage_failure(&e)),
        };
        let covered: Vec<CompletionTuple> = matrix
            .tuples()
            .filter(|(t, _)| unit.covers(t))
            .map(|(t, _)| t.clone())
            .collect();
        info!(
            campaign_id = %unit.campaign_id,
            idempotency_key = %unit.idempotency_key,
            stage = %unit.stage,
            code = %record.last_error.code,
            tuples = covered.len(),
            "unit failed permanently"
        );
        self.apply(&unit, &covered, TupleOutcome::FailedPermanent)
    }

    fn apply(
        &self,
        unit: &WorkUnit,
        tuples: &[CompletionTuple],
        outcome: TupleOutcome,
    ) -> Result<Disposition, FailureDetail> {
        let mut inserted = false;
        for tuple in tuples {
            match self.store.record_outcome(
                unit.campaign_id,
                tuple,
                unit.revision,
                outcome,
                unit.idempotency_key,
            ) {
                Ok(RecordOutcome::Inserted) => {
                    debug!(campaign_id = %unit.campaign_id, %tuple, outcome = outcome.as_str(), "tuple resolved");
                    inserted = true;
                }
                Ok(RecordOutcome::Duplicate) => {}
                Ok(RecordOutcome::Stale) => {
                    debug!(campaign_id = %unit.campaign_id, %tuple, revision = unit.revision, "stale revision ignored");
                }
                Ok(RecordOutcome::NotRequired) => {
                    warn!(campaign_id = %unit.campaign_id, %tuple, "result for a tuple outside the required set");
                }
                Err(StoreError::NotFound(_)) => return Ok(Disposition::Discarded),
                Err(e) => return Err(storage_failure(&e)),
            }
        }

        self.settle_and_notify(unit.campaign_id)?;
        Ok(if inserted {
            Disposition::Processed
        } else {
            Disposition::Duplicate
        })
    }

    /// Move a fully resolved campaign out of `processing` and publish the
    /// ready notification for its current epoch, at most once.
    pub fn settle_and_notify(&self, campaign_id: CampaignId) -> Result<(), FailureDetail> {
        if let Some(status) = self
            .store
            .settle_campaign(campaign_id)
            .map_err(|e| storage_failure(&e))?
        {
            info!(%campaign_id, %status, "campaign settled");
        }

        let campaign = self
            .store
            .get_campaign(campaign_id)
            .map_err(|e| storage_failure(&e))?;
        let finished = matches!(
            campaign.status,
            CampaignStatus::Completed | CampaignStatus::CompletedWithErrors
        );
        if !finished || campaign.ready_notified() {
            return Ok(());
        }

        let counts = self
            .store
            .completion_matrix(campaign_id)
            .map_err(|e| storage_failure(&e))?
            .counts();
        let epoch = campaign.epoch;
        if !self
            .store
            .claim_ready_notification(campaign_id, epoch)
            .map_err(|e| storage_failure(&e))?
        {
            return Ok(());
        }

        let notice = ReadyNotice {
            status: campaign.status,
            epoch,
            required_count: counts.required,
            done_count: counts.done,
            failed_count: counts.failed,
        };
        let envelope = MessageEnvelope::for_campaign(
            campaign_id,
            campaign.correlation_id,
            epoch,
            IdempotencyKey::for_campaign_event(campaign_id, READY_EVENT, epoch),
            notice,
            Utc::now(),
        );
        let published = envelope
            .to_json()
            .and_then(|json| self.bus.publish(READY_FOR_REVIEW_SUBJECT, json, envelope.headers()));
        if let Err(e) = published {
            if let Err(release) = self.store.release_ready_notification(campaign_id, epoch) {
                error!(%campaign_id, epoch, error = %release, "ready claim could not be released");
            }
            return Err(FailureDetail::new(ErrorCode::BusUnavailable, e.to_string()));
        }

        info!(
            %campaign_id,
            correlation_id = %campaign.correlation_id,
            status = %campaign.status,
            epoch,
            done = counts.done,
            failed = counts.failed,
            "ready for review notification published"
        );
        Ok(())
    }
}

fn decode_unit(payload: &serde_json::Value) -> Result<WorkUnit, String> {
    let envelope = MessageEnvelope::<StagePayload>::from_json(payload).map_err(|e| e.to_string())?;
    envelope.work_unit().map_err(|e| e.to_string())
}

impl DeliveryProcessor for CompletionTracker {
    fn handle(&self, delivery: Delivery) -> Result<Disposition, BusError> {
        let outcome = if is_dead_letter_subject(delivery.subject()) {
            self.on_dead_letter(delivery.payload())
        } else {
            self.on_terminal(delivery.payload())
        };
        match outcome {
            Ok(disposition) => {
                delivery.ack()?;
                Ok(disposition)
            }
            Err(detail) => {
                warn!(
                    subject = delivery.subject(),
                    code = %detail.code,
                    message = %detail.message,
                    "completion tracking failed; nak"
                );
                delivery.nak(&detail)?;
                Ok(Disposition::Retry)
            }
        }
    }
}
