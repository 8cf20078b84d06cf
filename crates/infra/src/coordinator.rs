//! Stateless fan-out across stages and dimensions.
//!
//! The coordinator keeps nothing in memory between calls. Every decision is
//! re-derived from the persisted campaign, its completion matrix and the
//! finished unit that triggered it, so any replica can advance any campaign.
//!
//! Fan-out rules:
//! - submission: one enrichment unit per target locale
//! - enrichment: one content unit per product of that locale
//! - content: one asset unit per aspect ratio of that (locale, product)
//! - asset → composition → finalization for the same tuple
//! - finalization: the terminal result goes to [`TERMINAL_SUBJECT`]

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use creatiflow_core::{
    AspectRatio, Campaign, CampaignConfig, CampaignId, CampaignStatus, CompletionMatrix,
    CompletionTuple, DomainError, ErrorCode, FailureDetail, IdempotencyKey, Locale, ProductId,
    Stage, TERMINAL_SUBJECT, WorkUnit,
};
use creatiflow_events::{BusError, MessageBus, MessageEnvelope, RevisionFeedback, StagePayload};

use crate::store::{PipelineStore, StoreError, UnitStateCounts};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("campaign {campaign_id} is {status}: {reason}")]
    InvalidState {
        campaign_id: CampaignId,
        status: CampaignStatus,
        reason: String,
    },
}

impl CoordinatorError {
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinatorError::Store(e) => e.is_transient(),
            CoordinatorError::Bus(e) => e.is_transient(),
            CoordinatorError::Domain(_) | CoordinatorError::InvalidState { .. } => false,
        }
    }

    /// Structured form recorded on work units and dead-letter records.
    pub fn failure_detail(&self) -> FailureDetail {
        let code = match self {
            CoordinatorError::Domain(e) if e.is_caller_error() => ErrorCode::ValidationFailed,
            CoordinatorError::Domain(_) => ErrorCode::Internal,
            CoordinatorError::Store(StoreError::Storage(_)) => ErrorCode::StorageError,
            CoordinatorError::Store(_) => ErrorCode::Internal,
            CoordinatorError::Bus(_) => ErrorCode::BusUnavailable,
            CoordinatorError::InvalidState { .. } => ErrorCode::ValidationFailed,
        };
        FailureDetail::new(code, self.to_string())
    }
}

/// Aggregated campaign status for surrounding collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignStatusView {
    pub campaign_id: CampaignId,
    pub status: CampaignStatus,
    pub epoch: u32,
    pub required_count: usize,
    pub done_count: usize,
    pub failed_count: usize,
    pub failure: Option<FailureDetail>,
    /// Work units per stage, bucketed by state.
    pub units: UnitStateCounts,
}

/// Reviewer request to regenerate one creative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRequest {
    pub campaign_id: CampaignId,
    pub locale: Locale,
    pub product_id: ProductId,
    pub aspect_ratio: AspectRatio,
    pub feedback: String,
    pub requested_by: Option<String>,
}

impl RevisionRequest {
    pub fn tuple(&self) -> CompletionTuple {
        CompletionTuple::new(self.locale.clone(), self.product_id.clone(), self.aspect_ratio)
    }
}

/// Whether every tuple `unit` covers has moved past its revision.
///
/// Enrichment is shared by all revisions of a locale and is never superseded.
pub fn is_superseded(matrix: &CompletionMatrix, unit: &WorkUnit) -> bool {
    if unit.stage == Stage::Enrichment {
        return false;
    }
    let mut covered = matrix.tuples().filter(|(t, _)| unit.covers(t)).peekable();
    if covered.peek().is_none() {
        return false;
    }
    covered.all(|(_, progress)| progress.revision > unit.revision)
}

#[derive(Clone)]
pub struct PipelineCoordinator {
    store: Arc<dyn PipelineStore>,
    bus: Arc<dyn MessageBus>,
}

impl PipelineCoordinator {
    pub fn new(store: Arc<dyn PipelineStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Publish `unit` on its stage's request subject.
    pub fn publish_unit(&self, unit: &WorkUnit, payload: StagePayload) -> Result<(), BusError> {
        let envelope = MessageEnvelope::for_unit(unit, payload, Utc::now());
        let subject = unit.stage.request_subject();
        self.bus.publish(subject, envelope.to_json()?, envelope.headers())?;
        debug!(
            campaign_id = %unit.campaign_id,
            correlation_id = %unit.correlation_id,
            idempotency_key = %unit.idempotency_key,
            stage = %unit.stage,
            subject,
            revision = unit.revision,
            "work unit published"
        );
        Ok(())
    }

    /// Persist a new campaign with its required set and start enrichment.
    ///
    /// A bus failure during the initial fan-out fails the campaign.
    #[instrument(skip_all, fields(campaign = %config.name))]
    pub fn submit_campaign(&self, config: CampaignConfig) -> Result<CampaignId, CoordinatorError> {
        let campaign = Campaign::draft(config, Utc::now())?;
        let matrix = CompletionMatrix::new(campaign.id, campaign.config.required_tuples(), |_| {
            rand::random::<u64>()
        });
        self.store.insert_campaign(&campaign, &matrix)?;

        if !self.store.transition_status(
            campaign.id,
            &[CampaignStatus::Draft],
            CampaignStatus::Processing,
            None,
        )? {
            let current = self.store.get_campaign(campaign.id)?;
            return Err(CoordinatorError::InvalidState {
                campaign_id: campaign.id,
                status: current.status,
                reason: "campaign left draft before submission finished".into(),
            });
        }

        for locale in &campaign.config.target_locales {
            let unit = WorkUnit::new(
                campaign.id,
                campaign.correlation_id,
                Stage::Enrichment,
                locale.clone(),
                None,
                None,
                0,
            )?;
            if let Err(err) = self.publish_unit(&unit, StagePayload::default()) {
                let detail = FailureDetail::new(ErrorCode::BusUnavailable, err.to_string());
                error!(
                    campaign_id = %campaign.id,
                    correlation_id = %campaign.correlation_id,
                    error = %err,
                    "initial fan-out failed; failing campaign"
                );
                self.store.transition_status(
                    campaign.id,
                    &[CampaignStatus::Processing],
                    CampaignStatus::Failed,
                    Some(detail),
                )?;
                return Err(err.into());
            }
        }

        info!(
            campaign_id = %campaign.id,
            correlation_id = %campaign.correlation_id,
            required = matrix.required_count(),
            locales = campaign.config.target_locales.len(),
            "campaign submitted"
        );
        Ok(campaign.id)
    }

    #[instrument(skip(self))]
    pub fn get_campaign_status(&self, campaign_id: CampaignId) -> Result<CampaignStatusView, CoordinatorError> {
        let campaign = self.store.get_campaign(campaign_id)?;
        let counts = self.store.completion_matrix(campaign_id)?.counts();
        let units = self.store.unit_state_counts(campaign_id)?;
        Ok(CampaignStatusView {
            campaign_id,
            status: campaign.status,
            epoch: campaign.epoch,
            required_count: counts.required,
            done_count: counts.done,
            failed_count: counts.failed,
            failure: campaign.failure,
            units,
        })
    }

    /// Allocate a new revision for one tuple and restart it at content
    /// generation with the reviewer's feedback. Returns the new revision.
    #[instrument(skip(self, request), fields(campaign_id = %request.campaign_id))]
    pub fn request_revision(&self, request: RevisionRequest) -> Result<u32, CoordinatorError> {
        let campaign = self.store.get_campaign(request.campaign_id)?;
        let tuple = request.tuple();
        if !campaign.config.required_tuples().contains(&tuple) {
            return Err(DomainError::validation(format!("{tuple} is not part of campaign {}", campaign.id)).into());
        }
        if !(campaign.status == CampaignStatus::Processing || campaign.status.is_reopenable()) {
            return Err(CoordinatorError::InvalidState {
                campaign_id: campaign.id,
                status: campaign.status,
                reason: "revisions need a running or finished campaign".into(),
            });
        }

        let enrichment = IdempotencyKey::derive(campaign.id, &tuple.locale, None, None, Stage::Enrichment, 0);
        let context_ref = self
            .store
            .get_stage_result(enrichment)?
            .and_then(|r| r.output_ref().map(str::to_owned))
            .ok_or_else(|| CoordinatorError::InvalidState {
                campaign_id: campaign.id,
                status: campaign.status,
                reason: format!("no locale context for {} yet", tuple.locale),
            })?;

        let ticket = self
            .store
            .advance_revision(campaign.id, &tuple, rand::random::<u64>())?;
        let unit = WorkUnit::new(
            campaign.id,
            campaign.correlation_id,
            Stage::ContentGeneration,
            tuple.locale.clone(),
            Some(tuple.product_id.clone()),
            Some(tuple.aspect_ratio),
            ticket.revision,
        )?;
        let payload = StagePayload {
            context_ref: Some(context_ref),
            ..StagePayload::default()
        }
        .with_seed(ticket.seed)
        .with_feedback(RevisionFeedback {
            from_revision: ticket.revision - 1,
            feedback: request.feedback,
            requested_by: request.requested_by,
        });
        self.publish_unit(&unit, payload)?;

        info!(
            campaign_id = %campaign.id,
            correlation_id = %campaign.correlation_id,
            tuple = %tuple,
            revision = ticket.revision,
            "revision requested"
        );
        Ok(ticket.revision)
    }

    /// Move a finished campaign to `ready_for_review`. Returns `false` when it
    /// is not in a finished state.
    #[instrument(skip(self))]
    pub fn hand_off_for_review(&self, campaign_id: CampaignId) -> Result<bool, CoordinatorError> {
        let moved = self.store.transition_status(
            campaign_id,
            &[CampaignStatus::Completed, CampaignStatus::CompletedWithErrors],
            CampaignStatus::ReadyForReview,
            None,
        )?;
        if moved {
            info!(%campaign_id, "campaign handed off for review");
        }
        Ok(moved)
    }

    /// Publish the follow-up work of a succeeded unit. Returns the number of
    /// messages published.
    pub fn advance(
        &self,
        campaign: &Campaign,
        unit: &WorkUnit,
        payload: &StagePayload,
        output_ref: &str,
    ) -> Result<usize, CoordinatorError> {
        let next_payload = payload.with_output(unit.stage, output_ref);
        let published = match unit.stage {
            Stage::Enrichment => {
                let mut n = 0;
                for product in &campaign.config.products {
                    let next = WorkUnit::new(
                        unit.campaign_id,
                        unit.correlation_id,
                        Stage::ContentGeneration,
                        unit.locale.clone(),
                        Some(product.id.clone()),
                        None,
                        unit.revision,
                    )?;
                    self.publish_unit(&next, next_payload.clone())?;
                    n += 1;
                }
                n
            }
            Stage::ContentGeneration => {
                let matrix = self.store.completion_matrix(unit.campaign_id)?;
                let ratios = match unit.aspect_ratio {
                    Some(ar) => vec![ar],
                    None => campaign.config.aspect_ratios.clone(),
                };
                let Some(product_id) = unit.product_id.clone() else {
                    return Err(DomainError::invariant("content unit without product").into());
                };
                let mut n = 0;
                for ar in ratios {
                    let tuple = CompletionTuple::new(unit.locale.clone(), product_id.clone(), ar);
                    let Some(progress) = matrix.progress(&tuple) else {
                        continue;
                    };
                    if progress.revision != unit.revision {
                        debug!(tuple = %tuple, unit_revision = unit.revision, current = progress.revision, "skipping superseded tuple");
                        continue;
                    }
                    let next = WorkUnit::new(
                        unit.campaign_id,
                        unit.correlation_id,
                        Stage::AssetGeneration,
                        unit.locale.clone(),
                        Some(product_id.clone()),
                        Some(ar),
                        unit.revision,
                    )?;
                    self.publish_unit(&next, next_payload.clone().with_seed(progress.seed))?;
                    n += 1;
                }
                n
            }
            Stage::AssetGeneration | Stage::Composition => {
                let Some(stage) = unit.stage.next() else {
                    return Err(DomainError::invariant(format!("{} has no next stage", unit.stage)).into());
                };
                self.publish_unit(&unit.at_stage(stage)?, next_payload)?;
                1
            }
            Stage::Finalization => {
                let envelope = MessageEnvelope::for_unit(unit, next_payload, Utc::now());
                self.bus
                    .publish(TERMINAL_SUBJECT, envelope.to_json()?, envelope.headers())?;
                1
            }
        };

        debug!(
            campaign_id = %unit.campaign_id,
            idempotency_key = %unit.idempotency_key,
            stage = %unit.stage,
            published,
            "fan-out complete"
        );
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creatiflow_core::{
        AudienceProfile, BrandConfig, CorrelationId, OutputSpec, Product, StageResult,
    };
    use creatiflow_events::InMemoryBus;

    use crate::store::InMemoryPipelineStore;

    fn config() -> CampaignConfig {
        CampaignConfig {
            name: "c1".into(),
            products: vec![Product {
                id: ProductId::new("serum").unwrap(),
                name: "Serum".into(),
                description: String::new(),
            }],
            target_locales: vec![Locale::new("en").unwrap(), Locale::new("de").unwrap()],
            aspect_ratios: vec![AspectRatio::Square, AspectRatio::Portrait],
            messages: Default::default(),
            audience: AudienceProfile::default(),
            brand: BrandConfig::default(),
            output: OutputSpec::default(),
        }
    }

    fn setup() -> (PipelineCoordinator, Arc<InMemoryPipelineStore>, InMemoryBus) {
        let store = Arc::new(InMemoryPipelineStore::new());
        let bus = InMemoryBus::new();
        let coordinator = PipelineCoordinator::new(store.clone(), Arc::new(bus.clone()));
        (coordinator, store, bus)
    }

    #[test]
    fn submission_fans_out_one_enrichment_per_locale() {
        let (coordinator, _, bus) = setup();
        let id = coordinator.submit_campaign(config()).unwrap();

        let published = bus.published(Stage::Enrichment.request_subject());
        assert_eq!(published.len(), 2);
        let view = coordinator.get_campaign_status(id).unwrap();
        assert_eq!(view.status, CampaignStatus::Processing);
        assert_eq!(view.required_count, 4);
        assert_eq!(view.done_count, 0);
    }

    #[test]
    fn invalid_brief_is_rejected_before_persisting() {
        let (coordinator, _, bus) = setup();
        let mut brief = config();
        brief.products.clear();
        let err = coordinator.submit_campaign(brief).unwrap_err();
        assert!(matches!(err, CoordinatorError::Domain(DomainError::Validation(_))));
        assert!(bus.published(">").is_empty());
        assert_eq!(err.failure_detail().code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn bus_outage_at_submission_fails_the_campaign() {
        let (coordinator, store, bus) = setup();
        bus.inject_publish_failures(Stage::Enrichment.request_subject(), 1);
        let err = coordinator.submit_campaign(config()).unwrap_err();
        assert!(matches!(err, CoordinatorError::Bus(_)));
        assert!(err.is_transient());

        let campaign = store.campaigns().pop().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Failed);
        assert_eq!(campaign.failure.unwrap().code, ErrorCode::BusUnavailable);
    }

    #[test]
    fn content_fan_out_covers_every_ratio() {
        let (coordinator, store, bus) = setup();
        let id = coordinator.submit_campaign(config()).unwrap();
        let campaign = store.get_campaign(id).unwrap();
        let unit = WorkUnit::new(
            id,
            campaign.correlation_id,
            Stage::ContentGeneration,
            Locale::new("en").unwrap(),
            Some(ProductId::new("serum").unwrap()),
            None,
            0,
        )
        .unwrap();

        let n = coordinator
            .advance(&campaign, &unit, &StagePayload::default(), "mem://copy")
            .unwrap();
        assert_eq!(n, 2);
        let assets = bus.published(Stage::AssetGeneration.request_subject());
        assert_eq!(assets.len(), 2);
        for message in assets {
            let env: MessageEnvelope<StagePayload> = MessageEnvelope::from_json(&message.payload).unwrap();
            assert_eq!(env.payload().content_ref.as_deref(), Some("mem://copy"));
            assert!(env.payload().seed.is_some());
        }
    }

    #[test]
    fn revision_requires_locale_context() {
        let (coordinator, _, _) = setup();
        let id = coordinator.submit_campaign(config()).unwrap();
        let err = coordinator
            .request_revision(RevisionRequest {
                campaign_id: id,
                locale: Locale::new("en").unwrap(),
                product_id: ProductId::new("serum").unwrap(),
                aspect_ratio: AspectRatio::Square,
                feedback: "warmer".into(),
                requested_by: None,
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidState { .. }));
    }

    #[test]
    fn revision_restarts_one_tuple_at_content() {
        let (coordinator, store, bus) = setup();
        let id = coordinator.submit_campaign(config()).unwrap();
        let campaign = store.get_campaign(id).unwrap();
        let en = Locale::new("en").unwrap();
        let enrichment = WorkUnit::new(id, campaign.correlation_id, Stage::Enrichment, en.clone(), None, None, 0).unwrap();
        store
            .record_stage_result(&StageResult::succeeded(&enrichment, "mem://ctx/en", Utc::now()))
            .unwrap();

        let request = RevisionRequest {
            campaign_id: id,
            locale: en,
            product_id: ProductId::new("serum").unwrap(),
            aspect_ratio: AspectRatio::Portrait,
            feedback: "less text".into(),
            requested_by: Some("reviewer@example.com".into()),
        };
        assert_eq!(coordinator.request_revision(request.clone()).unwrap(), 1);
        assert_eq!(coordinator.request_revision(request).unwrap(), 2);

        let content = bus.published(Stage::ContentGeneration.request_subject());
        let env: MessageEnvelope<StagePayload> = MessageEnvelope::from_json(&content[1].payload).unwrap();
        let unit = env.work_unit().unwrap();
        assert_eq!(unit.revision, 2);
        assert_eq!(unit.aspect_ratio, Some(AspectRatio::Portrait));
        let feedback = env.payload().feedback.clone().unwrap();
        assert_eq!(feedback.from_revision, 1);
        assert_eq!(feedback.feedback, "less text");
        assert_eq!(env.payload().context_ref.as_deref(), Some("mem://ctx/en"));
    }

    #[test]
    fn units_are_superseded_only_when_every_covered_tuple_moved_on() {
        let tuple_sq = CompletionTuple::new(
            Locale::new("en").unwrap(),
            ProductId::new("serum").unwrap(),
            AspectRatio::Square,
        );
        let tuple_pt = CompletionTuple::new(
            Locale::new("en").unwrap(),
            ProductId::new("serum").unwrap(),
            AspectRatio::Portrait,
        );
        let id = CampaignId::new();
        let mut matrix = CompletionMatrix::new(id, vec![tuple_sq.clone(), tuple_pt.clone()], |_| 1);
        let content = WorkUnit::new(
            id,
            CorrelationId::new(),
            Stage::ContentGeneration,
            tuple_sq.locale.clone(),
            Some(tuple_sq.product_id.clone()),
            None,
            0,
        )
        .unwrap();
        let asset = WorkUnit::new(
            id,
            content.correlation_id,
            Stage::AssetGeneration,
            tuple_sq.locale.clone(),
            Some(tuple_sq.product_id.clone()),
            Some(AspectRatio::Square),
            0,
        )
        .unwrap();

        matrix.advance_revision(&tuple_sq, 5).unwrap();
        assert!(is_superseded(&matrix, &asset));
        assert!(!is_superseded(&matrix, &content));

        matrix.advance_revision(&tuple_pt, 5).unwrap();
        assert!(is_superseded(&matrix, &content));
    }
}
