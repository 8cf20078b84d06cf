//! Generic stage replica: drives one [`StageHandler`] against its durable
//! consumer group.
//!
//! Per delivery:
//! 1. decode the envelope and rebuild the work unit (malformed → dead letter)
//! 2. drop units of failed campaigns and units superseded by a newer revision
//! 3. start an attempt; a unit that already succeeded only replays its
//!    pending fan-out
//! 4. validate, process, persist the result (first write wins), publish the
//!    next stage, mark the fan-out done
//! 5. ack only once every step above is durable
//!
//! Recoverable errors nak; fatal ones are dead-lettered explicitly and acked
//! so they stop consuming retry budget.

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use creatiflow_core::{
    AttemptStart, Campaign, CampaignStatus, ErrorCode, FailureDetail, Stage, StageResult, WorkUnit,
};
use creatiflow_events::{
    BusError, ConsumerOptions, DeadLetterRecord, Delivery, MessageEnvelope, StageError, StageHandler,
    StageInput, StagePayload,
};

use crate::config::StageConfig;
use crate::coordinator::{PipelineCoordinator, is_superseded};
use crate::store::{StoreError, UpsertOutcome};

use super::{DeliveryProcessor, Disposition};

enum Settle {
    Ack(Disposition),
    Nak(FailureDetail),
    DeadLetter(FailureDetail),
}

fn storage_failure(err: &StoreError) -> FailureDetail {
    FailureDetail::new(ErrorCode::StorageError, err.to_string())
}

/// Durable consumer name of a stage, e.g. `asset-generation`.
pub fn durable_name(stage: Stage) -> String {
    stage.as_str().replace('_', "-")
}

pub struct StageWorker<H> {
    handler: H,
    coordinator: PipelineCoordinator,
}

impl<H: StageHandler> StageWorker<H> {
    pub fn new(handler: H, coordinator: PipelineCoordinator) -> Self {
        Self { handler, coordinator }
    }

    pub fn stage(&self) -> Stage {
        self.handler.stage()
    }

    pub fn consumer_options(&self, config: &StageConfig) -> ConsumerOptions {
        let stage = self.stage();
        config.consumer_options(stage.request_subject(), durable_name(stage))
    }

    fn run(&self, unit: &WorkUnit, payload: &StagePayload, delivery_count: u32) -> Settle {
        let store = self.coordinator.store();
        let campaign = match store.get_campaign(unit.campaign_id) {
            Ok(c) => c,
            Err(StoreError::NotFound(id)) => {
                return Settle::DeadLetter(FailureDetail::new(
                    ErrorCode::ValidationFailed,
                    format!("unknown campaign {id}"),
                ));
            }
            Err(e) => return Settle::Nak(storage_failure(&e)),
        };
        if campaign.status == CampaignStatus::Failed {
            info!("campaign failed; discarding unit");
            return Settle::Ack(Disposition::Discarded);
        }
        match store.completion_matrix(unit.campaign_id) {
            Ok(matrix) if is_superseded(&matrix, unit) => {
                info!("unit superseded by a newer revision; discarding");
                return Settle::Ack(Disposition::Discarded);
            }
            Ok(_) => {}
            Err(e) => return Settle::Nak(storage_failure(&e)),
        }

        match store.begin_attempt(unit) {
            Ok(AttemptStart::Started { attempt }) => debug!(attempt, "attempt started"),
            Ok(AttemptStart::AlreadySucceeded) => {
                return match store.get_stage_result(unit.idempotency_key) {
                    Ok(Some(result)) => self.publish_downstream(&campaign, unit, payload, &result),
                    Ok(None) => {
                        warn!("unit succeeded without a stored result");
                        Settle::Ack(Disposition::Duplicate)
                    }
                    Err(e) => Settle::Nak(storage_failure(&e)),
                };
            }
            Ok(AttemptStart::AlreadyFailedPermanent) => return Settle::Ack(Disposition::Duplicate),
            Err(e) => return Settle::Nak(storage_failure(&e)),
        }

        let input = StageInput {
            unit,
            campaign: &campaign,
            payload,
            delivery_count,
        };
        let request = match self.handler.validate(&input) {
            Ok(r) => r,
            Err(e) => return Settle::DeadLetter(StageError::from(e).detail()),
        };

        match self.handler.process(request) {
            Ok(output) => {
                let result = StageResult::succeeded(unit, output.output_ref, Utc::now());
                let stored = match store.record_stage_result(&result) {
                    Ok(UpsertOutcome::Inserted) => result,
                    Ok(UpsertOutcome::Existing(existing)) => {
                        debug!("result already recorded by another attempt");
                        existing
                    }
                    Err(e) => return Settle::Nak(storage_failure(&e)),
                };
                self.publish_downstream(&campaign, unit, payload, &stored)
            }
            Err(StageError::Recoverable(detail)) => {
                if let Err(e) = store.fail_unit(unit, &detail, false) {
                    warn!(error = %e, "could not record failed attempt");
                }
                Settle::Nak(detail)
            }
            Err(StageError::Fatal(detail)) => Settle::DeadLetter(detail),
            Err(StageError::Conflict(reason)) => {
                debug!(%reason, "lost a race to another attempt");
                Settle::Ack(Disposition::Duplicate)
            }
        }
    }

    fn publish_downstream(
        &self,
        campaign: &Campaign,
        unit: &WorkUnit,
        payload: &StagePayload,
        result: &StageResult,
    ) -> Settle {
        if result.downstream_published {
            return Settle::Ack(Disposition::Duplicate);
        }
        let Some(output_ref) = result.output_ref() else {
            return Settle::Ack(Disposition::Duplicate);
        };
        match self.coordinator.advance(campaign, unit, payload, output_ref) {
            Ok(published) => debug!(published, "next stage published"),
            Err(e) if e.is_transient() => return Settle::Nak(e.failure_detail()),
            Err(e) => return Settle::DeadLetter(e.failure_detail()),
        }
        if let Err(e) = self.coordinator.store().mark_downstream_published(unit.idempotency_key) {
            return Settle::Nak(storage_failure(&e));
        }
        Settle::Ack(Disposition::Processed)
    }

    fn dead_letter(
        &self,
        delivery: Delivery,
        unit: Option<&WorkUnit>,
        detail: FailureDetail,
    ) -> Result<Disposition, BusError> {
        let record = DeadLetterRecord::new(delivery.message(), delivery.delivery_count(), detail.clone(), Utc::now());
        let subject = record.subject();
        if let Err(e) = self
            .coordinator
            .bus()
            .publish(&subject, record.to_payload()?, delivery.headers().clone())
        {
            warn!(error = %e, %subject, "dead-letter publish failed; retrying via nak");
            delivery.nak(&detail)?;
            return Ok(Disposition::Retry);
        }
        warn!(%subject, code = %detail.code, message = %detail.message, "unit dead-lettered");

        if let Some(unit) = unit {
            let store = self.coordinator.store();
            if let Err(e) = store.record_stage_result(&StageResult::failed(unit, detail, Utc::now())) {
                warn!(error = %e, "could not record failed result");
            }
        }
        delivery.ack()?;
        Ok(Disposition::DeadLettered)
    }
}

impl<H: StageHandler> DeliveryProcessor for StageWorker<H> {
    fn handle(&self, delivery: Delivery) -> Result<Disposition, BusError> {
        let envelope = match MessageEnvelope::<StagePayload>::from_json(delivery.payload()) {
            Ok(e) => e,
            Err(e) => {
                let detail = FailureDetail::new(ErrorCode::ValidationFailed, e.to_string());
                return self.dead_letter(delivery, None, detail);
            }
        };
        let unit = match envelope.work_unit() {
            Ok(u) if u.stage == self.stage() => u,
            Ok(u) => {
                let detail = FailureDetail::new(
                    ErrorCode::ValidationFailed,
                    format!("{} unit delivered to {} worker", u.stage, self.stage()),
                );
                return self.dead_letter(delivery, None, detail);
            }
            Err(e) => {
                let detail = FailureDetail::new(ErrorCode::ValidationFailed, e.to_string());
                return self.dead_letter(delivery, None, detail);
            }
        };

        let span = info_span!(
            "stage_attempt",
            campaign_id = %unit.campaign_id,
            correlation_id = %unit.correlation_id,
            idempotency_key = %unit.idempotency_key,
            stage = %unit.stage,
            revision = unit.revision,
            delivery = delivery.delivery_count(),
        );
        let _entered = span.enter();

        match self.run(&unit, envelope.payload(), delivery.delivery_count()) {
            Settle::Ack(disposition) => {
                delivery.ack()?;
                Ok(disposition)
            }
            Settle::Nak(detail) => {
                warn!(
                    code = %detail.code,
                    message = %detail.message,
                    final_attempt = delivery.is_final_attempt(),
                    "attempt failed; nak"
                );
                delivery.nak(&detail)?;
                Ok(Disposition::Retry)
            }
            Settle::DeadLetter(detail) => self.dead_letter(delivery, Some(&unit), detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use creatiflow_core::{
        AspectRatio, AudienceProfile, BrandConfig, CampaignConfig, Locale, OutputSpec, Product,
        ProductId, WorkUnitState,
    };
    use creatiflow_events::{
        BackoffPolicy, InMemoryBus, MessageBus, StageOutput, ValidationError,
        dead_letter::DEAD_LETTER_FILTER,
    };

    use crate::store::{InMemoryPipelineStore, PipelineStore};

    const TICK: Duration = Duration::from_millis(50);

    /// Enrichment stand-in whose behaviour is scripted per call.
    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        fatal: bool,
    }

    impl StageHandler for Scripted {
        type Request = ();

        fn stage(&self) -> Stage {
            Stage::Enrichment
        }

        fn validate(&self, input: &StageInput<'_>) -> Result<(), ValidationError> {
            if input.campaign.config.targets_locale(&input.unit.locale) {
                Ok(())
            } else {
                Err(ValidationError::new("locale not targeted"))
            }
        }

        fn process(&self, _: ()) -> Result<StageOutput, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(StageError::fatal(ErrorCode::InvalidInput, "refused"));
            }
            if n < self.fail_first {
                return Err(StageError::recoverable(ErrorCode::RateLimited, "busy"));
            }
            Ok(StageOutput::new("mem://ctx"))
        }
    }

    fn brief() -> CampaignConfig {
        CampaignConfig {
            name: "c".into(),
            products: vec![Product {
                id: ProductId::new("serum").unwrap(),
                name: "Serum".into(),
                description: String::new(),
            }],
            target_locales: vec![Locale::new("en").unwrap()],
            aspect_ratios: vec![AspectRatio::Square],
            messages: BTreeMap::new(),
            audience: AudienceProfile::default(),
            brand: BrandConfig::default(),
            output: OutputSpec::default(),
        }
    }

    fn setup(handler: Scripted) -> (StageWorker<Scripted>, Arc<InMemoryPipelineStore>, InMemoryBus) {
        let store = Arc::new(InMemoryPipelineStore::new());
        let bus = InMemoryBus::new();
        let coordinator = PipelineCoordinator::new(store.clone(), Arc::new(bus.clone()));
        (StageWorker::new(handler, coordinator), store, bus)
    }

    fn options(worker: &StageWorker<Scripted>) -> ConsumerOptions {
        let mut config = StageConfig::new(1, 3, Duration::from_secs(5));
        config.backoff = BackoffPolicy::none();
        worker.consumer_options(&config)
    }

    #[test]
    fn durable_names_are_kebab_case() {
        assert_eq!(durable_name(Stage::AssetGeneration), "asset-generation");
        assert_eq!(durable_name(Stage::Enrichment), "enrichment");
    }

    #[test]
    fn success_fans_out_to_content() {
        let (worker, store, bus) = setup(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: false,
        });
        let id = worker.coordinator.submit_campaign(brief()).unwrap();
        let mut sub = bus.subscribe(options(&worker)).unwrap();

        let delivery = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(worker.handle(delivery).unwrap(), Disposition::Processed);
        assert_eq!(bus.published(Stage::ContentGeneration.request_subject()).len(), 1);
        assert_eq!(store.unit_state_counts(id).unwrap()[&Stage::Enrichment].succeeded, 1);
    }

    #[test]
    fn recoverable_failure_naks_then_succeeds() {
        let (worker, store, bus) = setup(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 1,
            fatal: false,
        });
        let id = worker.coordinator.submit_campaign(brief()).unwrap();
        let mut sub = bus.subscribe(options(&worker)).unwrap();

        let first = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(worker.handle(first).unwrap(), Disposition::Retry);
        assert_eq!(store.unit_state_counts(id).unwrap()[&Stage::Enrichment].failed, 1);

        let second = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(second.delivery_count(), 2);
        assert_eq!(worker.handle(second).unwrap(), Disposition::Processed);
        let counts = store.unit_state_counts(id).unwrap()[&Stage::Enrichment];
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.total(), 1);
    }

    #[test]
    fn fatal_failure_is_dead_lettered_on_first_attempt() {
        let (worker, store, bus) = setup(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: true,
        });
        let id = worker.coordinator.submit_campaign(brief()).unwrap();
        let mut sub = bus.subscribe(options(&worker)).unwrap();

        let delivery = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(worker.handle(delivery).unwrap(), Disposition::DeadLettered);

        let dead = bus.published(DEAD_LETTER_FILTER);
        assert_eq!(dead.len(), 1);
        let record = DeadLetterRecord::from_payload(&dead[0].payload).unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.code, ErrorCode::InvalidInput);
        assert!(sub.fetch(TICK).unwrap().is_none());

        let campaign = store.get_campaign(id).unwrap();
        let key = creatiflow_core::IdempotencyKey::derive(
            id,
            &Locale::new("en").unwrap(),
            None,
            None,
            Stage::Enrichment,
            0,
        );
        assert_eq!(
            store.work_unit(key).unwrap().unwrap().state,
            WorkUnitState::FailedPermanent
        );
        assert_eq!(campaign.status, CampaignStatus::Processing);
    }

    #[test]
    fn garbage_payload_is_dead_lettered() {
        let (worker, _, bus) = setup(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: false,
        });
        bus.publish(
            Stage::Enrichment.request_subject(),
            serde_json::json!({ "hello": "world" }),
            Default::default(),
        )
        .unwrap();
        let mut sub = bus.subscribe(options(&worker)).unwrap();
        let delivery = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(worker.handle(delivery).unwrap(), Disposition::DeadLettered);
        assert_eq!(worker.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn units_of_failed_campaigns_are_discarded() {
        let (worker, store, bus) = setup(Scripted {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: false,
        });
        let id = worker.coordinator.submit_campaign(brief()).unwrap();
        store
            .transition_status(id, &[CampaignStatus::Processing], CampaignStatus::Failed, None)
            .unwrap();
        let mut sub = bus.subscribe(options(&worker)).unwrap();
        let delivery = sub.fetch(TICK).unwrap().unwrap();
        assert_eq!(worker.handle(delivery).unwrap(), Disposition::Discarded);
        assert_eq!(worker.handler.calls.load(Ordering::SeqCst), 0);
    }
}
