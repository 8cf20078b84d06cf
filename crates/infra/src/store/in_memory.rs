use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::Utc;

use creatiflow_core::{
    AttemptStart, Campaign, CampaignId, CampaignStatus, CompletionMatrix, CompletionTuple,
    CorrelationId, FailureDetail, IdempotencyKey, RecordOutcome, RevisionTicket, StageResult,
    TupleOutcome, WorkUnit, WorkUnitRecord,
};

use super::{
    PipelineStore, StoreError, UnitStateCounts, UpsertOutcome, apply_result,
    notification_claimable, reopen_for_revision, settled_status,
};

#[derive(Debug)]
struct CampaignRow {
    campaign: Campaign,
    matrix: CompletionMatrix,
}

#[derive(Debug, Default)]
struct State {
    campaigns: HashMap<CampaignId, CampaignRow>,
    units: HashMap<IdempotencyKey, WorkUnitRecord>,
    results: HashMap<IdempotencyKey, StageResult>,
}

/// In-memory pipeline store.
///
/// Intended for tests/dev. A single lock serialises every mutation, which
/// gives the same guarantees as the row-level guards of the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    state: RwLock<State>,
    faults: Mutex<HashMap<&'static str, u32>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `operation` fail with a storage error.
    ///
    /// `operation` is the trait method name, e.g. `"record_stage_result"`.
    pub fn inject_failures(&self, operation: &'static str, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.entry(operation).or_default() += count;
        }
    }

    /// Snapshot of every stored campaign, oldest first.
    pub fn campaigns(&self) -> Vec<Campaign> {
        let Ok(state) = self.read() else {
            return Vec::new();
        };
        let mut campaigns: Vec<Campaign> = state.campaigns.values().map(|r| r.campaign.clone()).collect();
        campaigns.sort_by_key(|c| c.created_at);
        campaigns
    }

    fn check_fault(&self, operation: &'static str) -> Result<(), StoreError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StoreError::Storage("fault table lock poisoned".into()))?;
        match faults.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Storage(format!("injected failure in {operation}")))
            }
            _ => Ok(()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))
    }
}

fn row_mut(state: &mut State, id: CampaignId) -> Result<&mut CampaignRow, StoreError> {
    state.campaigns.get_mut(&id).ok_or(StoreError::NotFound(id))
}

impl PipelineStore for InMemoryPipelineStore {
    fn health_check(&self) -> Result<(), StoreError> {
        self.check_fault("health_check")?;
        self.read().map(|_| ())
    }

    fn insert_campaign(&self, campaign: &Campaign, matrix: &CompletionMatrix) -> Result<(), StoreError> {
        self.check_fault("insert_campaign")?;
        if matrix.campaign_id() != campaign.id {
            return Err(StoreError::Conflict(format!(
                "matrix belongs to {}, not {}",
                matrix.campaign_id(),
                campaign.id
            )));
        }
        let mut state = self.write()?;
        if state.campaigns.contains_key(&campaign.id) {
            return Err(StoreError::AlreadyExists(campaign.id));
        }
        state.campaigns.insert(
            campaign.id,
            CampaignRow {
                campaign: campaign.clone(),
                matrix: matrix.clone(),
            },
        );
        Ok(())
    }

    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError> {
        self.check_fault("get_campaign")?;
        self.read()?
            .campaigns
            .get(&id)
            .map(|row| row.campaign.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Campaign>, StoreError> {
        self.check_fault("find_by_correlation")?;
        Ok(self
            .read()?
            .campaigns
            .values()
            .find(|row| row.campaign.correlation_id == correlation_id)
            .map(|row| row.campaign.clone()))
    }

    fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        failure: Option<FailureDetail>,
    ) -> Result<bool, StoreError> {
        self.check_fault("transition_status")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        if !from.contains(&row.campaign.status) {
            return Ok(false);
        }
        row.campaign.status = to;
        if failure.is_some() {
            row.campaign.failure = failure;
        }
        row.campaign.updated_at = Utc::now();
        Ok(true)
    }

    fn claim_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<bool, StoreError> {
        self.check_fault("claim_ready_notification")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        if !notification_claimable(&row.campaign, epoch) {
            return Ok(false);
        }
        row.campaign.notified_epoch = Some(epoch);
        Ok(true)
    }

    fn release_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<(), StoreError> {
        self.check_fault("release_ready_notification")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        if row.campaign.notified_epoch == Some(epoch) {
            row.campaign.notified_epoch = None;
        }
        Ok(())
    }

    fn completion_matrix(&self, id: CampaignId) -> Result<CompletionMatrix, StoreError> {
        self.check_fault("completion_matrix")?;
        self.read()?
            .campaigns
            .get(&id)
            .map(|row| row.matrix.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn record_outcome(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        revision: u32,
        outcome: TupleOutcome,
        source: IdempotencyKey,
    ) -> Result<RecordOutcome, StoreError> {
        self.check_fault("record_outcome")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        Ok(row.matrix.record(tuple, revision, outcome, source))
    }

    fn advance_revision(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        fresh_seed: u64,
    ) -> Result<RevisionTicket, StoreError> {
        self.check_fault("advance_revision")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        // Validate against a copy so a rejected reopen leaves the matrix untouched.
        let mut campaign = row.campaign.clone();
        reopen_for_revision(&mut campaign, Utc::now())?;
        let ticket = row.matrix.advance_revision(tuple, fresh_seed)?;
        row.campaign = campaign;
        Ok(ticket)
    }

    fn settle_campaign(&self, id: CampaignId) -> Result<Option<CampaignStatus>, StoreError> {
        self.check_fault("settle_campaign")?;
        let mut state = self.write()?;
        let row = row_mut(&mut state, id)?;
        if row.campaign.status != CampaignStatus::Processing {
            return Ok(None);
        }
        let Some(status) = settled_status(&row.matrix) else {
            return Ok(None);
        };
        row.campaign.status = status;
        row.campaign.updated_at = Utc::now();
        Ok(Some(status))
    }

    fn begin_attempt(&self, unit: &WorkUnit) -> Result<AttemptStart, StoreError> {
        self.check_fault("begin_attempt")?;
        let now = Utc::now();
        let mut state = self.write()?;
        let record = state
            .units
            .entry(unit.idempotency_key)
            .or_insert_with(|| WorkUnitRecord::requested(unit.clone(), now));
        Ok(record.begin_attempt(now)?)
    }

    fn fail_unit(&self, unit: &WorkUnit, error: &FailureDetail, permanent: bool) -> Result<(), StoreError> {
        self.check_fault("fail_unit")?;
        let now = Utc::now();
        let mut state = self.write()?;
        let record = state
            .units
            .entry(unit.idempotency_key)
            .or_insert_with(|| WorkUnitRecord::requested(unit.clone(), now));
        Ok(record.fail(error.clone(), permanent, now)?)
    }

    fn work_unit(&self, key: IdempotencyKey) -> Result<Option<WorkUnitRecord>, StoreError> {
        self.check_fault("work_unit")?;
        Ok(self.read()?.units.get(&key).cloned())
    }

    fn unit_state_counts(&self, id: CampaignId) -> Result<UnitStateCounts, StoreError> {
        self.check_fault("unit_state_counts")?;
        let state = self.read()?;
        if !state.campaigns.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut counts = UnitStateCounts::new();
        for record in state.units.values().filter(|r| r.unit.campaign_id == id) {
            counts.entry(record.unit.stage).or_default().add(record.state);
        }
        Ok(counts)
    }

    fn record_stage_result(&self, result: &StageResult) -> Result<UpsertOutcome, StoreError> {
        self.check_fault("record_stage_result")?;
        let now = Utc::now();
        let mut state = self.write()?;
        if let Some(existing) = state.results.get(&result.idempotency_key) {
            return Ok(UpsertOutcome::Existing(existing.clone()));
        }
        if let Some(record) = state.units.get_mut(&result.idempotency_key) {
            apply_result(record, result, now)?;
        }
        state.results.insert(result.idempotency_key, result.clone());
        Ok(UpsertOutcome::Inserted)
    }

    fn get_stage_result(&self, key: IdempotencyKey) -> Result<Option<StageResult>, StoreError> {
        self.check_fault("get_stage_result")?;
        Ok(self.read()?.results.get(&key).cloned())
    }

    fn mark_downstream_published(&self, key: IdempotencyKey) -> Result<(), StoreError> {
        self.check_fault("mark_downstream_published")?;
        let mut state = self.write()?;
        match state.results.get_mut(&key) {
            Some(result) => {
                result.downstream_published = true;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("no stage result for {key}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    use creatiflow_core::{
        AspectRatio, AudienceProfile, BrandConfig, CampaignConfig, ErrorCode, Locale, OutputSpec,
        Product, ProductId, Stage, WorkUnitState,
    };

    fn config(locales: &[&str], ratios: &[AspectRatio]) -> CampaignConfig {
        CampaignConfig {
            name: "c1".into(),
            products: vec![Product {
                id: ProductId::new("serum").unwrap(),
                name: "Serum".into(),
                description: String::new(),
            }],
            target_locales: locales.iter().map(|l| Locale::new(*l).unwrap()).collect(),
            aspect_ratios: ratios.to_vec(),
            messages: BTreeMap::new(),
            audience: AudienceProfile::default(),
            brand: BrandConfig::default(),
            output: OutputSpec::default(),
        }
    }

    fn seeded(store: &InMemoryPipelineStore, locales: &[&str], ratios: &[AspectRatio]) -> Campaign {
        let mut campaign = Campaign::draft(config(locales, ratios), Utc::now()).unwrap();
        campaign.status = CampaignStatus::Processing;
        let matrix = CompletionMatrix::new(campaign.id, campaign.config.required_tuples(), |_| 7);
        store.insert_campaign(&campaign, &matrix).unwrap();
        campaign
    }

    fn finalization_unit(campaign: &Campaign, tuple: &CompletionTuple, revision: u32) -> WorkUnit {
        WorkUnit::new(
            campaign.id,
            campaign.correlation_id,
            Stage::Finalization,
            tuple.locale.clone(),
            Some(tuple.product_id.clone()),
            Some(tuple.aspect_ratio),
            revision,
        )
        .unwrap()
    }

    #[test]
    fn stage_result_first_write_wins() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square]);
        let tuple = campaign.config.required_tuples().remove(0);
        let unit = finalization_unit(&campaign, &tuple, 0);

        assert_eq!(store.begin_attempt(&unit).unwrap(), AttemptStart::Started { attempt: 1 });
        let first = StageResult::succeeded(&unit, "mem://a", Utc::now());
        assert_eq!(store.record_stage_result(&first).unwrap(), UpsertOutcome::Inserted);

        let second = StageResult::succeeded(&unit, "mem://b", Utc::now());
        match store.record_stage_result(&second).unwrap() {
            UpsertOutcome::Existing(existing) => assert_eq!(existing.output_ref(), Some("mem://a")),
            other => panic!("expected existing, got {other:?}"),
        }
        let record = store.work_unit(unit.idempotency_key).unwrap().unwrap();
        assert_eq!(record.state, WorkUnitState::Succeeded);
        assert_eq!(store.begin_attempt(&unit).unwrap(), AttemptStart::AlreadySucceeded);
    }

    #[test]
    fn settle_transitions_once() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square, AspectRatio::Portrait]);
        let tuples = campaign.config.required_tuples();
        for t in &tuples {
            let unit = finalization_unit(&campaign, t, 0);
            store
                .record_outcome(campaign.id, t, 0, TupleOutcome::Done, unit.idempotency_key)
                .unwrap();
        }
        assert_eq!(store.settle_campaign(campaign.id).unwrap(), Some(CampaignStatus::Completed));
        assert_eq!(store.settle_campaign(campaign.id).unwrap(), None);
        assert!(store.claim_ready_notification(campaign.id, 1).unwrap());
        assert!(!store.claim_ready_notification(campaign.id, 1).unwrap());
    }

    #[test]
    fn concurrent_settlers_see_one_transition() {
        let store = Arc::new(InMemoryPipelineStore::new());
        let campaign = seeded(&store, &["en", "de"], &[AspectRatio::Square]);
        let tuples = campaign.config.required_tuples();

        let handles: Vec<_> = tuples
            .into_iter()
            .map(|t| {
                let store = Arc::clone(&store);
                let campaign = campaign.clone();
                thread::spawn(move || {
                    let unit = finalization_unit(&campaign, &t, 0);
                    store
                        .record_outcome(campaign.id, &t, 0, TupleOutcome::Done, unit.idempotency_key)
                        .unwrap();
                    let settled = store.settle_campaign(campaign.id).unwrap();
                    let claimed = settled.is_some()
                        || store.get_campaign(campaign.id).unwrap().status == CampaignStatus::Completed;
                    (settled, claimed && store.claim_ready_notification(campaign.id, 1).unwrap())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(s, _)| s.is_some()).count(), 1);
        assert_eq!(results.iter().filter(|(_, claimed)| *claimed).count(), 1);
    }

    #[test]
    fn revision_reopens_completed_campaign_in_new_epoch() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square]);
        let tuple = campaign.config.required_tuples().remove(0);
        let unit = finalization_unit(&campaign, &tuple, 0);
        store
            .record_outcome(campaign.id, &tuple, 0, TupleOutcome::Done, unit.idempotency_key)
            .unwrap();
        store.settle_campaign(campaign.id).unwrap();
        assert!(store.claim_ready_notification(campaign.id, 1).unwrap());

        let ticket = store.advance_revision(campaign.id, &tuple, 99).unwrap();
        assert_eq!(ticket, RevisionTicket { revision: 1, seed: 7 });
        let reopened = store.get_campaign(campaign.id).unwrap();
        assert_eq!(reopened.status, CampaignStatus::Processing);
        assert_eq!(reopened.epoch, 2);
        assert!(!reopened.ready_notified());

        // stale result for revision 0 does not count
        assert_eq!(
            store
                .record_outcome(campaign.id, &tuple, 0, TupleOutcome::Done, unit.idempotency_key)
                .unwrap(),
            RecordOutcome::Stale
        );
        assert_eq!(store.settle_campaign(campaign.id).unwrap(), None);
    }

    #[test]
    fn failed_campaign_rejects_revisions() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square]);
        store
            .transition_status(
                campaign.id,
                &[CampaignStatus::Processing],
                CampaignStatus::Failed,
                Some(FailureDetail::new(ErrorCode::BusUnavailable, "down")),
            )
            .unwrap();
        let tuple = campaign.config.required_tuples().remove(0);
        assert!(matches!(
            store.advance_revision(campaign.id, &tuple, 1),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.completion_matrix(campaign.id).unwrap().current_revision(&tuple), Some(0));
    }

    #[test]
    fn failed_result_marks_unit_permanent() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square]);
        let tuple = campaign.config.required_tuples().remove(0);
        let unit = finalization_unit(&campaign, &tuple, 0);
        store.begin_attempt(&unit).unwrap();
        let failed = StageResult::failed(
            &unit,
            FailureDetail::new(ErrorCode::InvalidInput, "bad"),
            Utc::now(),
        );
        store.record_stage_result(&failed).unwrap();
        let counts = store.unit_state_counts(campaign.id).unwrap();
        assert_eq!(counts[&Stage::Finalization].failed_permanent, 1);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let store = InMemoryPipelineStore::new();
        let campaign = seeded(&store, &["en"], &[AspectRatio::Square]);
        store.inject_failures("get_campaign", 1);
        assert!(store.get_campaign(campaign.id).unwrap_err().is_transient());
        assert!(store.get_campaign(campaign.id).is_ok());
    }
}
