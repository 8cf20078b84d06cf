//! Work units: one stage's worth of work for one slice of a campaign.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dimension::{AspectRatio, CompletionTuple, Locale, ProductId};
use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, CorrelationId};
use crate::result::FailureDetail;

/// Pipeline stages in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Enrichment,
    ContentGeneration,
    AssetGeneration,
    Composition,
    Finalization,
}

/// Subject carrying terminal results of the final stage.
pub const TERMINAL_SUBJECT: &str = "text.overlay.done";

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Enrichment,
        Stage::ContentGeneration,
        Stage::AssetGeneration,
        Stage::Composition,
        Stage::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment",
            Stage::ContentGeneration => "content_generation",
            Stage::AssetGeneration => "asset_generation",
            Stage::Composition => "composition",
            Stage::Finalization => "finalization",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown stage '{s}'")))
    }

    /// Subject on which work units for this stage are requested.
    pub fn request_subject(&self) -> &'static str {
        match self {
            Stage::Enrichment => "context.enrich.request",
            Stage::ContentGeneration => "creative.generate.request",
            Stage::AssetGeneration => "image.generate.request",
            Stage::Composition => "brand.compose.request",
            Stage::Finalization => "text.overlay.request",
        }
    }

    pub fn from_request_subject(subject: &str) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.request_subject() == subject)
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Enrichment => Some(Stage::ContentGeneration),
            Stage::ContentGeneration => Some(Stage::AssetGeneration),
            Stage::AssetGeneration => Some(Stage::Composition),
            Stage::Composition => Some(Stage::Finalization),
            Stage::Finalization => None,
        }
    }

    /// Whether units of this stage always address a single completion tuple.
    pub fn is_tuple_scoped(&self) -> bool {
        matches!(
            self,
            Stage::AssetGeneration | Stage::Composition | Stage::Finalization
        )
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace for deriving idempotency keys (UUIDv5).
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_5f0e_93a2_4c51_8e07_2f4d_c0a1_b7e3);

/// Deterministic key of a work unit.
///
/// Derived from `(campaign_id, locale, product_id, aspect_ratio, stage, revision)`
/// so any redelivery of the same logical unit maps to the same key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn derive(
        campaign_id: CampaignId,
        locale: &Locale,
        product_id: Option<&ProductId>,
        aspect_ratio: Option<AspectRatio>,
        stage: Stage,
        revision: u32,
    ) -> Self {
        let name = format!(
            "{}|{}|{}|{}|{}|{}",
            campaign_id,
            locale,
            product_id.map(ProductId::as_str).unwrap_or("-"),
            aspect_ratio.map(|ar| ar.as_str()).unwrap_or("-"),
            stage.as_str(),
            revision
        );
        Self(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()))
    }

    /// Key for a campaign-level event (e.g. the ready notification of one
    /// processing round).
    pub fn for_campaign_event(campaign_id: CampaignId, event: &str, sequence: u32) -> Self {
        let name = format!("{campaign_id}|event|{event}|{sequence}");
        Self(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// One unit of stage work.
///
/// Scope by stage:
/// - enrichment: locale
/// - content generation: locale + product, optionally narrowed to one aspect
///   ratio (revision requests)
/// - asset / composition / finalization: locale + product + aspect ratio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub campaign_id: CampaignId,
    pub correlation_id: CorrelationId,
    pub stage: Stage,
    pub locale: Locale,
    pub product_id: Option<ProductId>,
    pub aspect_ratio: Option<AspectRatio>,
    pub revision: u32,
    pub idempotency_key: IdempotencyKey,
}

impl WorkUnit {
    pub fn new(
        campaign_id: CampaignId,
        correlation_id: CorrelationId,
        stage: Stage,
        locale: Locale,
        product_id: Option<ProductId>,
        aspect_ratio: Option<AspectRatio>,
        revision: u32,
    ) -> DomainResult<Self> {
        match stage {
            Stage::Enrichment if product_id.is_some() || aspect_ratio.is_some() => {
                return Err(DomainError::invariant("enrichment units are per locale only"));
            }
            Stage::ContentGeneration if product_id.is_none() => {
                return Err(DomainError::invariant("content units need a product"));
            }
            s if s.is_tuple_scoped() && (product_id.is_none() || aspect_ratio.is_none()) => {
                return Err(DomainError::invariant(format!(
                    "{s} units need product and aspect ratio"
                )));
            }
            _ => {}
        }

        let idempotency_key = IdempotencyKey::derive(
            campaign_id,
            &locale,
            product_id.as_ref(),
            aspect_ratio,
            stage,
            revision,
        );
        Ok(Self {
            campaign_id,
            correlation_id,
            stage,
            locale,
            product_id,
            aspect_ratio,
            revision,
            idempotency_key,
        })
    }

    /// The same slice of the campaign at the given stage.
    pub fn at_stage(&self, stage: Stage) -> DomainResult<Self> {
        Self::new(
            self.campaign_id,
            self.correlation_id,
            stage,
            self.locale.clone(),
            self.product_id.clone(),
            self.aspect_ratio,
            self.revision,
        )
    }

    /// The single tuple this unit addresses, if it is narrowed to one.
    pub fn tuple(&self) -> Option<CompletionTuple> {
        match (&self.product_id, self.aspect_ratio) {
            (Some(p), Some(ar)) => Some(CompletionTuple::new(self.locale.clone(), p.clone(), ar)),
            _ => None,
        }
    }

    /// Whether `tuple` falls inside this unit's scope.
    pub fn covers(&self, tuple: &CompletionTuple) -> bool {
        self.locale == tuple.locale
            && self.product_id.as_ref().is_none_or(|p| p == &tuple.product_id)
            && self.aspect_ratio.is_none_or(|ar| ar == tuple.aspect_ratio)
    }
}

/// Lifecycle of a work unit.
///
/// `Requested → InProgress → Succeeded | Failed`, `Failed → Requested` while
/// retry budget remains, otherwise `Failed → FailedPermanent`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitState {
    Requested,
    InProgress,
    Succeeded,
    Failed,
    FailedPermanent,
}

impl WorkUnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkUnitState::Requested => "requested",
            WorkUnitState::InProgress => "in_progress",
            WorkUnitState::Succeeded => "succeeded",
            WorkUnitState::Failed => "failed",
            WorkUnitState::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Ok(match s {
            "requested" => WorkUnitState::Requested,
            "in_progress" => WorkUnitState::InProgress,
            "succeeded" => WorkUnitState::Succeeded,
            "failed" => WorkUnitState::Failed,
            "failed_permanent" => WorkUnitState::FailedPermanent,
            other => return Err(DomainError::validation(format!("unknown unit state '{other}'"))),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkUnitState::Succeeded | WorkUnitState::FailedPermanent)
    }

    pub fn can_transition_to(&self, to: WorkUnitState) -> bool {
        use WorkUnitState::*;
        matches!(
            (self, to),
            (Requested, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (Failed, Requested)
                | (Failed, FailedPermanent)
        )
    }
}

/// What a redelivered attempt found when it tried to start.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptStart {
    Started { attempt: u32 },
    AlreadySucceeded,
    AlreadyFailedPermanent,
}

/// Persisted bookkeeping for one work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnitRecord {
    pub unit: WorkUnit,
    pub state: WorkUnitState,
    pub attempts: u32,
    pub last_error: Option<FailureDetail>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnitRecord {
    pub fn requested(unit: WorkUnit, now: DateTime<Utc>) -> Self {
        Self {
            unit,
            state: WorkUnitState::Requested,
            attempts: 0,
            last_error: None,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: WorkUnitState) -> DomainResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(DomainError::invariant(format!(
                "work unit {} cannot move {} -> {}",
                self.unit.idempotency_key,
                self.state.as_str(),
                to.as_str()
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Start (or restart) an attempt.
    ///
    /// An `InProgress` unit being started again means the previous attempt
    /// never acknowledged; it is routed through `Failed → Requested` first.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<AttemptStart> {
        match self.state {
            WorkUnitState::Succeeded => return Ok(AttemptStart::AlreadySucceeded),
            WorkUnitState::FailedPermanent => return Ok(AttemptStart::AlreadyFailedPermanent),
            WorkUnitState::InProgress => {
                self.transition(WorkUnitState::Failed)?;
                self.transition(WorkUnitState::Requested)?;
            }
            WorkUnitState::Failed => self.transition(WorkUnitState::Requested)?,
            WorkUnitState::Requested => {}
        }
        self.transition(WorkUnitState::InProgress)?;
        self.attempts += 1;
        self.updated_at = now;
        Ok(AttemptStart::Started {
            attempt: self.attempts,
        })
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state == WorkUnitState::Succeeded {
            return Ok(());
        }
        self.transition(WorkUnitState::Succeeded)?;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt. `permanent` ends the unit.
    pub fn fail(&mut self, error: FailureDetail, permanent: bool, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.state != WorkUnitState::Failed {
            if self.state == WorkUnitState::Requested {
                // Dead-lettered before any attempt started (e.g. undecodable retry).
                self.transition(WorkUnitState::InProgress)?;
            }
            self.transition(WorkUnitState::Failed)?;
        }
        if permanent {
            self.transition(WorkUnitState::FailedPermanent)?;
        }
        self.last_error = Some(error);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ErrorCode;

    fn unit(stage: Stage, revision: u32) -> WorkUnit {
        let campaign = CampaignId::from_uuid(Uuid::from_u128(1));
        WorkUnit::new(
            campaign,
            CorrelationId::from_uuid(Uuid::from_u128(2)),
            stage,
            Locale::new("en").unwrap(),
            Some(ProductId::new("serum").unwrap()),
            Some(AspectRatio::Square),
            revision,
        )
        .unwrap()
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        assert_eq!(
            unit(Stage::Composition, 0).idempotency_key,
            unit(Stage::Composition, 0).idempotency_key
        );
    }

    #[test]
    fn idempotency_key_varies_with_stage_and_revision() {
        let a = unit(Stage::Composition, 0).idempotency_key;
        assert_ne!(a, unit(Stage::Finalization, 0).idempotency_key);
        assert_ne!(a, unit(Stage::Composition, 1).idempotency_key);
    }

    #[test]
    fn enrichment_rejects_product_scope() {
        let err = WorkUnit::new(
            CampaignId::new(),
            CorrelationId::new(),
            Stage::Enrichment,
            Locale::new("en").unwrap(),
            Some(ProductId::new("serum").unwrap()),
            None,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn asset_units_require_aspect_ratio() {
        assert!(
            WorkUnit::new(
                CampaignId::new(),
                CorrelationId::new(),
                Stage::AssetGeneration,
                Locale::new("en").unwrap(),
                Some(ProductId::new("serum").unwrap()),
                None,
                0,
            )
            .is_err()
        );
    }

    #[test]
    fn stages_chain_to_finalization() {
        let mut stage = Stage::Enrichment;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::ALL.to_vec());
        assert_eq!(
            Stage::from_request_subject("image.generate.request"),
            Some(Stage::AssetGeneration)
        );
    }

    #[test]
    fn content_unit_covers_all_ratios_of_its_product() {
        let content = WorkUnit::new(
            CampaignId::new(),
            CorrelationId::new(),
            Stage::ContentGeneration,
            Locale::new("en").unwrap(),
            Some(ProductId::new("serum").unwrap()),
            None,
            0,
        )
        .unwrap();
        let en = Locale::new("en").unwrap();
        let serum = ProductId::new("serum").unwrap();
        assert!(content.covers(&CompletionTuple::new(en.clone(), serum.clone(), AspectRatio::Portrait)));
        assert!(!content.covers(&CompletionTuple::new(
            Locale::new("de").unwrap(),
            serum,
            AspectRatio::Portrait
        )));
    }

    #[test]
    fn redelivery_of_abandoned_attempt_restarts() {
        let now = Utc::now();
        let mut record = WorkUnitRecord::requested(unit(Stage::AssetGeneration, 0), now);
        assert_eq!(record.begin_attempt(now).unwrap(), AttemptStart::Started { attempt: 1 });
        // no ack; redelivered
        assert_eq!(record.begin_attempt(now).unwrap(), AttemptStart::Started { attempt: 2 });
        record.succeed(now).unwrap();
        assert_eq!(record.begin_attempt(now).unwrap(), AttemptStart::AlreadySucceeded);
    }

    #[test]
    fn permanent_failure_is_terminal() {
        let now = Utc::now();
        let mut record = WorkUnitRecord::requested(unit(Stage::AssetGeneration, 0), now);
        record.begin_attempt(now).unwrap();
        record
            .fail(FailureDetail::new(ErrorCode::QuotaExceeded, "quota"), true, now)
            .unwrap();
        assert_eq!(record.state, WorkUnitState::FailedPermanent);
        assert_eq!(record.begin_attempt(now).unwrap(), AttemptStart::AlreadyFailedPermanent);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!WorkUnitState::Requested.can_transition_to(WorkUnitState::Succeeded));
        assert!(!WorkUnitState::Succeeded.can_transition_to(WorkUnitState::Requested));
        assert!(WorkUnitState::Failed.can_transition_to(WorkUnitState::Requested));
    }
}
