use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use creatiflow_core::{
    AspectRatio, CampaignId, CorrelationId, DomainError, IdempotencyKey, Locale, ProductId, Stage,
    WorkUnit,
};

use crate::bus::{BusError, HEADER_CORRELATION_ID, HEADER_IDEMPOTENCY_KEY, Headers};

/// Uniform envelope for every inter-stage message.
///
/// Notes:
/// - Dimension fields are optional: enrichment units carry only a locale,
///   campaign-level events carry none.
/// - `idempotency_key` must match the key derived from the other fields;
///   [`MessageEnvelope::work_unit`] rejects envelopes where it does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope<P> {
    campaign_id: CampaignId,
    #[serde(default)]
    stage: Option<Stage>,
    #[serde(default)]
    locale: Option<Locale>,
    #[serde(default)]
    product_id: Option<ProductId>,
    #[serde(default)]
    aspect_ratio: Option<AspectRatio>,
    revision: u32,
    idempotency_key: IdempotencyKey,
    correlation_id: CorrelationId,
    timestamp: DateTime<Utc>,

    stage_payload: P,
}

impl<P> MessageEnvelope<P> {
    pub fn for_unit(unit: &WorkUnit, stage_payload: P, timestamp: DateTime<Utc>) -> Self {
        Self {
            campaign_id: unit.campaign_id,
            stage: Some(unit.stage),
            locale: Some(unit.locale.clone()),
            product_id: unit.product_id.clone(),
            aspect_ratio: unit.aspect_ratio,
            revision: unit.revision,
            idempotency_key: unit.idempotency_key,
            correlation_id: unit.correlation_id,
            timestamp,
            stage_payload,
        }
    }

    /// Envelope for a campaign-level event with no work-unit dimensions.
    pub fn for_campaign(
        campaign_id: CampaignId,
        correlation_id: CorrelationId,
        revision: u32,
        idempotency_key: IdempotencyKey,
        stage_payload: P,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id,
            stage: None,
            locale: None,
            product_id: None,
            aspect_ratio: None,
            revision,
            idempotency_key,
            correlation_id,
            timestamp,
            stage_payload,
        }
    }

    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn locale(&self) -> Option<&Locale> {
        self.locale.as_ref()
    }

    pub fn product_id(&self) -> Option<&ProductId> {
        self.product_id.as_ref()
    }

    pub fn aspect_ratio(&self) -> Option<AspectRatio> {
        self.aspect_ratio
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.idempotency_key
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &P {
        &self.stage_payload
    }

    pub fn into_payload(self) -> P {
        self.stage_payload
    }

    /// Rebuild the work unit this envelope addresses, verifying its key.
    pub fn work_unit(&self) -> Result<WorkUnit, DomainError> {
        let stage = self
            .stage
            .ok_or_else(|| DomainError::validation("envelope has no stage"))?;
        let locale = self
            .locale
            .clone()
            .ok_or_else(|| DomainError::validation("envelope has no locale"))?;
        let unit = WorkUnit::new(
            self.campaign_id,
            self.correlation_id,
            stage,
            locale,
            self.product_id.clone(),
            self.aspect_ratio,
            self.revision,
        )?;
        if unit.idempotency_key != self.idempotency_key {
            return Err(DomainError::validation(format!(
                "idempotency key {} does not match envelope fields",
                self.idempotency_key
            )));
        }
        Ok(unit)
    }

    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_IDEMPOTENCY_KEY.into(), self.idempotency_key.to_string());
        headers.insert(HEADER_CORRELATION_ID.into(), self.correlation_id.to_string());
        headers
    }
}

impl<P: Serialize> MessageEnvelope<P> {
    pub fn to_json(&self) -> Result<serde_json::Value, BusError> {
        serde_json::to_value(self).map_err(|e| BusError::Fatal(format!("envelope encode: {e}")))
    }
}

impl<P: DeserializeOwned> MessageEnvelope<P> {
    /// Malformed envelopes are a fatal (non-retryable) error.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, BusError> {
        serde_json::from_value(value.clone())
            .map_err(|e| BusError::Fatal(format!("envelope decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::StagePayload;

    fn unit() -> WorkUnit {
        WorkUnit::new(
            CampaignId::new(),
            CorrelationId::new(),
            Stage::AssetGeneration,
            Locale::new("de").unwrap(),
            Some(ProductId::new("serum").unwrap()),
            Some(AspectRatio::Portrait),
            2,
        )
        .unwrap()
    }

    #[test]
    fn rebuilds_the_same_unit() {
        let unit = unit();
        let env = MessageEnvelope::for_unit(&unit, StagePayload::default().with_seed(5), Utc::now());
        let json = env.to_json().unwrap();
        let back: MessageEnvelope<StagePayload> = MessageEnvelope::from_json(&json).unwrap();
        assert_eq!(back.work_unit().unwrap(), unit);
        assert_eq!(back.payload().seed, Some(5));
    }

    #[test]
    fn tampered_revision_is_rejected() {
        let unit = unit();
        let env = MessageEnvelope::for_unit(&unit, StagePayload::default(), Utc::now());
        let mut json = env.to_json().unwrap();
        json["revision"] = serde_json::json!(3);
        let back: MessageEnvelope<StagePayload> = MessageEnvelope::from_json(&json).unwrap();
        assert!(matches!(back.work_unit(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn garbage_is_fatal() {
        let err = MessageEnvelope::<StagePayload>::from_json(&serde_json::json!({"x": 1})).unwrap_err();
        assert!(matches!(err, BusError::Fatal(_)));
    }

    #[test]
    fn headers_carry_key_and_correlation() {
        let unit = unit();
        let env = MessageEnvelope::for_unit(&unit, StagePayload::default(), Utc::now());
        let headers = env.headers();
        assert_eq!(headers[HEADER_IDEMPOTENCY_KEY], unit.idempotency_key.to_string());
        assert_eq!(headers[HEADER_CORRELATION_ID], unit.correlation_id.to_string());
    }
}
