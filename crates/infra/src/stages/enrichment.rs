use std::sync::Arc;

use tracing::debug;

use creatiflow_core::{CampaignConfig, Locale, Stage};
use creatiflow_events::{StageError, StageHandler, StageInput, StageOutput, ValidationError};

use crate::collaborators::{ContextEnricher, ObjectStore};

use super::{object_key, store_json};

pub struct EnrichmentRequest {
    brief: CampaignConfig,
    locale: Locale,
    object_key: String,
}

/// Gathers locale context and stores it as a context pack.
pub struct EnrichmentStage {
    enricher: Arc<dyn ContextEnricher>,
    objects: Arc<dyn ObjectStore>,
}

impl EnrichmentStage {
    pub fn new(enricher: Arc<dyn ContextEnricher>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { enricher, objects }
    }
}

impl StageHandler for EnrichmentStage {
    type Request = EnrichmentRequest;

    fn stage(&self) -> Stage {
        Stage::Enrichment
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        let brief = &input.campaign.config;
        if !brief.targets_locale(&input.unit.locale) {
            return Err(ValidationError::new(format!(
                "locale {} is not targeted by the campaign",
                input.unit.locale
            )));
        }
        Ok(EnrichmentRequest {
            brief: brief.clone(),
            locale: input.unit.locale.clone(),
            object_key: object_key(input.campaign, input.unit),
        })
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        let pack = self.enricher.enrich(&request.brief, &request.locale)?;
        let uri = store_json(self.objects.as_ref(), &request.object_key, &pack)?;
        debug!(locale = %request.locale, uri = %uri, "context pack stored");
        Ok(StageOutput::new(uri))
    }
}
