use std::sync::Arc;

use creatiflow_core::{BrandConfig, ErrorCode, Locale, Product, Stage};
use creatiflow_events::{StageError, StageHandler, StageInput, StageOutput, ValidationError};

use crate::collaborators::{ContentGenerator, ContextPack, ObjectStore};

use super::{load_json, object_key, store_json};

pub struct ContentRequest {
    context_ref: String,
    locale: Locale,
    product: Product,
    brand: BrandConfig,
    feedback: Option<String>,
    object_key: String,
}

/// Writes localized copy and rejects output that breaks brand compliance.
pub struct ContentGenerationStage {
    generator: Arc<dyn ContentGenerator>,
    objects: Arc<dyn ObjectStore>,
}

impl ContentGenerationStage {
    pub fn new(generator: Arc<dyn ContentGenerator>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { generator, objects }
    }
}

impl StageHandler for ContentGenerationStage {
    type Request = ContentRequest;

    fn stage(&self) -> Stage {
        Stage::ContentGeneration
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        let brief = &input.campaign.config;
        let product_id = input
            .unit
            .product_id
            .as_ref()
            .ok_or_else(|| ValidationError::new("content unit without product"))?;
        let product = brief
            .product(product_id)
            .ok_or_else(|| ValidationError::new(format!("unknown product {product_id}")))?;
        if !brief.targets_locale(&input.unit.locale) {
            return Err(ValidationError::new(format!(
                "locale {} is not targeted by the campaign",
                input.unit.locale
            )));
        }
        if let Some(ar) = input.unit.aspect_ratio {
            if !brief.aspect_ratios.contains(&ar) {
                return Err(ValidationError::new(format!("aspect ratio {ar} is not requested")));
            }
        }
        let context_ref = input
            .payload
            .context_ref
            .clone()
            .ok_or_else(|| ValidationError::new("missing context_ref"))?;

        Ok(ContentRequest {
            context_ref,
            locale: input.unit.locale.clone(),
            product: product.clone(),
            brand: brief.brand.clone(),
            feedback: input.payload.feedback.as_ref().map(|f| f.feedback.clone()),
            object_key: object_key(input.campaign, input.unit),
        })
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        let context: ContextPack = load_json(self.objects.as_ref(), &request.context_ref)?;
        let copy = self.generator.generate(
            &context,
            &request.locale,
            &request.product,
            request.feedback.as_deref(),
        )?;

        let banned = request.brand.banned_in(&request.locale, &copy.visible_text());
        if !banned.is_empty() {
            return Err(StageError::fatal(
                ErrorCode::InvalidInput,
                format!("copy contains banned words: {}", banned.join(", ")),
            ));
        }

        let uri = store_json(self.objects.as_ref(), &request.object_key, &copy)?;
        Ok(StageOutput::new(uri))
    }
}
