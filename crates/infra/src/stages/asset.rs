use std::sync::Arc;

use creatiflow_core::{AspectRatio, Stage};
use creatiflow_events::{StageError, StageHandler, StageInput, StageOutput, ValidationError};

use crate::collaborators::{AssetGenerator, CreativeCopy, ObjectStore};

use super::load_json;

pub struct AssetRequest {
    content_ref: String,
    product_name: String,
    primary_color: String,
    aspect_ratio: AspectRatio,
    seed: u64,
}

/// Generates the base image for one tuple.
pub struct AssetGenerationStage {
    generator: Arc<dyn AssetGenerator>,
    objects: Arc<dyn ObjectStore>,
}

impl AssetGenerationStage {
    pub fn new(generator: Arc<dyn AssetGenerator>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { generator, objects }
    }
}

/// Image prompt from the copy's visual direction.
pub fn build_prompt(copy: &CreativeCopy, product_name: &str, primary_color: &str, ar: AspectRatio) -> String {
    let mut prompt = format!("Product photo of {product_name}");
    if !copy.visual_elements.is_empty() {
        prompt.push_str(", featuring ");
        prompt.push_str(&copy.visual_elements.join(", "));
    }
    prompt.push_str(&format!(
        ". Mood: {}. Accent colour {primary_color}. Composition for {ar}, no text.",
        copy.headline
    ));
    prompt
}

impl StageHandler for AssetGenerationStage {
    type Request = AssetRequest;

    fn stage(&self) -> Stage {
        Stage::AssetGeneration
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        let brief = &input.campaign.config;
        let (Some(product_id), Some(aspect_ratio)) = (&input.unit.product_id, input.unit.aspect_ratio)
        else {
            return Err(ValidationError::new("asset unit without product and aspect ratio"));
        };
        let product = brief
            .product(product_id)
            .ok_or_else(|| ValidationError::new(format!("unknown product {product_id}")))?;
        let content_ref = input
            .payload
            .content_ref
            .clone()
            .ok_or_else(|| ValidationError::new("missing content_ref"))?;
        let seed = input
            .payload
            .seed
            .ok_or_else(|| ValidationError::new("missing generation seed"))?;

        Ok(AssetRequest {
            content_ref,
            product_name: product.name.clone(),
            primary_color: brief.brand.primary_color.clone(),
            aspect_ratio,
            seed,
        })
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        let copy: CreativeCopy = load_json(self.objects.as_ref(), &request.content_ref)?;
        let prompt = build_prompt(
            &copy,
            &request.product_name,
            &request.primary_color,
            request.aspect_ratio,
        );
        let asset_ref = self
            .generator
            .generate(&prompt, request.aspect_ratio.target_size(), request.seed)?;
        Ok(StageOutput::new(asset_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_product_and_format() {
        let copy = CreativeCopy {
            headline: "Glow".into(),
            description: "d".into(),
            call_to_action: "Shop now".into(),
            visual_elements: vec!["marble".into(), "morning light".into()],
        };
        let prompt = build_prompt(&copy, "Serum", "#ff0066", AspectRatio::Portrait);
        assert!(prompt.starts_with("Product photo of Serum, featuring marble, morning light."));
        assert!(prompt.contains("9x16"));
        assert!(prompt.contains("#ff0066"));
    }
}
