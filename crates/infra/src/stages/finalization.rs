use std::sync::Arc;

use serde::Serialize;

use creatiflow_core::Stage;
use creatiflow_events::{StageError, StageHandler, StageInput, StageOutput, ValidationError};

use crate::collaborators::{Compositor, CreativeCopy, ObjectStore, OverlaySpec};

use super::{load_json, object_key, store_json};

pub struct FinalizationRequest {
    composed_ref: String,
    content_ref: String,
    position: String,
    object_key: String,
}

/// Manifest persisted next to every finished creative.
#[derive(Debug, Serialize)]
struct FinalManifest<'a> {
    asset: &'a str,
    composed_from: &'a str,
    headline: &'a str,
    call_to_action: &'a str,
}

/// Draws headline and call to action onto the composed creative and
/// persists the final manifest.
pub struct FinalizationStage {
    compositor: Arc<dyn Compositor>,
    objects: Arc<dyn ObjectStore>,
}

impl FinalizationStage {
    pub fn new(compositor: Arc<dyn Compositor>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { compositor, objects }
    }
}

impl StageHandler for FinalizationStage {
    type Request = FinalizationRequest;

    fn stage(&self) -> Stage {
        Stage::Finalization
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        let composed_ref = input
            .payload
            .composed_ref
            .clone()
            .ok_or_else(|| ValidationError::new("missing composed_ref"))?;
        let content_ref = input
            .payload
            .content_ref
            .clone()
            .ok_or_else(|| ValidationError::new("missing content_ref"))?;
        Ok(FinalizationRequest {
            composed_ref,
            content_ref,
            position: input.campaign.config.brand.placement.overlay_text_position.clone(),
            object_key: object_key(input.campaign, input.unit),
        })
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        let copy: CreativeCopy = load_json(self.objects.as_ref(), &request.content_ref)?;
        let overlay = OverlaySpec::Text {
            headline: copy.headline.clone(),
            call_to_action: copy.call_to_action.clone(),
            position: request.position,
        };
        let final_asset = self.compositor.compose(&request.composed_ref, &overlay)?;
        let manifest = FinalManifest {
            asset: &final_asset,
            composed_from: &request.composed_ref,
            headline: &copy.headline,
            call_to_action: &copy.call_to_action,
        };
        store_json(self.objects.as_ref(), &request.object_key, &manifest)?;
        Ok(StageOutput::new(final_asset))
    }
}
