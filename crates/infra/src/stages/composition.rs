use std::sync::Arc;

use creatiflow_core::Stage;
use creatiflow_events::{StageError, StageHandler, StageInput, StageOutput, ValidationError};

use crate::collaborators::{Compositor, OverlaySpec};

pub struct CompositionRequest {
    asset_ref: String,
    overlay: OverlaySpec,
}

/// Applies logo and brand colour to the generated asset.
pub struct CompositionStage {
    compositor: Arc<dyn Compositor>,
}

impl CompositionStage {
    pub fn new(compositor: Arc<dyn Compositor>) -> Self {
        Self { compositor }
    }
}

impl StageHandler for CompositionStage {
    type Request = CompositionRequest;

    fn stage(&self) -> Stage {
        Stage::Composition
    }

    fn validate(&self, input: &StageInput<'_>) -> Result<Self::Request, ValidationError> {
        let asset_ref = input
            .payload
            .asset_ref
            .clone()
            .ok_or_else(|| ValidationError::new("missing asset_ref"))?;
        let brand = &input.campaign.config.brand;
        Ok(CompositionRequest {
            asset_ref,
            overlay: OverlaySpec::Brand {
                logo_uri: brand.logo_uri.clone(),
                logo_position: brand.placement.logo_position.clone(),
                primary_color: brand.primary_color.clone(),
            },
        })
    }

    fn process(&self, request: Self::Request) -> Result<StageOutput, StageError> {
        let composed = self.compositor.compose(&request.asset_ref, &request.overlay)?;
        Ok(StageOutput::new(composed))
    }
}
