//! Concrete stage handlers.
//!
//! Each handler validates its envelope into a typed request, calls its
//! collaborators and returns an object-store reference. Everything a handler
//! writes is keyed by the unit's idempotency key, so a repeated attempt
//! overwrites its own output.

pub mod asset;
pub mod composition;
pub mod content;
pub mod enrichment;
pub mod finalization;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use creatiflow_core::{Campaign, ErrorCode, WorkUnit};
use creatiflow_events::StageError;

use crate::collaborators::{
    AssetGenerator, CollaboratorError, Compositor, ContentGenerator, ContextEnricher, ObjectStore,
};

pub use asset::AssetGenerationStage;
pub use composition::CompositionStage;
pub use content::ContentGenerationStage;
pub use enrichment::EnrichmentStage;
pub use finalization::FinalizationStage;

/// Collaborators shared by all stage handlers of one process.
#[derive(Clone)]
pub struct Collaborators {
    pub enricher: Arc<dyn ContextEnricher>,
    pub content: Arc<dyn ContentGenerator>,
    pub assets: Arc<dyn AssetGenerator>,
    pub compositor: Arc<dyn Compositor>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Collaborators {
    /// Deterministic in-process collaborators.
    pub fn in_memory() -> Self {
        let objects: Arc<dyn ObjectStore> = Arc::new(crate::collaborators::InMemoryObjectStore::new());
        Self {
            enricher: Arc::new(crate::collaborators::TemplateEnricher::new()),
            content: Arc::new(crate::collaborators::TemplateContentGenerator::new()),
            assets: Arc::new(crate::collaborators::InMemoryAssetGenerator::new(objects.clone())),
            compositor: Arc::new(crate::collaborators::InMemoryCompositor::new(objects.clone())),
            objects,
        }
    }
}

/// Object key of a unit's output: `<prefix>/<campaign>/<stage>/<key>.json`.
pub(crate) fn object_key(campaign: &Campaign, unit: &WorkUnit) -> String {
    format!(
        "{}/{}/{}/{}.json",
        campaign.config.output.storage_prefix, campaign.id, unit.stage, unit.idempotency_key
    )
}

pub(crate) fn store_json<T: Serialize>(
    objects: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<String, StageError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StageError::fatal(ErrorCode::Internal, format!("encode {key}: {e}")))?;
    Ok(objects.put(key, bytes)?)
}

pub(crate) fn load_json<T: DeserializeOwned>(objects: &dyn ObjectStore, uri: &str) -> Result<T, StageError> {
    let bytes = objects.get(uri).map_err(StageError::from)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StageError::from(CollaboratorError::InvalidInput(format!("{uri} is not valid: {e}")))
    })
}
