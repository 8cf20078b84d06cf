//! External collaborators the stage handlers call into.
//!
//! Only the contracts live here; [`in_memory`] provides deterministic
//! implementations for tests and local runs.

pub mod in_memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use creatiflow_core::{CampaignConfig, ErrorCode, Locale, Product};
use creatiflow_events::StageError;

pub use in_memory::{
    InMemoryAssetGenerator, InMemoryCompositor, InMemoryObjectStore, TemplateContentGenerator,
    TemplateEnricher,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

impl From<CollaboratorError> for StageError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::RateLimited(msg) => StageError::recoverable(ErrorCode::RateLimited, msg),
            CollaboratorError::InvalidInput(msg) => StageError::fatal(ErrorCode::InvalidInput, msg),
            CollaboratorError::QuotaExceeded(msg) => {
                StageError::recoverable(ErrorCode::QuotaExceeded, msg)
            }
            CollaboratorError::Provider(msg) => StageError::recoverable(ErrorCode::ProviderError, msg),
            CollaboratorError::Storage(msg) => StageError::recoverable(ErrorCode::StorageError, msg),
            CollaboratorError::NotFound(uri) => {
                StageError::fatal(ErrorCode::InvalidInput, format!("missing upstream object {uri}"))
            }
        }
    }
}

/// Locale-specific context gathered before copy is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPack {
    pub locale: Locale,
    pub region: String,
    pub audience: String,
    pub core_message: Option<String>,
    pub cultural_notes: Vec<String>,
    pub legal_guidelines: Option<String>,
}

/// Structured marketing copy for one product in one locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreativeCopy {
    pub headline: String,
    pub description: String,
    pub call_to_action: String,
    pub visual_elements: Vec<String>,
}

impl CreativeCopy {
    /// All user-visible text, for compliance checks.
    pub fn visible_text(&self) -> String {
        format!("{} {} {}", self.headline, self.description, self.call_to_action)
    }
}

/// What a compositing pass draws on top of its base asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlaySpec {
    Brand {
        logo_uri: Option<String>,
        logo_position: String,
        primary_color: String,
    },
    Text {
        headline: String,
        call_to_action: String,
        position: String,
    },
}

pub trait ContextEnricher: Send + Sync {
    fn enrich(&self, brief: &CampaignConfig, locale: &Locale) -> Result<ContextPack, CollaboratorError>;
}

pub trait ContentGenerator: Send + Sync {
    /// `feedback` is set when regenerating for a revision request.
    fn generate(
        &self,
        context: &ContextPack,
        locale: &Locale,
        product: &Product,
        feedback: Option<&str>,
    ) -> Result<CreativeCopy, CollaboratorError>;
}

pub trait AssetGenerator: Send + Sync {
    /// Same prompt, size and seed yield the same reference.
    fn generate(&self, prompt: &str, size: (u32, u32), seed: u64) -> Result<String, CollaboratorError>;
}

pub trait Compositor: Send + Sync {
    /// Pure function of its inputs: identical calls return identical references.
    fn compose(&self, base_asset: &str, overlay: &OverlaySpec) -> Result<String, CollaboratorError>;
}

pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, overwriting any previous object, and return its URI.
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, CollaboratorError>;

    fn get(&self, uri: &str) -> Result<Vec<u8>, CollaboratorError>;
}
