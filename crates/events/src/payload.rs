//! Stage payload carried inside every envelope.
//!
//! Each stage appends its output reference and the payload travels on to the
//! next stage, so a unit always carries the references it needs from earlier
//! stages.

use serde::{Deserialize, Serialize};

use creatiflow_core::Stage;

/// Reviewer input attached to a revision request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionFeedback {
    pub from_revision: u32,
    pub feedback: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composed_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_ref: Option<String>,
    /// Generation seed for the asset stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<RevisionFeedback>,
}

impl StagePayload {
    /// Copy of this payload with `stage`'s output recorded.
    pub fn with_output(&self, stage: Stage, output_ref: &str) -> Self {
        let mut next = self.clone();
        let slot = match stage {
            Stage::Enrichment => &mut next.context_ref,
            Stage::ContentGeneration => &mut next.content_ref,
            Stage::AssetGeneration => &mut next.asset_ref,
            Stage::Composition => &mut next.composed_ref,
            Stage::Finalization => &mut next.final_ref,
        };
        *slot = Some(output_ref.to_string());
        next
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_feedback(mut self, feedback: RevisionFeedback) -> Self {
        self.feedback = Some(feedback);
        self
    }
}
