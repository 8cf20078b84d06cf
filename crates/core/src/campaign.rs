//! Campaign brief and lifecycle status.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::{AspectRatio, CompletionTuple, Locale, ProductId};
use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, CorrelationId};
use crate::result::FailureDetail;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceProfile {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub age_min: Option<u8>,
    #[serde(default)]
    pub age_max: Option<u8>,
    #[serde(default)]
    pub interests: Vec<String>,
}

/// Where brand elements are placed on a composed creative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub logo_position: String,
    pub overlay_text_position: String,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            logo_position: "bottom_right".to_string(),
            overlay_text_position: "bottom".to_string(),
        }
    }
}

/// Brand and compliance rules applied by the generation stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandConfig {
    pub primary_color: String,
    #[serde(default)]
    pub logo_uri: Option<String>,
    /// Words that must not appear in generated copy, per locale.
    #[serde(default)]
    pub banned_words: BTreeMap<Locale, Vec<String>>,
    #[serde(default)]
    pub legal_guidelines: Option<String>,
    #[serde(default)]
    pub placement: Placement,
}

impl Default for BrandConfig {
    fn default() -> Self {
        Self {
            primary_color: "#000000".to_string(),
            logo_uri: None,
            banned_words: BTreeMap::new(),
            legal_guidelines: None,
            placement: Placement::default(),
        }
    }
}

impl BrandConfig {
    /// Banned words that occur (case-insensitively) in `text`.
    pub fn banned_in<'a>(&'a self, locale: &Locale, text: &str) -> Vec<&'a str> {
        let haystack = text.to_lowercase();
        self.banned_words
            .get(locale)
            .into_iter()
            .flatten()
            .filter(|w| !w.is_empty() && haystack.contains(&w.to_lowercase()))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub format: String,
    pub storage_prefix: String,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            format: "png".to_string(),
            storage_prefix: "campaigns".to_string(),
        }
    }
}

/// A submitted campaign brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub name: String,
    pub products: Vec<Product>,
    pub target_locales: Vec<Locale>,
    pub aspect_ratios: Vec<AspectRatio>,
    /// Localized core message, keyed by locale.
    #[serde(default)]
    pub messages: BTreeMap<Locale, String>,
    #[serde(default)]
    pub audience: AudienceProfile,
    #[serde(default)]
    pub brand: BrandConfig,
    #[serde(default)]
    pub output: OutputSpec,
}

impl CampaignConfig {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("campaign name must not be empty"));
        }
        if self.products.is_empty() {
            return Err(DomainError::validation("campaign needs at least one product"));
        }
        if self.target_locales.is_empty() {
            return Err(DomainError::validation("campaign needs at least one target locale"));
        }
        if self.aspect_ratios.is_empty() {
            return Err(DomainError::validation("campaign needs at least one aspect ratio"));
        }

        let mut seen = BTreeSet::new();
        for p in &self.products {
            if !seen.insert(&p.id) {
                return Err(DomainError::validation(format!("duplicate product '{}'", p.id)));
            }
        }
        if self.target_locales.iter().collect::<BTreeSet<_>>().len() != self.target_locales.len() {
            return Err(DomainError::validation("duplicate target locale"));
        }
        if self.aspect_ratios.iter().collect::<BTreeSet<_>>().len() != self.aspect_ratios.len() {
            return Err(DomainError::validation("duplicate aspect ratio"));
        }
        if let (Some(min), Some(max)) = (self.audience.age_min, self.audience.age_max) {
            if min > max {
                return Err(DomainError::validation("audience age_min exceeds age_max"));
            }
        }
        Ok(())
    }

    /// The required set R = locales × products × aspect ratios.
    pub fn required_tuples(&self) -> Vec<CompletionTuple> {
        let mut out =
            Vec::with_capacity(self.target_locales.len() * self.products.len() * self.aspect_ratios.len());
        for locale in &self.target_locales {
            for product in &self.products {
                for ar in &self.aspect_ratios {
                    out.push(CompletionTuple::new(locale.clone(), product.id.clone(), *ar));
                }
            }
        }
        out
    }

    pub fn product(&self, id: &ProductId) -> Option<&Product> {
        self.products.iter().find(|p| &p.id == id)
    }

    pub fn targets_locale(&self, locale: &Locale) -> bool {
        self.target_locales.contains(locale)
    }

    pub fn message_for(&self, locale: &Locale) -> Option<&str> {
        self.messages.get(locale).map(String::as_str)
    }
}

/// Campaign lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Processing,
    /// Picked up by the review surface after a completed run.
    ReadyForReview,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Processing => "processing",
            CampaignStatus::ReadyForReview => "ready_for_review",
            CampaignStatus::Completed => "completed",
            CampaignStatus::CompletedWithErrors => "completed_with_errors",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Ok(match s {
            "draft" => CampaignStatus::Draft,
            "processing" => CampaignStatus::Processing,
            "ready_for_review" => CampaignStatus::ReadyForReview,
            "completed" => CampaignStatus::Completed,
            "completed_with_errors" => CampaignStatus::CompletedWithErrors,
            "failed" => CampaignStatus::Failed,
            other => return Err(DomainError::validation(format!("unknown status '{other}'"))),
        })
    }

    /// States a revision request may re-open.
    pub fn is_reopenable(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed
                | CampaignStatus::CompletedWithErrors
                | CampaignStatus::ReadyForReview
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_reopenable() || *self == CampaignStatus::Failed
    }
}

impl core::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted campaign record.
///
/// `epoch` counts processing rounds: it starts at 1 on submission and is bumped
/// whenever a revision re-opens a finished campaign. The ready notification is
/// claimed once per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub correlation_id: CorrelationId,
    pub config: CampaignConfig,
    pub status: CampaignStatus,
    pub epoch: u32,
    pub notified_epoch: Option<u32>,
    pub failure: Option<FailureDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// A fresh draft. The brief must already be valid.
    pub fn draft(config: CampaignConfig, now: DateTime<Utc>) -> DomainResult<Self> {
        config.validate()?;
        Ok(Self {
            id: CampaignId::new(),
            correlation_id: CorrelationId::new(),
            config,
            status: CampaignStatus::Draft,
            epoch: 1,
            notified_epoch: None,
            failure: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn ready_notified(&self) -> bool {
        self.notified_epoch == Some(self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CampaignConfig {
        CampaignConfig {
            name: "Spring launch".into(),
            products: vec![
                Product {
                    id: ProductId::new("serum").unwrap(),
                    name: "Serum".into(),
                    description: String::new(),
                },
                Product {
                    id: ProductId::new("cream").unwrap(),
                    name: "Cream".into(),
                    description: String::new(),
                },
            ],
            target_locales: vec![Locale::new("en").unwrap(), Locale::new("de").unwrap()],
            aspect_ratios: vec![AspectRatio::Square, AspectRatio::Portrait],
            messages: BTreeMap::new(),
            audience: AudienceProfile::default(),
            brand: BrandConfig::default(),
            output: OutputSpec::default(),
        }
    }

    #[test]
    fn required_set_is_full_cross_product() {
        let tuples = config().required_tuples();
        assert_eq!(tuples.len(), 8);
        let unique: BTreeSet<_> = tuples.iter().collect();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn rejects_empty_dimensions() {
        let mut c = config();
        c.aspect_ratios.clear();
        assert!(matches!(c.validate(), Err(DomainError::Validation(_))));

        let mut c = config();
        c.target_locales.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_products() {
        let mut c = config();
        let dup = c.products[0].clone();
        c.products.push(dup);
        assert!(c.validate().is_err());
    }

    #[test]
    fn banned_words_match_case_insensitively() {
        let mut c = config();
        let en = Locale::new("en").unwrap();
        c.brand.banned_words.insert(en.clone(), vec!["Cure".into()]);
        assert_eq!(c.brand.banned_in(&en, "a miracle cure for skin"), vec!["Cure"]);
        assert!(c.brand.banned_in(&Locale::new("de").unwrap(), "cure").is_empty());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CampaignStatus::Draft,
            CampaignStatus::Processing,
            CampaignStatus::ReadyForReview,
            CampaignStatus::Completed,
            CampaignStatus::CompletedWithErrors,
            CampaignStatus::Failed,
        ] {
            assert_eq!(CampaignStatus::parse(s.as_str()).unwrap(), s);
        }
    }
}
