//! Fan-out dimensions: locale, product and aspect ratio.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// BCP-47-ish locale tag (`en`, `de`, `pt-BR`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        let mut parts = tag.split('-');
        let primary = parts.next().unwrap_or_default();
        if !(2..=3).contains(&primary.len()) || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!("invalid locale tag '{tag}'")));
        }
        for sub in parts {
            if !(2..=8).contains(&sub.len()) || !sub.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(DomainError::validation(format!("invalid locale tag '{tag}'")));
            }
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Locale {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Locale> for String {
    fn from(value: Locale) -> Self {
        value.0
    }
}

impl FromStr for Locale {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-assigned product identifier (a slug, not a UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> DomainResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 128 {
            return Err(DomainError::invalid_id(format!("ProductId: length {}", id.len())));
        }
        if id.chars().any(|c| c.is_whitespace() || c == '|') {
            return Err(DomainError::invalid_id(format!("ProductId: '{id}'")));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProductId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProductId> for String {
    fn from(value: ProductId) -> Self {
        value.0
    }
}

impl FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output aspect ratio of a creative.
///
/// Accepts both `1x1` and `1:1` spellings; always renders as `WxH`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AspectRatio {
    Square,
    Portrait,
    Landscape,
    Feed,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 4] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
        AspectRatio::Feed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1x1",
            AspectRatio::Portrait => "9x16",
            AspectRatio::Landscape => "16x9",
            AspectRatio::Feed => "4x5",
        }
    }

    /// Pixel size requested from the asset generator.
    pub fn target_size(&self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait => (1024, 1792),
            AspectRatio::Landscape => (1792, 1024),
            AspectRatio::Feed => (1024, 1280),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace(':', "x");
        AspectRatio::ALL
            .into_iter()
            .find(|ar| ar.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unsupported aspect ratio '{s}'")))
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a campaign's required output set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionTuple {
    pub locale: Locale,
    pub product_id: ProductId,
    pub aspect_ratio: AspectRatio,
}

impl CompletionTuple {
    pub fn new(locale: Locale, product_id: ProductId, aspect_ratio: AspectRatio) -> Self {
        Self {
            locale,
            product_id,
            aspect_ratio,
        }
    }
}

impl fmt::Display for CompletionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.locale, self.product_id, self.aspect_ratio)
    }
}
