use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::json;

use creatiflow_core::{CampaignConfig, Locale, Product};

use super::{
    AssetGenerator, CollaboratorError, Compositor, ContentGenerator, ContextEnricher, ContextPack,
    CreativeCopy, ObjectStore, OverlaySpec,
};

const URI_SCHEME: &str = "mem://";

/// Scripted failures plus a call counter, shared by the fakes below.
#[derive(Debug, Default)]
struct Faults {
    queued: Mutex<VecDeque<CollaboratorError>>,
    calls: AtomicUsize,
}

impl Faults {
    fn push(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.extend(errors);
        }
    }

    /// Count a call and pop the next scripted failure, if any.
    fn next(&self) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queued = self
            .queued
            .lock()
            .map_err(|_| CollaboratorError::Provider("fault queue poisoned".into()))?;
        match queued.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn digest(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    parts.hash(&mut hasher);
    hasher.finish()
}

fn encode(value: &serde_json::Value) -> Result<Vec<u8>, CollaboratorError> {
    serde_json::to_vec(value).map_err(|e| CollaboratorError::Storage(format!("encode: {e}")))
}

/// Object store backed by a map; URIs look like `mem://<key>`.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    faults: Faults,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.faults.push(errors);
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uri: &str) -> bool {
        uri.strip_prefix(URI_SCHEME)
            .is_some_and(|key| self.objects.read().is_ok_and(|o| o.contains_key(key)))
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, CollaboratorError> {
        self.faults.next()?;
        self.objects
            .write()
            .map_err(|_| CollaboratorError::Storage("object map poisoned".into()))?
            .insert(key.to_string(), bytes);
        Ok(format!("{URI_SCHEME}{key}"))
    }

    fn get(&self, uri: &str) -> Result<Vec<u8>, CollaboratorError> {
        let key = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| CollaboratorError::NotFound(uri.to_string()))?;
        self.objects
            .read()
            .map_err(|_| CollaboratorError::Storage("object map poisoned".into()))?
            .get(key)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(uri.to_string()))
    }
}

/// Builds the context pack straight from the brief.
#[derive(Debug, Default)]
pub struct TemplateEnricher {
    faults: Faults,
}

impl TemplateEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.faults.push(errors);
    }
}

impl ContextEnricher for TemplateEnricher {
    fn enrich(&self, brief: &CampaignConfig, locale: &Locale) -> Result<ContextPack, CollaboratorError> {
        self.faults.next()?;
        let mut cultural_notes = vec![format!("write natively for {locale}")];
        cultural_notes.extend(brief.audience.interests.iter().map(|i| format!("audience likes {i}")));
        Ok(ContextPack {
            locale: locale.clone(),
            region: brief.audience.region.clone(),
            audience: brief.audience.audience.clone(),
            core_message: brief.message_for(locale).map(str::to_string),
            cultural_notes,
            legal_guidelines: brief.brand.legal_guidelines.clone(),
        })
    }
}

/// Deterministic copywriter.
#[derive(Debug, Default)]
pub struct TemplateContentGenerator {
    faults: Faults,
}

impl TemplateContentGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.faults.push(errors);
    }

    pub fn calls(&self) -> usize {
        self.faults.calls()
    }
}

fn call_to_action(locale: &Locale) -> &'static str {
    match locale.as_str().split('-').next().unwrap_or_default() {
        "de" => "Jetzt kaufen",
        "fr" => "Acheter maintenant",
        "es" => "Compra ahora",
        "it" => "Acquista ora",
        _ => "Shop now",
    }
}

impl ContentGenerator for TemplateContentGenerator {
    fn generate(
        &self,
        context: &ContextPack,
        locale: &Locale,
        product: &Product,
        feedback: Option<&str>,
    ) -> Result<CreativeCopy, CollaboratorError> {
        self.faults.next()?;
        let message = context
            .core_message
            .clone()
            .unwrap_or_else(|| product.description.clone());
        let mut description = if message.is_empty() {
            product.name.clone()
        } else {
            message
        };
        if let Some(feedback) = feedback {
            description = format!("{description} ({feedback})");
        }
        let mut visual_elements = vec![product.name.clone()];
        if !context.region.is_empty() {
            visual_elements.push(format!("{} setting", context.region));
        }
        Ok(CreativeCopy {
            headline: product.name.clone(),
            description,
            call_to_action: call_to_action(locale).to_string(),
            visual_elements,
        })
    }
}

/// Writes a small JSON descriptor instead of pixels.
pub struct InMemoryAssetGenerator {
    objects: Arc<dyn ObjectStore>,
    faults: Faults,
}

impl InMemoryAssetGenerator {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            faults: Faults::default(),
        }
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.faults.push(errors);
    }

    pub fn calls(&self) -> usize {
        self.faults.calls()
    }
}

impl AssetGenerator for InMemoryAssetGenerator {
    fn generate(&self, prompt: &str, size: (u32, u32), seed: u64) -> Result<String, CollaboratorError> {
        self.faults.next()?;
        let (width, height) = size;
        let key = format!(
            "assets/{:016x}.json",
            digest(&[prompt, &width.to_string(), &height.to_string(), &seed.to_string()])
        );
        let descriptor = json!({ "prompt": prompt, "width": width, "height": height, "seed": seed });
        self.objects.put(&key, encode(&descriptor)?)
    }
}

/// Records each overlay as a new object referencing its base.
pub struct InMemoryCompositor {
    objects: Arc<dyn ObjectStore>,
    faults: Faults,
}

impl InMemoryCompositor {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            faults: Faults::default(),
        }
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        self.faults.push(errors);
    }
}

impl Compositor for InMemoryCompositor {
    fn compose(&self, base_asset: &str, overlay: &OverlaySpec) -> Result<String, CollaboratorError> {
        self.faults.next()?;
        // Base must exist; a dangling reference is an input problem.
        self.objects.get(base_asset)?;
        let overlay_json = serde_json::to_value(overlay)
            .map_err(|e| CollaboratorError::InvalidInput(format!("overlay: {e}")))?;
        let key = format!(
            "composed/{:016x}.json",
            digest(&[base_asset, &overlay_json.to_string()])
        );
        let descriptor = json!({ "base": base_asset, "overlay": overlay_json });
        self.objects.put(&key, encode(&descriptor)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_store_round_trip_and_overwrite() {
        let store = InMemoryObjectStore::new();
        let uri = store.put("a/b.json", b"one".to_vec()).unwrap();
        assert_eq!(uri, "mem://a/b.json");
        store.put("a/b.json", b"two".to_vec()).unwrap();
        assert_eq!(store.get(&uri).unwrap(), b"two");
        assert_eq!(store.len(), 1);
        assert!(matches!(store.get("mem://nope"), Err(CollaboratorError::NotFound(_))));
    }

    #[test]
    fn asset_generation_is_deterministic() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let generator = InMemoryAssetGenerator::new(objects.clone());
        let a = generator.generate("serum on marble", (1024, 1024), 7).unwrap();
        let b = generator.generate("serum on marble", (1024, 1024), 7).unwrap();
        let c = generator.generate("serum on marble", (1024, 1024), 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(objects.len(), 2);
        assert_eq!(generator.calls(), 3);
    }

    #[test]
    fn scripted_failures_come_first() {
        let generator = InMemoryAssetGenerator::new(Arc::new(InMemoryObjectStore::new()));
        generator.fail_next([CollaboratorError::QuotaExceeded("monthly".into())]);
        assert!(matches!(
            generator.generate("p", (1, 1), 1),
            Err(CollaboratorError::QuotaExceeded(_))
        ));
        assert!(generator.generate("p", (1, 1), 1).is_ok());
    }

    #[test]
    fn compositor_rejects_dangling_base() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let compositor = InMemoryCompositor::new(objects);
        let overlay = OverlaySpec::Text {
            headline: "h".into(),
            call_to_action: "cta".into(),
            position: "bottom".into(),
        };
        assert!(matches!(
            compositor.compose("mem://missing", &overlay),
            Err(CollaboratorError::NotFound(_))
        ));
    }

    #[test]
    fn call_to_action_follows_language() {
        assert_eq!(call_to_action(&Locale::new("de-AT").unwrap()), "Jetzt kaufen");
        assert_eq!(call_to_action(&Locale::new("ja").unwrap()), "Shop now");
    }
}
