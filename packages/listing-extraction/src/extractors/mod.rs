//! Modality extractors.
//!
//! One extractor per evidence channel. Each follows the same flow:
//!
//! 1. Look the input up in the response cache (text and digested images only)
//! 2. On a miss, call the backend through its resilience wrapper, which
//!    reserves quota for each attempt and settles it with what was billed
//! 3. Coerce the structured output into the field catalog; absent or
//!    unparseable fields stay absent
//! 4. Fill missing per-field confidences from the configured bands
//!
//! Failures are returned to the orchestrator, which records the modality as
//! unavailable instead of failing the whole request.

pub mod image;
pub mod prompts;
pub mod text;
pub mod voice;

pub use image::ImageExtractor;
pub use text::TextExtractor;
pub use voice::VoiceExtractor;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheKey, ExtractionCache};
use crate::error::Failure;
use crate::quota::QuotaGuard;
use crate::resilience::{BackendTable, Invocation, ResilientBackend};
use crate::traits::backend::{BackendKind, BackendOutput, BackendPayload, BackendRequest};
use crate::types::config::EngineConfig;
use crate::types::field::Modality;
use crate::types::partial::PartialExtraction;
use crate::types::request::ExtractionRequest;
use crate::types::schema::{structured_output_schema, ConfidenceDefaults, FieldCatalog};

/// Successful result of one modality.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub partial: PartialExtraction,

    /// Served from the response cache (no backend call, no quota)
    pub cached: bool,

    /// Cost billed for this modality
    pub billed_cost: f64,
}

impl Extraction {
    fn from_cache(partial: PartialExtraction) -> Self {
        Self {
            partial,
            cached: true,
            billed_cost: 0.0,
        }
    }
}

/// Extracts a [`PartialExtraction`] from one modality of a request.
#[async_trait]
pub trait ModalityExtractor: Send + Sync {
    fn modality(&self) -> Modality;

    /// Run the extraction. `deadline` bounds every backend call; `cancel`
    /// aborts in-flight calls.
    async fn extract(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure>;
}

/// Dependencies shared by every extractor: backends, quota, cache and the
/// field catalog used to parse outputs.
pub struct ExtractorCore {
    backends: BackendTable,
    quota: QuotaGuard,
    cache: Option<Arc<dyn ExtractionCache>>,
    cache_ttl: Duration,
    catalog: FieldCatalog,
    defaults: ConfidenceDefaults,
    schema: Value,
}

impl ExtractorCore {
    pub fn new(
        config: &EngineConfig,
        backends: BackendTable,
        quota: QuotaGuard,
        cache: Option<Arc<dyn ExtractionCache>>,
    ) -> Self {
        Self {
            backends,
            quota,
            cache: cache.filter(|_| config.cache.enabled),
            cache_ttl: config.cache.ttl(),
            catalog: config.fields.clone(),
            defaults: config.confidence_defaults.clone(),
            schema: structured_output_schema(),
        }
    }

    pub fn backends(&self) -> &BackendTable {
        &self.backends
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    fn backend(&self, kind: BackendKind) -> Result<&Arc<ResilientBackend>, Failure> {
        self.backends
            .get(kind)
            .ok_or_else(|| Failure::backend(false, format!("no {kind} backend configured")).with_backend(kind))
    }

    fn caching(&self) -> bool {
        self.cache.is_some()
    }

    async fn cached(&self, key: Option<&CacheKey>) -> Option<PartialExtraction> {
        let (cache, key) = (self.cache.as_ref()?, key?);
        let hit = cache.get(key).await;
        if hit.is_some() {
            debug!(key = %key, "Response cache hit");
        }
        hit
    }

    async fn remember(&self, key: Option<CacheKey>, partial: &PartialExtraction) {
        if partial.is_empty() {
            return;
        }
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), key) {
            cache.put(key, partial.clone(), self.cache_ttl).await;
        }
    }

    /// Call the backend. Quota is reserved and settled per attempt.
    async fn invoke(
        &self,
        kind: BackendKind,
        instructions: &str,
        payload: BackendPayload,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Invocation {
        let backend = match self.backend(kind) {
            Ok(backend) => backend,
            Err(failure) => return Invocation::failed(failure, 0, 0.0),
        };

        let request = BackendRequest {
            kind,
            instructions: prompts::with_fields(instructions, &self.catalog),
            payload,
            schema: self.schema.clone(),
        };
        backend.call(&request, &self.quota, deadline, cancel).await
    }

    /// Coerce backend output into a partial for `modality`.
    fn parse(&self, modality: Modality, output: &BackendOutput) -> PartialExtraction {
        let mut partial = PartialExtraction::new(modality);

        for (name, raw) in &output.fields {
            if raw.is_null() {
                continue;
            }
            let Some(spec) = self.catalog.get(name) else {
                debug!(%modality, field = %name, "Ignoring field outside the catalog");
                continue;
            };

            let confidence = output
                .confidence
                .get(name)
                .copied()
                .unwrap_or_else(|| self.defaults.for_band(spec.band));

            match spec.coerce(raw, modality, confidence) {
                Some(value) => partial.insert(name.clone(), value, confidence),
                None => debug!(%modality, field = %name, raw = %raw, "Unparseable field value left absent"),
            }
        }

        partial
    }
}

impl std::fmt::Debug for ExtractorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorCore")
            .field("backends", &self.backends)
            .field("quota", &self.quota)
            .field("caching", &self.caching())
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

fn missing_input(modality: Modality) -> Failure {
    Failure::backend(false, format!("request carries no {modality} input"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use crate::types::config::QuotaConfig;
    use crate::types::field::FieldData;
    use serde_json::json;

    fn core() -> ExtractorCore {
        let config = EngineConfig::default();
        let backends = BackendTable::builder(&config.backends)
            .client(BackendKind::Text, Arc::new(MockBackend::new("text")))
            .build();
        ExtractorCore::new(&config, backends, QuotaGuard::new(QuotaConfig::default()), None)
    }

    #[test]
    fn test_parse_uses_backend_confidence_then_band_default() {
        let core = core();
        let output = BackendOutput::default()
            .with_field("bedrooms", json!("3 bedrooms"))
            .with_confidence("bedrooms", 0.95)
            .with_field("price", json!("45,000/month"))
            .with_field("property_type", json!("Apartment"));

        let partial = core.parse(Modality::Text, &output);

        let bedrooms = partial.get("bedrooms").unwrap();
        assert_eq!(bedrooms.value, FieldData::Integer(3));
        assert_eq!(bedrooms.confidence, 0.95);

        let price = partial.get("price").unwrap();
        assert_eq!(price.value, FieldData::Decimal(45_000.0));
        assert_eq!(price.confidence, ConfidenceDefaults::default().price);

        let property_type = partial.get("property_type").unwrap();
        assert_eq!(property_type.value, FieldData::Text("apartment".into()));
        assert_eq!(property_type.confidence, ConfidenceDefaults::default().categorical);
    }

    #[test]
    fn test_parse_leaves_absent_and_unknown_out() {
        let core = core();
        let output = BackendOutput::default()
            .with_field("bedrooms", json!(null))
            .with_field("bathrooms", json!("a few"))
            .with_field("helipad", json!(true));

        let partial = core.parse(Modality::Text, &output);
        assert!(partial.is_empty());
    }

    #[tokio::test]
    async fn test_missing_backend_is_non_retryable() {
        let core = core();
        let invocation = core
            .invoke(
                BackendKind::Vision,
                prompts::IMAGE_PROMPT,
                BackendPayload::Images(vec![]),
                Instant::now() + Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        let failure = invocation.outcome.unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(failure.backend, Some(BackendKind::Vision));
    }
}
