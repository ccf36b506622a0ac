//! Text modality: the seller's free-form description.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{missing_input, prompts, Extraction, ExtractorCore, ModalityExtractor};
use crate::cache::CacheKey;
use crate::error::Failure;
use crate::traits::backend::{BackendKind, BackendPayload};
use crate::types::field::Modality;
use crate::types::request::ExtractionRequest;

#[derive(Debug, Clone)]
pub struct TextExtractor {
    core: Arc<ExtractorCore>,
}

impl TextExtractor {
    pub fn new(core: Arc<ExtractorCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ModalityExtractor for TextExtractor {
    fn modality(&self) -> Modality {
        Modality::Text
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let text = request.text().ok_or_else(|| missing_input(Modality::Text))?;

        let key = self
            .core
            .backend(BackendKind::Text)
            .ok()
            .filter(|_| self.core.caching())
            .map(|backend| CacheKey::for_text(backend.model(), text));
        if let Some(partial) = self.core.cached(key.as_ref()).await {
            return Ok(Extraction::from_cache(partial));
        }

        let invocation = self
            .core
            .invoke(
                BackendKind::Text,
                prompts::TEXT_PROMPT,
                BackendPayload::Text(text.to_string()),
                deadline,
                cancel,
            )
            .await;
        let output = invocation.outcome?;

        let partial = self.core.parse(Modality::Text, &output);
        debug!(fields = partial.len(), attempts = invocation.attempts, "Text extraction complete");
        self.core.remember(key, &partial).await;

        Ok(Extraction {
            partial,
            cached: false,
            billed_cost: invocation.billed_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::FailureKind;
    use crate::quota::QuotaGuard;
    use crate::resilience::BackendTable;
    use crate::testing::MockBackend;
    use crate::traits::backend::BackendOutput;
    use crate::types::config::{EngineConfig, QuotaConfig};
    use crate::types::field::FieldData;
    use serde_json::json;
    use std::time::Duration;

    fn extractor(mock: Arc<MockBackend>, quota: QuotaConfig) -> (TextExtractor, Arc<ExtractorCore>) {
        let config = EngineConfig::default();
        let backends = BackendTable::builder(&config.backends)
            .client(BackendKind::Text, mock)
            .build();
        let core = Arc::new(ExtractorCore::new(
            &config,
            backends,
            QuotaGuard::new(quota),
            Some(Arc::new(MemoryCache::default())),
        ));
        (TextExtractor::new(core.clone()), core)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_extracts_and_caches() {
        let mock = Arc::new(MockBackend::new("text").with_default_output(
            BackendOutput::default()
                .with_field("bedrooms", json!(3))
                .with_confidence("bedrooms", 0.7)
                .with_billed_cost(0.002),
        ));
        let (extractor, core) = extractor(mock.clone(), QuotaConfig::default());
        let request = ExtractionRequest::from_text("Bright 3 bedroom flat").unwrap();
        let cancel = CancellationToken::new();

        let first = extractor.extract(&request, deadline(), &cancel).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.partial.get("bedrooms").unwrap().value, FieldData::Integer(3));
        let spent = core.quota().usage().daily_spent;

        let second = extractor.extract(&request, deadline(), &cancel).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.partial, first.partial);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(core.quota().usage().daily_spent, spent);
    }

    #[tokio::test]
    async fn test_quota_exceeded_skips_backend() {
        let mock = Arc::new(MockBackend::new("text"));
        let (extractor, _) = extractor(
            mock.clone(),
            QuotaConfig {
                daily_ceiling: 0.0,
                monthly_ceiling: 0.0,
            },
        );
        let request = ExtractionRequest::from_text("3 bed flat").unwrap();

        let failure = extractor
            .extract(&request, deadline(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::QuotaExceeded);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_result_not_cached() {
        let mock = Arc::new(MockBackend::new("text"));
        let (extractor, _) = extractor(mock.clone(), QuotaConfig::default());
        let request = ExtractionRequest::from_text("call me").unwrap();
        let cancel = CancellationToken::new();

        extractor.extract(&request, deadline(), &cancel).await.unwrap();
        extractor.extract(&request, deadline(), &cancel).await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }
}
