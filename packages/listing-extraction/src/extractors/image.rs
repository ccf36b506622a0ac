//! Image modality: the listing's photo set.
//!
//! Large sets are split into ordered batches of `images.max_per_call`.
//! Batches run concurrently; successful ones are folded into a single
//! partial. The modality fails only when every batch fails.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{missing_input, prompts, Extraction, ExtractorCore, ModalityExtractor};
use crate::cache::CacheKey;
use crate::error::Failure;
use crate::traits::backend::{BackendKind, BackendPayload};
use crate::types::field::Modality;
use crate::types::partial::PartialExtraction;
use crate::types::request::ExtractionRequest;

#[derive(Debug, Clone)]
pub struct ImageExtractor {
    core: Arc<ExtractorCore>,
    max_per_call: usize,
}

impl ImageExtractor {
    pub fn new(core: Arc<ExtractorCore>, max_per_call: usize) -> Self {
        Self {
            core,
            max_per_call: max_per_call.max(1),
        }
    }
}

#[async_trait]
impl ModalityExtractor for ImageExtractor {
    fn modality(&self) -> Modality {
        Modality::Image
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Extraction, Failure> {
        let images = request.images();
        if images.is_empty() {
            return Err(missing_input(Modality::Image));
        }

        let key = self
            .core
            .backend(BackendKind::Vision)
            .ok()
            .filter(|_| self.core.caching())
            .and_then(|backend| CacheKey::for_images(backend.model(), images));
        if let Some(partial) = self.core.cached(key.as_ref()).await {
            return Ok(Extraction::from_cache(partial));
        }

        let batches = images.chunks(self.max_per_call).map(|batch| {
            self.core.invoke(
                BackendKind::Vision,
                prompts::IMAGE_PROMPT,
                BackendPayload::Images(batch.to_vec()),
                deadline,
                cancel,
            )
        });
        let invocations = join_all(batches).await;
        let batch_count = invocations.len();

        let mut billed_cost = 0.0;
        let mut combined: Option<PartialExtraction> = None;
        let mut first_failure = None;

        for (index, invocation) in invocations.into_iter().enumerate() {
            billed_cost += invocation.billed_cost;
            match invocation.outcome {
                Ok(output) => {
                    let partial = self.core.parse(Modality::Image, &output);
                    match combined.as_mut() {
                        Some(combined) => combined.absorb(partial),
                        None => combined = Some(partial),
                    }
                }
                Err(failure) => {
                    warn!(batch = index, batches = batch_count, error = %failure, "Image batch failed");
                    first_failure.get_or_insert(failure);
                }
            }
        }

        let Some(partial) = combined else {
            return Err(first_failure.unwrap_or_else(|| missing_input(Modality::Image)));
        };

        debug!(
            images = images.len(),
            batches = batch_count,
            fields = partial.len(),
            "Image extraction complete"
        );

        // A set with failed batches is incomplete and must not be served again.
        if first_failure.is_none() {
            self.core.remember(key, &partial).await;
        }

        Ok(Extraction {
            partial,
            cached: false,
            billed_cost,
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
    use crate::traits::backend::{BackendErrorKind, BackendFailure, BackendOutput};
    use crate::types::config::{BackendConfig, EngineConfig, QuotaConfig, RetryConfig};
    use crate::types::field::FieldData;
    use crate::types::request::ImageRef;
    use serde_json::json;
    use std::time::Duration;

    fn extractor(mock: Arc<MockBackend>, max_per_call: usize) -> (ImageExtractor, Arc<ExtractorCore>) {
        let config = EngineConfig::default().with_backend(
            BackendKind::Vision,
            BackendConfig::vision_default().with_retry(RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            }),
        );
        let backends = BackendTable::builder(&config.backends)
            .client(BackendKind::Vision, mock)
            .build();
        let core = Arc::new(ExtractorCore::new(
            &config,
            backends,
            QuotaGuard::new(QuotaConfig::default()),
            Some(Arc::new(MemoryCache::default())),
        ));
        (ImageExtractor::new(core.clone(), max_per_call), core)
    }

    fn request(count: usize, digested: bool) -> ExtractionRequest {
        let images = (0..count).map(|i| {
            let image = ImageRef::new(&format!("https://cdn.example.com/{i}.jpg")).unwrap();
            if digested {
                image.with_digest(format!("digest-{i}"))
            } else {
                image
            }
        });
        ExtractionRequest::builder().images(images).build().unwrap()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_batches_are_combined() {
        let mock = Arc::new(
            MockBackend::new("vision")
                .then_output(
                    BackendOutput::default()
                        .with_field("bedrooms", json!(2))
                        .with_confidence("bedrooms", 0.6)
                        .with_field("amenities", json!(["pool"])),
                )
                .then_output(
                    BackendOutput::default()
                        .with_field("bedrooms", json!(3))
                        .with_confidence("bedrooms", 0.9)
                        .with_field("amenities", json!(["balcony"])),
                ),
        );
        let (extractor, _) = extractor(mock.clone(), 2);

        let extraction = extractor
            .extract(&request(4, false), deadline(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.call_count(), 2);
        let partial = extraction.partial;
        assert_eq!(partial.modality(), Modality::Image);
        assert_eq!(partial.get("bedrooms").unwrap().value, FieldData::Integer(3));
        let FieldData::Set(items) = &partial.get("amenities").unwrap().value else {
            panic!("amenities should be a set");
        };
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_still_succeeds() {
        let mock = Arc::new(
            MockBackend::new("vision")
                .then_output(BackendOutput::default().with_field("furnished", json!(true)))
                .then_fail(
                    BackendFailure::new(BackendErrorKind::BadInput, "unsupported format").with_billed_cost(0.01),
                ),
        );
        let (extractor, core) = extractor(mock.clone(), 1);

        let extraction = extractor
            .extract(&request(2, true), deadline(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(extraction.partial.len(), 1);
        assert!(extraction.billed_cost > 0.01);
        assert!(core.quota().usage().daily_spent > 0.01);

        // Incomplete results are not cached.
        extractor
            .extract(&request(2, true), deadline(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_all_batches_failing_fails_modality() {
        let mock = Arc::new(
            MockBackend::new("vision")
                .with_default_failure(BackendFailure::new(BackendErrorKind::Auth, "401")),
        );
        let (extractor, _) = extractor(mock, 2);

        let failure = extractor
            .extract(&request(3, false), deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::BackendError);
    }

    #[tokio::test]
    async fn test_digested_set_cached() {
        let mock = Arc::new(
            MockBackend::new("vision")
                .with_default_output(BackendOutput::default().with_field("bedrooms", json!(3))),
        );
        let (extractor, _) = extractor(mock.clone(), 8);
        let cancel = CancellationToken::new();

        extractor.extract(&request(2, true), deadline(), &cancel).await.unwrap();
        let second = extractor.extract(&request(2, true), deadline(), &cancel).await.unwrap();

        assert!(second.cached);
        assert_eq!(mock.call_count(), 1);
    }
}
