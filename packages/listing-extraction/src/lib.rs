//! Multimodal Listing Extraction Engine
//!
//! Turns a property listing described through free text, photos, and a
//! recorded voice note into one structured record with per-field
//! provenance, confidence, and a validation report.
//!
//! # Design Philosophy
//!
//! **"Evidence, not guesses"**
//!
//! - Every value carries the modality it came from and a confidence
//! - Fields nobody mentioned stay absent; nothing is inferred
//! - A failing modality degrades the result, never the request
//! - Backends are untrusted: bounded by deadlines, retries, breakers, and budgets
//! - Library handles mechanics, the deployment supplies providers and catalogs
//!
//! # Usage
//!
//! ```rust,ignore
//! use listing_extraction::{BackendKind, BackendTable, EngineConfig, ExtractionRequest, Orchestrator};
//! use listing_extraction::testing::MockBackend;
//! use std::{sync::Arc, time::Duration};
//!
//! let config = EngineConfig::from_file("extraction.toml")?;
//! let backends = BackendTable::builder(&config.backends)
//!     .client(BackendKind::Text, Arc::new(MockBackend::new("text")))
//!     .build();
//! let orchestrator = Orchestrator::builder(config, backends).build();
//!
//! let request = ExtractionRequest::from_text("Bright 2-bed flat in Alfama, 1200/month")?;
//! let outcome = orchestrator.process_within(&request, Duration::from_secs(30)).await?;
//! println!("{:?} {:?}", outcome.report.status, outcome.record.get("bedrooms"));
//! ```
//!
//! # Modules
//!
//! - [`orchestrator`] - Request lifecycle, concurrent dispatch, deadline handling
//! - [`extractors`] - Per-modality extraction (text, image, voice)
//! - [`resilience`] - Timeouts, retries, circuit breakers, rate limits
//! - [`quota`] - Daily and monthly spend ceilings
//! - [`cache`] - Response cache keyed by content hash
//! - [`merge`] - Cross-modality reconciliation
//! - [`validate`] - Required fields, ranges, consistency
//! - [`traits`] - Backend, observer, and catalog-matcher seams
//! - [`types`] - Requests, fields, records, reports, configuration
//! - [`backends`] - Reference provider implementations
//! - [`testing`] - Mock implementations for testing

pub mod backends;
pub mod cache;
pub mod error;
pub mod extractors;
pub mod merge;
pub mod orchestrator;
pub mod quota;
pub mod resilience;
pub mod testing;
pub mod traits;
pub mod types;
pub mod validate;

// Re-export core types at crate root
pub use error::{ConfigError, Failure, FailureKind, MatchError, RequestError, Result};
pub use traits::{
    backend::{
        BackendClient, BackendErrorKind, BackendFailure, BackendKind, BackendOutput, BackendPayload,
        BackendRequest,
    },
    matcher::{AmenityMatcher, StaticCatalogMatcher},
    observer::{CallEvent, CallObserver, CallStatus, TracingObserver},
};
pub use types::{
    config::{
        BackendConfig, BackendsConfig, BreakerConfig, CacheConfig, ConsistencyRule, CostConfig,
        EngineConfig, ImageConfig, MergeConfig, OrchestratorConfig, QuotaConfig, RangeRule,
        RateLimitConfig, RetryConfig, ValidationConfig,
    },
    field::{FieldData, FieldValue, Modality, SetItem},
    partial::PartialExtraction,
    record::{MergedField, MergedRecord, RejectedValue},
    report::{IssueCode, Severity, ValidationIssue, ValidationReport, ValidationStatus},
    request::{ExtractionRequest, ExtractionRequestBuilder, ImageRef, VoiceRef},
    schema::{ConfidenceBand, ConfidenceDefaults, FieldCatalog, FieldKind, FieldSpec},
};

pub use cache::{CacheKey, ExtractionCache, MemoryCache};
pub use extractors::{
    Extraction, ExtractorCore, ImageExtractor, ModalityExtractor, TextExtractor, VoiceExtractor,
};
pub use merge::MergeEngine;
pub use orchestrator::{
    ExtractionOutcome, ModalityReport, ModalityStatus, OrchestrationState, Orchestrator,
    OrchestratorBuilder,
};
pub use quota::{QuotaClock, QuotaGuard, QuotaReservation, QuotaUsage, SystemClock};
pub use resilience::{BackendTable, CircuitState, Invocation, ResilientBackend};
pub use validate::Validator;

#[cfg(feature = "openai")]
pub use backends::OpenAiBackend;
