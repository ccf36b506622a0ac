//! Request orchestration.
//!
//! One call walks `Received -> Dispatching -> AwaitingAll -> Merging ->
//! Validating -> Done`, or ends in `Failed` when no modality produced a
//! partial. Modalities run concurrently, each bounded by the request
//! deadline; a modality that fails or runs out of time is reported, not
//! fatal. Work still running at the deadline is cancelled, which drops the
//! in-flight backend calls.

use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{ExtractionCache, MemoryCache};
use crate::error::{Failure, Result};
use crate::extractors::{
    Extraction, ExtractorCore, ImageExtractor, ModalityExtractor, TextExtractor, VoiceExtractor,
};
use crate::merge::MergeEngine;
use crate::quota::QuotaGuard;
use crate::resilience::BackendTable;
use crate::traits::matcher::AmenityMatcher;
use crate::types::config::EngineConfig;
use crate::types::field::Modality;
use crate::types::record::MergedRecord;
use crate::types::report::ValidationReport;
use crate::types::request::ExtractionRequest;
use crate::validate::Validator;

// ============================================================================
// Outcome types
// ============================================================================

/// Lifecycle of one orchestration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Received,
    Dispatching,
    AwaitingAll,
    Merging,
    Validating,
    Done,
    Failed,
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Dispatching => "dispatching",
            Self::AwaitingAll => "awaiting_all",
            Self::Merging => "merging",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How one requested modality fared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModalityStatus {
    Succeeded { fields: usize, billed_cost: f64 },
    Cached { fields: usize },
    Failed { failure: Failure },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalityReport {
    pub modality: Modality,
    #[serde(flatten)]
    pub status: ModalityStatus,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl ModalityReport {
    pub fn succeeded(&self) -> bool {
        !matches!(self.status, ModalityStatus::Failed { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.status {
            ModalityStatus::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// Result of a successful orchestration call.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutcome {
    pub request_id: Uuid,
    pub record: MergedRecord,
    pub report: ValidationReport,

    /// One entry per requested modality, in request order
    pub modalities: Vec<ModalityReport>,

    /// Total cost billed for this request
    pub billed_cost: f64,

    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl ExtractionOutcome {
    pub fn modality(&self, modality: Modality) -> Option<&ModalityReport> {
        self.modalities.iter().find(|m| m.modality == modality)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    extractors: Vec<Arc<dyn ModalityExtractor>>,
    core: Arc<ExtractorCore>,
    merge: MergeEngine,
    validator: Validator,
    default_deadline: Duration,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig, backends: BackendTable) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            backends,
            quota: None,
            cache: None,
            matcher: None,
        }
    }

    pub fn quota(&self) -> &QuotaGuard {
        self.core.quota()
    }

    pub fn backends(&self) -> &BackendTable {
        self.core.backends()
    }

    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    /// Process a request with a budget relative to now.
    pub async fn process_within(
        &self,
        request: &ExtractionRequest,
        budget: Duration,
    ) -> Result<ExtractionOutcome> {
        self.process(request, Instant::now() + budget).await
    }

    /// Process a request, finishing by `deadline`.
    pub async fn process(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
    ) -> Result<ExtractionOutcome> {
        self.process_with_cancel(request, deadline, &CancellationToken::new())
            .await
    }

    /// Process a request; cancelling `cancel` aborts every in-flight call.
    #[instrument(skip(self, request, deadline, cancel), fields(request_id = %request.id()))]
    pub async fn process_with_cancel(
        &self,
        request: &ExtractionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome> {
        let started = Instant::now();
        let mut state = OrchestrationState::Received;
        let modalities = request.modalities();
        info!(
            modalities = ?modalities,
            budget_ms = deadline.saturating_duration_since(started).as_millis() as u64,
            "Extraction request received"
        );

        // Anything still running when this call returns is cancelled.
        let request_cancel = cancel.child_token();
        let _cancel_on_exit = request_cancel.clone().drop_guard();

        transition(&mut state, OrchestrationState::Dispatching);
        let tasks = modalities.iter().filter_map(|modality| {
            let extractor = self.extractor(*modality)?;
            let task_cancel = request_cancel.child_token();
            Some(async move {
                let task_started = Instant::now();
                let result = match timeout_at(deadline, extractor.extract(request, deadline, &task_cancel)).await {
                    Ok(result) => result,
                    Err(_) => {
                        task_cancel.cancel();
                        Err(Failure::timeout(format!(
                            "{} extraction cancelled at the request deadline",
                            extractor.modality()
                        )))
                    }
                };
                (extractor.modality(), result, task_started.elapsed())
            })
        });

        transition(&mut state, OrchestrationState::AwaitingAll);
        let results = join_all(tasks).await;

        let mut partials = Vec::with_capacity(results.len());
        let mut reports = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut billed_cost = 0.0;

        for (modality, result, elapsed) in results {
            let status = match result {
                Ok(Extraction {
                    partial,
                    cached,
                    billed_cost: cost,
                }) => {
                    billed_cost += cost;
                    let fields = partial.len();
                    debug!(%modality, fields, cached, elapsed_ms = elapsed.as_millis() as u64, "Modality completed");
                    partials.push(partial);
                    if cached {
                        ModalityStatus::Cached { fields }
                    } else {
                        ModalityStatus::Succeeded {
                            fields,
                            billed_cost: cost,
                        }
                    }
                }
                Err(failure) => {
                    warn!(%modality, error = %failure, "Modality unavailable");
                    failures.push((modality, failure.clone()));
                    ModalityStatus::Failed { failure }
                }
            };
            reports.push(ModalityReport {
                modality,
                status,
                elapsed,
            });
        }

        if partials.is_empty() {
            transition(&mut state, OrchestrationState::Failed);
            let failure = if cancel.is_cancelled() {
                Failure::cancelled("request cancelled by caller")
            } else {
                Failure::all_modalities_failed(&failures)
            };
            error!(error = %failure, elapsed_ms = started.elapsed().as_millis() as u64, "Extraction failed");
            return Err(failure);
        }

        transition(&mut state, OrchestrationState::Merging);
        let record = match timeout_at(deadline, self.merge.merge_and_match(&partials)).await {
            Ok(record) => record,
            Err(_) => {
                warn!("Catalog matching ran past the deadline, merging without it");
                self.merge.merge(&partials)
            }
        };

        transition(&mut state, OrchestrationState::Validating);
        let report = self.validator.validate(&record);

        transition(&mut state, OrchestrationState::Done);
        let elapsed = started.elapsed();
        info!(
            status = ?report.status,
            fields = record.len(),
            overall_confidence = record.overall_confidence,
            completeness = report.completeness,
            billed_cost,
            elapsed_ms = elapsed.as_millis() as u64,
            "Extraction complete"
        );

        Ok(ExtractionOutcome {
            request_id: request.id(),
            record,
            report,
            modalities: reports,
            billed_cost,
            elapsed,
        })
    }

    fn extractor(&self, modality: Modality) -> Option<&Arc<dyn ModalityExtractor>> {
        self.extractors.iter().find(|e| e.modality() == modality)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("core", &self.core)
            .field("merge", &self.merge)
            .field("validator", &self.validator)
            .field("default_deadline", &self.default_deadline)
            .finish_non_exhaustive()
    }
}

fn transition(state: &mut OrchestrationState, next: OrchestrationState) {
    debug!(from = %state, to = %next, "State transition");
    *state = next;
}

/// Builder for [`Orchestrator`].
///
/// Quota guard and cache default to fresh in-process instances; pass shared
/// ones to share spend and cached results across orchestrators.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    backends: BackendTable,
    quota: Option<QuotaGuard>,
    cache: Option<Arc<dyn ExtractionCache>>,
    matcher: Option<Arc<dyn AmenityMatcher>>,
}

impl OrchestratorBuilder {
    pub fn quota(mut self, quota: QuotaGuard) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ExtractionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn matcher(mut self, matcher: Arc<dyn AmenityMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let quota = self
            .quota
            .unwrap_or_else(|| QuotaGuard::new(config.quota.clone()));
        let cache = self.cache.or_else(|| {
            config
                .cache
                .enabled
                .then(|| Arc::new(MemoryCache::new(config.cache.max_entries)) as Arc<dyn ExtractionCache>)
        });

        let core = Arc::new(ExtractorCore::new(&config, self.backends, quota, cache));
        let extractors: Vec<Arc<dyn ModalityExtractor>> = vec![
            Arc::new(TextExtractor::new(core.clone())),
            Arc::new(ImageExtractor::new(core.clone(), config.images.max_per_call)),
            Arc::new(VoiceExtractor::new(core.clone())),
        ];

        let mut merge = MergeEngine::new(config.merge.clone());
        if let Some(matcher) = self.matcher {
            merge = merge.with_matcher(matcher);
        }

        Orchestrator {
            extractors,
            core,
            merge,
            validator: Validator::new(config.validation.clone()),
            default_deadline: config.orchestrator.default_deadline(),
        }
    }
}
