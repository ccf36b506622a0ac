//! Typed errors for the listing extraction engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.
//!
//! [`Failure`] is the single fault value that flows out of the resilience
//! wrapper, the quota guard, the modality extractors and the orchestrator.
//! A failed validation is not an error: it is reported through
//! [`ValidationReport`](crate::types::report::ValidationReport).

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::types::field::Modality;
use crate::traits::backend::BackendKind;

/// Category of a [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A call (or the whole request) ran past its time budget.
    Timeout,

    /// Local rate limiter budget exhausted, or the backend signalled 429.
    RateLimited,

    /// The backend's circuit breaker is open; no call was attempted.
    CircuitOpen,

    /// The cost ceiling for the current day or month would be exceeded.
    QuotaExceeded,

    /// The backend rejected or failed the call.
    BackendError,

    /// No modality produced a partial extraction.
    AllModalitiesFailed,

    /// The caller or the orchestrator deadline cancelled the work.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::CircuitOpen => "circuit open",
            Self::QuotaExceeded => "quota exceeded",
            Self::BackendError => "backend error",
            Self::AllModalitiesFailed => "all modalities failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A failed invocation, extraction or orchestration.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {detail}")]
pub struct Failure {
    /// What went wrong
    pub kind: FailureKind,

    /// Whether retrying the same call may succeed
    pub retryable: bool,

    /// Human-readable detail
    pub detail: String,

    /// Backend the failure originated from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

impl Failure {
    fn new(kind: FailureKind, retryable: bool, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            detail: detail.into(),
            backend: None,
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, true, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, true, detail)
    }

    pub fn circuit_open(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::CircuitOpen, false, detail)
    }

    pub fn quota_exceeded(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::QuotaExceeded, false, detail)
    }

    /// A backend-side failure. 5xx-style failures are retryable, bad input
    /// and auth rejections are not.
    pub fn backend(retryable: bool, detail: impl Into<String>) -> Self {
        Self::new(FailureKind::BackendError, retryable, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, false, detail)
    }

    /// Summarize the per-modality failures of a request that produced nothing.
    pub fn all_modalities_failed(failures: &[(Modality, Failure)]) -> Self {
        let detail = if failures.is_empty() {
            "no modality completed before the deadline".to_string()
        } else {
            failures
                .iter()
                .map(|(modality, failure)| format!("{modality}: {failure}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        Self::new(FailureKind::AllModalitiesFailed, false, detail)
    }

    /// Tag the failure with the backend it came from.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Errors raised while loading or validating [`EngineConfig`](crate::types::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing failed
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is outside its allowed range
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised when building an [`ExtractionRequest`](crate::types::request::ExtractionRequest).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No text, images, or voice note supplied
    #[error("request must carry at least one of text, images, or voice")]
    NoModality,

    /// Text supplied but blank
    #[error("text input is blank")]
    BlankText,

    /// Image URI could not be parsed
    #[error("invalid image reference: {0}")]
    InvalidImage(String),

    /// Voice URI could not be parsed
    #[error("invalid voice reference: {0}")]
    InvalidVoice(String),
}

/// Errors from the external amenity-catalog matcher.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Lookup service unavailable
    #[error("catalog lookup failed: {0}")]
    Lookup(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Failure>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let failure = Failure::timeout("vision call exceeded 30s");
        assert_eq!(failure.to_string(), "timeout: vision call exceeded 30s");
        assert!(failure.retryable);
    }

    #[test]
    fn test_all_modalities_failed_summary() {
        let failure = Failure::all_modalities_failed(&[
            (Modality::Voice, Failure::circuit_open("voice backend cooling down")),
        ]);
        assert_eq!(failure.kind, FailureKind::AllModalitiesFailed);
        assert!(failure.detail.contains("voice"));
        assert!(!failure.retryable);
    }
}
