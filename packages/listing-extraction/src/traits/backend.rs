//! Backend trait for inference providers.
//!
//! A backend is a thin adapter around one external model (text, vision, or
//! transcription). The engine only relies on the contract here: a canonical
//! request goes in, structured output or a classified failure comes out.
//! Timeouts, retries, circuit breaking and rate limiting are layered on top
//! by [`ResilientBackend`](crate::resilience::ResilientBackend).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Failure;
use crate::types::request::{ImageRef, VoiceRef};

/// Which provider family a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Text,
    Vision,
    Voice,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Text, BackendKind::Vision, BackendKind::Voice];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BackendPayload {
    Text(String),
    Images(Vec<ImageRef>),
    Audio(VoiceRef),
}

impl BackendPayload {
    /// Billable units: images for vision, one otherwise.
    pub fn units(&self) -> u32 {
        match self {
            Self::Images(images) => images.len() as u32,
            _ => 1,
        }
    }
}

/// Canonical request sent to every backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRequest {
    pub kind: BackendKind,

    /// System-level instructions for the model
    pub instructions: String,

    pub payload: BackendPayload,

    /// JSON schema the structured output must follow
    pub schema: Value,
}

/// Structured output returned by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Raw field values keyed by canonical field name
    #[serde(default)]
    pub fields: Map<String, Value>,

    /// Per-field confidence, when the provider reports one
    #[serde(default)]
    pub confidence: HashMap<String, f32>,

    /// Transcript (transcription backends)
    #[serde(default)]
    pub transcript: Option<String>,

    /// Actual cost billed for this call, if the provider reports it
    #[serde(default)]
    pub billed_cost: Option<f64>,
}

impl BackendOutput {
    /// Parse a provider's JSON document.
    pub fn from_json(raw: &str) -> Result<Self, BackendFailure> {
        serde_json::from_str(raw).map_err(|e| {
            BackendFailure::new(BackendErrorKind::MalformedOutput, format!("unparseable output: {e}"))
        })
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_confidence(mut self, name: impl Into<String>, confidence: f32) -> Self {
        self.confidence.insert(name.into(), confidence);
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn with_billed_cost(mut self, cost: f64) -> Self {
        self.billed_cost = Some(cost);
        self
    }
}

/// Classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Provider-side timeout
    Timeout,
    /// Provider signalled throttling (HTTP 429)
    RateLimited,
    /// 5xx-equivalent
    Unavailable,
    /// Request rejected as malformed (HTTP 400/422)
    BadInput,
    /// Credentials rejected (HTTP 401/403)
    Auth,
    /// Response did not follow the output schema
    MalformedOutput,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate limited",
            Self::Unavailable => "unavailable",
            Self::BadInput => "bad input",
            Self::Auth => "auth",
            Self::MalformedOutput => "malformed output",
        };
        f.write_str(s)
    }
}

/// Failure reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub kind: BackendErrorKind,
    pub detail: String,

    /// Cost billed for work completed before the failure
    pub billed_cost: f64,
}

impl BackendFailure {
    pub fn new(kind: BackendErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            billed_cost: 0.0,
        }
    }

    pub fn with_billed_cost(mut self, cost: f64) -> Self {
        self.billed_cost = cost;
        self
    }

    /// Transient failures worth another attempt.
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Timeout | BackendErrorKind::RateLimited | BackendErrorKind::Unavailable
        )
    }

    /// Whether the failure says something about backend health.
    ///
    /// Bad-input rejections are the caller's problem, not the backend's.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self.kind, BackendErrorKind::BadInput)
    }

    /// Convert into the engine-level failure.
    pub fn into_failure(self, backend: BackendKind) -> Failure {
        let failure = match self.kind {
            BackendErrorKind::Timeout => Failure::timeout(format!("{backend} backend: {}", self.detail)),
            BackendErrorKind::RateLimited => {
                Failure::rate_limited(format!("{backend} backend throttled: {}", self.detail))
            }
            kind => Failure::backend(self.retryable(), format!("{kind}: {}", self.detail)),
        };
        failure.with_backend(backend)
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for BackendFailure {}

/// One external inference provider.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Provider label used in logs.
    fn name(&self) -> &str;

    /// Perform one call. Implementations must be cancel-safe: dropping the
    /// future aborts the underlying request.
    async fn invoke(&self, request: &BackendRequest) -> Result<BackendOutput, BackendFailure>;
}

#[async_trait]
impl<T: BackendClient + ?Sized> BackendClient for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendOutput, BackendFailure> {
        (**self).invoke(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_retryable_classification() {
        assert!(BackendFailure::new(BackendErrorKind::Unavailable, "502").retryable());
        assert!(BackendFailure::new(BackendErrorKind::RateLimited, "429").retryable());
        assert!(!BackendFailure::new(BackendErrorKind::BadInput, "400").retryable());
        assert!(!BackendFailure::new(BackendErrorKind::Auth, "401").retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(BackendFailure::new(BackendErrorKind::Timeout, "slow").trips_breaker());
        assert!(BackendFailure::new(BackendErrorKind::Auth, "401").trips_breaker());
        assert!(!BackendFailure::new(BackendErrorKind::BadInput, "400").trips_breaker());
    }

    #[test]
    fn test_into_failure() {
        let failure = BackendFailure::new(BackendErrorKind::Timeout, "no response")
            .into_failure(BackendKind::Vision);
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.backend, Some(BackendKind::Vision));

        let failure = BackendFailure::new(BackendErrorKind::BadInput, "unsupported format")
            .into_failure(BackendKind::Voice);
        assert_eq!(failure.kind, FailureKind::BackendError);
        assert!(!failure.retryable);
    }

    #[test]
    fn test_output_from_json() {
        let output = BackendOutput::from_json(
            r#"{"fields": {"bedrooms": 3}, "confidence": {"bedrooms": 0.9}}"#,
        )
        .unwrap();
        assert_eq!(output.fields["bedrooms"], 3);
        assert_eq!(output.confidence["bedrooms"], 0.9);

        let err = BackendOutput::from_json("not json").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::MalformedOutput);
    }

    #[test]
    fn test_image_units() {
        let images = vec![
            ImageRef::new("https://cdn.example.com/1.jpg").unwrap(),
            ImageRef::new("https://cdn.example.com/2.jpg").unwrap(),
        ];
        assert_eq!(BackendPayload::Images(images).units(), 2);
        assert_eq!(BackendPayload::Text("x".into()).units(), 1);
    }
}
