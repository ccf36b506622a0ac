//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the extraction engine
//! without making real inference calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::quota::QuotaClock;
use crate::traits::backend::{BackendClient, BackendFailure, BackendOutput, BackendRequest};
use crate::traits::observer::{CallEvent, CallObserver, CallStatus};
use crate::types::field::{FieldData, Modality};
use crate::types::partial::PartialExtraction;

type Scripted = Result<BackendOutput, BackendFailure>;

/// A mock backend for testing.
///
/// Replays scripted outcomes in order, then falls back to a default outcome
/// (an empty output unless configured). Every request is recorded.
pub struct MockBackend {
    name: String,

    /// Outcomes returned in order before the default applies
    script: Mutex<VecDeque<Scripted>>,

    default: Scripted,

    /// Simulated latency per call
    delay: Option<Duration>,

    /// Call tracking for assertions
    requests: Arc<RwLock<Vec<BackendRequest>>>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            default: Ok(BackendOutput::default()),
            delay: None,
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Queue a successful outcome.
    pub fn then_output(self, output: BackendOutput) -> Self {
        self.script.lock().unwrap().push_back(Ok(output));
        self
    }

    /// Queue a failure.
    pub fn then_fail(self, failure: BackendFailure) -> Self {
        self.script.lock().unwrap().push_back(Err(failure));
        self
    }

    /// Outcome once the script is exhausted.
    pub fn with_default_output(mut self, output: BackendOutput) -> Self {
        self.default = Ok(output);
        self
    }

    pub fn with_default_failure(mut self, failure: BackendFailure) -> Self {
        self.default = Err(failure);
        self
    }

    /// Sleep this long (tokio time) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls that reached the backend.
    pub fn call_count(&self) -> usize {
        self.requests.read().unwrap().len()
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.read().unwrap().clone()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendOutput, BackendFailure> {
        self.requests.write().unwrap().push(request.clone());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        outcome
    }
}

/// Observer that keeps every call event.
#[derive(Default)]
pub struct RecordingObserver {
    events: RwLock<Vec<CallEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<CallStatus> {
        self.events.read().unwrap().iter().map(|e| e.status).collect()
    }

    pub fn total_billed(&self) -> f64 {
        self.events.read().unwrap().iter().map(|e| e.billed_cost).sum()
    }
}

impl CallObserver for RecordingObserver {
    fn on_call(&self, event: &CallEvent) {
        self.events.write().unwrap().push(event.clone());
    }
}

/// Settable wall clock for quota window tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl QuotaClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Build a partial from `(field, value, confidence)` triples.
pub fn partial<'a>(
    modality: Modality,
    fields: impl IntoIterator<Item = (&'a str, FieldData, f32)>,
) -> PartialExtraction {
    fields
        .into_iter()
        .fold(PartialExtraction::new(modality), |partial, (name, value, confidence)| {
            partial.with_field(name, value, confidence)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::backend::{BackendErrorKind, BackendKind, BackendPayload};
    use serde_json::json;

    fn request() -> BackendRequest {
        BackendRequest {
            kind: BackendKind::Text,
            instructions: String::new(),
            payload: BackendPayload::Text("flat".into()),
            schema: json!({}),
        }
    }

    #[tokio::test]
    async fn test_mock_backend_script_then_default() {
        let mock = MockBackend::new("text")
            .then_fail(BackendFailure::new(BackendErrorKind::Unavailable, "503"))
            .with_default_output(BackendOutput::default().with_field("bedrooms", json!(2)));

        assert!(mock.invoke(&request()).await.is_err());
        assert_eq!(mock.invoke(&request()).await.unwrap().fields["bedrooms"], 2);
        assert_eq!(mock.invoke(&request()).await.unwrap().fields["bedrooms"], 2);
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn test_partial_helper() {
        let partial = partial(
            Modality::Text,
            [
                ("bedrooms", FieldData::Integer(3), 0.8),
                ("city", FieldData::Text("Lisbon".into()), 0.6),
            ],
        );
        assert_eq!(partial.len(), 2);
        assert!((partial.overall_confidence() - 0.7).abs() < 1e-6);
    }
}
