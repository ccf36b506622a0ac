//! Call-outcome events emitted by the resilience wrapper.
//!
//! Every attempt against a backend produces one [`CallEvent`], including
//! attempts rejected locally (circuit open, rate limited) before any network
//! traffic. Quota accounting and metrics hang off this hook.

use serde::Serialize;
use std::time::Duration;

use crate::error::FailureKind;
use crate::traits::backend::BackendKind;

/// What happened on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum CallStatus {
    Succeeded,
    /// The backend was called and failed
    Failed(FailureKind),
    /// The attempt never reached the backend
    Rejected(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEvent {
    pub backend: BackendKind,

    /// 1-based attempt number within one wrapped call
    pub attempt: u32,

    pub status: CallStatus,

    /// Cost billed by this attempt
    pub billed_cost: f64,

    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

/// Receives call-outcome events.
pub trait CallObserver: Send + Sync {
    fn on_call(&self, event: &CallEvent);
}

/// Default observer: logs each event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CallObserver for TracingObserver {
    fn on_call(&self, event: &CallEvent) {
        tracing::debug!(
            backend = %event.backend,
            attempt = event.attempt,
            status = ?event.status,
            billed_cost = event.billed_cost,
            latency_ms = event.latency.as_millis() as u64,
            "Backend call outcome"
        );
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
