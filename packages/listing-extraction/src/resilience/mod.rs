//! Fault isolation around backend calls.
//!
//! - [`CircuitBreaker`] - per-backend Closed / Open / HalfOpen state machine
//! - [`CallRateLimiter`] - per-minute and per-hour token buckets
//! - [`Backoff`] - jittered exponential delay between retries
//! - [`ResilientBackend`] - composes the above around one client
//! - [`BackendTable`] - kind to wrapper lookup

pub mod breaker;
pub mod rate_limit;
pub mod retry;
pub mod table;
pub mod wrapper;

pub use breaker::{CircuitBreaker, CircuitPermit, CircuitState};
pub use rate_limit::{CallRateLimiter, TokioClock};
pub use retry::Backoff;
pub use table::{BackendTable, BackendTableBuilder};
pub use wrapper::{Invocation, ResilientBackend};
