//! Reference backend implementations.
//!
//! Deployments usually bring their own [`BackendClient`](crate::traits::backend::BackendClient);
//! these cover the common hosted providers.

#[cfg(feature = "openai")]
mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiBackend;
