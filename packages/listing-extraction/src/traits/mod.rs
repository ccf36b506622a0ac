//! Core trait abstractions for the extraction engine.
//!
//! These traits define the interfaces that deployments implement to plug in
//! inference providers, the amenity catalog, and call-outcome accounting.

pub mod backend;
pub mod matcher;
pub mod observer;
