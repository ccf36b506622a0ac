//! Data types for the extraction engine.

pub mod config;
pub mod field;
pub mod partial;
pub mod record;
pub mod report;
pub mod request;
pub mod schema;
