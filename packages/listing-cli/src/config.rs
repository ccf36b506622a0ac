//! Configuration file for the CLI.
//!
//! One TOML file carries the engine configuration plus an optional
//! `[catalog]` table mapping amenity labels to catalog ids:
//!
//! ```toml
//! [quota]
//! daily_ceiling = 5.0
//!
//! [catalog]
//! "swimming pool" = "amenity-pool"
//! gym = "amenity-gym"
//! ```

use anyhow::{Context, Result};
use listing_extraction::{EngineConfig, StaticCatalogMatcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// CLI-only sections of the config file.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CliSections {
    catalog: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub catalog: Option<StaticCatalogMatcher>,
}

impl CliConfig {
    /// Load from a file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let engine = EngineConfig::from_toml_str(raw)?;
        let sections: CliSections = toml::from_str(raw)?;
        let catalog = (!sections.catalog.is_empty())
            .then(|| StaticCatalogMatcher::new(sections.catalog));

        Ok(Self { engine, catalog })
    }
}
