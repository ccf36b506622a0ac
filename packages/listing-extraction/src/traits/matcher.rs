//! Amenity-catalog matcher.
//!
//! Free-text amenity labels are resolved to catalog ids by an external
//! lookup (typically embedding similarity search). The merge engine calls
//! it for set-valued fields only; the lookup has no side effects on the
//! engine.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::MatchError;
use crate::types::field::normalize_text;

/// Resolve free-text labels to catalog ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmenityMatcher: Send + Sync {
    /// Return the catalog ids matching `labels`. Unmatched labels are
    /// simply absent from the result.
    async fn match_labels(&self, labels: &[String]) -> Result<Vec<String>, MatchError>;
}

/// Exact, case-insensitive label lookup.
///
/// For deployments without a semantic matcher.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogMatcher {
    ids: HashMap<String, String>,
}

impl StaticCatalogMatcher {
    /// Build from `label -> catalog id` pairs.
    pub fn new(entries: impl IntoIterator<Item = (impl AsRef<str>, impl Into<String>)>) -> Self {
        Self {
            ids: entries
                .into_iter()
                .map(|(label, id)| (normalize_text(label.as_ref()), id.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[async_trait]
impl AmenityMatcher for StaticCatalogMatcher {
    async fn match_labels(&self, labels: &[String]) -> Result<Vec<String>, MatchError> {
        let mut ids: Vec<String> = Vec::new();
        for label in labels {
            if let Some(id) = self.ids.get(&normalize_text(label)) {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_matcher_case_insensitive() {
        let matcher = StaticCatalogMatcher::new([
            ("Swimming Pool", "amenity-pool"),
            ("gym", "amenity-gym"),
        ]);

        let ids = matcher
            .match_labels(&[
                "swimming  pool".to_string(),
                "GYM".to_string(),
                "sauna".to_string(),
                "Gym".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(ids, vec!["amenity-pool".to_string(), "amenity-gym".to_string()]);
    }
}
