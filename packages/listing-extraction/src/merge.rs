//! Merge engine: reconcile per-modality partials into one record.
//!
//! Arbitration is total and deterministic. Partials are ranked by the fixed
//! source priority `image > voice > text`; for every field seen in any
//! partial:
//!
//! - one source: the value is taken unchanged
//! - several agreeing sources: the top-priority value is taken with the
//!   highest contributing confidence
//! - disagreement: the top-priority value wins, its confidence is multiplied
//!   by the disagreement penalty, and the losers go to the audit list
//! - set-valued fields are unioned, keeping provenance per element
//!
//! The overall confidence is the importance-weighted mean of the chosen
//! confidences, so it can always be recomputed from the record alone.

use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::matcher::AmenityMatcher;
use crate::types::config::MergeConfig;
use crate::types::field::{FieldData, FieldValue, Modality, SetItem};
use crate::types::partial::PartialExtraction;
use crate::types::record::{MergedField, MergedRecord, RejectedValue};

pub struct MergeEngine {
    config: MergeConfig,
    matcher: Option<Arc<dyn AmenityMatcher>>,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            matcher: None,
        }
    }

    /// Resolve set-valued catalog fields through `matcher` after merging.
    pub fn with_matcher(mut self, matcher: Arc<dyn AmenityMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge partials into one record. Pure: same partials, same record.
    pub fn merge(&self, partials: &[PartialExtraction]) -> MergedRecord {
        let mut ranked: Vec<&PartialExtraction> = partials.iter().collect();
        ranked.sort_by_key(|p| std::cmp::Reverse(p.modality().priority()));

        // Candidates per field, in priority order.
        let mut candidates: IndexMap<&str, Vec<&FieldValue>> = IndexMap::new();
        for partial in &ranked {
            for (name, value) in partial.fields() {
                candidates.entry(name.as_str()).or_default().push(value);
            }
        }

        let mut record = MergedRecord::default();
        for (name, values) in candidates {
            let (field, rejected) = self.arbitrate(name, &values);
            record.rejected.extend(rejected);
            record.fields.insert(name.to_string(), field);
        }

        record.overall_confidence = record.weighted_confidence(|name| self.config.importance_of(name));

        debug!(
            partials = partials.len(),
            fields = record.len(),
            rejected = record.rejected.len(),
            overall_confidence = record.overall_confidence,
            "Merged partials"
        );

        record
    }

    /// Merge, then resolve catalog ids for set-valued fields.
    ///
    /// Matcher failures are logged and leave `catalog_matches` without that
    /// field; they never fail the merge.
    pub async fn merge_and_match(&self, partials: &[PartialExtraction]) -> MergedRecord {
        let mut record = self.merge(partials);
        self.resolve_catalog(&mut record).await;
        record
    }

    async fn resolve_catalog(&self, record: &mut MergedRecord) {
        let Some(matcher) = self.matcher.as_ref() else {
            return;
        };

        let lookups: Vec<(String, Vec<String>)> = self
            .config
            .catalog_fields
            .iter()
            .filter_map(|name| match record.get(name).map(|v| &v.value) {
                Some(FieldData::Set(items)) if !items.is_empty() => {
                    Some((name.clone(), items.iter().map(|i| i.label.clone()).collect()))
                }
                _ => None,
            })
            .collect();

        let results = join_all(lookups.iter().map(|(_, labels)| matcher.match_labels(labels))).await;

        for ((field, labels), result) in lookups.into_iter().zip(results) {
            match result {
                Ok(ids) => {
                    debug!(field = %field, labels = labels.len(), matched = ids.len(), "Catalog match");
                    record.catalog_matches.insert(field, ids);
                }
                Err(e) => {
                    warn!(field = %field, error = %e, "Catalog match failed, keeping free-text labels");
                }
            }
        }
    }

    fn arbitrate(&self, name: &str, values: &[&FieldValue]) -> (MergedField, Vec<RejectedValue>) {
        let winner = values[0];

        if winner.value.is_set() {
            return self.union_sets(name, values);
        }

        let (agreeing, disagreeing): (Vec<&FieldValue>, Vec<&FieldValue>) = values
            .iter()
            .copied()
            .partition(|v| v.value.agrees_with(&winner.value, self.config.relative_tolerance));

        let confidence = agreeing
            .iter()
            .map(|v| v.confidence)
            .fold(winner.confidence, f32::max);
        let contributors = agreeing.iter().map(|v| v.source).collect();
        let chosen = FieldValue::new(winner.value.clone(), confidence, winner.source);

        if disagreeing.is_empty() {
            return (
                MergedField {
                    value: chosen,
                    contributors,
                    contested: false,
                },
                Vec::new(),
            );
        }

        debug!(
            field = name,
            chosen_from = %winner.source,
            rejected = disagreeing.len(),
            "Sources disagree"
        );

        let rejected = disagreeing
            .into_iter()
            .map(|v| RejectedValue {
                field: name.to_string(),
                value: v.clone(),
                chosen_from: winner.source,
            })
            .collect();

        // Agreeing sources do not lift a contested value above the winner's own confidence.
        let contested = FieldValue::new(
            winner.value.clone(),
            confidence.min(winner.confidence),
            winner.source,
        );

        (
            MergedField {
                value: contested.penalized(self.config.disagreement_penalty),
                contributors,
                contested: true,
            },
            rejected,
        )
    }

    /// Union set values. Non-set values for the same field cannot be unioned
    /// and are rejected.
    fn union_sets(&self, name: &str, values: &[&FieldValue]) -> (MergedField, Vec<RejectedValue>) {
        let winner = values[0];
        let mut items: Vec<SetItem> = Vec::new();
        let mut contributors: Vec<Modality> = Vec::new();
        let mut confidence = 0.0f32;
        let mut rejected = Vec::new();

        for value in values {
            let FieldData::Set(incoming) = &value.value else {
                rejected.push(RejectedValue {
                    field: name.to_string(),
                    value: (*value).clone(),
                    chosen_from: winner.source,
                });
                continue;
            };

            confidence = confidence.max(value.confidence);
            if !contributors.contains(&value.source) {
                contributors.push(value.source);
            }

            for item in incoming {
                match items.iter_mut().find(|existing| existing.key() == item.key()) {
                    Some(existing) => {
                        existing.confidence = existing.confidence.max(item.confidence);
                        for source in &item.sources {
                            if !existing.sources.contains(source) {
                                existing.sources.push(*source);
                            }
                        }
                    }
                    None => items.push(item.clone()),
                }
            }
        }

        let contested = !rejected.is_empty();
        let mut value = FieldValue::new(FieldData::Set(items), confidence, winner.source);
        if contested {
            value = value.penalized(self.config.disagreement_penalty);
        }

        (
            MergedField {
                value,
                contributors,
                contested,
            },
            rejected,
        )
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("config", &self.config)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatchError;
    use crate::testing::partial;
    use crate::traits::matcher::{MockAmenityMatcher, StaticCatalogMatcher};
    use proptest::prelude::*;

    fn engine() -> MergeEngine {
        MergeEngine::new(MergeConfig::default())
    }

    fn amenities(labels: &[&str], source: Modality) -> FieldData {
        FieldData::Set(labels.iter().map(|l| SetItem::new(*l, source, 0.7)).collect())
    }

    #[test]
    fn test_bedrooms_agree_takes_max() {
        let text = partial(Modality::Text, [("bedrooms", FieldData::Integer(3), 0.6)]);
        let image = partial(Modality::Image, [("bedrooms", FieldData::Integer(3), 0.85)]);

        let record = engine().merge(&[text, image]);

        let bedrooms = &record.fields["bedrooms"];
        assert_eq!(bedrooms.value.value, FieldData::Integer(3));
        assert_eq!(bedrooms.value.confidence, 0.85);
        assert_eq!(bedrooms.contributors, vec![Modality::Image, Modality::Text]);
        assert!(!bedrooms.contested);
        assert!(record.rejected.is_empty());
    }

    #[test]
    fn test_price_disagreement_voice_beats_text() {
        let text = partial(Modality::Text, [("price", FieldData::Decimal(45_000.0), 0.7)]);
        let voice = partial(Modality::Voice, [("price", FieldData::Decimal(48_000.0), 0.6)]);

        let record = engine().merge(&[text, voice]);

        let price = &record.fields["price"];
        assert_eq!(price.value.value, FieldData::Decimal(48_000.0));
        assert_eq!(price.value.source, Modality::Voice);
        assert!((price.value.confidence - 0.48).abs() < 1e-6);
        assert!(price.contested);

        let rejected: Vec<_> = record.rejected_for("price").collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].value.value, FieldData::Decimal(45_000.0));
        assert_eq!(rejected[0].value.source, Modality::Text);
        assert_eq!(rejected[0].chosen_from, Modality::Voice);
    }

    #[test]
    fn test_close_decimals_agree_within_tolerance() {
        let text = partial(Modality::Text, [("total_area_sqm", FieldData::Decimal(250.0), 0.6)]);
        let image = partial(Modality::Image, [("total_area_sqm", FieldData::Decimal(252.0), 0.5)]);

        let record = engine().merge(&[text, image]);

        let area = &record.fields["total_area_sqm"];
        assert_eq!(area.value.value, FieldData::Decimal(252.0));
        assert_eq!(area.value.confidence, 0.6);
        assert!(!area.contested);
    }

    #[test]
    fn test_three_way_partial_agreement() {
        let text = partial(Modality::Text, [("bathrooms", FieldData::Integer(1), 0.9)]);
        let voice = partial(Modality::Voice, [("bathrooms", FieldData::Integer(2), 0.7)]);
        let image = partial(Modality::Image, [("bathrooms", FieldData::Integer(2), 0.5)]);

        let record = engine().merge(&[text, voice, image]);

        let bathrooms = &record.fields["bathrooms"];
        assert_eq!(bathrooms.value.value, FieldData::Integer(2));
        assert!((bathrooms.value.confidence - 0.4).abs() < 1e-6);
        assert_eq!(bathrooms.contributors, vec![Modality::Image, Modality::Voice]);
        assert_eq!(record.rejected_for("bathrooms").count(), 1);
    }

    #[test]
    fn test_contested_value_stays_below_winner_confidence() {
        let image = partial(Modality::Image, [("bedrooms", FieldData::Integer(3), 0.6)]);
        let voice = partial(Modality::Voice, [("bedrooms", FieldData::Integer(3), 0.95)]);
        let text = partial(Modality::Text, [("bedrooms", FieldData::Integer(2), 0.9)]);

        let record = engine().merge(&[text, voice, image]);

        let bedrooms = &record.fields["bedrooms"];
        assert!(bedrooms.contested);
        assert_eq!(bedrooms.value.source, Modality::Image);
        assert!(bedrooms.value.confidence < 0.6);
        assert!((bedrooms.value.confidence - 0.48).abs() < 1e-6);
        assert!(bedrooms.contributors.contains(&Modality::Voice));
    }

    #[test]
    fn test_sets_are_unioned_with_provenance() {
        let text = partial(
            Modality::Text,
            [("amenities", amenities(&["Pool", "parking"], Modality::Text), 0.7)],
        );
        let image = partial(
            Modality::Image,
            [("amenities", amenities(&["pool", "balcony"], Modality::Image), 0.8)],
        );

        let record = engine().merge(&[text, image]);

        let field = &record.fields["amenities"];
        let FieldData::Set(items) = &field.value.value else {
            panic!("amenities should stay a set");
        };
        let labels: Vec<_> = items.iter().map(|i| i.key()).collect();
        assert_eq!(labels, vec!["pool", "balcony", "parking"]);
        assert_eq!(items[0].sources, vec![Modality::Image, Modality::Text]);
        assert_eq!(items[1].sources, vec![Modality::Image]);
        assert_eq!(items[2].sources, vec![Modality::Text]);
        assert_eq!(field.value.confidence, 0.8);
        assert!(record.rejected.is_empty());
    }

    #[test]
    fn test_overall_confidence_is_importance_weighted() {
        let text = partial(
            Modality::Text,
            [
                ("price", FieldData::Decimal(1000.0), 0.9),
                ("title", FieldData::Text("Sunny flat".into()), 0.3),
            ],
        );

        let record = engine().merge(&[text]);

        // price weighs 2.0, title 1.0
        let expected = (2.0 * 0.9 + 1.0 * 0.3) / 3.0;
        assert!((record.overall_confidence - expected).abs() < 1e-6);
        assert_eq!(
            record.overall_confidence,
            record.weighted_confidence(|f| MergeConfig::default().importance_of(f))
        );
    }

    #[test]
    fn test_empty_input_empty_record() {
        let record = engine().merge(&[]);
        assert!(record.is_empty());
        assert_eq!(record.overall_confidence, 0.0);
    }

    #[tokio::test]
    async fn test_catalog_matches_resolved() {
        let matcher = StaticCatalogMatcher::new([("pool", "amenity:pool"), ("balcony", "amenity:balcony")]);
        let engine = engine().with_matcher(Arc::new(matcher));
        let image = partial(
            Modality::Image,
            [("amenities", amenities(&["Pool", "Balcony", "sauna"], Modality::Image), 0.8)],
        );

        let record = engine.merge_and_match(&[image]).await;

        assert_eq!(
            record.catalog_matches["amenities"],
            vec!["amenity:pool".to_string(), "amenity:balcony".to_string()]
        );
    }

    #[tokio::test]
    async fn test_catalog_failure_is_not_fatal() {
        let mut matcher = MockAmenityMatcher::new();
        matcher
            .expect_match_labels()
            .times(1)
            .returning(|_| Err(MatchError::Lookup("catalog down".into())));
        let engine = engine().with_matcher(Arc::new(matcher));
        let text = partial(
            Modality::Text,
            [("amenities", amenities(&["pool"], Modality::Text), 0.7)],
        );

        let record = engine.merge_and_match(&[text]).await;

        assert!(record.contains("amenities"));
        assert!(record.catalog_matches.is_empty());
    }

    fn modality() -> impl Strategy<Value = Modality> {
        prop_oneof![Just(Modality::Text), Just(Modality::Image), Just(Modality::Voice)]
    }

    fn two_modalities() -> impl Strategy<Value = (Modality, Modality)> {
        (modality(), modality()).prop_filter("distinct modalities", |(a, b)| a != b)
    }

    proptest! {
        #[test]
        fn prop_single_source_unchanged(value in 0i64..20, confidence in 0.0f32..=1.0, m in modality()) {
            let record = engine().merge(&[partial(m, [("bedrooms", FieldData::Integer(value), confidence)])]);
            let merged = record.get("bedrooms").unwrap();
            prop_assert_eq!(&merged.value, &FieldData::Integer(value));
            prop_assert_eq!(merged.confidence, confidence);
            prop_assert_eq!(merged.source, m);
        }

        #[test]
        fn prop_agreeing_takes_max(
            value in 0i64..20,
            c1 in 0.0f32..=1.0,
            c2 in 0.0f32..=1.0,
            (m1, m2) in two_modalities(),
        ) {
            let record = engine().merge(&[
                partial(m1, [("bedrooms", FieldData::Integer(value), c1)]),
                partial(m2, [("bedrooms", FieldData::Integer(value), c2)]),
            ]);
            let merged = record.get("bedrooms").unwrap();
            prop_assert_eq!(merged.confidence, c1.max(c2));
            prop_assert!(merged.confidence >= c1 && merged.confidence >= c2);
        }

        #[test]
        fn prop_disagreeing_prefers_priority_with_penalty(
            v1 in 0i64..20,
            v2 in 0i64..20,
            c1 in 0.01f32..=1.0,
            c2 in 0.01f32..=1.0,
            (m1, m2) in two_modalities(),
        ) {
            prop_assume!(v1 != v2);
            let record = engine().merge(&[
                partial(m1, [("bedrooms", FieldData::Integer(v1), c1)]),
                partial(m2, [("bedrooms", FieldData::Integer(v2), c2)]),
            ]);

            let (winner_value, winner_conf, winner_source) =
                if m1.priority() > m2.priority() { (v1, c1, m1) } else { (v2, c2, m2) };

            let merged = record.get("bedrooms").unwrap();
            prop_assert_eq!(&merged.value, &FieldData::Integer(winner_value));
            prop_assert_eq!(merged.source, winner_source);
            prop_assert!(merged.confidence < winner_conf);
            prop_assert_eq!(record.rejected.len(), 1);
        }

        #[test]
        fn prop_never_fabricates(
            values in proptest::collection::vec((0i64..5, 0.0f32..=1.0), 1..=3),
        ) {
            let modalities = [Modality::Text, Modality::Voice, Modality::Image];
            let partials: Vec<_> = values
                .iter()
                .zip(modalities)
                .map(|((v, c), m)| partial(m, [("floor", FieldData::Integer(*v), *c)]))
                .collect();

            let record = engine().merge(&partials);
            let merged = record.get("floor").unwrap();
            prop_assert!(values.iter().any(|(v, _)| FieldData::Integer(*v) == merged.value));
        }
    }
}
