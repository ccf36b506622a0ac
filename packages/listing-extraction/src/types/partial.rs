//! Partial extractions - the field set produced by one modality alone.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::field::{FieldData, FieldValue, Modality, SetItem};

/// A sparse map from field name to value, produced by exactly one modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialExtraction {
    modality: Modality,
    fields: IndexMap<String, FieldValue>,
    overall_confidence: f32,
}

impl PartialExtraction {
    pub fn new(modality: Modality) -> Self {
        Self {
            modality,
            fields: IndexMap::new(),
            overall_confidence: 0.0,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Mean confidence of the populated fields (0.0 when empty).
    pub fn overall_confidence(&self) -> f32 {
        self.overall_confidence
    }

    pub fn fields(&self) -> &IndexMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Insert a field. Provenance is always this partial's modality.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldData, confidence: f32) {
        let value = match value {
            FieldData::Set(items) => FieldData::Set(
                items
                    .into_iter()
                    .map(|item| SetItem::new(item.label, self.modality, item.confidence))
                    .collect(),
            ),
            other => other,
        };
        self.fields
            .insert(name.into(), FieldValue::new(value, confidence, self.modality));
        self.recompute();
    }

    /// Builder-style insert.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldData, confidence: f32) -> Self {
        self.insert(name, value, confidence);
        self
    }

    /// Fold another partial of the same modality into this one (used for
    /// image batches). Per field the more confident value wins; sets are
    /// unioned.
    pub fn absorb(&mut self, other: PartialExtraction) {
        debug_assert_eq!(self.modality, other.modality);

        for (name, incoming) in other.fields {
            match self.fields.get_mut(&name) {
                None => {
                    self.fields.insert(name, incoming);
                }
                Some(existing) => {
                    if let FieldData::Set(more) = incoming.value {
                        if let FieldData::Set(items) = &mut existing.value {
                            for item in more {
                                match items.iter_mut().find(|i| i.key() == item.key()) {
                                    Some(found) => {
                                        found.confidence = found.confidence.max(item.confidence)
                                    }
                                    None => items.push(item),
                                }
                            }
                        }
                        existing.confidence = existing.confidence.max(incoming.confidence);
                    } else if incoming.confidence > existing.confidence {
                        *existing = incoming;
                    }
                }
            }
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        self.overall_confidence = if self.fields.is_empty() {
            0.0
        } else {
            let total: f32 = self.fields.values().map(|v| v.confidence).sum();
            total / self.fields.len() as f32
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_confidence_is_mean() {
        let partial = PartialExtraction::new(Modality::Text)
            .with_field("bedrooms", FieldData::Integer(3), 0.6)
            .with_field("listing_type", FieldData::Text("rent".into()), 0.8);

        assert!((partial.overall_confidence() - 0.7).abs() < 1e-6);
        assert_eq!(partial.get("bedrooms").unwrap().source, Modality::Text);
    }

    #[test]
    fn test_set_items_take_partial_provenance() {
        let partial = PartialExtraction::new(Modality::Image).with_field(
            "amenities",
            FieldData::Set(vec![SetItem::new("pool", Modality::Text, 0.9)]),
            0.9,
        );

        let FieldData::Set(items) = &partial.get("amenities").unwrap().value else {
            panic!("expected set");
        };
        assert_eq!(items[0].sources, vec![Modality::Image]);
    }

    #[test]
    fn test_absorb_batches() {
        let mut first = PartialExtraction::new(Modality::Image)
            .with_field("bedrooms", FieldData::Integer(2), 0.5)
            .with_field(
                "amenities",
                FieldData::Set(vec![SetItem::new("Pool", Modality::Image, 0.7)]),
                0.7,
            );
        let second = PartialExtraction::new(Modality::Image)
            .with_field("bedrooms", FieldData::Integer(3), 0.9)
            .with_field(
                "amenities",
                FieldData::Set(vec![
                    SetItem::new("pool", Modality::Image, 0.8),
                    SetItem::new("gym", Modality::Image, 0.6),
                ]),
                0.8,
            )
            .with_field("furnished", FieldData::Flag(true), 0.75);

        first.absorb(second);

        assert_eq!(first.get("bedrooms").unwrap().value, FieldData::Integer(3));
        assert_eq!(first.len(), 3);
        let FieldData::Set(items) = &first.get("amenities").unwrap().value else {
            panic!("expected set");
        };
        assert_eq!(items.len(), 2);
        assert!((items[0].confidence - 0.8).abs() < 1e-6);
    }
}
