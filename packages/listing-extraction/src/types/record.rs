//! Merged records - the single reconciled record after combining partials.

use indexmap::IndexMap;
use serde::Serialize;

use crate::types::field::{FieldValue, Modality};

/// The value chosen for one field, with every modality that supported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedField {
    /// Chosen value; `source` is the modality it was taken from
    pub value: FieldValue,

    /// Modalities whose value agreed with the chosen one, highest priority first
    pub contributors: Vec<Modality>,

    /// Whether another modality disagreed and the confidence was penalized
    pub contested: bool,
}

/// A value considered during merge but not chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedValue {
    pub field: String,

    /// The losing value, with its original confidence and modality
    pub value: FieldValue,

    /// Modality whose value won
    pub chosen_from: Modality,
}

/// The reconciled listing record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedRecord {
    /// One chosen value per field, in first-seen order
    pub fields: IndexMap<String, MergedField>,

    /// Alternatives that lost arbitration (audit trail)
    pub rejected: Vec<RejectedValue>,

    /// Catalog ids resolved for set-valued fields
    pub catalog_matches: IndexMap<String, Vec<String>>,

    /// Importance-weighted mean of the chosen confidences
    pub overall_confidence: f32,
}

impl MergedRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).map(|f| &f.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rejected alternatives for one field.
    pub fn rejected_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RejectedValue> {
        self.rejected.iter().filter(move |r| r.field == name)
    }

    /// Recompute the overall confidence from the chosen values alone.
    ///
    /// `weight` maps a field name to its importance.
    pub fn weighted_confidence(&self, weight: impl Fn(&str) -> f32) -> f32 {
        let (sum, total) = self
            .fields
            .iter()
            .fold((0.0f32, 0.0f32), |(sum, total), (name, field)| {
                let w = weight(name).max(0.0);
                (sum + w * field.value.confidence, total + w)
            });

        if total > 0.0 {
            sum / total
        } else {
            0.0
        }
    }
}
