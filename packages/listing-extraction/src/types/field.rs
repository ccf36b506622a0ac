//! Field values - typed values with confidence and provenance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One evidence channel describing a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Image,
    Voice,
}

impl Modality {
    /// All modalities, highest merge priority first.
    pub const BY_PRIORITY: [Modality; 3] = [Modality::Image, Modality::Voice, Modality::Text];

    /// Merge priority: images confirm ground truth, voice is direct but
    /// loosely structured, text is the most error-prone for numbers.
    pub fn priority(self) -> u8 {
        match self {
            Self::Image => 3,
            Self::Voice => 2,
            Self::Text => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldData {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Flag(bool),
    /// Set-valued field (e.g. amenities); unioned on merge, never arbitrated.
    Set(Vec<SetItem>),
}

/// One element of a set-valued field, with its own provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetItem {
    /// Element label as extracted
    pub label: String,

    /// Modalities that reported this element, highest priority first
    pub sources: Vec<Modality>,

    /// Highest confidence any source gave this element
    pub confidence: f32,
}

impl SetItem {
    pub fn new(label: impl Into<String>, source: Modality, confidence: f32) -> Self {
        Self {
            label: label.into(),
            sources: vec![source],
            confidence: clamp_confidence(confidence),
        }
    }

    /// Comparison key: lowercase, single-spaced.
    pub fn key(&self) -> String {
        normalize_text(&self.label)
    }
}

impl FieldData {
    /// Whether two values agree.
    ///
    /// Decimals agree within `relative_tolerance` of the larger magnitude.
    /// Integers and flags must be equal. Text compares case-insensitively
    /// after whitespace normalization. Sets agree when their element keys
    /// are equal.
    pub fn agrees_with(&self, other: &FieldData, relative_tolerance: f64) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Decimal(a), Self::Decimal(b)) => within_tolerance(*a, *b, relative_tolerance),
            (Self::Integer(a), Self::Decimal(b)) | (Self::Decimal(b), Self::Integer(a)) => {
                within_tolerance(*a as f64, *b, relative_tolerance)
            }
            (Self::Text(a), Self::Text(b)) => normalize_text(a) == normalize_text(b),
            (Self::Flag(a), Self::Flag(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => {
                let mut left: Vec<String> = a.iter().map(SetItem::key).collect();
                let mut right: Vec<String> = b.iter().map(SetItem::key).collect();
                left.sort();
                left.dedup();
                right.sort();
                right.dedup();
                left == right
            }
            _ => false,
        }
    }

    /// Numeric view for range and consistency checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }
}

impl fmt::Display for FieldData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Set(items) => {
                let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
                write!(f, "[{}]", labels.join(", "))
            }
        }
    }
}

/// A typed value plus confidence and the modality it came from.
///
/// A missing field is represented by absence from the owning map, never by
/// a placeholder value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: FieldData,

    /// Confidence in [0.0, 1.0]
    pub confidence: f32,

    /// Modality this value was extracted from
    pub source: Modality,
}

impl FieldValue {
    pub fn new(value: FieldData, confidence: f32, source: Modality) -> Self {
        Self {
            value,
            confidence: clamp_confidence(confidence),
            source,
        }
    }

    /// Scale confidence by a factor (clamped).
    pub fn penalized(mut self, factor: f32) -> Self {
        self.confidence = clamp_confidence(self.confidence * factor);
        self
    }
}

/// Clamp a confidence into [0.0, 1.0]; NaN becomes 0.0.
pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn within_tolerance(a: f64, b: f64, relative_tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return true;
    }
    (a - b).abs() / scale <= relative_tolerance
}
