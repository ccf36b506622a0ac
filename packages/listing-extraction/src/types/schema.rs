//! The canonical listing field catalog and backend output coercion.
//!
//! Backends return loosely-typed JSON. Each catalog entry says how a raw
//! value is coerced into a [`FieldData`] and which default confidence band
//! applies when the backend gives no confidence of its own.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::types::field::{normalize_text, FieldData, Modality, SetItem};

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d[\d,]*(?:\.\d+)?)\s*(?:(k|K|M|mn|million)\b)?")
        .expect("number pattern is valid")
});

/// How a raw backend value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Decimal,
    Text,
    /// Lowercased, whitespace-normalized label from a small vocabulary
    Category,
    Flag,
    Set,
}

/// Default-confidence band for fields whose backend gave no confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Directly-stated categorical facts (listing type, city)
    Categorical,
    Flag,
    FreeText,
    Set,
    /// Explicit counts and measurements
    Numeric,
    Price,
}

/// One entry of the field catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub band: ConfidenceBand,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, band: ConfidenceBand) -> Self {
        Self {
            name: name.into(),
            kind,
            band,
        }
    }

    /// Coerce a raw backend value. `None` means the field stays absent.
    pub fn coerce(&self, raw: &Value, source: Modality, confidence: f32) -> Option<FieldData> {
        match self.kind {
            FieldKind::Integer => coerce_integer(raw).map(FieldData::Integer),
            FieldKind::Decimal => coerce_decimal(raw).map(FieldData::Decimal),
            FieldKind::Text => coerce_text(raw).map(FieldData::Text),
            FieldKind::Category => coerce_text(raw).map(|s| FieldData::Text(normalize_text(&s))),
            FieldKind::Flag => coerce_flag(raw).map(FieldData::Flag),
            FieldKind::Set => coerce_set(raw, source, confidence).map(FieldData::Set),
        }
    }
}

/// Default confidence per band, configured per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceDefaults {
    pub categorical: f32,
    pub flag: f32,
    pub free_text: f32,
    pub set: f32,
    pub numeric: f32,
    pub price: f32,
}

impl Default for ConfidenceDefaults {
    fn default() -> Self {
        Self {
            categorical: 0.8,
            flag: 0.75,
            free_text: 0.7,
            set: 0.7,
            numeric: 0.6,
            price: 0.5,
        }
    }
}

impl ConfidenceDefaults {
    pub fn for_band(&self, band: ConfidenceBand) -> f32 {
        match band {
            ConfidenceBand::Categorical => self.categorical,
            ConfidenceBand::Flag => self.flag,
            ConfidenceBand::FreeText => self.free_text,
            ConfidenceBand::Set => self.set,
            ConfidenceBand::Numeric => self.numeric,
            ConfidenceBand::Price => self.price,
        }
    }
}

/// The set of fields the engine understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldCatalog {
    specs: Vec<FieldSpec>,
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self::listing_defaults()
    }
}

impl FieldCatalog {
    pub fn new(specs: Vec<FieldSpec>) -> Self {
        Self { specs }
    }

    /// Property-listing fields mirrored by [`ListingFields`].
    pub fn listing_defaults() -> Self {
        use ConfidenceBand as B;
        use FieldKind as K;

        Self::new(vec![
            FieldSpec::new("title", K::Text, B::FreeText),
            FieldSpec::new("description", K::Text, B::FreeText),
            FieldSpec::new("listing_type", K::Category, B::Categorical),
            FieldSpec::new("property_type", K::Category, B::Categorical),
            FieldSpec::new("price", K::Decimal, B::Price),
            FieldSpec::new("currency", K::Category, B::Categorical),
            FieldSpec::new("price_period", K::Category, B::Categorical),
            FieldSpec::new("bedrooms", K::Integer, B::Numeric),
            FieldSpec::new("bathrooms", K::Integer, B::Numeric),
            FieldSpec::new("total_area_sqm", K::Decimal, B::Numeric),
            FieldSpec::new("built_area_sqm", K::Decimal, B::Numeric),
            FieldSpec::new("floor", K::Integer, B::Numeric),
            FieldSpec::new("total_floors", K::Integer, B::Numeric),
            FieldSpec::new("year_built", K::Integer, B::Numeric),
            FieldSpec::new("year_renovated", K::Integer, B::Numeric),
            FieldSpec::new("parking_spaces", K::Integer, B::Numeric),
            FieldSpec::new("furnished", K::Flag, B::Flag),
            FieldSpec::new("city", K::Text, B::Categorical),
            FieldSpec::new("neighborhood", K::Text, B::Categorical),
            FieldSpec::new("address", K::Text, B::FreeText),
            FieldSpec::new("amenities", K::Set, B::Set),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Default listing fields as returned by a backend.
///
/// Only used to publish the structured-output JSON schema; every property
/// is optional because absent facts must stay absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListingFields {
    pub title: Option<String>,
    pub description: Option<String>,
    /// "sale" or "rent"
    pub listing_type: Option<String>,
    /// apartment, house, villa, land, commercial, ...
    pub property_type: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    /// "month", "year" or "total"
    pub price_period: Option<String>,
    pub bedrooms: Option<i64>,
    pub bathrooms: Option<i64>,
    pub total_area_sqm: Option<f64>,
    pub built_area_sqm: Option<f64>,
    pub floor: Option<i64>,
    pub total_floors: Option<i64>,
    pub year_built: Option<i64>,
    pub year_renovated: Option<i64>,
    pub parking_spaces: Option<i64>,
    pub furnished: Option<bool>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub amenities: Option<Vec<String>>,
}

/// Structured output every backend is asked to produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StructuredOutput {
    pub fields: ListingFields,

    /// Per-field confidence in [0, 1], keyed by field name
    #[serde(default)]
    pub confidence: HashMap<String, f32>,

    /// Transcript of a voice note (transcription backends only)
    #[serde(default)]
    pub transcript: Option<String>,
}

/// JSON schema for [`StructuredOutput`].
pub fn structured_output_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(StructuredOutput)).unwrap_or(Value::Null)
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => parse_number(s).filter(|f| f.fract() == 0.0).map(|f| f as i64),
        _ => None,
    }
}

fn coerce_decimal(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn coerce_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_flag(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match normalize_text(s).as_str() {
            "yes" | "y" | "true" | "1" => Some(true),
            "no" | "n" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_set(raw: &Value, source: Modality, confidence: f32) -> Option<Vec<SetItem>> {
    let labels: Vec<String> = match raw {
        Value::Array(values) => values.iter().filter_map(coerce_text).collect(),
        Value::String(s) => s
            .split([',', ';'])
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return None,
    };

    let mut items: Vec<SetItem> = Vec::with_capacity(labels.len());
    for label in labels {
        let item = SetItem::new(label, source, confidence);
        if !items.iter().any(|i| i.key() == item.key()) {
            items.push(item);
        }
    }
    (!items.is_empty()).then_some(items)
}

/// First number in a loose string: "45,000/month" -> 45000, "1.2k" -> 1200.
fn parse_number(s: &str) -> Option<f64> {
    let caps = NUMBER.captures(s)?;
    let digits = caps.get(1)?.as_str().replace(',', "");
    let value: f64 = digits.parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("K") => 1_000.0,
        Some("M") | Some("mn") | Some("million") => 1_000_000.0,
        _ => 1.0,
    };
    Some(value * multiplier)
}
