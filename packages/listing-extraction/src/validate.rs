//! Record validation.
//!
//! Every check runs and every issue is reported; nothing short-circuits.
//! A failed validation is a normal outcome carried in the report, not an
//! error.

use tracing::debug;

use crate::types::config::{ConsistencyRule, RangeRule, ValidationConfig};
use crate::types::field::normalize_text;
use crate::types::record::MergedRecord;
use crate::types::report::{IssueCode, Severity, ValidationIssue, ValidationReport, ValidationStatus};

#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Required fields for this record: the default list plus the list for
    /// its category, if the category field is populated and known.
    pub fn required_fields(&self, record: &MergedRecord) -> Vec<&str> {
        let mut required: Vec<&str> = self.config.default_required.iter().map(String::as_str).collect();

        let category = record
            .get(&self.config.category_field)
            .and_then(|v| v.value.as_text())
            .map(normalize_text);

        if let Some(extra) = category.and_then(|c| self.config.required_by_category.get(&c)) {
            for field in extra {
                if !required.contains(&field.as_str()) {
                    required.push(field);
                }
            }
        }

        required
    }

    pub fn validate(&self, record: &MergedRecord) -> ValidationReport {
        let mut issues = Vec::new();

        let required = self.required_fields(record);
        let populated = required.iter().filter(|f| record.contains(f)).count();
        for field in required.iter().filter(|f| !record.contains(f)) {
            issues.push(ValidationIssue::new(
                *field,
                Severity::Error,
                IssueCode::MissingRequired,
                format!("{field} is required"),
            ));
        }

        for rule in &self.config.ranges {
            if let Some(issue) = check_range(record, rule) {
                issues.push(issue);
            }
        }

        for rule in &self.config.consistency {
            if let Some(issue) = check_consistency(record, rule) {
                issues.push(issue);
            }
        }

        let mut low_confidence = Vec::new();
        for (name, field) in &record.fields {
            if field.value.confidence < self.config.confidence_floor {
                issues.push(ValidationIssue::new(
                    name.as_str(),
                    Severity::Warning,
                    IssueCode::LowConfidence,
                    format!(
                        "confidence {:.2} below floor {:.2}",
                        field.value.confidence, self.config.confidence_floor
                    ),
                ));
                low_confidence.push(name.clone());
            }
        }

        let status = if issues.iter().any(|i| i.severity == Severity::Error) {
            ValidationStatus::Invalid
        } else if issues.iter().any(|i| i.severity == Severity::Warning) {
            ValidationStatus::Partial
        } else {
            ValidationStatus::Valid
        };

        let completeness = if required.is_empty() {
            1.0
        } else {
            populated as f32 / required.len() as f32
        };

        debug!(
            status = ?status,
            issues = issues.len(),
            completeness,
            "Validated record"
        );

        ValidationReport {
            status,
            issues,
            completeness,
            low_confidence,
        }
    }
}

fn numeric(record: &MergedRecord, field: &str) -> Option<f64> {
    record.get(field).and_then(|v| v.value.as_f64())
}

fn check_range(record: &MergedRecord, rule: &RangeRule) -> Option<ValidationIssue> {
    let value = numeric(record, &rule.field)?;

    let message = match (rule.min, rule.max) {
        (Some(min), _) if value < min => format!("{value} is below the minimum {min}"),
        (_, Some(max)) if value > max => format!("{value} is above the maximum {max}"),
        _ => return None,
    };

    let severity = if rule.hard {
        Severity::Error
    } else {
        Severity::Warning
    };
    Some(ValidationIssue::new(rule.field.as_str(), severity, IssueCode::OutOfRange, message))
}

fn check_consistency(record: &MergedRecord, rule: &ConsistencyRule) -> Option<ValidationIssue> {
    match rule {
        ConsistencyRule::NotGreater { lesser, greater } => {
            let (a, b) = (numeric(record, lesser)?, numeric(record, greater)?);
            (a > b).then(|| {
                ValidationIssue::new(
                    lesser.as_str(),
                    Severity::Warning,
                    IssueCode::Inconsistent,
                    format!("{lesser} ({a}) exceeds {greater} ({b})"),
                )
            })
        }
        ConsistencyRule::NotBefore { later, earlier } => {
            let (a, b) = (numeric(record, later)?, numeric(record, earlier)?);
            (a < b).then(|| {
                ValidationIssue::new(
                    later.as_str(),
                    Severity::Warning,
                    IssueCode::Inconsistent,
                    format!("{later} ({a}) precedes {earlier} ({b})"),
                )
            })
        }
    }
}
