//! Validation reports.

use serde::Serialize;

/// Overall outcome of validating a merged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// No issues above info level.
    #[default]
    Valid,

    /// Only soft warnings (consistency, low confidence, soft ranges).
    Partial,

    /// A required field is missing or a hard range check failed.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Which check produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    MissingRequired,
    OutOfRange,
    Inconsistent,
    LowConfidence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        field: impl Into<String>,
        severity: Severity,
        code: IssueCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            severity,
            code,
            message: message.into(),
        }
    }
}

/// Result of validating a [`MergedRecord`](crate::types::record::MergedRecord).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,

    /// Every issue found; checks never short-circuit
    pub issues: Vec<ValidationIssue>,

    /// Populated required fields / total required fields
    pub completeness: f32,

    /// Populated fields below the confidence floor (kept, not removed)
    pub low_confidence: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn missing_required(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter(|i| i.code == IssueCode::MissingRequired)
            .map(|i| i.field.as_str())
            .collect()
    }

    /// Fields the caller should ask the user about: missing required fields
    /// first, then low-confidence ones.
    pub fn clarifications(&self) -> Vec<&str> {
        let mut fields = self.missing_required();
        for field in &self.low_confidence {
            if !fields.contains(&field.as_str()) {
                fields.push(field.as_str());
            }
        }
        fields
    }

    /// Whether a clarification round is needed before publishing.
    pub fn needs_clarification(&self) -> bool {
        !self.clarifications().is_empty()
    }
}
