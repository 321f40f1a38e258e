use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifiers reported in validation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingStateId,
    MissingWorkflowId,
    InvalidStatus,
    MissingMetadata,
    InvalidVersion,
    DataSizeWarning,
    DataTooLarge,
    ValidationRuleError,
    InvalidCurrentStatus,
    ForbiddenTransition,
    ConditionNotMet,
    RequiredFieldMissing,
    ForbiddenFieldPresent,
    CustomValidationFailed,
    CustomValidatorError,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MissingStateId => "MISSING_STATE_ID",
            ValidationCode::MissingWorkflowId => "MISSING_WORKFLOW_ID",
            ValidationCode::InvalidStatus => "INVALID_STATUS",
            ValidationCode::MissingMetadata => "MISSING_METADATA",
            ValidationCode::InvalidVersion => "INVALID_VERSION",
            ValidationCode::DataSizeWarning => "DATA_SIZE_WARNING",
            ValidationCode::DataTooLarge => "DATA_TOO_LARGE",
            ValidationCode::ValidationRuleError => "VALIDATION_RULE_ERROR",
            ValidationCode::InvalidCurrentStatus => "INVALID_CURRENT_STATUS",
            ValidationCode::ForbiddenTransition => "FORBIDDEN_TRANSITION",
            ValidationCode::ConditionNotMet => "CONDITION_NOT_MET",
            ValidationCode::RequiredFieldMissing => "REQUIRED_FIELD_MISSING",
            ValidationCode::ForbiddenFieldPresent => "FORBIDDEN_FIELD_PRESENT",
            ValidationCode::CustomValidationFailed => "CUSTOM_VALIDATION_FAILED",
            ValidationCode::CustomValidatorError => "CUSTOM_VALIDATOR_ERROR",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Name of the rule that produced the issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            rule: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

/// Outcome of a state or transition check. Never raised as an error by the
/// validator itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, issue: ValidationIssue) {
        self.is_valid = false;
        self.errors.push(issue);
    }

    pub fn warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        if !other.is_valid || !other.errors.is_empty() {
            self.is_valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_error(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }

    pub fn has_warning(&self, code: ValidationCode) -> bool {
        self.warnings.iter().any(|issue| issue.code == code)
    }

    pub fn error_codes(&self) -> Vec<ValidationCode> {
        self.errors.iter().map(|issue| issue.code).collect()
    }

    /// Comma separated error codes, used in error messages and logs.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return "no errors".to_string();
        }
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_to_stable_identifiers() {
        let value = serde_json::to_value(ValidationCode::ForbiddenTransition).unwrap();
        assert_eq!(value, "FORBIDDEN_TRANSITION");
        assert_eq!(ValidationCode::CustomValidatorError.as_str(), "CUSTOM_VALIDATOR_ERROR");
    }

    #[test]
    fn test_merge_propagates_invalidity() {
        let mut result = ValidationResult::valid();
        let mut other = ValidationResult::valid();
        other.warning(ValidationIssue::new(ValidationCode::DataSizeWarning, "big"));
        result.merge(other);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);

        let mut failing = ValidationResult::valid();
        failing.error(ValidationIssue::new(ValidationCode::InvalidVersion, "zero"));
        result.merge(failing);
        assert!(!result.is_valid);
        assert!(result.has_error(ValidationCode::InvalidVersion));
        assert!(result.summary().contains("INVALID_VERSION"));
    }
}
