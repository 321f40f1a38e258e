use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use super::result::{ValidationCode, ValidationIssue, ValidationResult};
use crate::state::{StateTransition, WorkflowState, WorkflowStatus};

/// Pluggable structural check run by `StateValidator::validate_state`.
///
/// Returning `Err` (or panicking) is treated as a broken rule and reported as
/// `VALIDATION_RULE_ERROR`; it never aborts validation.
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Higher priorities run first.
    fn priority(&self) -> i32 {
        0
    }

    fn enabled(&self) -> bool {
        true
    }

    fn validate(&self, state: &WorkflowState) -> anyhow::Result<ValidationResult>;
}

type RuleFn = dyn Fn(&WorkflowState) -> anyhow::Result<ValidationResult> + Send + Sync;

/// Closure-backed rule for callers that don't want a dedicated type.
pub struct FnRule {
    name: String,
    description: String,
    priority: i32,
    enabled: bool,
    check: Box<RuleFn>,
}

impl FnRule {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&WorkflowState) -> anyhow::Result<ValidationResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            priority: 0,
            enabled: true,
            check: Box::new(check),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl fmt::Debug for FnRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ValidationRule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self, state: &WorkflowState) -> anyhow::Result<ValidationResult> {
        (self.check)(state)
    }
}

/// Both identifiers must be non-blank.
#[derive(Debug, Default)]
pub struct RequiredIdentifiersRule;

impl ValidationRule for RequiredIdentifiersRule {
    fn name(&self) -> &str {
        "required_identifiers"
    }

    fn description(&self) -> &str {
        "State id and workflow id must be present"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn validate(&self, state: &WorkflowState) -> anyhow::Result<ValidationResult> {
        let mut result = ValidationResult::valid();
        if state.id.trim().is_empty() {
            result.error(
                ValidationIssue::new(ValidationCode::MissingStateId, "State id is required")
                    .with_field("id"),
            );
        }
        if state.workflow_id.trim().is_empty() {
            result.error(
                ValidationIssue::new(ValidationCode::MissingWorkflowId, "Workflow id is required")
                    .with_field("workflowId"),
            );
        }
        Ok(result)
    }
}

#[derive(Debug, Default)]
pub struct VersionRule;

impl ValidationRule for VersionRule {
    fn name(&self) -> &str {
        "version"
    }

    fn description(&self) -> &str {
        "Metadata version must be at least 1"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn validate(&self, state: &WorkflowState) -> anyhow::Result<ValidationResult> {
        let mut result = ValidationResult::valid();
        if state.metadata.version < 1 {
            result.error(
                ValidationIssue::new(
                    ValidationCode::InvalidVersion,
                    format!("Version must be >= 1, got {}", state.metadata.version),
                )
                .with_field("metadata.version"),
            );
        }
        Ok(result)
    }
}

/// Serialized size of `data` against the soft and hard limits.
#[derive(Debug, Clone)]
pub struct DataSizeRule {
    pub warning_bytes: usize,
    pub limit_bytes: usize,
}

impl ValidationRule for DataSizeRule {
    fn name(&self) -> &str {
        "data_size"
    }

    fn description(&self) -> &str {
        "Serialized state data must stay below the configured size limit"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn validate(&self, state: &WorkflowState) -> anyhow::Result<ValidationResult> {
        let size = serde_json::to_vec(&state.data)?.len();
        let mut result = ValidationResult::valid();
        if size > self.limit_bytes {
            result.error(
                ValidationIssue::new(
                    ValidationCode::DataTooLarge,
                    format!("State data is {} bytes, limit is {}", size, self.limit_bytes),
                )
                .with_field("data"),
            );
        } else if size > self.warning_bytes {
            result.warning(
                ValidationIssue::new(
                    ValidationCode::DataSizeWarning,
                    format!(
                        "State data is {} bytes, approaching limit of {}",
                        size, self.limit_bytes
                    ),
                )
                .with_field("data"),
            );
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
    Matches,
}

/// Rejected condition definitions
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition on '{field}' needs a string pattern")]
    PatternNotString { field: String },

    #[error("invalid pattern for condition on '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConditionDef {
    field: String,
    operator: ConditionOperator,
    #[serde(default)]
    value: Value,
}

/// `field operator value` check. Fields are dotted paths into the state's
/// `data`; a `transition.` prefix addresses the transition payload instead.
///
/// `Matches` patterns are compiled when the condition is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ConditionDef", into = "ConditionDef")]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    pattern: Option<Regex>,
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.value == other.value
    }
}

impl TryFrom<ConditionDef> for Condition {
    type Error = ConditionError;

    fn try_from(def: ConditionDef) -> Result<Self, Self::Error> {
        Condition::new(def.field, def.operator, def.value)
    }
}

impl From<Condition> for ConditionDef {
    fn from(condition: Condition) -> Self {
        Self {
            field: condition.field,
            operator: condition.operator,
            value: condition.value,
        }
    }
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: Value,
    ) -> Result<Self, ConditionError> {
        let field = field.into();
        let pattern = match operator {
            ConditionOperator::Matches => {
                let source = value.as_str().ok_or_else(|| ConditionError::PatternNotString {
                    field: field.clone(),
                })?;
                let regex = Regex::new(source).map_err(|source| ConditionError::InvalidPattern {
                    field: field.clone(),
                    source,
                })?;
                Some(regex)
            }
            _ => None,
        };
        Ok(Self {
            field,
            operator,
            value,
            pattern,
        })
    }

    pub fn evaluate(&self, state: &WorkflowState, transition: &StateTransition) -> bool {
        let actual = match self.field.strip_prefix("transition.") {
            Some(path) => lookup_path(&transition.payload, path),
            None => match &state.data {
                Value::Object(map) => lookup_path(map, &self.field),
                _ => None,
            },
        };

        match self.operator {
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
            ConditionOperator::NotExists => actual.map_or(true, Value::is_null),
            ConditionOperator::Equals => actual == Some(&self.value),
            ConditionOperator::NotEquals => actual != Some(&self.value),
            ConditionOperator::In => match (&self.value, actual) {
                (Value::Array(options), Some(actual)) => options.contains(actual),
                _ => false,
            },
            ConditionOperator::GreaterThan => {
                compare_numbers(actual, &self.value).is_some_and(|(lhs, rhs)| lhs > rhs)
            }
            ConditionOperator::LessThan => {
                compare_numbers(actual, &self.value).is_some_and(|(lhs, rhs)| lhs < rhs)
            }
            ConditionOperator::Matches => match (actual.and_then(Value::as_str), &self.pattern) {
                (Some(text), Some(pattern)) => pattern.is_match(text),
                _ => false,
            },
        }
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<(f64, f64)> {
    Some((actual?.as_f64()?, expected.as_f64()?))
}

fn lookup_path<'a>(root: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub type CustomValidator =
    Arc<dyn Fn(&WorkflowState, &StateTransition) -> anyhow::Result<bool> + Send + Sync>;

/// Extends the allowed-transition table for `from -> to` pairs and attaches
/// extra checks to them.
#[derive(Clone)]
pub struct TransitionRule {
    pub name: String,
    pub from: Vec<WorkflowStatus>,
    pub to: WorkflowStatus,
    pub conditions: Vec<Condition>,
    pub required_fields: Vec<String>,
    pub forbidden_fields: Vec<String>,
    custom_validator: Option<CustomValidator>,
}

impl fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRule")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("conditions", &self.conditions)
            .field("required_fields", &self.required_fields)
            .field("forbidden_fields", &self.forbidden_fields)
            .field("custom_validator", &self.custom_validator.is_some())
            .finish()
    }
}

impl TransitionRule {
    pub fn new(name: impl Into<String>, from: Vec<WorkflowStatus>, to: WorkflowStatus) -> Self {
        Self {
            name: name.into(),
            from,
            to,
            conditions: Vec::new(),
            required_fields: Vec::new(),
            forbidden_fields: Vec::new(),
            custom_validator: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn forbid_field(mut self, field: impl Into<String>) -> Self {
        self.forbidden_fields.push(field.into());
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&WorkflowState, &StateTransition) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.custom_validator = Some(Arc::new(validator));
        self
    }

    pub fn applies_to(&self, from: WorkflowStatus, to: WorkflowStatus) -> bool {
        self.to == to && self.from.contains(&from)
    }

    pub fn check(&self, state: &WorkflowState, transition: &StateTransition) -> ValidationResult {
        let mut result = ValidationResult::valid();

        for condition in &self.conditions {
            if !condition.evaluate(state, transition) {
                result.error(
                    ValidationIssue::new(
                        ValidationCode::ConditionNotMet,
                        format!(
                            "Condition {:?} on '{}' not met",
                            condition.operator, condition.field
                        ),
                    )
                    .with_field(condition.field.clone())
                    .with_rule(self.name.clone()),
                );
            }
        }

        for field in &self.required_fields {
            if !transition.payload.contains_key(field) {
                result.error(
                    ValidationIssue::new(
                        ValidationCode::RequiredFieldMissing,
                        format!("Transition requires field '{}'", field),
                    )
                    .with_field(field.clone())
                    .with_rule(self.name.clone()),
                );
            }
        }

        for field in &self.forbidden_fields {
            if transition.payload.contains_key(field) {
                result.error(
                    ValidationIssue::new(
                        ValidationCode::ForbiddenFieldPresent,
                        format!("Transition must not carry field '{}'", field),
                    )
                    .with_field(field.clone())
                    .with_rule(self.name.clone()),
                );
            }
        }

        if let Some(validator) = &self.custom_validator {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| validator(state, transition)));
            match outcome {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => result.error(
                    ValidationIssue::new(
                        ValidationCode::CustomValidationFailed,
                        format!("Custom validation for '{}' rejected the transition", self.name),
                    )
                    .with_rule(self.name.clone()),
                ),
                Ok(Err(e)) => result.error(
                    ValidationIssue::new(
                        ValidationCode::CustomValidatorError,
                        format!("Custom validator '{}' failed: {}", self.name, e),
                    )
                    .with_rule(self.name.clone()),
                ),
                Err(payload) => result.error(
                    ValidationIssue::new(
                        ValidationCode::CustomValidatorError,
                        format!(
                            "Custom validator '{}' panicked: {}",
                            self.name,
                            panic_message(payload.as_ref())
                        ),
                    )
                    .with_rule(self.name.clone()),
                ),
            }
        }

        result
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
