//! Rule engine for structural state validation and transition legality.
//!
//! The validator is pure: it performs no I/O and reports every domain failure
//! through a [`ValidationResult`] rather than an error.

pub mod result;
pub mod rules;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::config::ValidatorConfig;
use crate::state::{StateTransition, WorkflowState, WorkflowStatus};

pub use result::{ValidationCode, ValidationIssue, ValidationResult};
pub use rules::{
    Condition, ConditionError, ConditionOperator, CustomValidator, DataSizeRule, FnRule,
    RequiredIdentifiersRule, TransitionRule, ValidationRule, VersionRule,
};

/// The built-in directed graph of legal status changes.
pub fn default_transition_table() -> BTreeMap<WorkflowStatus, BTreeSet<WorkflowStatus>> {
    use WorkflowStatus::*;

    let edges: [(WorkflowStatus, &[WorkflowStatus]); 8] = [
        (Pending, &[Running, Cancelled]),
        (Running, &[Paused, Completed, Failed, Cancelled, Waiting]),
        (Paused, &[Running, Cancelled]),
        (Waiting, &[Cancelled]),
        (Failed, &[Rollback]),
        (Rollback, &[Pending]),
        (Completed, &[]),
        (Cancelled, &[]),
    ];

    edges
        .into_iter()
        .map(|(from, to)| (from, to.iter().copied().collect()))
        .collect()
}

pub struct StateValidator {
    strict_mode: bool,
    rules: Vec<Box<dyn ValidationRule>>,
    transitions: BTreeMap<WorkflowStatus, BTreeSet<WorkflowStatus>>,
    transition_rules: Vec<TransitionRule>,
}

impl std::fmt::Debug for StateValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateValidator")
            .field("strict_mode", &self.strict_mode)
            .field("rules", &self.rule_names())
            .field("transitions", &self.transitions)
            .field("transition_rules", &self.transition_rules)
            .finish()
    }
}

impl Default for StateValidator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl StateValidator {
    /// Validator with the built-in rules and the default transition table.
    pub fn new(config: &ValidatorConfig) -> Self {
        let mut validator = Self {
            strict_mode: config.strict_mode,
            rules: Vec::new(),
            transitions: default_transition_table(),
            transition_rules: Vec::new(),
        };
        validator.add_rule(Box::new(RequiredIdentifiersRule));
        validator.add_rule(Box::new(VersionRule));
        validator.add_rule(Box::new(DataSizeRule {
            warning_bytes: config.data_size_warning_bytes,
            limit_bytes: config.data_size_limit_bytes,
        }));
        validator
    }

    pub fn with_rule(mut self, rule: Box<dyn ValidationRule>) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn with_transition_rule(mut self, rule: TransitionRule) -> Self {
        self.add_transition_rule(rule);
        self
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    pub fn set_strict_mode(&mut self, strict: bool) {
        self.strict_mode = strict;
    }

    /// Register a rule, replacing any existing rule of the same name.
    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.retain(|existing| existing.name() != rule.name());
        debug!(rule = rule.name(), priority = rule.priority(), "Registered validation rule");
        self.rules.push(rule);
        // stable sort keeps registration order among equal priorities
        self.rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority()));
    }

    /// Returns false when no rule of that name exists.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name() != name);
        self.rules.len() != before
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.name().to_string()).collect()
    }

    pub fn add_transition_rule(&mut self, rule: TransitionRule) {
        self.transition_rules.retain(|existing| existing.name != rule.name);
        self.transition_rules.push(rule);
    }

    pub fn remove_transition_rule(&mut self, name: &str) -> bool {
        let before = self.transition_rules.len();
        self.transition_rules.retain(|rule| rule.name != name);
        self.transition_rules.len() != before
    }

    pub fn transition_rules(&self) -> &[TransitionRule] {
        &self.transition_rules
    }

    /// Run every enabled rule in priority order.
    pub fn validate_state(&self, state: &WorkflowState) -> ValidationResult {
        let mut result = ValidationResult::valid();

        for rule in self.rules.iter().filter(|rule| rule.enabled()) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| rule.validate(state)));
            match outcome {
                Ok(Ok(rule_result)) => result.merge(tag_rule(rule_result, rule.name())),
                Ok(Err(e)) => {
                    warn!(
                        rule = rule.name(),
                        state_id = %state.id,
                        error = %e,
                        "Validation rule failed"
                    );
                    result.error(
                        ValidationIssue::new(
                            ValidationCode::ValidationRuleError,
                            format!("Rule '{}' failed: {}", rule.name(), e),
                        )
                        .with_rule(rule.name()),
                    );
                }
                Err(payload) => {
                    let message = rules::panic_message(payload.as_ref());
                    warn!(
                        rule = rule.name(),
                        state_id = %state.id,
                        error = %message,
                        "Validation rule panicked"
                    );
                    result.error(
                        ValidationIssue::new(
                            ValidationCode::ValidationRuleError,
                            format!("Rule '{}' panicked: {}", rule.name(), message),
                        )
                        .with_rule(rule.name()),
                    );
                }
            }
        }

        if self.strict_mode && !result.warnings.is_empty() {
            result.is_valid = false;
        }

        result
    }

    /// Structural checks on an untyped document, followed by
    /// [`validate_state`](Self::validate_state) when it deserializes.
    pub fn validate_document(&self, document: &Value) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if text_field(document, "id").trim().is_empty() {
            result.error(
                ValidationIssue::new(ValidationCode::MissingStateId, "State id is required")
                    .with_field("id"),
            );
        }
        if text_field(document, "workflowId").trim().is_empty() {
            result.error(
                ValidationIssue::new(ValidationCode::MissingWorkflowId, "Workflow id is required")
                    .with_field("workflowId"),
            );
        }

        let status = document.get("status").and_then(Value::as_str);
        if status.and_then(|s| s.parse::<WorkflowStatus>().ok()).is_none() {
            result.error(
                ValidationIssue::new(
                    ValidationCode::InvalidStatus,
                    format!("Unknown status: {}", status.unwrap_or("<missing>")),
                )
                .with_field("status"),
            );
        }

        match document.get("metadata") {
            Some(Value::Object(metadata)) => {
                let version = metadata.get("version").and_then(Value::as_i64).unwrap_or(0);
                if version < 1 {
                    result.error(
                        ValidationIssue::new(
                            ValidationCode::InvalidVersion,
                            format!("Version must be >= 1, got {}", version),
                        )
                        .with_field("metadata.version"),
                    );
                }
            }
            _ => result.error(
                ValidationIssue::new(ValidationCode::MissingMetadata, "State metadata is required")
                    .with_field("metadata"),
            ),
        }

        if !result.is_valid {
            return result;
        }

        match serde_json::from_value::<WorkflowState>(document.clone()) {
            Ok(state) => result.merge(self.validate_state(&state)),
            Err(e) => result.error(ValidationIssue::new(
                ValidationCode::ValidationRuleError,
                format!("State document is malformed: {}", e),
            )),
        }
        result
    }

    /// Check a proposed transition against the current state, the
    /// transition table and every matching transition rule.
    pub fn validate_transition(
        &self,
        current: &WorkflowState,
        transition: &StateTransition,
    ) -> ValidationResult {
        let mut result = ValidationResult::valid();

        if current.status != transition.from {
            result.error(
                ValidationIssue::new(
                    ValidationCode::InvalidCurrentStatus,
                    format!(
                        "State {} is {}, transition expects {}",
                        current.id, current.status, transition.from
                    ),
                )
                .with_field("status"),
            );
            return result;
        }

        if !self.is_transition_allowed(transition.from, transition.to) {
            result.error(ValidationIssue::new(
                ValidationCode::ForbiddenTransition,
                format!("Transition {} -> {} is not allowed", transition.from, transition.to),
            ));
            return result;
        }

        for rule in self
            .transition_rules
            .iter()
            .filter(|rule| rule.applies_to(transition.from, transition.to))
        {
            result.merge(rule.check(current, transition));
        }

        if self.strict_mode && !result.warnings.is_empty() {
            result.is_valid = false;
        }

        result
    }

    /// Statuses reachable from `status` in one step.
    pub fn get_allowed_transitions(&self, status: WorkflowStatus) -> Vec<WorkflowStatus> {
        let mut allowed: BTreeSet<WorkflowStatus> =
            self.transitions.get(&status).cloned().unwrap_or_default();
        allowed.extend(
            self.transition_rules
                .iter()
                .filter(|rule| rule.from.contains(&status))
                .map(|rule| rule.to),
        );
        allowed.into_iter().collect()
    }

    pub fn is_transition_allowed(&self, from: WorkflowStatus, to: WorkflowStatus) -> bool {
        self.transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
            || self.transition_rules.iter().any(|rule| rule.applies_to(from, to))
    }
}

fn text_field<'a>(document: &'a Value, key: &str) -> &'a str {
    document.get(key).and_then(Value::as_str).unwrap_or("")
}

fn tag_rule(mut result: ValidationResult, rule: &str) -> ValidationResult {
    for issue in result.errors.iter_mut().chain(result.warnings.iter_mut()) {
        if issue.rule.is_none() {
            issue.rule = Some(rule.to_string());
        }
    }
    result
}
