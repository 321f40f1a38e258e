use anyhow::{Context, Result};
use workflow_state::{StateCoreConfig, StateValidator, WorkflowStatus};

pub struct TransitionsCommand {
    pub status: String,
}

impl TransitionsCommand {
    pub fn new(status: String) -> Self {
        Self { status }
    }

    pub fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        let status: WorkflowStatus = self
            .status
            .to_uppercase()
            .parse()
            .with_context(|| format!("Unknown status '{}'", self.status))?;

        let validator = StateValidator::new(&config.validator);
        let allowed = validator.get_allowed_transitions(status);

        if allowed.is_empty() {
            println!("🛑 {} is terminal: no transitions allowed", status);
            return Ok(());
        }

        println!("🚦 Transitions from {}:", status);
        for target in allowed {
            println!("   → {}", target);
        }
        Ok(())
    }
}
