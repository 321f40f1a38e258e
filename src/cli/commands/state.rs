use anyhow::Result;
use workflow_state::{StateCoreConfig, WorkflowState};

use super::with_manager;

pub struct ShowCommand {
    pub id: String,
}

impl ShowCommand {
    pub fn new(id: String) -> Self {
        Self { id }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            match manager.get_state(&self.id).await? {
                Some(state) => {
                    print_state(&state);
                    println!();
                    println!("📄 Data:");
                    println!("{}", serde_json::to_string_pretty(&state.data)?);
                }
                None => {
                    println!("📋 No state with id {}", self.id);
                    println!("   💡 List a workflow's states with: workflow-state list <workflow-id>");
                }
            }
            anyhow::Ok(())
        })
        .await
    }
}

pub struct HistoryCommand {
    pub id: String,
    pub limit: usize,
}

impl HistoryCommand {
    pub fn new(id: String, limit: usize) -> Self {
        Self { id, limit }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            let history = manager.get_state_history(&self.id, self.limit).await?;
            if history.is_empty() {
                println!("📜 State {} has no recorded transitions", self.id);
                return Ok(());
            }

            println!("📜 HISTORY OF {} (newest first)", self.id);
            println!("─────────────────────────────────────────");
            for record in history {
                println!(
                    "{}  {} → {}  [{} → {}]  by {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.previous_status,
                    record.new_status,
                    record.previous_step,
                    record.new_step,
                    record.triggered_by
                );
                if let Some(reason) = record.reason {
                    println!("    💬 {}", reason);
                }
            }
            anyhow::Ok(())
        })
        .await
    }
}

pub struct ListCommand {
    pub workflow_id: String,
}

impl ListCommand {
    pub fn new(workflow_id: String) -> Self {
        Self { workflow_id }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            let states = manager.list_workflow_states(&self.workflow_id).await?;
            if states.is_empty() {
                println!("📋 Workflow {} has no states", self.workflow_id);
                return Ok(());
            }

            println!("📋 STATES OF WORKFLOW {}", self.workflow_id);
            println!("─────────────────────────────────────────");
            for state in &states {
                println!(
                    "{}  {:<10} step={} v{}",
                    state.id, state.status, state.current_step, state.metadata.version
                );
            }
            println!();
            println!("📈 {} state(s)", states.len());
            anyhow::Ok(())
        })
        .await
    }
}

pub fn print_state(state: &WorkflowState) {
    println!("🔎 STATE {}", state.id);
    println!("   🗂️  Workflow: {}", state.workflow_id);
    println!("   🚦 Status: {}", state.status);
    println!("   👣 Step: {}", state.current_step);
    println!("   🔢 Version: {}", state.metadata.version);
    println!(
        "   🕒 Updated: {} by {}",
        state.metadata.updated_at.format("%Y-%m-%d %H:%M:%S"),
        state.metadata.updated_by
    );
    if let Some(checkpoint_id) = &state.checkpoint_id {
        println!("   📸 Latest checkpoint: {}", checkpoint_id);
    }
    println!("   📜 History entries: {}", state.history.len());
}
