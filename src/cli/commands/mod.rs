use anyhow::Result;
use workflow_state::{StateCoreConfig, WorkflowStateManager};

pub mod admin;
pub mod checkpoint;
pub mod state;
pub mod transitions;

/// Open a manager for the duration of `f` and close it afterwards, even when
/// `f` fails.
pub async fn with_manager<F, Fut, R>(config: &StateCoreConfig, f: F) -> Result<R>
where
    F: FnOnce(WorkflowStateManager) -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    let manager = match WorkflowStateManager::from_config(config).await {
        Ok(manager) => manager,
        Err(e) => {
            println!("❌ Failed to open state store at {}: {}", config.database.url, e);
            return Err(e.into());
        }
    };

    let result = f(manager.clone()).await;
    if let Err(e) = manager.close().await {
        println!("⚠️  State store did not close cleanly: {}", e);
    }
    result
}

pub fn show_usage() -> Result<()> {
    println!("🗂️  workflow-state - Workflow State Management");
    println!();
    println!("Getting started:");
    println!("  🛠️  workflow-state migrate              # Create the schema");
    println!("  📊 workflow-state stats                # Store overview");
    println!("  🔎 workflow-state show <id>            # Inspect a state");
    println!("  📜 workflow-state history <id>         # Transition history");
    println!();
    println!("Recovery:");
    println!("  📸 workflow-state checkpoint <id>      # Snapshot a state");
    println!("  ⏪ workflow-state restore <checkpoint>  # Rewind to a snapshot");
    println!();
    println!("💡 Configuration is read from workflow-state.toml and WORKFLOW_STATE_* variables");
    Ok(())
}
