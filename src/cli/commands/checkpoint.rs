use anyhow::Result;
use workflow_state::StateCoreConfig;

use super::state::print_state;
use super::with_manager;

pub struct CheckpointCommand {
    pub state_id: String,
    pub description: Option<String>,
}

impl CheckpointCommand {
    pub fn new(state_id: String, description: Option<String>) -> Self {
        Self {
            state_id,
            description,
        }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            let checkpoint = manager
                .create_checkpoint(&self.state_id, self.description.clone())
                .await?;
            println!("📸 Checkpoint {} created", checkpoint.id);
            println!("   🔢 Snapshot version: {}", checkpoint.snapshot.metadata.version);

            let checkpoints = manager.list_checkpoints(&self.state_id).await?;
            println!("   🗃️  State now has {} checkpoint(s)", checkpoints.len());
            anyhow::Ok(())
        })
        .await
    }
}

pub struct RestoreCommand {
    pub checkpoint_id: String,
    pub restored_by: String,
}

impl RestoreCommand {
    pub fn new(checkpoint_id: String, restored_by: String) -> Self {
        Self {
            checkpoint_id,
            restored_by,
        }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            let restored = manager
                .restore_from_checkpoint(&self.checkpoint_id, &self.restored_by)
                .await?;
            println!("⏪ Restored from checkpoint {}", self.checkpoint_id);
            println!();
            print_state(&restored);
            anyhow::Ok(())
        })
        .await
    }
}
