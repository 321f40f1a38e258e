use anyhow::Result;
use workflow_state::{StateCoreConfig, StateStore};

use super::with_manager;

pub struct MigrateCommand;

impl MigrateCommand {
    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        println!("🛠️  Migrating {}", config.database.url);
        print!("🔄 Connecting... ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let store = StateStore::connect(config).await?;
        println!("✅");

        print!("📦 Applying schema... ");
        std::io::Write::flush(&mut std::io::stdout())?;
        // initialize runs migrations when auto_migrate is on
        let result = store.initialize().await;
        store.close().await?;
        result?;
        println!("✅");

        if !config.database.auto_migrate {
            println!("⚠️  database.auto_migrate is false, schema was only verified");
        }
        Ok(())
    }
}

pub struct StatsCommand {
    pub json: bool,
}

impl StatsCommand {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub async fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        with_manager(config, |manager| async move {
            let stats = manager.stats().await?;
            if self.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("📊 WORKFLOW STATE STORE");
            println!("=======================");
            println!("   🗂️  States: {}", stats.store.total_states);
            println!("   📸 Checkpoints: {}", stats.store.total_checkpoints);
            if let (Some(oldest), Some(newest)) =
                (stats.store.oldest_state_at, stats.store.newest_state_at)
            {
                println!(
                    "   🕒 Created between {} and {}",
                    oldest.format("%Y-%m-%d %H:%M:%S"),
                    newest.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("🚦 BY STATUS:");
            if stats.store.by_status.is_empty() {
                println!("   (none)");
            }
            for (status, count) in &stats.store.by_status {
                println!("   {:<10} {}", status.as_str(), count);
            }
            anyhow::Ok(())
        })
        .await
    }
}

pub struct ConfigCommand;

impl ConfigCommand {
    pub fn execute(&self, config: &StateCoreConfig) -> Result<()> {
        println!("{}", toml::to_string_pretty(config)?);
        Ok(())
    }
}
