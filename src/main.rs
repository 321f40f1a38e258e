use anyhow::Result;
use clap::Parser;
use workflow_state::{init_telemetry, shutdown_telemetry, StateCoreConfig};

mod cli;

use cli::commands::admin::{ConfigCommand, MigrateCommand, StatsCommand};
use cli::commands::checkpoint::{CheckpointCommand, RestoreCommand};
use cli::commands::show_usage;
use cli::commands::state::{HistoryCommand, ListCommand, ShowCommand};
use cli::commands::transitions::TransitionsCommand;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    StateCoreConfig::load_env_file()?;
    let mut config = match &cli.config_dir {
        Some(dir) => StateCoreConfig::load_from(dir)?,
        None => StateCoreConfig::load()?,
    };
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }

    init_telemetry(&config.observability)?;

    let result = match cli.command {
        None => show_usage(),
        Some(Commands::Transitions { status }) => TransitionsCommand::new(status).execute(&config),
        Some(Commands::Config) => ConfigCommand.execute(&config),
        Some(command) => tokio::runtime::Runtime::new()?.block_on(async {
            match command {
                Commands::Migrate => MigrateCommand.execute(&config).await,
                Commands::Stats { json } => StatsCommand::new(json).execute(&config).await,
                Commands::Show { id } => ShowCommand::new(id).execute(&config).await,
                Commands::History { id, limit } => {
                    HistoryCommand::new(id, limit).execute(&config).await
                }
                Commands::List { workflow_id } => {
                    ListCommand::new(workflow_id).execute(&config).await
                }
                Commands::Checkpoint {
                    state_id,
                    description,
                } => {
                    CheckpointCommand::new(state_id, description)
                        .execute(&config)
                        .await
                }
                Commands::Restore { checkpoint_id, by } => {
                    RestoreCommand::new(checkpoint_id, by)
                        .execute(&config)
                        .await
                }
                Commands::Transitions { .. } | Commands::Config => Ok(()),
            }
        }),
    };

    shutdown_telemetry();
    result
}
