use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "workflow-state")]
#[command(about = "Inspect and operate the workflow state store")]
#[command(long_about = "workflow-state manages versioned workflow state records: validated \
                       transitions, checkpoints and restores, backed by SQLite with an \
                       in-process cache. \
                       Start with 'workflow-state migrate' to create the schema.")]
pub struct Cli {
    /// Directory holding workflow-state.toml / .workflow-state-rc
    #[arg(
        long,
        global = true,
        help = "Directory to load configuration files from (default: current directory)"
    )]
    pub config_dir: Option<PathBuf>,

    /// Override the database URL from configuration
    #[arg(long, global = true, help = "Database URL, e.g. sqlite://.workflow-state/state.db")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or upgrade the database schema
    Migrate,
    /// Show store counts and tier metrics
    Stats {
        /// Print JSON instead of a summary
        #[arg(long, help = "Emit machine readable JSON")]
        json: bool,
    },
    /// Show one workflow state
    Show {
        /// State id
        id: String,
    },
    /// Show the transition history of a state, newest first
    History {
        /// State id
        id: String,
        /// Maximum number of entries
        #[arg(long, default_value = "20", help = "Maximum number of history entries to show")]
        limit: usize,
    },
    /// List the states of a workflow
    List {
        /// Workflow id
        workflow_id: String,
    },
    /// Snapshot a state
    Checkpoint {
        /// State id
        state_id: String,
        /// Free-form description stored with the checkpoint
        #[arg(long, help = "Description stored with the checkpoint")]
        description: Option<String>,
    },
    /// Restore a state from a checkpoint
    Restore {
        /// Checkpoint id
        checkpoint_id: String,
        /// Actor recorded as updatedBy
        #[arg(long, default_value = "cli", help = "Actor recorded on the restored state")]
        by: String,
    },
    /// Show the statuses reachable from a status
    Transitions {
        /// Status, e.g. RUNNING
        status: String,
    },
    /// Print the effective configuration as TOML
    Config,
}
