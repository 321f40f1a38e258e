use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the workflow state core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StateCoreConfig {
    /// State manager settings
    pub manager: ManagerConfig,
    /// Validator settings
    pub validator: ValidatorConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Durable store settings
    pub database: DatabaseConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// History entries kept per state; older entries are dropped
    pub max_history_entries: usize,
    /// Default transaction timeout in milliseconds
    pub transaction_timeout_ms: u64,
    /// Buffered events per subscriber before slow subscribers lag
    pub event_channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Treat warnings as blocking
    pub strict_mode: bool,
    /// Serialized data size that triggers DATA_SIZE_WARNING
    pub data_size_warning_bytes: usize,
    /// Serialized data size that triggers DATA_TOO_LARGE
    pub data_size_limit_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time to live of cached state entries
    pub ttl_seconds: u64,
    /// Maximum cached entries
    pub max_capacity: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout_seconds: u64,
    /// How long SQLite waits on a locked database
    pub busy_timeout_seconds: u64,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON structured logs instead of human readable lines
    pub json_logs: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_history_entries: 100,
            transaction_timeout_ms: 30_000,
            event_channel_capacity: 256,
        }
    }
}

impl ManagerConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            data_size_warning_bytes: 900 * 1024,
            data_size_limit_bytes: 1024 * 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_capacity: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.workflow-state/state.db".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 5,
            busy_timeout_seconds: 5,
            auto_migrate: true,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl StateCoreConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (workflow-state.toml, .workflow-state-rc)
    /// 3. Environment variables (prefixed with WORKFLOW_STATE_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) but looks for config files in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let toml_file = dir.join("workflow-state.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file));
        }

        let rc_file = dir.join(".workflow-state-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(config::FileFormat::Toml));
        }

        // Override with environment variables, e.g. WORKFLOW_STATE_MANAGER__MAX_HISTORY_ENTRIES
        builder = builder.add_source(
            Environment::with_prefix("WORKFLOW_STATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
