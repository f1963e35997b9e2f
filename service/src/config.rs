use anyhow::{Context, Result};
use aof_engine::SchedulerConfig;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Storm batcher settings
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct StormConfig {
    /// Accumulation window for non-critical events of one type
    pub window_ms: u64,
    /// Count above which the window collapses into one aggregate message
    pub threshold: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            threshold: 5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrchestratorConfig {
    /// Project root holding `tasks/` and `events/`
    pub data_dir: PathBuf,
    /// Project scope identifier
    pub project_id: String,
    /// Scheduler tick period
    pub poll_interval_ms: u64,
    /// Lease TTL applied at assignment
    pub default_lease_ttl_ms: u64,
    /// Hard ceiling on concurrently leased tasks
    pub max_concurrent_dispatches: u32,
    /// Upper bound on assignments in one cycle
    #[serde(default)]
    pub max_dispatches_per_poll: Option<u32>,
    /// Global throttle between dispatches
    #[serde(default)]
    pub min_dispatch_interval_ms: Option<u64>,
    /// Age after which a ready task is reported stuck
    #[serde(default)]
    pub stuck_task_threshold_ms: Option<u64>,
    /// Also block stuck tasks instead of only reporting them
    pub auto_block_stuck_tasks: bool,
    /// Plan without executing
    pub dry_run: bool,
    /// Default notification dedupe window
    pub dedupe_window_ms: u64,
    /// Storm batcher settings
    #[serde(default)]
    pub storm: StormConfig,
    /// Directory for the cross-process scheduler lock; none disables it
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    /// Optional workflow definition file (YAML)
    #[serde(default)]
    pub workflow_file: Option<PathBuf>,
    /// Optional org chart file (YAML)
    #[serde(default)]
    pub org_file: Option<PathBuf>,
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./aof-data"),
            project_id: "default".to_string(),
            poll_interval_ms: 30_000,
            default_lease_ttl_ms: 600_000,
            max_concurrent_dispatches: 4,
            max_dispatches_per_poll: None,
            min_dispatch_interval_ms: None,
            stuck_task_threshold_ms: None,
            auto_block_stuck_tasks: false,
            dry_run: false,
            dedupe_window_ms: 300_000,
            storm: StormConfig::default(),
            lock_dir: None,
            workflow_file: None,
            org_file: None,
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the embedded defaults, an optional config
    /// file, and `AOF_`-prefixed environment variable overrides.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder.add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("AOF")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut result: OrchestratorConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("AOF")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;
        let mut result: OrchestratorConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;
        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Standard environment variables recognized alongside the AOF_ prefix
    fn apply_standard_env_vars(config: &mut OrchestratorConfig) {
        if let Ok(data_dir) = env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(project_id) = env::var("PROJECT_ID") {
            config.project_id = project_id;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
    }

    /// The scheduler's view of this configuration
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            project_id: self.project_id.clone(),
            dry_run: self.dry_run,
            default_lease_ttl_ms: self.default_lease_ttl_ms,
            max_concurrent_dispatches: self.max_concurrent_dispatches,
            max_dispatches_per_poll: self.max_dispatches_per_poll,
            min_dispatch_interval_ms: self.min_dispatch_interval_ms,
            stuck_task_threshold_ms: self.stuck_task_threshold_ms,
            auto_block_stuck_tasks: self.auto_block_stuck_tasks,
            ..SchedulerConfig::default()
        }
    }

    /// Validate the configuration; fatal at service startup
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("data_dir cannot be empty"));
        }
        if self.project_id.trim().is_empty() {
            return Err(anyhow::anyhow!("project_id cannot be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be greater than 0"));
        }
        if self.max_concurrent_dispatches == 0 {
            return Err(anyhow::anyhow!(
                "max_concurrent_dispatches must be greater than 0"
            ));
        }
        if self.storm.threshold == 0 {
            return Err(anyhow::anyhow!("storm.threshold must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.poll_interval_ms, 30_000);
        assert_eq!(config.default_lease_ttl_ms, 600_000);
        assert_eq!(config.dedupe_window_ms, 300_000);
        assert_eq!(config.storm.window_ms, 10_000);
        assert_eq!(config.storm.threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let config: OrchestratorConfig = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.project_id, "default");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.project_id = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_config_projection() {
        let mut config = OrchestratorConfig::default();
        config.dry_run = true;
        config.max_concurrent_dispatches = 7;
        let sched = config.scheduler_config();
        assert!(sched.dry_run);
        assert_eq!(sched.max_concurrent_dispatches, 7);
        assert_eq!(sched.default_lease_ttl_ms, 600_000);
    }
}
