use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::scheduler::{ReminderFrequency, SchedulerSettings, DEFAULT_STALL_THRESHOLD_DAYS};
use crate::workflow::engine::DEFAULT_DEADLINE_APPROACH_DAYS;
use crate::workflow::stage::DEFAULT_STAGES;
use crate::workflow::{ConfigError, StageSet};

pub const CONFIG_FILE: &str = "content-workflow.toml";
pub const RC_FILE: &str = ".content-workflow-rc";
pub const ENV_PREFIX: &str = "CONTENT_WORKFLOW";
/// Upper bound for day-based thresholds.
pub const MAX_THRESHOLD_DAYS: i64 = 3650;

/// Main configuration structure for the content workflow service
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentWorkflowConfig {
    /// Stages and timing rules
    pub workflow: WorkflowConfig,
    /// Where workflows, transitions and the content catalog live
    pub storage: StorageConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Ordered stage names; first is the initial stage, last is terminal
    pub stages: Vec<String>,
    /// Move drafts to the next stage when their content is updated
    pub auto_progress_enabled: bool,
    pub reminder_frequency: ReminderFrequency,
    /// Days without an update before a workflow counts as stalled
    pub stall_threshold_days: i64,
    /// Days ahead of a deadline that reminders start
    pub deadline_approach_days: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            auto_progress_enabled: true,
            reminder_frequency: ReminderFrequency::Daily,
            stall_threshold_days: DEFAULT_STALL_THRESHOLD_DAYS,
            deadline_approach_days: DEFAULT_DEADLINE_APPROACH_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".content-workflow"),
        }
    }
}

impl StorageConfig {
    pub fn workflows_path(&self) -> PathBuf {
        self.data_dir.join("workflows.json")
    }

    pub fn transitions_path(&self) -> PathBuf {
        self.data_dir.join("transitions.jsonl")
    }

    pub fn content_path(&self) -> PathBuf {
        self.data_dir.join("content.json")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter, overridden by RUST_LOG
    pub log_level: String,
    /// JSON log lines instead of compact text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl ContentWorkflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (content-workflow.toml, .content-workflow-rc)
    /// 3. Environment variables (prefixed with CONTENT_WORKFLOW_, `__` between levels)
    pub fn load() -> Result<Self> {
        Self::load_from_dir(Path::new("."))
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let main_file = dir.join(CONFIG_FILE);
        if main_file.exists() {
            builder = builder.add_source(File::from(main_file).format(FileFormat::Toml));
        }

        let rc_file = dir.join(RC_FILE);
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("workflow.stages")
                .try_parsing(true),
        );

        let config: ContentWorkflowConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stage_set()?;
        check_days(
            "workflow.stall_threshold_days",
            self.workflow.stall_threshold_days,
        )?;
        check_days(
            "workflow.deadline_approach_days",
            self.workflow.deadline_approach_days,
        )?;
        Ok(())
    }

    pub fn stage_set(&self) -> Result<StageSet, ConfigError> {
        StageSet::new(&self.workflow.stages)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            frequency: self.workflow.reminder_frequency,
            stall_threshold_days: self.workflow.stall_threshold_days,
            deadline_approach_days: self.workflow.deadline_approach_days,
        }
    }
}

fn check_days(field: &str, days: i64) -> Result<(), ConfigError> {
    if !(0..=MAX_THRESHOLD_DAYS).contains(&days) {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be between 0 and {MAX_THRESHOLD_DAYS} days"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ContentWorkflowConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workflow.stages.len(), 5);
        assert!(config.workflow.auto_progress_enabled);
        assert_eq!(config.workflow.reminder_frequency, ReminderFrequency::Daily);
        assert_eq!(config.workflow.stall_threshold_days, 7);
        assert_eq!(config.workflow.deadline_approach_days, 3);
        assert_eq!(
            config.storage.transitions_path(),
            PathBuf::from(".content-workflow/transitions.jsonl")
        );
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[workflow]
stages = ["idea", "writing", "edit", "live"]
reminder_frequency = "weekly"

[storage]
data_dir = "/var/lib/content-workflow"
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(RC_FILE),
            "[workflow]\nauto_progress_enabled = false\n",
        )
        .unwrap();

        let config = ContentWorkflowConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.workflow.stages, vec!["idea", "writing", "edit", "live"]);
        assert_eq!(config.workflow.reminder_frequency, ReminderFrequency::Weekly);
        assert!(!config.workflow.auto_progress_enabled);
        assert_eq!(config.workflow.stall_threshold_days, 7);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/content-workflow"));
        assert_eq!(config.stage_set().unwrap().terminal().as_str(), "live");
    }

    #[test]
    fn invalid_stage_lists_are_rejected() {
        let mut config = ContentWorkflowConfig::default();
        config.workflow.stages = vec!["draft".into(), "draft".into()];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateStage(_))));

        config.workflow.stages.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoStages)));
    }

    #[test]
    fn negative_thresholds_are_rejected() {
        let mut config = ContentWorkflowConfig::default();
        config.workflow.stall_threshold_days = -1;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn oversized_thresholds_are_rejected() {
        let mut config = ContentWorkflowConfig::default();
        config.workflow.deadline_approach_days = 100_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        config.workflow.deadline_approach_days = MAX_THRESHOLD_DAYS;
        config.workflow.stall_threshold_days = MAX_THRESHOLD_DAYS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        config.workflow.stall_threshold_days = MAX_THRESHOLD_DAYS;
        config.validate().unwrap();
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ContentWorkflowConfig::default();
        config.workflow.reminder_frequency = ReminderFrequency::Hourly;
        config.observability.json_logs = false;
        config.save_to_file(dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = ContentWorkflowConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
