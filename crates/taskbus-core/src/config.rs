//! Taskbus configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskbusError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskbusConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl TaskbusConfig {
    /// Load config from the default path (~/.taskbus/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskbusError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string and validate it.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TaskbusError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskbusError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler or bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(TaskbusError::Config(
                "scheduler.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(TaskbusError::Config(
                "scheduler.tick_interval_ms must be positive".into(),
            ));
        }
        let history = &self.bus.message_history;
        if history.enabled && history.max_messages == 0 {
            return Err(TaskbusError::Config(
                "bus.message_history.max_messages must be at least 1".into(),
            ));
        }
        if history.enabled && history.sweep_interval_ms == 0 {
            return Err(TaskbusError::Config(
                "bus.message_history.sweep_interval_ms must be positive".into(),
            ));
        }
        if self.monitor.failure_threshold == 0 {
            return Err(TaskbusError::Config(
                "monitor.failure_threshold must be at least 1".into(),
            ));
        }
        for (name, level) in &self.scheduler.priority_levels {
            if *level > MAX_PRIORITY_LEVEL {
                return Err(TaskbusError::Config(format!(
                    "priority level '{name}' = {level} exceeds {MAX_PRIORITY_LEVEL}"
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Taskbus home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskbus")
    }
}

/// Largest value accepted in the priority table.
pub const MAX_PRIORITY_LEVEL: u8 = 100;

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Deferrals a dependency-blocked task may accumulate before it fails.
    #[serde(default = "default_max_dependency_deferrals")]
    pub max_dependency_deferrals: u32,
    /// Named priority levels; lower value runs first.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: BTreeMap<String, u8>,
}

fn default_max_concurrent_tasks() -> usize { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 5_000 }
fn default_tick_interval_ms() -> u64 { 1_000 }
fn default_max_dependency_deferrals() -> u32 { 300 }

fn default_priority_levels() -> BTreeMap<String, u8> {
    [("critical", 0), ("high", 1), ("medium", 2), ("low", 3)]
        .into_iter()
        .map(|(name, level)| (name.to_string(), level))
        .collect()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            max_dependency_deferrals: default_max_dependency_deferrals(),
            priority_levels: default_priority_levels(),
        }
    }
}

impl SchedulerConfig {
    /// Look up a named priority level (case-insensitive).
    pub fn priority(&self, name: &str) -> Option<u8> {
        let name = name.trim().to_ascii_lowercase();
        self.priority_levels.get(&name).copied()
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Channel allow-list: literal channel or `*` pattern → enabled.
    #[serde(default = "default_enabled_channels")]
    pub enabled_channels: BTreeMap<String, bool>,
    #[serde(default)]
    pub message_history: MessageHistoryConfig,
}

fn default_enabled_channels() -> BTreeMap<String, bool> {
    BTreeMap::from([("*".to_string(), true)])
}
fn default_request_timeout_ms() -> u64 { 30_000 }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            enabled_channels: default_enabled_channels(),
            message_history: MessageHistoryConfig::default(),
        }
    }
}

/// Per-channel message history retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_retention_time_ms")]
    pub retention_time_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Retain every published message, not only those published with `persist`.
    #[serde(default)]
    pub persist_all: bool,
}

fn default_max_messages() -> usize { 100 }
fn default_retention_time_ms() -> u64 { 3_600_000 }
fn default_sweep_interval_ms() -> u64 { 60_000 }

impl Default for MessageHistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: default_max_messages(),
            retention_time_ms: default_retention_time_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            persist_all: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String { "~/.taskbus/data".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StoreConfig {
    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// `agent:failure` messages from one agent before a restart is requested.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_failure_threshold() -> u32 { 3 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskbusConfig::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 10);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.scheduler.retry_delay_ms, 5_000);
        assert_eq!(config.bus.request_timeout_ms, 30_000);
        assert!(!config.bus.message_history.enabled);
        assert_eq!(config.bus.enabled_channels.get("*"), Some(&true));
        assert_eq!(config.monitor.failure_threshold, 3);
    }

    #[test]
    fn test_partial_toml() {
        let config = TaskbusConfig::from_toml(
            r#"
            [scheduler]
            max_concurrent_tasks = 2

            [bus.enabled_channels]
            "agent:*" = true
            "agent:debug" = false

            [bus.message_history]
            enabled = true
            max_messages = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.bus.enabled_channels.len(), 2);
        assert_eq!(config.bus.message_history.max_messages, 5);
        assert_eq!(config.bus.message_history.retention_time_ms, 3_600_000);
    }

    #[test]
    fn test_priority_lookup() {
        let config = SchedulerConfig::default();
        assert_eq!(config.priority("critical"), Some(0));
        assert_eq!(config.priority(" LOW "), Some(3));
        assert_eq!(config.priority("urgent"), None);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = TaskbusConfig::from_toml("[scheduler]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(matches!(err, TaskbusError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join("taskbus-test-config");
        let path = dir.join("config.toml");
        let mut config = TaskbusConfig::default();
        config.scheduler.retry_delay_ms = 250;
        config.save_to(&path).unwrap();

        let loaded = TaskbusConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.retry_delay_ms, 250);
        std::fs::remove_dir_all(&dir).ok();
    }
}
