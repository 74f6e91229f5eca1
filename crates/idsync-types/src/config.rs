//! Configuration loading for idsync.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/idsync/config.toml`.

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::definitions::JobDefinition;
use crate::error::IdsyncError;
use crate::query::DEFAULT_CHUNK_SIZE;
use crate::recurrence::RecurrenceDefinition;

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Interval between polls (ms)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Delay before the first poll after start (seconds)
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Run the planner every N ticks (0 disables planning)
    #[serde(default = "default_plan_every_ticks")]
    pub plan_every_ticks: u64,

    /// How far ahead the planner materializes jobs (hours)
    #[serde(default = "default_plan_horizon_hours")]
    pub plan_horizon_hours: u64,

    /// Max time to wait for running jobs on shutdown (seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_initial_delay_secs() -> u64 {
    10
}

fn default_plan_every_ticks() -> u64 {
    60
}

fn default_plan_horizon_hours() -> u64 {
    24
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            initial_delay_secs: default_initial_delay_secs(),
            plan_every_ticks: default_plan_every_ticks(),
            plan_horizon_hours: default_plan_horizon_hours(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl HeartbeatSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_ms == 0 {
            return Err("tick_ms must be > 0".to_string());
        }
        if self.plan_every_ticks > 0 && self.plan_horizon_hours == 0 {
            return Err("plan_horizon_hours must be > 0 when planning is enabled".to_string());
        }
        Ok(())
    }
}

/// Store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// How long a transaction waits for a row lock (ms)
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Reconciliation tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Rows per page for chunked scans
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Coordinator policy switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Interrupt owned jobs that run past their limit time
    #[serde(default)]
    pub enforce_deadlines: bool,

    /// Abort overdue RUNNING jobs that no live coordinator owns
    #[serde(default)]
    pub abort_stale: bool,
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// IANA timezone recurrence anchors are interpreted in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub reconcile: ReconcileSettings,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub job_definitions: Vec<JobDefinition>,

    #[serde(default)]
    pub recurrences: Vec<RecurrenceDefinition>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "idsync")
}

fn default_db_path() -> String {
    project_dirs()
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            timezone: default_timezone(),
            heartbeat: HeartbeatSettings::default(),
            store: StoreSettings::default(),
            reconcile: ReconcileSettings::default(),
            coordinator: CoordinatorSettings::default(),
            job_definitions: Vec::new(),
            recurrences: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/idsync/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (IDSYNC_*, nested sections with `__`)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, IdsyncError> {
        let config_dir = project_dirs()
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| IdsyncError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| IdsyncError::Config(e.to_string()))?
            .set_default("timezone", default_timezone())
            .map_err(|e| IdsyncError::Config(e.to_string()))?
            .set_default("heartbeat.tick_ms", default_tick_ms() as i64)
            .map_err(|e| IdsyncError::Config(e.to_string()))?
            .set_default("store.lock_timeout_ms", default_lock_timeout_ms() as i64)
            .map_err(|e| IdsyncError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: IDSYNC_DB_PATH, IDSYNC_HEARTBEAT__TICK_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("IDSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| IdsyncError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| IdsyncError::Config(e.to_string()))?;

        settings.heartbeat.validate().map_err(IdsyncError::Config)?;
        Ok(settings)
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(home) = home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use crate::recurrence::RecurrenceRule;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings.heartbeat.tick_ms, 1000);
        assert_eq!(settings.heartbeat.initial_delay_secs, 10);
        assert_eq!(settings.reconcile.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!settings.coordinator.enforce_deadlines);
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.store.lock_timeout_ms, 5000);
    }

    #[test]
    fn test_load_definitions_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("idsync.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
timezone = "Europe/Paris"

[reconcile]
chunk_size = 50

[[job_definitions]]
id = "import-users"
kind = "IMPORT"
target = "USER"
timeout_secs = 600

[[recurrences]]
id = 1
jobdef_id = "import-users"
kind = "DAILY"
anchor = "2024-01-01T02:00:00"
interval = 1
"#
        )
        .unwrap();

        let settings = Settings::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(settings.timezone, "Europe/Paris");
        assert_eq!(settings.reconcile.chunk_size, 50);
        assert_eq!(settings.job_definitions.len(), 1);
        assert_eq!(settings.job_definitions[0].kind, JobKind::Import);
        assert_eq!(settings.job_definitions[0].timeout_secs, 600);
        assert!(matches!(
            settings.recurrences[0].rule,
            RecurrenceRule::Daily { interval: 1, .. }
        ));
    }

    #[test]
    fn test_heartbeat_validation() {
        let mut heartbeat = HeartbeatSettings::default();
        assert!(heartbeat.validate().is_ok());
        heartbeat.tick_ms = 0;
        assert!(heartbeat.validate().is_err());
    }

    #[test]
    fn test_expanded_db_path_passthrough() {
        let settings = Settings {
            db_path: "/var/lib/idsync".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.expanded_db_path(), PathBuf::from("/var/lib/idsync"));
    }

    #[test]
    fn test_expanded_db_path_uses_platform_home() {
        let settings = Settings {
            db_path: "~/.local/share/idsync/db".to_string(),
            ..Settings::default()
        };
        let expanded = settings.expanded_db_path();
        match BaseDirs::new() {
            Some(dirs) => {
                assert_eq!(expanded, dirs.home_dir().join(".local/share/idsync/db"));
                assert!(!expanded.starts_with("~"));
            }
            None => assert_eq!(expanded, PathBuf::from("~/.local/share/idsync/db")),
        }
    }
}
