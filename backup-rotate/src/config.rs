//! Configuration management for the rotation controller.
//!
//! Loads configuration from a TOML file with `BACKUP_ROTATE_*` environment
//! variable overrides (nested keys use `__`, e.g. `BACKUP_ROTATE_LOG__LEVEL`).

use chrono::{Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hooks;
use crate::tier::Tier;
use crate::utils::errors::{Result, RotateError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host identifier used as the archive name prefix
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Archive tool executable
    #[serde(default = "default_store_command")]
    pub command: String,

    /// Repository location; when unset the tool's own environment (BORG_REPO) is used
    #[serde(default)]
    pub repository: Option<String>,

    /// Extra arguments for archive creation (e.g. `--compression lz4`)
    #[serde(default)]
    pub create_options: Vec<String>,

    /// Environment passed to every store invocation, as `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directories to back up, one archive each, in order
    #[serde(default)]
    pub targets: Vec<PathBuf>,

    /// Timestamp archives in local time instead of UTC
    #[serde(default)]
    pub use_local_time: bool,

    /// Working directory for archive creation
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Monthly batches to keep
    #[serde(default = "default_keep_monthly")]
    pub monthly: usize,

    /// Daily batches to keep
    #[serde(default = "default_keep_daily")]
    pub daily: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock directory; the holder's pid is written inside it
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Executable run before the first archive is created
    #[serde(default)]
    pub pre_backup: Option<PathBuf>,

    /// Executable run after the last archive is created
    #[serde(default)]
    pub post_backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

fn default_store_command() -> String {
    "borg".to_string()
}

fn default_source_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_keep_monthly() -> usize {
    12
}

fn default_keep_daily() -> usize {
    31
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/run/backup-rotate.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            command: default_store_command(),
            repository: None,
            create_options: Vec::new(),
            env: Vec::new(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            use_local_time: false,
            source_root: default_source_root(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            monthly: default_keep_monthly(),
            daily: default_keep_daily(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            store: StoreConfig::default(),
            backup: BackupConfig::default(),
            retention: RetentionConfig::default(),
            lock: LockConfig::default(),
            hooks: HooksConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl RetentionConfig {
    /// Batches to keep for `tier`; `None` means the tier is never pruned.
    pub fn keep_for(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Yearly => None,
            Tier::Monthly => Some(self.monthly),
            Tier::Daily => Some(self.daily),
        }
    }
}

impl StoreConfig {
    /// `env` entries split into name and value. Entries without `=` are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }
}

impl BackupConfig {
    /// Current wall-clock time in the configured timezone.
    pub fn now(&self) -> NaiveDateTime {
        if self.use_local_time {
            Local::now().naive_local()
        } else {
            Utc::now().naive_utc()
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BACKUP_ROTATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backup.targets")
                .with_list_parse_key("store.create_options"),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RotateError::Config(e.to_string()))
    }

    /// Parse configuration from TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RotateError::Config(e.to_string()))
    }

    /// Check settings that must hold before the lock is taken.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RotateError::Config(
                "host is empty and could not be detected".into(),
            ));
        }
        if self.host.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
            return Err(RotateError::Config(format!(
                "host '{}' may not contain whitespace, '/' or ':'",
                self.host
            )));
        }
        if self.store.command.trim().is_empty() {
            return Err(RotateError::Config("store.command is empty".into()));
        }
        if let Some(entry) = self
            .store
            .env
            .iter()
            .find(|e| e.split_once('=').map_or(true, |(k, _)| k.is_empty()))
        {
            return Err(RotateError::Config(format!(
                "store.env entry '{entry}' is not KEY=VALUE"
            )));
        }
        if self.backup.targets.is_empty() {
            return Err(RotateError::Config("backup.targets is empty".into()));
        }
        if let Some(target) = self.backup.targets.iter().find(|t| !t.is_absolute()) {
            return Err(RotateError::Config(format!(
                "backup target {} is not an absolute path",
                target.display()
            )));
        }
        if self.retention.monthly == 0 || self.retention.daily == 0 {
            return Err(RotateError::Config(
                "retention counts must be at least 1".into(),
            ));
        }
        for hook in [&self.hooks.pre_backup, &self.hooks.post_backup]
            .into_iter()
            .flatten()
        {
            hooks::ensure_executable(hook)?;
        }
        Ok(())
    }
}
