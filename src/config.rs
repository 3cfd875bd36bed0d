//! Storage configuration.
//!
//! `StorageConfig` controls how documents are backed up and where temporary
//! plaintext copies of encrypted documents live. It provides sensible defaults
//! via [`Default`] and a fluent [`StorageConfig::builder()`] with validation.
//!
//! # Examples
//!
//! ## Use defaults
//! ```rust
//! use ct_storage::config::StorageConfig;
//! let cfg = StorageConfig::default();
//! assert_eq!(cfg.backup_num, 3);
//! ```
//!
//! ## Customize with the builder
//! ```rust
//! use ct_storage::config::StorageConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = StorageConfig::builder()
//!     .backup_num(5)
//!     .custom_backup_dir("/var/backups/notes")
//!     .build()?; // returns Result<StorageConfig, StorageConfigError>
//! # Ok(()) }
//! ```
//!
//! # Fields (summary)
//! - `backup_copy`: Keep tilde backups (`doc.ctb~`, `doc.ctb~~`, ...) on save (default: true).
//! - `backup_num`: Number of backup generations to retain (default: 3).
//! - `custom_backup_dir_on`: Store single-file backups in `custom_backup_dir` instead of
//!   next to the document.
//! - `custom_backup_dir`: Root of the custom backup tree.
//! - `tmp_dir`: Parent directory for extracted plaintext copies of encrypted documents.
//!   Defaults to the system temp directory.
//! - `queue_depth`: Capacity of the background backup queue (default: 9). Saves block
//!   when the queue is full.
//! - `log_level`: Level used by [`crate::logging::init_logging`].
//!
//! # Errors
//!
//! Builder validation can return [`StorageConfigError`] if values are invalid
//! (e.g. `backup_num == 0` with backups enabled, a custom backup dir switched on
//! without a path, or `queue_depth == 0`).

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default capacity of the background backup queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backup_copy: bool,
    pub backup_num: usize,
    pub custom_backup_dir_on: bool,
    pub custom_backup_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub queue_depth: usize,
    pub log_level: LogLevel,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_copy: true,
            backup_num: 3,
            custom_backup_dir_on: false,
            custom_backup_dir: None,
            tmp_dir: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            log_level: LogLevel::Warn,
        }
    }
}

impl StorageConfig {
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }

    /// Whether a save should produce a backup generation at all.
    pub fn wants_backup(&self) -> bool {
        self.backup_copy && self.backup_num > 0
    }

    /// The custom backup root, if it is switched on and configured.
    pub fn effective_backup_dir(&self) -> Option<&Path> {
        if self.custom_backup_dir_on {
            self.custom_backup_dir.as_deref()
        } else {
            None
        }
    }

    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: StorageConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Writes the config as pretty-printed JSON.
    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}

/// Builder for [`StorageConfig`].
#[derive(Debug, Clone, Default)]
pub struct StorageConfigBuilder {
    inner: StorageConfig,
}

impl StorageConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut StorageConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn backup_copy(self, on: bool) -> Self { self.map(|c| c.backup_copy = on) }
    pub fn backup_num(self, n: usize) -> Self { self.map(|c| c.backup_num = n) }
    pub fn custom_backup_dir<P: Into<PathBuf>>(self, dir: P) -> Self {
        self.map(|c| {
            c.custom_backup_dir_on = true;
            c.custom_backup_dir = Some(dir.into());
        })
    }
    pub fn custom_backup_dir_on(self, on: bool) -> Self { self.map(|c| c.custom_backup_dir_on = on) }
    pub fn tmp_dir<P: Into<PathBuf>>(self, dir: P) -> Self { self.map(|c| c.tmp_dir = Some(dir.into())) }
    pub fn queue_depth(self, n: usize) -> Self { self.map(|c| c.queue_depth = n) }
    pub fn log_level(self, level: LogLevel) -> Self { self.map(|c| c.log_level = level) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut StorageConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<StorageConfig, StorageConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfigError {
    ZeroBackups,
    MissingBackupDir,
    ZeroQueueDepth,
}

impl fmt::Display for StorageConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfigError::ZeroBackups =>
                write!(f, "backup_num must be at least 1 when backup_copy is enabled"),
            StorageConfigError::MissingBackupDir =>
                write!(f, "custom_backup_dir_on is set but no custom_backup_dir is configured"),
            StorageConfigError::ZeroQueueDepth =>
                write!(f, "queue_depth must be at least 1"),
        }
    }
}
impl std::error::Error for StorageConfigError {}

fn validate(c: &StorageConfig) -> Result<(), StorageConfigError> {
    if c.backup_copy && c.backup_num == 0 {
        return Err(StorageConfigError::ZeroBackups);
    }
    if c.custom_backup_dir_on && c.custom_backup_dir.is_none() {
        return Err(StorageConfigError::MissingBackupDir);
    }
    if c.queue_depth == 0 {
        return Err(StorageConfigError::ZeroQueueDepth);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let cfg = StorageConfig::default();
        assert!(validate(&cfg).is_ok());
        assert!(cfg.wants_backup());
        assert_eq!(cfg.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert!(cfg.effective_backup_dir().is_none());
    }

    #[test]
    fn builder_rejects_invalid_values() {
        let err = StorageConfig::builder().backup_num(0).build().unwrap_err();
        assert_eq!(err, StorageConfigError::ZeroBackups);

        let err = StorageConfig::builder().custom_backup_dir_on(true).build().unwrap_err();
        assert_eq!(err, StorageConfigError::MissingBackupDir);

        let err = StorageConfig::builder().queue_depth(0).build().unwrap_err();
        assert_eq!(err, StorageConfigError::ZeroQueueDepth);

        // zero backups is fine when backups are off
        assert!(StorageConfig::builder().backup_copy(false).backup_num(0).build().is_ok());
    }

    #[test]
    fn custom_backup_dir_switches_on() {
        let cfg = StorageConfig::builder().custom_backup_dir("/tmp/bk").build().unwrap();
        assert_eq!(cfg.effective_backup_dir(), Some(Path::new("/tmp/bk")));
    }

    #[test]
    fn json_round_trip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{ "backup_num": 7 }"#).unwrap();

        let cfg = StorageConfig::load_json(&path).unwrap();
        assert_eq!(cfg.backup_num, 7);
        assert!(cfg.backup_copy);

        cfg.save_json(&path).unwrap();
        assert_eq!(StorageConfig::load_json(&path).unwrap(), cfg);
    }
}
