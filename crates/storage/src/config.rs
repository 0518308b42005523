use std::path::PathBuf;

use serde::Deserialize;

use crate::error::StorageError;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETAIN_BACKUPS: usize = 5;

/// Store and migration settings.
///
/// `database_path` of `None` opens an in-memory database; backups are
/// unavailable in that mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Upper bound on write-lock wait, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts after the first for transient contention.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_retain_backups")]
    pub retain_backups: usize,
    /// Back up before every migration, flagged or not.
    #[serde(default)]
    pub force_backup: bool,
    #[serde(default)]
    pub checkpoint_after_mutation: bool,
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retain_backups() -> usize {
    DEFAULT_RETAIN_BACKUPS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backup_dir: None,
            retain_backups: DEFAULT_RETAIN_BACKUPS,
            force_backup: false,
            checkpoint_after_mutation: false,
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, StorageError> {
        let config: StoreConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.retain_backups == 0 {
            return Err(StorageError::InvalidArgument(
                "retainBackups must be greater than zero".into(),
            ));
        }
        if let Some(path) = &self.database_path
            && path.as_os_str().is_empty()
        {
            return Err(StorageError::InvalidArgument("databasePath must not be empty".into()));
        }
        Ok(())
    }
}
