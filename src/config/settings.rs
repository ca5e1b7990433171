//! Sync policy settings.
//!
//! Loaded from `~/.trs-sync/config.json` (or an explicit path). Missing
//! keys take their defaults, and a missing file means all defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::types::{RetryPolicy, SyncOptions};

/// Retry section of the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub attempts_per_run: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempts_per_run: 3,
            base_delay_ms: 250,
            max_delay_ms: 5000,
        }
    }
}

/// Sync policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub max_invalid_per_batch: Option<usize>,
    pub abort_on_mapping_error: bool,
    pub poll_interval_secs: u64,
    pub retry: RetrySettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_invalid_per_batch: Some(25),
            abort_on_mapping_error: false,
            poll_interval_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

impl SyncSettings {
    /// Apply `TRS_SYNC_BATCH_SIZE` and `TRS_SYNC_MAX_ATTEMPTS` from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is not a positive integer.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TRS_SYNC_BATCH_SIZE") {
            self.batch_size = parse_positive("TRS_SYNC_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TRS_SYNC_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_positive("TRS_SYNC_MAX_ATTEMPTS", &raw)?;
        }
        Ok(())
    }

    /// Reject values the runner cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 || self.retry.attempts_per_run == 0 {
            return Err(Error::Config(
                "retry.max_attempts and retry.attempts_per_run must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Runner options for a normal incremental run.
    #[must_use]
    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size,
            ignore_invalid: false,
            max_invalid_per_batch: self.max_invalid_per_batch,
            abort_on_mapping_error: self.abort_on_mapping_error,
            dry_run: false,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                attempts_per_run: self.retry.attempts_per_run,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
        }
    }
}

fn parse_positive<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Ok(value),
        _ => Err(Error::Config(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

/// Get the default settings file path.
fn default_settings_path() -> Result<PathBuf> {
    super::global_dir()
        .map(|dir| dir.join("config.json"))
        .ok_or(Error::Config("Could not determine home directory".into()))
}

/// Load settings, then apply environment overrides and validate.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be read or parsed, or a
/// value is out of range.
pub fn load_settings(explicit_path: Option<&Path>) -> Result<SyncSettings> {
    let path = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => default_settings_path()?,
    };

    let mut settings = if path.exists() {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))?
    } else if explicit_path.is_some() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    } else {
        SyncSettings::default()
    };

    settings.apply_overrides(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}
