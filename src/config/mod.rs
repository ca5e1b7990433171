//! Configuration management.
//!
//! This module resolves where the records store and the change feed live,
//! and loads the sync policy.
//!
//! # Layout
//!
//! - **Database**: `~/.trs-sync/data/trs-sync.db`
//! - **Feed**: `~/.trs-sync/feed/<entity_type>.jsonl`
//! - **Settings**: `~/.trs-sync/config.json`
//!
//! Every location can be overridden by a CLI flag or a `TRS_SYNC_*`
//! environment variable.

mod settings;

pub use settings::{RetrySettings, SyncSettings, load_settings};

use std::path::{Path, PathBuf};

/// Get the global trs-sync directory location (`~/.trs-sync/`).
#[must_use]
pub fn global_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".trs-sync"))
}

/// Read a non-blank environment variable.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `TRS_SYNC_DB` environment variable
/// 3. Global location: `~/.trs-sync/data/trs-sync.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Some(db_path) = env_value("TRS_SYNC_DB") {
        return Some(PathBuf::from(db_path));
    }

    global_dir().map(|dir| dir.join("data").join("trs-sync.db"))
}

/// Resolve the feed directory.
///
/// Priority: `explicit_dir`, then `TRS_SYNC_FEED_DIR`, then `~/.trs-sync/feed`.
#[must_use]
pub fn resolve_feed_dir(explicit_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = explicit_dir {
        return Some(dir.to_path_buf());
    }

    if let Some(dir) = env_value("TRS_SYNC_FEED_DIR") {
        return Some(PathBuf::from(dir));
    }

    global_dir().map(|dir| dir.join("feed"))
}

/// Get the default actor name recorded on audit events.
///
/// Priority:
/// 1. `TRS_SYNC_ACTOR` environment variable
/// 2. System username
/// 3. "trs-sync"
#[must_use]
pub fn default_actor() -> String {
    env_value("TRS_SYNC_ACTOR")
        .or_else(|| env_value("USER"))
        .unwrap_or_else(|| "trs-sync".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_actor() {
        let actor = default_actor();
        assert!(!actor.is_empty());
    }

    #[test]
    fn test_resolve_db_path_with_explicit() {
        let explicit = PathBuf::from("/custom/path/db.sqlite");
        let result = resolve_db_path(Some(&explicit));
        assert_eq!(result, Some(explicit));
    }

    #[test]
    fn test_resolve_feed_dir_with_explicit() {
        let explicit = PathBuf::from("/var/feed");
        assert_eq!(resolve_feed_dir(Some(&explicit)), Some(explicit));
    }

    #[test]
    fn test_global_dir_is_hidden_home_dir() {
        let dir = global_dir().unwrap();
        assert!(dir.ends_with(".trs-sync"));
    }
}
