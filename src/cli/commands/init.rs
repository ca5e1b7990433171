//! Initialize the records store.
//!
//! Creates `~/.trs-sync/data/trs-sync.db` (or the `--db` path), applies the
//! schema and migrations, and makes sure the feed directory exists.

use crate::config::{resolve_db_path, resolve_feed_dir};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    feed_dir: PathBuf,
    reinitialized: bool,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns [`Error::AlreadyInitialized`] if the database exists and
/// `force` is not set, or an error if the directory or database cannot
/// be created.
pub fn execute(
    db_path: Option<&PathBuf>,
    feed_dir: Option<&PathBuf>,
    force: bool,
    json: bool,
) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("Could not determine database location".to_string()))?;
    let feed_dir = resolve_feed_dir(feed_dir.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("Could not determine feed directory".to_string()))?;

    let existed = db_path.exists();
    init_database(&db_path, force)?;
    fs::create_dir_all(&feed_dir)?;

    if json {
        let output = InitOutput {
            database: db_path,
            feed_dir,
            reinitialized: existed,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        if existed {
            println!("Reapplied schema to existing database");
        } else {
            println!("Initialized trs-sync database");
        }
        println!("  Database: {}", db_path.display());
        println!("  Feed:     {}", feed_dir.display());
        println!();
        println!("Next: run 'trs-sync run' to drain the feed.");
    }

    Ok(())
}

/// Create the database and apply the schema.
///
/// Reopening an existing database with `force` only reapplies the
/// idempotent schema and pending migrations; rows are kept.
fn init_database(db_path: &Path, force: bool) -> Result<()> {
    if db_path.exists() && !force {
        return Err(Error::AlreadyInitialized {
            path: db_path.to_path_buf(),
        });
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    SqliteStorage::open(db_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_database_with_schema() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("trs.db");

        init_database(&db_path, false).unwrap();

        assert!(db_path.exists());
        let storage = SqliteStorage::open(&db_path).unwrap();
        assert_eq!(storage.count_rows(EntityType::Contact).unwrap(), 0);
    }

    #[test]
    fn test_init_fails_if_already_initialized() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("trs.db");

        init_database(&db_path, false).unwrap();
        let result = init_database(&db_path, false);
        assert!(matches!(result, Err(Error::AlreadyInitialized { .. })));
    }

    #[test]
    fn test_init_force_keeps_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("trs.db");

        init_database(&db_path, false).unwrap();
        assert!(init_database(&db_path, true).is_ok());
    }
}
