//! Command implementations.

pub mod completions;
pub mod init;
pub mod quarantine;
pub mod show;
pub mod status;
pub mod sync;
pub mod version;

use std::path::PathBuf;

use crate::config::resolve_db_path;
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;

/// Resolve the database path and require that it was initialized.
///
/// # Errors
///
/// Returns [`Error::NotInitialized`] if no database exists there yet.
pub fn existing_db_path(db_path: Option<&PathBuf>) -> Result<PathBuf> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path)).ok_or(Error::NotInitialized)?;

    if !db_path.exists() {
        return Err(Error::NotInitialized);
    }
    Ok(db_path)
}

/// Open an initialized database.
///
/// # Errors
///
/// Returns [`Error::NotInitialized`] if the file is missing, or a database
/// error if it cannot be opened.
pub fn open_storage(db_path: Option<&PathBuf>) -> Result<SqliteStorage> {
    let path = existing_db_path(db_path)?;
    SqliteStorage::open(&path)
}
