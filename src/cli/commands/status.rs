//! Status command implementation.

use crate::error::Result;
use crate::sync::{get_sync_status, print_status};
use std::path::PathBuf;

use super::open_storage;

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the database is missing or cannot be queried.
pub fn execute(db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let status = get_sync_status(&storage)?;

    if json {
        println!("{}", serde_json::to_string(&status)?);
    } else {
        print_status(&status);
    }

    Ok(())
}
