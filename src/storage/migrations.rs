//! Schema upgrades for databases created by older releases.
//!
//! Each upgrade is a SQL file under `/migrations/`, compiled in with
//! `include_str!`. Applied names are recorded in `schema_migrations`.

use std::collections::HashSet;

use rusqlite::{Connection, Result};
use tracing::{info, warn};

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Ordered by file name; never reorder or rename an entry once released.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_add_person_merge_reference",
        sql: include_str!("../../migrations/001_add_person_merge_reference.sql"),
    },
    Migration {
        name: "002_index_retry_ledger",
        sql: include_str!("../../migrations/002_index_retry_ledger.sql"),
    },
];

fn applied_names(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<HashSet<String>>>()?;
    Ok(names)
}

/// Apply every migration not yet recorded.
///
/// A fresh database already has the columns the older upgrades add, so a
/// `duplicate column name` failure marks the migration done instead of
/// aborting.
///
/// # Errors
///
/// Returns the first SQL error other than a duplicate column.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let done = applied_names(conn)?;
    let pending = MIGRATIONS.iter().filter(|m| !done.contains(m.name));

    for migration in pending {
        match conn.execute_batch(migration.sql) {
            Ok(()) => info!(migration = migration.name, "Applied migration"),
            Err(e) if e.to_string().contains("duplicate column name") => {
                warn!(migration = migration.name, "Columns already present, recording as applied");
            }
            Err(e) => return Err(e),
        }

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.name, chrono::Utc::now().timestamp_millis()],
        )?;
    }

    Ok(())
}
