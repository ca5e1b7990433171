//! Database schema definitions.
//!
//! Target tables mirror source entities one row per external id. Sync
//! bookkeeping (cursors, retry ledger, quarantine) lives beside them, and
//! every committed transition leaves a row in `events`.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema.
///
/// Timestamps are INTEGER Unix milliseconds; calendar dates are
/// `YYYY-MM-DD` TEXT.
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Target Tables
-- ====================

-- Persons: teachers, mirrored from source contacts
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    trn TEXT,
    first_name TEXT NOT NULL,
    middle_name TEXT,
    last_name TEXT NOT NULL,
    date_of_birth TEXT,
    email_address TEXT,
    national_insurance_number TEXT,
    merged_into_external_id TEXT,
    source_state TEXT NOT NULL CHECK (source_state IN ('active', 'inactive', 'merged')),
    source_created_on INTEGER NOT NULL,
    source_modified_on INTEGER NOT NULL,
    first_synced_at INTEGER NOT NULL,
    last_synced_at INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    CHECK (first_synced_at <= last_synced_at)
);

CREATE INDEX IF NOT EXISTS idx_persons_trn ON persons(trn);

-- Inductions: one per source induction record
CREATE TABLE IF NOT EXISTS inductions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    person_external_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_date TEXT,
    completion_date TEXT,
    source_state TEXT NOT NULL CHECK (source_state IN ('active', 'inactive', 'merged')),
    source_created_on INTEGER NOT NULL,
    source_modified_on INTEGER NOT NULL,
    first_synced_at INTEGER NOT NULL,
    last_synced_at INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    CHECK (first_synced_at <= last_synced_at)
);

-- No foreign key: an induction may arrive before its person.
CREATE INDEX IF NOT EXISTS idx_inductions_person ON inductions(person_external_id);

-- ====================
-- Sync Bookkeeping
-- ====================

CREATE TABLE IF NOT EXISTS feed_cursors (
    entity_type TEXT PRIMARY KEY,
    position INTEGER NOT NULL DEFAULT 0 CHECK (position >= 0),
    updated_at INTEGER NOT NULL
);

-- Failed attempts per feed record, kept until the cursor passes it
CREATE TABLE IF NOT EXISTS sync_record_attempts (
    entity_type TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    external_id TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT NOT NULL,
    first_failed_at INTEGER NOT NULL,
    last_failed_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, sequence)
);

CREATE TABLE IF NOT EXISTS sync_quarantine (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    external_id TEXT,
    reason TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    payload TEXT NOT NULL,
    quarantined_at INTEGER NOT NULL,
    resolved_at INTEGER,
    UNIQUE (entity_type, sequence)
);

CREATE INDEX IF NOT EXISTS idx_quarantine_open ON sync_quarantine(resolved_at);

-- ====================
-- Audit Events
-- ====================

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
";

/// Apply the schema to the database.
///
/// Idempotent: every statement uses `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    super::migrations::run_migrations(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "persons",
            "inductions",
            "feed_cursors",
            "sync_record_attempts",
            "sync_quarantine",
            "events",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("First apply failed");
        apply_schema(&conn).expect("Second apply failed");
    }

    #[test]
    fn test_external_id_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let insert = "INSERT INTO persons (external_id, first_name, last_name, source_state,
                      source_created_on, source_modified_on, first_synced_at, last_synced_at, content_hash)
                      VALUES ('C1', 'Ann', 'Smith', 'active', 0, 0, 0, 0, 'h')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_sync_timestamps_are_ordered() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO persons (external_id, first_name, last_name, source_state,
             source_created_on, source_modified_on, first_synced_at, last_synced_at, content_hash)
             VALUES ('C1', 'Ann', 'Smith', 'active', 0, 0, 10, 5, 'h')",
            [],
        );
        assert!(result.is_err());
    }
}
