//! SQLite storage implementation.
//!
//! The row store behind the sync engine. Every write goes through
//! [`SqliteStorage::mutate`], which wraps the change in an IMMEDIATE
//! transaction and commits its audit events alongside it.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{
    EntityType, InductionFields, InductionStatus, MappedFields, PersonFields, SourceState,
    TargetRow,
};
use crate::storage::events::{insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use crate::sync::repository::{RetryLedger, SyncStateRepository};
use crate::sync::types::{FeedCursor, QuarantineEntry, SyncError, SyncResult};

const DEFAULT_ACTOR: &str = "trs-sync";

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    /// Recorded on audit events written through the repository traits.
    actor: String,
}

/// Context for a mutation operation, collecting audit events.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation.
    pub actor: String,
    /// Events to write at the end of the transaction.
    pub events: Vec<Event>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
        }
    }

    /// Record an event for this operation.
    pub fn record_event(&mut self, entity_type: &str, entity_id: &str, event_type: EventType) {
        self.events
            .push(Event::new(entity_type, entity_id, event_type, &self.actor));
    }

    /// Record an event with old/new values for field tracking.
    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor)
                .with_values(old_value, new_value),
        );
    }
}

/// A record that failed and has not yet been passed by the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAttempt {
    pub entity_type: EntityType,
    pub sequence: u64,
    pub external_id: Option<String>,
    pub attempts: u32,
    pub last_error: String,
    pub last_failed_at: DateTime<Utc>,
}

/// A stored feed cursor with its last write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorRecord {
    pub entity_type: EntityType,
    pub position: FeedCursor,
    pub updated_at: DateTime<Utc>,
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(timeout_ms.unwrap_or(5000)))?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Set the actor recorded on audit events written by the sync engine.
    #[must_use]
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Writes audit events
    /// 4. Commits (or rolls back on error)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R, E>(&mut self, op: &str, actor: &str, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> std::result::Result<R, E>,
        E: From<rusqlite::Error>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;

        Ok(result)
    }

    // ==================
    // Target Rows
    // ==================

    /// Number of rows mirrored for an entity type.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_rows(&self, entity_type: EntityType) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity_type.table());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // ==================
    // Cursors
    // ==================

    /// All stored feed cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_cursors(&self) -> Result<Vec<CursorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, position, updated_at FROM feed_cursors ORDER BY entity_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CursorRecord {
                entity_type: parse_column(row, 0)?,
                position: FeedCursor(row.get(1)?),
                updated_at: millis_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ==================
    // Retry Ledger & Quarantine
    // ==================

    /// Records that failed and are still ahead of the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_attempts(&self) -> Result<Vec<PendingAttempt>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, sequence, external_id, attempts, last_error, last_failed_at
             FROM sync_record_attempts ORDER BY entity_type, sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingAttempt {
                entity_type: parse_column(row, 0)?,
                sequence: row.get(1)?,
                external_id: row.get(2)?,
                attempts: row.get(3)?,
                last_error: row.get(4)?,
                last_failed_at: millis_column(row, 5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// List quarantine entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_quarantine(&self, include_resolved: bool) -> Result<Vec<QuarantineEntry>> {
        let sql = format!(
            "SELECT {QUARANTINE_COLUMNS} FROM sync_quarantine {} ORDER BY quarantined_at, id",
            if include_resolved {
                ""
            } else {
                "WHERE resolved_at IS NULL"
            }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_quarantine_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Get a quarantine entry by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_quarantine(&self, id: i64) -> Result<Option<QuarantineEntry>> {
        let sql = format!("SELECT {QUARANTINE_COLUMNS} FROM sync_quarantine WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id], map_quarantine_row)
            .optional()?)
    }

    /// Number of unresolved quarantine entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_open_quarantine(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_quarantine WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Mark a quarantine entry resolved.
    ///
    /// Returns `false` if it was already resolved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuarantineNotFound`] if no entry has this id.
    pub fn resolve_quarantine(&mut self, id: i64, comment: Option<&str>, actor: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();

        self.mutate("resolve_quarantine", actor, |tx, ctx| {
            let entry: Option<(String, Option<String>, u64, Option<i64>)> = tx
                .query_row(
                    "SELECT entity_type, external_id, sequence, resolved_at FROM sync_quarantine WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((entity_type, external_id, sequence, resolved_at)) = entry else {
                return Err(Error::QuarantineNotFound { id });
            };
            if resolved_at.is_some() {
                return Ok(false);
            }

            tx.execute(
                "UPDATE sync_quarantine SET resolved_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;

            let entity_id = external_id.unwrap_or_else(|| format!("sequence:{sequence}"));
            let mut event = Event::new(&entity_type, &entity_id, EventType::QuarantineResolved, &ctx.actor)
                .with_values(None, Some(id.to_string()));
            if let Some(comment) = comment {
                event = event.with_comment(comment);
            }
            ctx.events.push(event);
            Ok(true)
        })
    }

    /// Audit events recorded for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_for(&self, entity_type: EntityType, external_id: &str, limit: Option<u32>) -> Result<Vec<Event>> {
        Ok(crate::storage::events::get_events(
            &self.conn,
            entity_type.as_str(),
            external_id,
            limit,
        )?)
    }
}

// ==================
// Repository
// ==================

impl SyncStateRepository for SqliteStorage {
    fn get_by_external_id(
        &self,
        entity_type: EntityType,
        external_id: &str,
    ) -> SyncResult<Option<TargetRow>> {
        let row = match entity_type {
            EntityType::Contact => self
                .conn
                .query_row(
                    &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE external_id = ?1"),
                    [external_id],
                    map_person_row,
                )
                .optional()?,
            EntityType::Induction => self
                .conn
                .query_row(
                    &format!("SELECT {INDUCTION_COLUMNS} FROM inductions WHERE external_id = ?1"),
                    [external_id],
                    map_induction_row,
                )
                .optional()?,
        };
        Ok(row)
    }

    fn upsert(&mut self, row: &TargetRow) -> SyncResult<()> {
        let actor = self.actor.clone();
        let entity_type = row.entity_type();
        let classify = |e: rusqlite::Error| constraint_or_database(e, entity_type, &row.external_id);

        match row.id {
            None => self.mutate("sync_insert", &actor, |tx, ctx| {
                insert_row(tx, row).map_err(classify)?;
                ctx.record_change(
                    entity_type.as_str(),
                    &row.external_id,
                    EventType::SyncCreated,
                    None,
                    Some(row.content_hash.clone()),
                );
                Ok(())
            }),
            Some(id) => self.mutate("sync_update", &actor, |tx, ctx| {
                let previous_hash: Option<String> = tx
                    .query_row(
                        &format!(
                            "SELECT content_hash FROM {} WHERE id = ?1 AND external_id = ?2",
                            entity_type.table()
                        ),
                        rusqlite::params![id, row.external_id],
                        |r| r.get(0),
                    )
                    .optional()?;

                let changed = update_row(tx, id, row).map_err(classify)?;
                if previous_hash.is_none() || changed == 0 {
                    return Err(SyncError::ConstraintViolation {
                        entity_type,
                        external_id: row.external_id.clone(),
                        message: format!("row {id} no longer exists"),
                    });
                }

                ctx.record_change(
                    entity_type.as_str(),
                    &row.external_id,
                    EventType::SyncUpdated,
                    previous_hash,
                    Some(row.content_hash.clone()),
                );
                Ok(())
            }),
        }
    }

    fn delete(&mut self, entity_type: EntityType, external_id: &str) -> SyncResult<bool> {
        let actor = self.actor.clone();
        self.mutate("sync_delete", &actor, |tx, ctx| {
            let hash: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT content_hash FROM {} WHERE external_id = ?1",
                        entity_type.table()
                    ),
                    [external_id],
                    |r| r.get(0),
                )
                .optional()?;
            let deleted = tx.execute(
                &format!("DELETE FROM {} WHERE external_id = ?1", entity_type.table()),
                [external_id],
            )?;

            if deleted > 0 {
                ctx.record_change(
                    entity_type.as_str(),
                    external_id,
                    EventType::SyncDeleted,
                    hash,
                    None,
                );
            }
            Ok(deleted > 0)
        })
    }
}

impl RetryLedger for SqliteStorage {
    fn record_failure(
        &mut self,
        entity_type: EntityType,
        sequence: u64,
        external_id: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<u32> {
        let actor = self.actor.clone();
        self.mutate("record_failure", &actor, |tx, _ctx| {
            tx.execute(
                "INSERT INTO sync_record_attempts
                    (entity_type, sequence, external_id, attempts, last_error, first_failed_at, last_failed_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
                 ON CONFLICT(entity_type, sequence) DO UPDATE SET
                    attempts = attempts + 1,
                    last_error = excluded.last_error,
                    last_failed_at = excluded.last_failed_at",
                rusqlite::params![
                    entity_type.as_str(),
                    sequence,
                    external_id,
                    error,
                    now.timestamp_millis()
                ],
            )?;
            let attempts: u32 = tx.query_row(
                "SELECT attempts FROM sync_record_attempts WHERE entity_type = ?1 AND sequence = ?2",
                rusqlite::params![entity_type.as_str(), sequence],
                |row| row.get(0),
            )?;
            Ok(attempts)
        })
    }

    fn quarantine(
        &mut self,
        entity_type: EntityType,
        sequence: u64,
        external_id: Option<&str>,
        reason: &str,
        attempts: u32,
        payload: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<i64> {
        let actor = self.actor.clone();
        self.mutate("quarantine", &actor, |tx, ctx| {
            tx.execute(
                "INSERT INTO sync_quarantine
                    (entity_type, sequence, external_id, reason, attempts, payload, quarantined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(entity_type, sequence) DO UPDATE SET
                    external_id = excluded.external_id,
                    reason = excluded.reason,
                    attempts = excluded.attempts,
                    payload = excluded.payload,
                    quarantined_at = excluded.quarantined_at,
                    resolved_at = NULL",
                rusqlite::params![
                    entity_type.as_str(),
                    sequence,
                    external_id,
                    reason,
                    attempts,
                    payload,
                    now.timestamp_millis()
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM sync_quarantine WHERE entity_type = ?1 AND sequence = ?2",
                rusqlite::params![entity_type.as_str(), sequence],
                |row| row.get(0),
            )?;
            tx.execute(
                "DELETE FROM sync_record_attempts WHERE entity_type = ?1 AND sequence = ?2",
                rusqlite::params![entity_type.as_str(), sequence],
            )?;

            let entity_id = external_id.map_or_else(|| format!("sequence:{sequence}"), str::to_string);
            ctx.events.push(
                Event::new(entity_type.as_str(), &entity_id, EventType::SyncQuarantined, &ctx.actor)
                    .with_values(None, Some(id.to_string()))
                    .with_comment(reason),
            );
            Ok(id)
        })
    }

    fn clear_attempts_through(
        &mut self,
        entity_type: EntityType,
        cursor: FeedCursor,
    ) -> SyncResult<()> {
        self.conn.execute(
            "DELETE FROM sync_record_attempts WHERE entity_type = ?1 AND sequence <= ?2",
            rusqlite::params![entity_type.as_str(), cursor.position()],
        )?;
        Ok(())
    }
}

// ==================
// Row Mapping
// ==================

const PERSON_COLUMNS: &str = "id, external_id, trn, first_name, middle_name, last_name, \
    date_of_birth, email_address, national_insurance_number, merged_into_external_id, \
    source_state, source_created_on, source_modified_on, first_synced_at, last_synced_at, content_hash";

const INDUCTION_COLUMNS: &str = "id, external_id, person_external_id, status, start_date, \
    completion_date, source_state, source_created_on, source_modified_on, first_synced_at, \
    last_synced_at, content_hash";

const QUARANTINE_COLUMNS: &str =
    "id, entity_type, sequence, external_id, reason, attempts, payload, quarantined_at, resolved_at";

fn insert_row(tx: &Transaction, row: &TargetRow) -> rusqlite::Result<()> {
    match &row.fields {
        MappedFields::Person(p) => tx.execute(
            "INSERT INTO persons (external_id, trn, first_name, middle_name, last_name,
                date_of_birth, email_address, national_insurance_number, merged_into_external_id,
                source_state, source_created_on, source_modified_on, first_synced_at, last_synced_at, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                row.external_id,
                p.trn,
                p.first_name,
                p.middle_name,
                p.last_name,
                p.date_of_birth.map(date_to_sql),
                p.email_address,
                p.national_insurance_number,
                p.merged_into_external_id,
                row.source_state.as_str(),
                row.source_created_on.timestamp_millis(),
                row.source_modified_on.timestamp_millis(),
                row.first_synced_at.timestamp_millis(),
                row.last_synced_at.timestamp_millis(),
                row.content_hash,
            ],
        ),
        MappedFields::Induction(i) => tx.execute(
            "INSERT INTO inductions (external_id, person_external_id, status, start_date, completion_date,
                source_state, source_created_on, source_modified_on, first_synced_at, last_synced_at, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                row.external_id,
                i.person_external_id,
                i.status.as_str(),
                i.start_date.map(date_to_sql),
                i.completion_date.map(date_to_sql),
                row.source_state.as_str(),
                row.source_created_on.timestamp_millis(),
                row.source_modified_on.timestamp_millis(),
                row.first_synced_at.timestamp_millis(),
                row.last_synced_at.timestamp_millis(),
                row.content_hash,
            ],
        ),
    }?;
    Ok(())
}

/// Full-row overwrite. `first_synced_at` is never touched.
fn update_row(tx: &Transaction, id: i64, row: &TargetRow) -> rusqlite::Result<usize> {
    match &row.fields {
        MappedFields::Person(p) => tx.execute(
            "UPDATE persons SET trn = ?3, first_name = ?4, middle_name = ?5, last_name = ?6,
                date_of_birth = ?7, email_address = ?8, national_insurance_number = ?9,
                merged_into_external_id = ?10, source_state = ?11, source_created_on = ?12,
                source_modified_on = ?13, last_synced_at = ?14, content_hash = ?15
             WHERE id = ?1 AND external_id = ?2",
            rusqlite::params![
                id,
                row.external_id,
                p.trn,
                p.first_name,
                p.middle_name,
                p.last_name,
                p.date_of_birth.map(date_to_sql),
                p.email_address,
                p.national_insurance_number,
                p.merged_into_external_id,
                row.source_state.as_str(),
                row.source_created_on.timestamp_millis(),
                row.source_modified_on.timestamp_millis(),
                row.last_synced_at.timestamp_millis(),
                row.content_hash,
            ],
        ),
        MappedFields::Induction(i) => tx.execute(
            "UPDATE inductions SET person_external_id = ?3, status = ?4, start_date = ?5,
                completion_date = ?6, source_state = ?7, source_created_on = ?8,
                source_modified_on = ?9, last_synced_at = ?10, content_hash = ?11
             WHERE id = ?1 AND external_id = ?2",
            rusqlite::params![
                id,
                row.external_id,
                i.person_external_id,
                i.status.as_str(),
                i.start_date.map(date_to_sql),
                i.completion_date.map(date_to_sql),
                row.source_state.as_str(),
                row.source_created_on.timestamp_millis(),
                row.source_modified_on.timestamp_millis(),
                row.last_synced_at.timestamp_millis(),
                row.content_hash,
            ],
        ),
    }
}

fn map_person_row(row: &rusqlite::Row) -> rusqlite::Result<TargetRow> {
    let fields = MappedFields::Person(PersonFields {
        trn: row.get(2)?,
        first_name: row.get(3)?,
        middle_name: row.get(4)?,
        last_name: row.get(5)?,
        date_of_birth: date_column(row, 6)?,
        email_address: row.get(7)?,
        national_insurance_number: row.get(8)?,
        merged_into_external_id: row.get(9)?,
    });
    map_target_row(row, fields, 10)
}

fn map_induction_row(row: &rusqlite::Row) -> rusqlite::Result<TargetRow> {
    let fields = MappedFields::Induction(InductionFields {
        person_external_id: row.get(2)?,
        status: parse_column::<InductionStatus>(row, 3)?,
        start_date: date_column(row, 4)?,
        completion_date: date_column(row, 5)?,
    });
    map_target_row(row, fields, 6)
}

/// Shared tail: id, external id, and the six sync columns from `sync_start`.
fn map_target_row(
    row: &rusqlite::Row,
    fields: MappedFields,
    sync_start: usize,
) -> rusqlite::Result<TargetRow> {
    Ok(TargetRow {
        id: row.get(0)?,
        external_id: row.get(1)?,
        fields,
        source_state: parse_column::<SourceState>(row, sync_start)?,
        source_created_on: millis_column(row, sync_start + 1)?,
        source_modified_on: millis_column(row, sync_start + 2)?,
        first_synced_at: millis_column(row, sync_start + 3)?,
        last_synced_at: millis_column(row, sync_start + 4)?,
        content_hash: row.get(sync_start + 5)?,
    })
}

fn map_quarantine_row(row: &rusqlite::Row) -> rusqlite::Result<QuarantineEntry> {
    let resolved_at: Option<i64> = row.get(8)?;
    Ok(QuarantineEntry {
        id: row.get(0)?,
        entity_type: parse_column(row, 1)?,
        sequence: row.get(2)?,
        external_id: row.get(3)?,
        reason: row.get(4)?,
        attempts: row.get(5)?,
        payload: row.get(6)?,
        quarantined_at: millis_column(row, 7)?,
        resolved_at: resolved_at
            .map(|ms| millis_to_utc(8, ms))
            .transpose()?,
    })
}

fn parse_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn millis_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    millis_to_utc(idx, row.get(idx)?)
}

fn millis_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn date_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Constraint failures signal a race with another writer.
fn constraint_or_database(err: rusqlite::Error, entity_type: EntityType, external_id: &str) -> SyncError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SyncError::ConstraintViolation {
                entity_type,
                external_id: external_id.to_string(),
                message: message.clone().unwrap_or_else(|| err.to_string()),
            }
        }
        _ => SyncError::from(err),
    }
}
