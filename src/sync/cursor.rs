//! Feed cursor stores.
//!
//! The cursor for an entity type is the sequence number of the last feed
//! entry that reached a terminal outcome. Advancing is a compare-and-swap:
//! the caller states the position it loaded, and a store that has moved on
//! since then reports [`SyncError::CursorAdvanceConflict`].
//!
//! In-process workers additionally serialize on [`CursorLocks`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::model::EntityType;
use crate::storage::events::{insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use crate::sync::types::{FeedCursor, SyncError, SyncResult};

/// Durable per entity type watermark.
pub trait CursorStore {
    /// Current cursor, or [`FeedCursor::START`] if none was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor>;

    /// Move the cursor from `expected` to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CursorAdvanceConflict`] if the stored cursor is
    /// no longer `expected`.
    fn advance_cursor(
        &self,
        entity_type: EntityType,
        expected: FeedCursor,
        next: FeedCursor,
    ) -> SyncResult<()>;

    /// Rewind to the start of the feed. Returns the previous cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn reset_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor>;
}

/// One lock per entity type, held by a worker for the length of a batch.
#[derive(Debug, Default)]
pub struct CursorLocks {
    contact: Mutex<()>,
    induction: Mutex<()>,
}

impl CursorLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until this worker owns the cursor for `entity_type`.
    pub fn lock(&self, entity_type: EntityType) -> MutexGuard<'_, ()> {
        let lock = match entity_type {
            EntityType::Contact => &self.contact,
            EntityType::Induction => &self.induction,
        };
        lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cursor store for tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<EntityType, FeedCursor>>,
}

impl MemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a cursor without any check, as another worker would.
    pub fn set(&self, entity_type: EntityType, cursor: FeedCursor) {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type, cursor);
    }
}

impl CursorStore for MemoryCursorStore {
    fn load_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
        let cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cursors.get(&entity_type).copied().unwrap_or_default())
    }

    fn advance_cursor(
        &self,
        entity_type: EntityType,
        expected: FeedCursor,
        next: FeedCursor,
    ) -> SyncResult<()> {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let actual = cursors.get(&entity_type).copied().unwrap_or_default();
        if actual != expected {
            return Err(SyncError::CursorAdvanceConflict {
                entity_type,
                expected,
                actual,
            });
        }
        cursors.insert(entity_type, next);
        Ok(())
    }

    fn reset_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cursors.remove(&entity_type).unwrap_or_default())
    }
}

/// Cursor store in the `feed_cursors` table.
///
/// Owns a connection separate from the row store so cursor writes never
/// share a transaction with row writes.
#[derive(Debug)]
pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
    actor: String,
}

impl SqliteCursorStore {
    /// Open the cursor store in an existing or new database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema cannot be applied.
    pub fn open(path: &Path, actor: &str) -> SyncResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            actor: actor.to_string(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_position(conn: &Connection, entity_type: EntityType) -> rusqlite::Result<FeedCursor> {
    let position: Option<i64> = conn
        .query_row(
            "SELECT position FROM feed_cursors WHERE entity_type = ?1",
            [entity_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(FeedCursor(position.map_or(0, |p| u64::try_from(p).unwrap_or(0))))
}

fn write_position(
    conn: &Connection,
    entity_type: EntityType,
    cursor: FeedCursor,
) -> SyncResult<()> {
    let position = i64::try_from(cursor.position())
        .map_err(|_| SyncError::Feed(format!("cursor out of range: {cursor}")))?;
    conn.execute(
        "INSERT INTO feed_cursors (entity_type, position, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(entity_type) DO UPDATE SET position = excluded.position, updated_at = excluded.updated_at",
        rusqlite::params![
            entity_type.as_str(),
            position,
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

impl CursorStore for SqliteCursorStore {
    fn load_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
        Ok(read_position(&self.conn(), entity_type)?)
    }

    fn advance_cursor(
        &self,
        entity_type: EntityType,
        expected: FeedCursor,
        next: FeedCursor,
    ) -> SyncResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let actual = read_position(&tx, entity_type)?;
        if actual != expected {
            return Err(SyncError::CursorAdvanceConflict {
                entity_type,
                expected,
                actual,
            });
        }
        write_position(&tx, entity_type, next)?;

        tx.commit()?;
        Ok(())
    }

    fn reset_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = read_position(&tx, entity_type)?;
        write_position(&tx, entity_type, FeedCursor::START)?;
        insert_event(
            &tx,
            &Event::new(
                "feed_cursor",
                entity_type.as_str(),
                EventType::CursorReset,
                &self.actor,
            )
            .with_values(Some(previous.to_string()), Some(FeedCursor::START.to_string())),
        )?;

        tx.commit()?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_cursor_compare_and_swap() {
        let store = MemoryCursorStore::new();
        assert_eq!(store.load_cursor(EntityType::Contact).unwrap(), FeedCursor::START);

        store
            .advance_cursor(EntityType::Contact, FeedCursor(0), FeedCursor(5))
            .unwrap();
        assert_eq!(store.load_cursor(EntityType::Contact).unwrap(), FeedCursor(5));

        let err = store
            .advance_cursor(EntityType::Contact, FeedCursor(0), FeedCursor(9))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::CursorAdvanceConflict {
                actual: FeedCursor(5),
                ..
            }
        ));
        assert_eq!(store.load_cursor(EntityType::Induction).unwrap(), FeedCursor::START);
    }

    #[test]
    fn test_sqlite_cursor_persists_across_connections() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cursors.db");

        let store = SqliteCursorStore::open(&db_path, "test").unwrap();
        store
            .advance_cursor(EntityType::Induction, FeedCursor(0), FeedCursor(12))
            .unwrap();
        drop(store);

        let reopened = SqliteCursorStore::open(&db_path, "test").unwrap();
        assert_eq!(
            reopened.load_cursor(EntityType::Induction).unwrap(),
            FeedCursor(12)
        );
    }

    #[test]
    fn test_sqlite_cursor_detects_concurrent_advance() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cursors.db");
        let worker_a = SqliteCursorStore::open(&db_path, "a").unwrap();
        let worker_b = SqliteCursorStore::open(&db_path, "b").unwrap();

        let loaded = worker_a.load_cursor(EntityType::Contact).unwrap();
        worker_b
            .advance_cursor(EntityType::Contact, loaded, FeedCursor(3))
            .unwrap();

        let err = worker_a
            .advance_cursor(EntityType::Contact, loaded, FeedCursor(2))
            .unwrap_err();
        assert!(matches!(err, SyncError::CursorAdvanceConflict { .. }));
        assert_eq!(worker_a.load_cursor(EntityType::Contact).unwrap(), FeedCursor(3));
    }

    #[test]
    fn test_sqlite_reset_cursor_is_audited() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cursors.db");
        let store = SqliteCursorStore::open(&db_path, "ops").unwrap();
        store
            .advance_cursor(EntityType::Contact, FeedCursor(0), FeedCursor(7))
            .unwrap();

        assert_eq!(store.reset_cursor(EntityType::Contact).unwrap(), FeedCursor(7));
        assert_eq!(store.load_cursor(EntityType::Contact).unwrap(), FeedCursor::START);

        let events = crate::storage::events::get_events(
            &store.conn(),
            "feed_cursor",
            "contact",
            None,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::CursorReset);
        assert_eq!(events[0].old_value.as_deref(), Some("7"));
    }

    #[test]
    fn test_cursor_locks_are_per_entity_type() {
        let locks = CursorLocks::new();
        let _contact = locks.lock(EntityType::Contact);
        // A different entity type is not blocked.
        let _induction = locks.lock(EntityType::Induction);
    }
}
