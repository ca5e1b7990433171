//! Audit trail for sync writes.
//!
//! Every committed sync transition writes an event in the same transaction
//! as the row change. Downstream consumers read this table.

use rusqlite::{Connection, Result};
use serde::Serialize;

/// What happened to a row, a quarantine entry or a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Target row events
    SyncCreated,
    SyncUpdated,
    SyncDeleted,

    // Quarantine events
    SyncQuarantined,
    QuarantineResolved,

    // Cursor events
    CursorReset,
}

impl EventType {
    pub const ALL: [Self; 6] = [
        Self::SyncCreated,
        Self::SyncUpdated,
        Self::SyncDeleted,
        Self::SyncQuarantined,
        Self::QuarantineResolved,
        Self::CursorReset,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SyncCreated => "sync_created",
            Self::SyncUpdated => "sync_updated",
            Self::SyncDeleted => "sync_deleted",
            Self::SyncQuarantined => "sync_quarantined",
            Self::QuarantineResolved => "quarantine_resolved",
            Self::CursorReset => "cursor_reset",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {s}"))
    }
}

/// One row of the `events` table.
///
/// `entity_id` is the external id for row events and the entity type for
/// cursor events.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
}

impl Event {
    /// Stamped now; `id` stays 0 until inserted.
    #[must_use]
    pub fn new(entity_type: &str, entity_id: &str, event_type: EventType, actor: &str) -> Self {
        Self {
            id: 0,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            comment: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Content hashes before and after the write.
    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

/// Append an event, returning its id.
///
/// # Errors
///
/// Fails if the `events` table is missing or the write is rejected.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.entity_type,
            event.entity_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const DEFAULT_EVENT_LIMIT: u32 = 100;

/// Events recorded against one entity, newest first.
///
/// # Errors
///
/// Returns an error if the query fails or a stored event type is unknown.
pub fn get_events(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Event>> {
    let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        let raw: String = row.get(3)?;
        let event_type = raw.parse::<EventType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        Ok(Event {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            event_type,
            actor: row.get(4)?,
            old_value: row.get(5)?,
            new_value: row.get(6)?,
            comment: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;

    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    #[test]
    fn test_event_insert_and_get() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let event = Event::new("contact", "C1", EventType::SyncCreated, "test-actor")
            .with_comment("sequence 4");

        let id = insert_event(&conn, &event).unwrap();
        assert!(id > 0);

        let events = get_events(&conn, "contact", "C1", Some(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "test-actor");
        assert_eq!(events[0].event_type, EventType::SyncCreated);
        assert_eq!(events[0].comment, Some("sequence 4".to_string()));
    }

    #[test]
    fn test_event_type_round_trips_through_storage_names() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>(), Ok(event_type));
        }
        assert!("row_archived".parse::<EventType>().is_err());
    }
}
