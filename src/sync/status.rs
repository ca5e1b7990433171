//! Sync status display.
//!
//! Summarizes where each feed cursor sits, how many rows are mirrored,
//! which records are waiting on a retry, and how much is quarantined.

use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::model::EntityType;
use crate::storage::{PendingAttempt, SqliteStorage};
use crate::sync::types::FeedCursor;

/// Per entity type view of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityStatus {
    pub entity_type: EntityType,
    pub cursor: FeedCursor,
    pub rows: usize,
    /// Records ahead of the cursor with a failed attempt on file.
    pub pending_retries: usize,
}

/// Snapshot of the sync state across all entity types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub entities: Vec<EntityStatus>,
    pub pending: Vec<PendingAttempt>,
    pub open_quarantine: usize,
}

impl SyncStatus {
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.entities.iter().map(|e| e.rows).sum()
    }

    /// Nothing is waiting on an operator.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.pending.is_empty() && self.open_quarantine == 0
    }
}

/// Collect the current sync status.
///
/// Entity types with no stored cursor report position zero.
///
/// # Errors
///
/// Returns an error if database queries fail.
pub fn get_sync_status(storage: &SqliteStorage) -> Result<SyncStatus> {
    let cursors = storage.list_cursors()?;
    let pending = storage.pending_attempts()?;

    let mut entities = Vec::with_capacity(EntityType::ALL.len());
    for entity_type in EntityType::ALL {
        let cursor = cursors
            .iter()
            .find(|c| c.entity_type == entity_type)
            .map_or(FeedCursor::START, |c| c.position);
        entities.push(EntityStatus {
            entity_type,
            cursor,
            rows: storage.count_rows(entity_type)?,
            pending_retries: pending.iter().filter(|p| p.entity_type == entity_type).count(),
        });
    }

    Ok(SyncStatus {
        entities,
        pending,
        open_quarantine: storage.count_open_quarantine()?,
    })
}

/// Print sync status to stdout in a human-readable format.
pub fn print_status(status: &SyncStatus) {
    println!("{}", "Sync Status".bold().underline());
    println!();

    println!("{}", "Feeds:".blue().bold());
    for entity in &status.entities {
        println!(
            "  {:<10} cursor {:>8}  rows {:>8}",
            entity.entity_type, entity.cursor, entity.rows
        );
    }
    println!();

    if status.pending.is_empty() {
        println!("{}", "No records waiting on a retry.".green());
    } else {
        println!("{}", "Pending Retries:".yellow().bold());
        for attempt in &status.pending {
            println!(
                "  {} #{} {} ({} attempts): {}",
                attempt.entity_type,
                attempt.sequence,
                attempt.external_id.as_deref().unwrap_or("-"),
                attempt.attempts,
                attempt.last_error.dimmed()
            );
        }
    }

    if status.open_quarantine > 0 {
        println!();
        println!(
            "{} {}",
            "Quarantined:".red().bold(),
            status.open_quarantine
        );
        println!(
            "{}",
            "Run 'trs-sync quarantine list' to inspect them.".dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::repository::RetryLedger;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_get_sync_status_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(&temp_dir.path().join("test.db")).unwrap();

        let status = get_sync_status(&storage).unwrap();

        assert_eq!(status.entities.len(), 2);
        assert!(status.entities.iter().all(|e| e.cursor == FeedCursor::START));
        assert_eq!(status.total_rows(), 0);
        assert!(status.is_healthy());
    }

    #[test]
    fn test_get_sync_status_reports_retries_and_quarantine() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let now = Utc::now();
        storage
            .record_failure(EntityType::Induction, 7, Some("I7"), "database is locked", now)
            .unwrap();
        storage
            .quarantine(EntityType::Contact, 2, Some("C2"), "disk I/O error", 5, "{}", now)
            .unwrap();

        let status = get_sync_status(&storage).unwrap();

        assert!(!status.is_healthy());
        assert_eq!(status.open_quarantine, 1);
        assert_eq!(status.pending.len(), 1);
        let induction = status
            .entities
            .iter()
            .find(|e| e.entity_type == EntityType::Induction)
            .unwrap();
        assert_eq!(induction.pending_retries, 1);
    }
}
