//! Persistence seams used by the orchestrator and the batch runner.
//!
//! [`SqliteStorage`](crate::storage::SqliteStorage) implements both traits;
//! tests wrap it to inject failures.

use chrono::{DateTime, Utc};

use crate::model::{EntityType, TargetRow};
use crate::sync::types::{FeedCursor, SyncResult};

/// Read and write target rows keyed by `(entity_type, external_id)`.
pub trait SyncStateRepository {
    /// Current row for an external id, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_by_external_id(
        &self,
        entity_type: EntityType,
        external_id: &str,
    ) -> SyncResult<Option<TargetRow>>;

    /// Insert (`row.id == None`) or overwrite (`row.id == Some`) a row in one
    /// atomic write.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` when an insert collides with an existing
    /// external id or an update finds its row gone; `Database` otherwise.
    fn upsert(&mut self, row: &TargetRow) -> SyncResult<()>;

    /// Hard-delete a row. Returns `true` when a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn delete(&mut self, entity_type: EntityType, external_id: &str) -> SyncResult<bool>;
}

/// Durable per-record attempt counts and the quarantine they lead to.
///
/// Records are identified by feed position, since an undecodable record may
/// have no external id.
pub trait RetryLedger {
    /// Count a failed attempt and return the total so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    fn record_failure(
        &mut self,
        entity_type: EntityType,
        sequence: u64,
        external_id: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<u32>;

    /// Move a record to quarantine and drop its attempt count.
    ///
    /// Returns the quarantine entry id.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    #[allow(clippy::too_many_arguments)]
    fn quarantine(
        &mut self,
        entity_type: EntityType,
        sequence: u64,
        external_id: Option<&str>,
        reason: &str,
        attempts: u32,
        payload: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<i64>;

    /// Forget attempt counts for records at or before `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    fn clear_attempts_through(
        &mut self,
        entity_type: EntityType,
        cursor: FeedCursor,
    ) -> SyncResult<()>;
}
