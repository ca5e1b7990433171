//! Shared types for the sync engine.
//!
//! Outcomes, batch results, retry policy and the sync error taxonomy used
//! by the orchestrator and the batch runner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::EntityType;
use crate::sync::mapper::MappingError;

/// Per entity type feed watermark.
///
/// Holds the sequence number of the last feed entry that reached a
/// terminal outcome. Zero means nothing has been consumed yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeedCursor(pub u64);

impl FeedCursor {
    pub const START: Self = Self(0);

    #[must_use]
    pub const fn position(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of applying one change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new target row was inserted.
    Created,
    /// An existing row was overwritten.
    Updated {
        /// The incoming snapshot was older than the stored one.
        stale: bool,
        /// Mirrored content differs from what was stored.
        changed: bool,
    },
    /// The target row was hard-deleted.
    Deleted,
    /// A removal arrived for a row that does not exist.
    AlreadyAbsent,
    /// The feed entry did not decode.
    Invalid { reason: String },
    /// The snapshot violated a business rule; nothing was written.
    MappingFailed(MappingError),
}

impl ApplyOutcome {
    /// True when the store is now consistent with the change.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated { .. } | Self::Deleted | Self::AlreadyAbsent
        )
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "already_absent",
            Self::Invalid { .. } => "invalid",
            Self::MappingFailed(_) => "mapping_failed",
        }
    }
}

/// Why a batch stopped consuming records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The feed returned fewer records than the window; caught up.
    #[default]
    Exhausted,
    /// The window was full; more records may be waiting.
    WindowFull,
    /// A cancellation request was observed between records.
    Cancelled,
    /// A record failed transiently and will be retried on the next run.
    Deferred { sequence: u64 },
    /// Too many invalid records for the caller's policy.
    InvalidThreshold { invalid: usize },
    /// A mapping failure with `abort_on_mapping_error` set.
    MappingError { sequence: u64 },
}

impl StopReason {
    /// True when the caller should treat the run as failed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidThreshold { .. } | Self::MappingError { .. })
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted => f.write_str("caught up"),
            Self::WindowFull => f.write_str("window full"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Deferred { sequence } => write!(f, "deferred at sequence {sequence}"),
            Self::InvalidThreshold { invalid } => {
                write!(f, "too many invalid records ({invalid})")
            }
            Self::MappingError { sequence } => write!(f, "mapping error at sequence {sequence}"),
        }
    }
}

/// Outcome counts for one batch (or an accumulated run of batches).
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub run_id: Uuid,
    pub entity_type: EntityType,
    /// Number of feed windows consumed.
    pub batches: usize,
    /// Records that reached a consistent state (created + updated + deleted + already absent).
    pub applied: usize,
    pub created: usize,
    pub updated: usize,
    /// Updates whose content matched what was stored.
    pub unchanged: usize,
    /// Updates carrying an older `modified_on` than the stored row.
    pub stale: usize,
    pub deleted: usize,
    pub already_absent: usize,
    pub invalid: usize,
    /// Mapping failures plus quarantined records.
    pub failed: usize,
    /// Records left for the next run after a transient error.
    pub deferred: usize,
    pub quarantined: usize,
    pub cursor_before: FeedCursor,
    pub cursor_after: FeedCursor,
    pub stop: StopReason,
    pub dry_run: bool,
}

impl BatchResult {
    #[must_use]
    pub fn new(entity_type: EntityType, cursor: FeedCursor) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            entity_type,
            batches: 0,
            applied: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            stale: 0,
            deleted: 0,
            already_absent: 0,
            invalid: 0,
            failed: 0,
            deferred: 0,
            quarantined: 0,
            cursor_before: cursor,
            cursor_after: cursor,
            stop: StopReason::Exhausted,
            dry_run: false,
        }
    }

    /// Count one record outcome.
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated { stale, changed } => {
                self.updated += 1;
                if *stale {
                    self.stale += 1;
                }
                if !*changed {
                    self.unchanged += 1;
                }
            }
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::AlreadyAbsent => self.already_absent += 1,
            ApplyOutcome::Invalid { .. } => self.invalid += 1,
            ApplyOutcome::MappingFailed(_) => self.failed += 1,
        }
        if outcome.is_applied() {
            self.applied += 1;
        }
    }

    /// Fold a later batch of the same run into this one.
    pub fn absorb(&mut self, later: &BatchResult) {
        self.batches += later.batches;
        self.applied += later.applied;
        self.created += later.created;
        self.updated += later.updated;
        self.unchanged += later.unchanged;
        self.stale += later.stale;
        self.deleted += later.deleted;
        self.already_absent += later.already_absent;
        self.invalid += later.invalid;
        self.failed += later.failed;
        self.deferred += later.deferred;
        self.quarantined += later.quarantined;
        self.cursor_after = later.cursor_after;
        self.stop = later.stop.clone();
    }

    /// Total records that reached any outcome, including deferrals.
    #[must_use]
    pub fn total_processed(&self) -> usize {
        self.applied + self.invalid + self.failed + self.deferred
    }
}

/// A record that exhausted its retries and needs manual remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub sequence: u64,
    pub external_id: Option<String>,
    pub reason: String,
    pub attempts: u32,
    /// Raw feed payload, kept so the record can be replayed.
    pub payload: String,
    pub quarantined_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts across runs before a record is quarantined.
    pub max_attempts: u32,
    /// Immediate attempts within a single run before deferring.
    pub attempts_per_run: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempts_per_run: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt_index` (zero-based), capped.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// No waiting between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32, attempts_per_run: u32) -> Self {
        Self {
            max_attempts,
            attempts_per_run,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Caller policy for one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Feed window size.
    pub batch_size: usize,
    /// Bulk/backfill mode: invalid records never abort the batch.
    pub ignore_invalid: bool,
    /// Outside `ignore_invalid`, stop once more than this many invalid
    /// records were seen in one batch. `None` means no limit.
    pub max_invalid_per_batch: Option<usize>,
    /// Stop the batch at the first mapping failure.
    pub abort_on_mapping_error: bool,
    /// Plan and count transitions without writing anything.
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            ignore_invalid: false,
            max_invalid_per_batch: Some(25),
            abort_on_mapping_error: false,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Sync-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO error reading the feed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store error (busy, locked, I/O). Transient.
    #[error("Database error: {0}")]
    Database(String),

    /// The store's uniqueness constraint rejected a write, or the row a
    /// write targeted disappeared. Indicates a race between workers.
    #[error("Constraint violation for {entity_type} {external_id}: {message}")]
    ConstraintViolation {
        entity_type: EntityType,
        external_id: String,
        message: String,
    },

    /// Another worker advanced the same cursor.
    #[error("Cursor for {entity_type} moved concurrently (expected {expected}, found {actual})")]
    CursorAdvanceConflict {
        entity_type: EntityType,
        expected: FeedCursor,
        actual: FeedCursor,
    },

    /// The feed could not be read.
    #[error("Feed error: {0}")]
    Feed(String),
}

impl SyncError {
    /// Errors worth retrying the same record for.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ConstraintViolation { .. })
    }

    /// Transient errors that count toward the quarantine ceiling.
    ///
    /// Constraint violations signal a race, not bad data, so they never do.
    #[must_use]
    pub const fn counts_toward_quarantine(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
