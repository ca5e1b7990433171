//! Batch runner: pulls a window from the feed, applies it record by record,
//! and moves the cursor.
//!
//! Every record ends in one of three places:
//!
//! - **terminal**: applied, invalid, rejected by the mapper, or quarantined.
//!   The cursor may move past it.
//! - **deferred**: a transient failure survived the in-run retries. The
//!   batch stops and the cursor stays before it, so the next run sees it
//!   again.
//! - **unreached**: the batch stopped earlier.
//!
//! The cursor only ever advances past a contiguous prefix of terminal
//! records. Because rows are written before the cursor moves, a crash in
//! between replays records that were already applied, which the
//! orchestrator tolerates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use crate::model::{ChangeRecord, EntityType};
use crate::sync::cursor::{CursorLocks, CursorStore};
use crate::sync::decode::decode;
use crate::sync::feed::{FeedSource, RawFeedEntry};
use crate::sync::orchestrator::{Clock, Orchestrator, PlannedState, SystemClock};
use crate::sync::repository::{RetryLedger, SyncStateRepository};
use crate::sync::types::{
    ApplyOutcome, BatchResult, FeedCursor, StopReason, SyncError, SyncOptions, SyncResult,
};

/// Cooperative cancellation, checked between records.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How one record ended.
enum RecordResult {
    Terminal(ApplyOutcome),
    Quarantined,
    Deferred,
}

/// Drives feed windows through the orchestrator for one repository.
pub struct BatchRunner<'a, R> {
    feed: &'a dyn FeedSource,
    repo: &'a mut R,
    cursors: &'a dyn CursorStore,
    locks: Arc<CursorLocks>,
    clock: Box<dyn Clock + 'a>,
    options: SyncOptions,
    cancel: CancellationToken,
    /// Dry runs only: writes planned so far in this run.
    planned: PlannedState,
}

impl<'a, R> BatchRunner<'a, R>
where
    R: SyncStateRepository + RetryLedger,
{
    pub fn new(
        feed: &'a dyn FeedSource,
        repo: &'a mut R,
        cursors: &'a dyn CursorStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            feed,
            repo,
            cursors,
            locks: Arc::new(CursorLocks::new()),
            clock: Box::new(SystemClock),
            options,
            cancel: CancellationToken::new(),
            planned: PlannedState::new(),
        }
    }

    /// Share cursor locks with other runners in this process.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<CursorLocks>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Process one feed window for an entity type.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed, cursor store or retry ledger fails, or
    /// if another worker moved the cursor during the batch. Rows applied
    /// before the error stay applied and are replayed by the next run.
    pub fn process_batch(&mut self, entity_type: EntityType) -> SyncResult<BatchResult> {
        self.planned.clear();
        self.process_window(entity_type, None)
    }

    /// Process windows until the feed is drained, the run stops early, or
    /// `max_batches` windows were consumed. Counts are accumulated.
    ///
    /// # Errors
    ///
    /// See [`Self::process_batch`].
    pub fn run_until_idle(
        &mut self,
        entity_type: EntityType,
        max_batches: Option<usize>,
    ) -> SyncResult<BatchResult> {
        let mut total: Option<BatchResult> = None;
        // A dry run never stores its cursor, so it carries it here instead.
        let mut dry_cursor = None;
        self.planned.clear();

        loop {
            let batch = self.process_window(entity_type, dry_cursor)?;
            if self.options.dry_run {
                dry_cursor = Some(batch.cursor_after);
            }
            let more = batch.stop == StopReason::WindowFull;

            if let Some(total) = total.as_mut() {
                total.absorb(&batch);
            } else {
                total = Some(batch);
            }

            let batches = total.as_ref().map_or(0, |t| t.batches);
            if !more || max_batches.is_some_and(|max| batches >= max) {
                break;
            }
        }

        total.ok_or_else(|| SyncError::Feed("no batch was processed".to_string()))
    }

    fn process_window(
        &mut self,
        entity_type: EntityType,
        start: Option<FeedCursor>,
    ) -> SyncResult<BatchResult> {
        let locks = Arc::clone(&self.locks);
        let _guard = locks.lock(entity_type);

        let cursor = match start {
            Some(cursor) => cursor,
            None => self.cursors.load_cursor(entity_type)?,
        };
        let mut result = BatchResult::new(entity_type, cursor);
        result.batches = 1;
        result.dry_run = self.options.dry_run;

        let span = info_span!(
            "sync_batch",
            run_id = %result.run_id,
            entity_type = %entity_type,
            cursor = cursor.position()
        );
        let _enter = span.enter();

        let window = self.options.batch_size.max(1);
        let page = self.feed.fetch_changes(entity_type, cursor, window)?;
        debug!(entries = page.entries.len(), "Fetched feed window");

        let mut terminal_through = cursor;
        let mut stop = None;

        for entry in &page.entries {
            if self.cancel.is_cancelled() {
                info!(sequence = entry.sequence, "Cancellation requested, stopping batch");
                stop = Some(StopReason::Cancelled);
                break;
            }

            let change = decode(entry);
            match self.process_record(entity_type, entry, &change)? {
                RecordResult::Terminal(outcome) => {
                    terminal_through = FeedCursor(entry.sequence);
                    result.record(&outcome);
                    if let Some(reason) = self.check_policy(entry, &outcome, &result) {
                        stop = Some(reason);
                        break;
                    }
                }
                RecordResult::Quarantined => {
                    terminal_through = FeedCursor(entry.sequence);
                    result.failed += 1;
                    result.quarantined += 1;
                }
                RecordResult::Deferred => {
                    result.deferred += 1;
                    stop = Some(StopReason::Deferred {
                        sequence: entry.sequence,
                    });
                    break;
                }
            }
        }

        let next = match stop {
            Some(_) => terminal_through,
            // Covers lines the page consumed without returning, such as blanks.
            None => page.next_cursor.max(terminal_through),
        };
        result.stop = stop.unwrap_or(if page.entries.len() < window {
            StopReason::Exhausted
        } else {
            StopReason::WindowFull
        });
        result.cursor_after = next;

        if !self.options.dry_run && next > cursor {
            if let Err(e) = self.cursors.advance_cursor(entity_type, cursor, next) {
                error!(error = %e, "Cursor advance failed");
                return Err(e);
            }
            if let Err(e) = self.repo.clear_attempts_through(entity_type, next) {
                warn!(error = %e, "Could not clear retry ledger");
            }
        }

        info!(
            applied = result.applied,
            invalid = result.invalid,
            failed = result.failed,
            deferred = result.deferred,
            cursor_after = result.cursor_after.position(),
            stop = ?result.stop,
            dry_run = result.dry_run,
            "Batch complete"
        );
        Ok(result)
    }

    fn process_record(
        &mut self,
        entity_type: EntityType,
        entry: &RawFeedEntry,
        change: &ChangeRecord,
    ) -> SyncResult<RecordResult> {
        if let ChangeRecord::Invalid { reason, .. } = change {
            warn!(
                sequence = entry.sequence,
                external_id = change.external_id().unwrap_or("-"),
                %reason,
                "Invalid feed record"
            );
        }

        if self.options.dry_run {
            let now = self.clock.now();
            let outcome = self.planned.plan(&*self.repo, change, now)?.outcome();
            debug!(sequence = entry.sequence, outcome = outcome.label(), "Planned (dry run)");
            return Ok(RecordResult::Terminal(outcome));
        }

        let retry = self.options.retry;
        let mut attempt = 0u32;
        loop {
            let now = self.clock.now();
            let err = match Orchestrator::new(&mut *self.repo).apply(change, now) {
                Ok(outcome) => {
                    debug!(sequence = entry.sequence, outcome = outcome.label(), "Applied");
                    return Ok(RecordResult::Terminal(outcome));
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            if attempt < retry.attempts_per_run.max(1) && !self.cancel.is_cancelled() {
                let delay = retry.delay_for_attempt(attempt - 1);
                debug!(
                    sequence = entry.sequence,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Transient failure, retrying"
                );
                thread::sleep(delay);
                continue;
            }

            return self.defer_or_quarantine(entity_type, entry, change, &err, now);
        }
    }

    fn defer_or_quarantine(
        &mut self,
        entity_type: EntityType,
        entry: &RawFeedEntry,
        change: &ChangeRecord,
        err: &SyncError,
        now: DateTime<Utc>,
    ) -> SyncResult<RecordResult> {
        let external_id = change.external_id();
        let reason = err.to_string();

        if err.counts_toward_quarantine() {
            // The attempt ceiling depends on this write; failing it ends the run.
            let attempts = self
                .repo
                .record_failure(entity_type, entry.sequence, external_id, &reason, now)
                .inspect_err(|e| {
                    error!(sequence = entry.sequence, error = %e, "Could not record failed attempt");
                })?;

            if attempts >= self.options.retry.max_attempts {
                let id = self
                    .repo
                    .quarantine(
                        entity_type,
                        entry.sequence,
                        external_id,
                        &reason,
                        attempts,
                        &entry.payload,
                        now,
                    )
                    .inspect_err(|e| {
                        error!(sequence = entry.sequence, error = %e, "Could not quarantine record");
                    })?;
                warn!(
                    sequence = entry.sequence,
                    external_id = external_id.unwrap_or("-"),
                    attempts,
                    quarantine_id = id,
                    error = %err,
                    "Record quarantined"
                );
                return Ok(RecordResult::Quarantined);
            }
        }

        warn!(
            sequence = entry.sequence,
            external_id = external_id.unwrap_or("-"),
            error = %err,
            "Deferring record to the next run"
        );
        Ok(RecordResult::Deferred)
    }

    fn check_policy(
        &self,
        entry: &RawFeedEntry,
        outcome: &ApplyOutcome,
        result: &BatchResult,
    ) -> Option<StopReason> {
        match outcome {
            ApplyOutcome::Invalid { .. } if !self.options.ignore_invalid => {
                let limit = self.options.max_invalid_per_batch?;
                (result.invalid > limit).then(|| {
                    error!(invalid = result.invalid, limit, "Too many invalid records, stopping");
                    StopReason::InvalidThreshold {
                        invalid: result.invalid,
                    }
                })
            }
            ApplyOutcome::MappingFailed(e) if self.options.abort_on_mapping_error => {
                error!(sequence = entry.sequence, error = %e, "Mapping failure, stopping");
                Some(StopReason::MappingError {
                    sequence: entry.sequence,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceState, TargetRow};
    use crate::storage::SqliteStorage;
    use crate::sync::cursor::MemoryCursorStore;
    use crate::sync::feed::MemoryFeed;
    use crate::sync::orchestrator::FixedClock;
    use crate::sync::types::RetryPolicy;
    use chrono::TimeZone;
    use std::collections::HashMap;

    /// Wraps the real store and fails upserts for chosen external ids.
    struct FlakyStore {
        inner: SqliteStorage,
        failures: HashMap<String, (usize, fn(&str) -> SyncError)>,
        ledger_down: bool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqliteStorage::open_memory().unwrap(),
                failures: HashMap::new(),
                ledger_down: false,
            }
        }

        fn fail(&mut self, external_id: &str, times: usize, make: fn(&str) -> SyncError) {
            self.failures.insert(external_id.to_string(), (times, make));
        }
    }

    fn busy(_: &str) -> SyncError {
        SyncError::Database("database is locked".into())
    }

    fn race(id: &str) -> SyncError {
        SyncError::ConstraintViolation {
            entity_type: EntityType::Contact,
            external_id: id.to_string(),
            message: "UNIQUE constraint failed: persons.external_id".into(),
        }
    }

    impl SyncStateRepository for FlakyStore {
        fn get_by_external_id(
            &self,
            entity_type: EntityType,
            external_id: &str,
        ) -> SyncResult<Option<TargetRow>> {
            self.inner.get_by_external_id(entity_type, external_id)
        }

        fn upsert(&mut self, row: &TargetRow) -> SyncResult<()> {
            if let Some((remaining, make)) = self.failures.get_mut(&row.external_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(make(&row.external_id));
                }
            }
            self.inner.upsert(row)
        }

        fn delete(&mut self, entity_type: EntityType, external_id: &str) -> SyncResult<bool> {
            self.inner.delete(entity_type, external_id)
        }
    }

    impl RetryLedger for FlakyStore {
        fn record_failure(
            &mut self,
            entity_type: EntityType,
            sequence: u64,
            external_id: Option<&str>,
            error: &str,
            now: DateTime<Utc>,
        ) -> SyncResult<u32> {
            if self.ledger_down {
                return Err(busy("ledger"));
            }
            self.inner
                .record_failure(entity_type, sequence, external_id, error, now)
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
            self.inner
                .quarantine(entity_type, sequence, external_id, reason, attempts, payload, now)
        }

        fn clear_attempts_through(
            &mut self,
            entity_type: EntityType,
            cursor: FeedCursor,
        ) -> SyncResult<()> {
            self.inner.clear_attempts_through(entity_type, cursor)
        }
    }

    fn contact(id: &str, first_name: &str, modified_hour: u32) -> String {
        serde_json::json!({
            "id": id,
            "createdon": "2024-01-01T09:00:00Z",
            "modifiedon": format!("2024-02-01T{modified_hour:02}:00:00Z"),
            "statecode": 0,
            "attributes": {"firstname": first_name, "lastname": "Smith"}
        })
        .to_string()
    }

    fn remove(id: &str) -> String {
        serde_json::json!({"change": "remove", "id": id}).to_string()
    }

    fn options() -> SyncOptions {
        SyncOptions {
            retry: RetryPolicy::immediate(3, 2),
            ..SyncOptions::default()
        }
    }

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_batch_applies_and_advances_cursor() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));
        feed.push(EntityType::Contact, contact("C1", "Anne", 2));
        feed.push(EntityType::Contact, remove("C2"));
        feed.push(EntityType::Contact, remove("C2"));

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .with_clock(clock())
            .process_batch(EntityType::Contact)
            .unwrap();

        assert_eq!(result.created, 2);
        assert_eq!(result.updated, 1);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.already_absent, 1);
        assert_eq!(result.applied, 5);
        assert_eq!(result.stop, StopReason::Exhausted);
        assert_eq!(result.cursor_after, FeedCursor(5));
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor(5));
        assert!(store
            .get_by_external_id(EntityType::Contact, "C2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_record_does_not_poison_batch() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, "{broken");
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();

        assert_eq!(result.created, 2);
        assert_eq!(result.invalid, 1);
        assert_eq!(result.cursor_after, FeedCursor(3));
        assert!(store
            .get_by_external_id(EntityType::Contact, "C2")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_invalid_threshold_stops_batch() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, "{broken");
        feed.push(EntityType::Contact, "{broken");
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            max_invalid_per_batch: Some(1),
            ..options()
        };
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();

        assert_eq!(result.stop, StopReason::InvalidThreshold { invalid: 2 });
        assert!(result.stop.is_fatal());
        assert_eq!(result.created, 0);
        assert_eq!(result.cursor_after, FeedCursor(2));

        // Bulk mode tolerates any number of invalid records.
        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            max_invalid_per_batch: Some(1),
            ignore_invalid: true,
            ..options()
        };
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.invalid, 2);
        assert_eq!(result.created, 1);
        assert_eq!(result.stop, StopReason::Exhausted);
    }

    #[test]
    fn test_mapping_failure_counts_as_failed_or_aborts() {
        let feed = MemoryFeed::new();
        feed.push(
            EntityType::Contact,
            serde_json::json!({
                "id": "C1", "createdon": "2024-01-01T09:00:00Z",
                "modifiedon": "2024-01-01T09:00:00Z", "statecode": 5,
                "attributes": {"firstname": "Ann", "lastname": "Smith"}
            })
            .to_string(),
        );
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.created, 1);

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            abort_on_mapping_error: true,
            ..options()
        };
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.stop, StopReason::MappingError { sequence: 1 });
        assert_eq!(result.created, 0);
    }

    #[test]
    fn test_transient_failure_defers_without_advancing_past_record() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));
        feed.push(EntityType::Contact, contact("C3", "Cat", 1));

        let mut store = FlakyStore::new();
        store.fail("C2", 2, busy);
        let cursors = MemoryCursorStore::new();

        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.deferred, 1);
        assert_eq!(result.stop, StopReason::Deferred { sequence: 2 });
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor(1));
        assert!(store
            .get_by_external_id(EntityType::Contact, "C3")
            .unwrap()
            .is_none());

        // The failure budget is spent; the next run applies the rest.
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.created, 2);
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor(3));
    }

    #[test]
    fn test_in_run_retry_recovers() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));

        let mut store = FlakyStore::new();
        store.fail("C1", 1, busy);
        let cursors = MemoryCursorStore::new();

        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.created, 1);
        assert_eq!(result.deferred, 0);
    }

    #[test]
    fn test_persistent_store_failure_is_quarantined() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));

        let mut store = FlakyStore::new();
        store.fail("C1", usize::MAX, busy);
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            retry: RetryPolicy::immediate(2, 1),
            ..SyncOptions::default()
        };

        let first = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(first.deferred, 1);
        assert_eq!(first.cursor_after, FeedCursor::START);

        let second = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(second.quarantined, 1);
        assert_eq!(second.failed, 1);
        assert_eq!(second.created, 1);
        assert_eq!(second.cursor_after, FeedCursor(2));

        let entries = store.inner.list_quarantine(false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].external_id.as_deref(), Some("C1"));
        assert_eq!(entries[0].attempts, 2);
    }

    #[test]
    fn test_unwritable_retry_ledger_ends_the_run() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));

        let mut store = FlakyStore::new();
        store.fail("C2", usize::MAX, busy);
        store.ledger_down = true;
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            retry: RetryPolicy::immediate(1, 1),
            ..SyncOptions::default()
        };

        for _ in 0..3 {
            let err = BatchRunner::new(&feed, &mut store, &cursors, opts)
                .process_batch(EntityType::Contact)
                .unwrap_err();
            assert!(matches!(err, SyncError::Database(_)));
            assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor::START);
        }
        assert!(store.inner.list_quarantine(true).unwrap().is_empty());

        // Once the ledger is back the ceiling of one attempt applies.
        store.ledger_down = false;
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.quarantined, 1);
        assert_eq!(result.cursor_after, FeedCursor(2));
    }

    #[test]
    fn test_constraint_violation_is_never_quarantined() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));

        let mut store = FlakyStore::new();
        store.fail("C1", usize::MAX, race);
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            retry: RetryPolicy::immediate(1, 1),
            ..SyncOptions::default()
        };

        for _ in 0..3 {
            let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
                .process_batch(EntityType::Contact)
                .unwrap();
            assert_eq!(result.deferred, 1);
            assert_eq!(result.quarantined, 0);
        }
        assert!(store.inner.list_quarantine(true).unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_stops_between_records() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .with_cancellation(cancel)
            .process_batch(EntityType::Contact)
            .unwrap();
        assert_eq!(result.stop, StopReason::Cancelled);
        assert_eq!(result.applied, 0);
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor::START);
    }

    /// Cursor store whose position moves under the runner's feet.
    struct RacingCursors {
        inner: MemoryCursorStore,
    }

    impl CursorStore for RacingCursors {
        fn load_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
            let loaded = self.inner.load_cursor(entity_type)?;
            self.inner.set(entity_type, FeedCursor(loaded.position() + 1));
            Ok(loaded)
        }

        fn advance_cursor(
            &self,
            entity_type: EntityType,
            expected: FeedCursor,
            next: FeedCursor,
        ) -> SyncResult<()> {
            self.inner.advance_cursor(entity_type, expected, next)
        }

        fn reset_cursor(&self, entity_type: EntityType) -> SyncResult<FeedCursor> {
            self.inner.reset_cursor(entity_type)
        }
    }

    #[test]
    fn test_cursor_conflict_is_fatal_but_rows_stay_applied() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));

        let mut store = FlakyStore::new();
        let cursors = RacingCursors {
            inner: MemoryCursorStore::new(),
        };

        let err = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap_err();
        assert!(matches!(err, SyncError::CursorAdvanceConflict { .. }));
        assert!(store
            .get_by_external_id(EntityType::Contact, "C1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_run_until_idle_drains_windows() {
        let feed = MemoryFeed::new();
        for i in 0..5 {
            feed.push(EntityType::Contact, contact(&format!("C{i}"), "Ann", 1));
        }

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            batch_size: 2,
            ..options()
        };
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .run_until_idle(EntityType::Contact, None)
            .unwrap();

        assert_eq!(result.batches, 3);
        assert_eq!(result.created, 5);
        assert_eq!(result.cursor_before, FeedCursor::START);
        assert_eq!(result.cursor_after, FeedCursor(5));
        assert_eq!(result.stop, StopReason::Exhausted);

        let limited = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .run_until_idle(EntityType::Contact, Some(1))
            .unwrap();
        assert_eq!(limited.batches, 1);
        assert_eq!(limited.applied, 0);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let feed = MemoryFeed::new();
        for i in 0..3 {
            feed.push(EntityType::Contact, contact(&format!("C{i}"), "Ann", 1));
        }

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let opts = SyncOptions {
            batch_size: 2,
            dry_run: true,
            ..options()
        };
        let result = BatchRunner::new(&feed, &mut store, &cursors, opts)
            .run_until_idle(EntityType::Contact, None)
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.created, 3);
        assert_eq!(result.cursor_after, FeedCursor(3));
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor::START);
        assert!(store
            .get_by_external_id(EntityType::Contact, "C0")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_dry_run_counts_match_real_run() {
        let feed = MemoryFeed::new();
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));
        feed.push(EntityType::Contact, contact("C1", "Anne", 2));
        feed.push(EntityType::Contact, contact("C2", "Bob", 1));
        feed.push(EntityType::Contact, remove("C2"));
        feed.push(EntityType::Contact, remove("C2"));
        feed.push(EntityType::Contact, contact("C1", "Anne", 2));
        feed.push(EntityType::Contact, contact("C1", "Ann", 1));

        let counts = |dry_run: bool| {
            let mut store = FlakyStore::new();
            let cursors = MemoryCursorStore::new();
            let opts = SyncOptions {
                batch_size: 3,
                dry_run,
                ..options()
            };
            let r = BatchRunner::new(&feed, &mut store, &cursors, opts)
                .with_clock(clock())
                .run_until_idle(EntityType::Contact, None)
                .unwrap();
            (
                r.created,
                r.updated,
                r.unchanged,
                r.stale,
                r.deleted,
                r.already_absent,
                r.cursor_after,
            )
        };

        let real = counts(false);
        assert_eq!(real, (2, 3, 1, 1, 1, 1, FeedCursor(7)));
        assert_eq!(counts(true), real);
    }

    #[test]
    fn test_shared_locks_serialize_runners_on_one_cursor() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sync.db");
        SqliteStorage::open(&db_path).unwrap();

        let feed = MemoryFeed::new();
        for i in 0..20 {
            feed.push(EntityType::Contact, contact(&format!("C{i}"), "Ann", 1));
        }
        let cursors = MemoryCursorStore::new();
        let locks = Arc::new(CursorLocks::new());

        let results: Vec<SyncResult<BatchResult>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let locks = Arc::clone(&locks);
                    let (feed, cursors, db_path) = (&feed, &cursors, &db_path);
                    scope.spawn(move || {
                        let mut storage = SqliteStorage::open(db_path).unwrap();
                        BatchRunner::new(feed, &mut storage, cursors, options())
                            .with_locks(locks)
                            .process_batch(EntityType::Contact)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let created: usize = results
            .into_iter()
            .map(|r| r.expect("no cursor conflict under a shared lock").created)
            .sum();
        assert_eq!(created, 20);
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap(), FeedCursor(20));
    }

    #[test]
    fn test_undecodable_jsonl_line_is_invalid_not_stored() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let feed = crate::sync::feed::JsonlFeed::new(temp_dir.path());
        let mut bytes = contact("C1", "An?n", 1).into_bytes();
        let at = bytes.iter().position(|&b| b == b'?').unwrap();
        bytes[at] = 0xFF;
        bytes.push(b'\n');
        bytes.extend_from_slice(contact("C2", "Bob", 1).as_bytes());
        bytes.push(b'\n');
        std::fs::write(feed.feed_path(EntityType::Contact), bytes).unwrap();

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .process_batch(EntityType::Contact)
            .unwrap();

        assert_eq!(result.invalid, 1);
        assert_eq!(result.created, 1);
        assert_eq!(result.cursor_after, FeedCursor(2));
        assert!(store
            .get_by_external_id(EntityType::Contact, "C1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_redelivered_changes_converge() {
        let feed = MemoryFeed::new();
        let upsert = contact("C1", "Ann", 1);
        feed.push(EntityType::Contact, upsert.clone());
        feed.push(EntityType::Contact, upsert.clone());
        feed.push(EntityType::Contact, upsert);

        let mut store = FlakyStore::new();
        let cursors = MemoryCursorStore::new();
        let result = BatchRunner::new(&feed, &mut store, &cursors, options())
            .with_clock(clock())
            .process_batch(EntityType::Contact)
            .unwrap();

        assert_eq!(result.created, 1);
        assert_eq!(result.updated, 2);
        assert_eq!(result.unchanged, 2);
        let row = store
            .get_by_external_id(EntityType::Contact, "C1")
            .unwrap()
            .unwrap();
        assert_eq!(row.source_state, SourceState::Active);
        assert_eq!(row.first_synced_at, row.last_synced_at);
    }
}
