//! Sync orchestrator: the per-entity state machine.
//!
//! Each `(entity_type, external_id)` is either Absent or Present. A change
//! record moves it between those states:
//!
//! | change   | current | result                                    |
//! |----------|---------|-------------------------------------------|
//! | Upserted | Absent  | map, insert → `Created`                   |
//! | Upserted | Present | map, overwrite → `Updated`                |
//! | Removed  | Present | hard delete → `Deleted`                   |
//! | Removed  | Absent  | nothing → `AlreadyAbsent`                 |
//! | Invalid  | any     | nothing → `Invalid`                       |
//!
//! A snapshot the mapper rejects produces `MappingFailed` and writes
//! nothing. Deciding is pure ([`plan`]); [`Orchestrator::apply`] reads the
//! current row, plans, and performs at most one atomic repository write.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{ChangeRecord, EntityType, TargetRow};
use crate::sync::hash::{has_changed, row_hash};
use crate::sync::mapper;
use crate::sync::repository::SyncStateRepository;
use crate::sync::types::{ApplyOutcome, SyncResult};

/// Source of "now" for sync timestamps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What applying a change would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Insert(TargetRow),
    Update {
        row: TargetRow,
        stale: bool,
        changed: bool,
        previous_hash: String,
    },
    Delete {
        entity_type: EntityType,
        external_id: String,
    },
    /// No write; the outcome is final as planned.
    Skip(ApplyOutcome),
}

impl Transition {
    /// Outcome reported if this transition is carried out.
    #[must_use]
    pub fn outcome(&self) -> ApplyOutcome {
        match self {
            Self::Insert(_) => ApplyOutcome::Created,
            Self::Update { stale, changed, .. } => ApplyOutcome::Updated {
                stale: *stale,
                changed: *changed,
            },
            Self::Delete { .. } => ApplyOutcome::Deleted,
            Self::Skip(outcome) => outcome.clone(),
        }
    }
}

/// Decide the transition for a change given the current row.
///
/// `current` must be the row for the change's own `(entity_type,
/// external_id)`. Pure: no I/O and no clock.
#[must_use]
pub fn plan(change: &ChangeRecord, current: Option<&TargetRow>, now: DateTime<Utc>) -> Transition {
    match change {
        ChangeRecord::Invalid { reason, .. } => Transition::Skip(ApplyOutcome::Invalid {
            reason: reason.clone(),
        }),
        ChangeRecord::Removed {
            entity_type,
            external_id,
        } => match current {
            Some(_) => Transition::Delete {
                entity_type: *entity_type,
                external_id: external_id.clone(),
            },
            None => Transition::Skip(ApplyOutcome::AlreadyAbsent),
        },
        ChangeRecord::Upserted(snapshot) => {
            let mapped = match mapper::map(snapshot) {
                Ok(mapped) => mapped,
                Err(e) => return Transition::Skip(ApplyOutcome::MappingFailed(e)),
            };
            let meta = snapshot.meta();
            let content_hash = row_hash(
                &mapped.fields,
                mapped.source_state,
                meta.created_on,
                meta.modified_on,
            );

            match current {
                None => Transition::Insert(TargetRow {
                    id: None,
                    external_id: meta.external_id.clone(),
                    fields: mapped.fields,
                    source_state: mapped.source_state,
                    source_created_on: meta.created_on,
                    source_modified_on: meta.modified_on,
                    first_synced_at: now,
                    last_synced_at: now,
                    content_hash,
                }),
                Some(existing) => {
                    let stale = meta.modified_on < existing.source_modified_on;
                    let changed = has_changed(&content_hash, Some(&existing.content_hash));
                    Transition::Update {
                        row: TargetRow {
                            id: existing.id,
                            external_id: existing.external_id.clone(),
                            fields: mapped.fields,
                            source_state: mapped.source_state,
                            source_created_on: meta.created_on,
                            source_modified_on: meta.modified_on,
                            first_synced_at: existing.first_synced_at,
                            // Clock skew must not move the watermark backwards.
                            last_synced_at: now.max(existing.last_synced_at),
                            content_hash,
                        },
                        stale,
                        changed,
                        previous_hash: existing.content_hash.clone(),
                    }
                }
            }
        }
    }
}

/// Applies change records to a repository.
pub struct Orchestrator<'r, R: SyncStateRepository> {
    repo: &'r mut R,
}

impl<'r, R: SyncStateRepository> Orchestrator<'r, R> {
    pub fn new(repo: &'r mut R) -> Self {
        Self { repo }
    }

    /// Read current state and decide, without writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the current row cannot be read.
    pub fn preview(&self, change: &ChangeRecord, now: DateTime<Utc>) -> SyncResult<Transition> {
        let current = match target(change) {
            Some((entity_type, external_id)) => {
                self.repo.get_by_external_id(entity_type, external_id)?
            }
            None => None,
        };
        Ok(plan(change, current.as_ref(), now))
    }

    /// Apply one change record.
    ///
    /// Business failures come back as outcomes; only store failures are
    /// errors, and those leave the store unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ConstraintViolation` when another writer raced this one, or
    /// `Database` when the store is unavailable.
    pub fn apply(&mut self, change: &ChangeRecord, now: DateTime<Utc>) -> SyncResult<ApplyOutcome> {
        let transition = self.preview(change, now)?;
        let outcome = transition.outcome();

        match transition {
            Transition::Insert(row) => {
                self.repo.upsert(&row)?;
                debug!(
                    entity_type = %row.entity_type(),
                    external_id = %row.external_id,
                    "Created target row"
                );
            }
            Transition::Update {
                row,
                stale,
                changed,
                ..
            } => {
                if stale {
                    warn!(
                        entity_type = %row.entity_type(),
                        external_id = %row.external_id,
                        incoming_modified_on = %row.source_modified_on,
                        "Applying snapshot older than the stored row"
                    );
                }
                self.repo.upsert(&row)?;
                debug!(
                    entity_type = %row.entity_type(),
                    external_id = %row.external_id,
                    changed,
                    "Updated target row"
                );
            }
            Transition::Delete {
                entity_type,
                external_id,
            } => {
                if !self.repo.delete(entity_type, &external_id)? {
                    // Deleted by another worker between read and write.
                    return Ok(ApplyOutcome::AlreadyAbsent);
                }
                debug!(%entity_type, %external_id, "Deleted target row");
            }
            Transition::Skip(ApplyOutcome::MappingFailed(ref e)) => {
                warn!(
                    external_id = change.external_id().unwrap_or("-"),
                    error = %e,
                    "Snapshot rejected by mapper"
                );
            }
            Transition::Skip(_) => {}
        }

        Ok(outcome)
    }
}

/// Rows as a dry run would have left them.
///
/// Planned writes shadow the repository, keyed by `(entity_type, external_id)`.
#[derive(Debug, Default)]
pub struct PlannedState {
    rows: HashMap<(EntityType, String), Option<TargetRow>>,
}

impl PlannedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Plan a change on top of earlier planned writes, then record it.
    ///
    /// # Errors
    ///
    /// Returns an error if a row not planned yet cannot be read.
    pub fn plan<R: SyncStateRepository + ?Sized>(
        &mut self,
        repo: &R,
        change: &ChangeRecord,
        now: DateTime<Utc>,
    ) -> SyncResult<Transition> {
        let Some((entity_type, external_id)) = target(change) else {
            return Ok(plan(change, None, now));
        };
        let key = (entity_type, external_id.to_string());
        let current = match self.rows.get(&key) {
            Some(planned) => planned.clone(),
            None => repo.get_by_external_id(entity_type, external_id)?,
        };

        let transition = plan(change, current.as_ref(), now);
        match &transition {
            Transition::Insert(row) | Transition::Update { row, .. } => {
                self.rows.insert(key, Some(row.clone()));
            }
            Transition::Delete { .. } => {
                self.rows.insert(key, None);
            }
            Transition::Skip(_) => {}
        }
        Ok(transition)
    }
}

fn target(change: &ChangeRecord) -> Option<(EntityType, &str)> {
    match change {
        ChangeRecord::Upserted(snapshot) => Some((snapshot.entity_type(), snapshot.external_id())),
        ChangeRecord::Removed {
            entity_type,
            external_id,
        } => Some((*entity_type, external_id)),
        ChangeRecord::Invalid { .. } => None,
    }
}
