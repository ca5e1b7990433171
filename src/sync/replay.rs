//! Replaying quarantined records.
//!
//! A quarantined record keeps its raw feed payload. Once the cause is
//! fixed, replay decodes that payload again and applies it outside the
//! feed; the cursor has already moved past it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use crate::sync::decode::decode;
use crate::sync::feed::RawFeedEntry;
use crate::sync::orchestrator::Orchestrator;
use crate::sync::types::ApplyOutcome;

/// What a replay did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub id: i64,
    pub outcome: &'static str,
    /// Set when the entry was marked resolved.
    pub resolved: bool,
    /// Why the record still cannot be applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decode and apply a quarantined record, resolving it on success.
///
/// An entry that was already resolved is replayed anyway; replay is
/// idempotent because apply is.
///
/// # Errors
///
/// Returns [`Error::QuarantineNotFound`] for an unknown id, or a sync
/// error if the store rejects the write.
pub fn replay_quarantined(
    storage: &mut SqliteStorage,
    id: i64,
    now: DateTime<Utc>,
    actor: &str,
) -> Result<ReplayReport> {
    let entry = storage
        .get_quarantine(id)?
        .ok_or(Error::QuarantineNotFound { id })?;

    let change = decode(&RawFeedEntry::new(
        entry.sequence,
        entry.entity_type.as_str(),
        entry.payload.clone(),
    ));
    let outcome = Orchestrator::new(storage).apply(&change, now)?;

    let reason = match &outcome {
        ApplyOutcome::Invalid { reason } => Some(reason.clone()),
        ApplyOutcome::MappingFailed(err) => Some(err.to_string()),
        _ => None,
    };

    let resolved = if outcome.is_applied() {
        storage.resolve_quarantine(id, Some("replayed"), actor)?;
        info!(id, entity_type = %entry.entity_type, sequence = entry.sequence, outcome = outcome.label(), "Replayed quarantined record");
        true
    } else {
        warn!(id, entity_type = %entry.entity_type, sequence = entry.sequence, reason = ?reason, "Quarantined record still fails");
        false
    };

    Ok(ReplayReport {
        id,
        outcome: outcome.label(),
        resolved,
        reason,
    })
}
