//! Content hashing for target rows.
//!
//! A SHA-256 fingerprint of everything a row mirrors from the source. The
//! orchestrator compares fingerprints to report whether an update actually
//! changed content; the audit trail records old and new fingerprints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{MappedFields, SourceState};

/// Compute a SHA-256 hash of a serializable value.
///
/// # Panics
///
/// Panics if the value cannot be serialized to JSON. Row content is plain
/// data with string keys, so this does not happen.
#[must_use]
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).expect("serialization should not fail");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Serialize)]
struct RowContent<'a> {
    fields: &'a MappedFields,
    source_state: SourceState,
    source_created_on: i64,
    source_modified_on: i64,
}

/// Fingerprint of a row's mirrored content.
///
/// Sync bookkeeping (`id`, `first_synced_at`, `last_synced_at`) is left out
/// so replaying the same snapshot always yields the same hash.
#[must_use]
pub fn row_hash(
    fields: &MappedFields,
    source_state: SourceState,
    source_created_on: DateTime<Utc>,
    source_modified_on: DateTime<Utc>,
) -> String {
    content_hash(&RowContent {
        fields,
        source_state,
        source_created_on: source_created_on.timestamp_millis(),
        source_modified_on: source_modified_on.timestamp_millis(),
    })
}

/// True when there is no stored hash or it differs from the current one.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}
