//! Source entity snapshots and the change records built from them.
//!
//! Snapshots are typed per entity type. The decoder is the only place that
//! sees the raw JSON field bag; everything downstream works on these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityType;

/// Attributes every source snapshot carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Stable identifier assigned by the source. Never changes.
    pub external_id: String,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    /// Raw numeric state code, translated by the mapper.
    pub state_code: i32,
}

/// A teacher as the source describes them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactAttributes {
    pub trn: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub stated_first_name: Option<String>,
    pub stated_middle_name: Option<String>,
    pub stated_last_name: Option<String>,
    /// Date-only value carried as an instant. May be shifted by a historical
    /// timezone offset; see the mapper.
    pub birth_date: Option<DateTime<Utc>>,
    pub email_address: Option<String>,
    pub national_insurance_number: Option<String>,
    /// External id of the record this contact was merged into.
    pub merged_into: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub meta: SnapshotMeta,
    pub attributes: ContactAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InductionAttributes {
    /// External id of the contact this induction belongs to.
    pub person_external_id: String,
    pub status_code: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InductionSnapshot {
    pub meta: SnapshotMeta,
    pub attributes: InductionAttributes,
}

/// A versioned record from the source, one variant per entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum SourceSnapshot {
    Contact(ContactSnapshot),
    Induction(InductionSnapshot),
}

impl SourceSnapshot {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Contact(_) => EntityType::Contact,
            Self::Induction(_) => EntityType::Induction,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &SnapshotMeta {
        match self {
            Self::Contact(c) => &c.meta,
            Self::Induction(i) => &i.meta,
        }
    }

    #[must_use]
    pub fn external_id(&self) -> &str {
        &self.meta().external_id
    }
}

/// One decoded feed entry.
///
/// Consumed exactly once by the orchestrator, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// The source created or changed an entity; carries its full snapshot.
    Upserted(SourceSnapshot),
    /// The source deleted an entity.
    Removed {
        entity_type: EntityType,
        external_id: String,
    },
    /// The feed entry could not be decoded.
    Invalid {
        /// Discriminator exactly as delivered, which may not be a known type.
        entity_type: String,
        /// Present when the id could still be recovered from the payload.
        external_id: Option<String>,
        reason: String,
    },
}

impl ChangeRecord {
    /// External id this change targets, if known.
    #[must_use]
    pub fn external_id(&self) -> Option<&str> {
        match self {
            Self::Upserted(snapshot) => Some(snapshot.external_id()),
            Self::Removed { external_id, .. } => Some(external_id),
            Self::Invalid { external_id, .. } => external_id.as_deref(),
        }
    }

    /// Short label for logs and dry-run output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Upserted(_) => "upserted",
            Self::Removed { .. } => "removed",
            Self::Invalid { .. } => "invalid",
        }
    }
}
