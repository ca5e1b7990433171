//! Target rows: the store's mirror of source entities.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntityType, SourceState};

/// Induction outcome vocabulary used by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InductionStatus {
    Exempt,
    Fail,
    FailedInWales,
    InductionExtended,
    InProgress,
    NotYetCompleted,
    Pass,
    PassedInWales,
    RequiredToComplete,
}

impl InductionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exempt => "exempt",
            Self::Fail => "fail",
            Self::FailedInWales => "failed_in_wales",
            Self::InductionExtended => "induction_extended",
            Self::InProgress => "in_progress",
            Self::NotYetCompleted => "not_yet_completed",
            Self::Pass => "pass",
            Self::PassedInWales => "passed_in_wales",
            Self::RequiredToComplete => "required_to_complete",
        }
    }
}

impl std::fmt::Display for InductionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InductionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exempt" => Ok(Self::Exempt),
            "fail" => Ok(Self::Fail),
            "failed_in_wales" => Ok(Self::FailedInWales),
            "induction_extended" => Ok(Self::InductionExtended),
            "in_progress" => Ok(Self::InProgress),
            "not_yet_completed" => Ok(Self::NotYetCompleted),
            "pass" => Ok(Self::Pass),
            "passed_in_wales" => Ok(Self::PassedInWales),
            "required_to_complete" => Ok(Self::RequiredToComplete),
            _ => Err(format!("Unknown induction status: {s}")),
        }
    }
}

/// Business fields of a `persons` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonFields {
    pub trn: Option<String>,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub email_address: Option<String>,
    pub national_insurance_number: Option<String>,
    pub merged_into_external_id: Option<String>,
}

/// Business fields of an `inductions` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InductionFields {
    pub person_external_id: String,
    pub status: InductionStatus,
    pub start_date: Option<NaiveDate>,
    pub completion_date: Option<NaiveDate>,
}

/// Mapper output: the business fields for one target row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum MappedFields {
    #[serde(rename = "contact")]
    Person(PersonFields),
    Induction(InductionFields),
}

impl MappedFields {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Person(_) => EntityType::Contact,
            Self::Induction(_) => EntityType::Induction,
        }
    }
}

/// A row in one of the target tables.
///
/// `first_synced_at` is set once on insert and never overwritten;
/// `last_synced_at` moves forward on every successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRow {
    /// Store-generated key; `None` until the row has been inserted.
    pub id: Option<i64>,
    pub external_id: String,
    pub fields: MappedFields,
    pub source_state: SourceState,
    pub source_created_on: DateTime<Utc>,
    pub source_modified_on: DateTime<Utc>,
    pub first_synced_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    /// Fingerprint of the mirrored content, used to report no-op updates.
    pub content_hash: String,
}

impl TargetRow {
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.fields.entity_type()
    }
}
