//! Entity mapper: typed source snapshots to target row fields.
//!
//! Pure and deterministic. Handles the translation rules the source's
//! schema forces on us:
//!
//! - stated names win over primary names, field by field
//! - date-only attributes arrive as instants that may sit an hour before
//!   midnight; they are rounded to the nearest UTC midnight
//! - numeric state codes and induction option-set values are translated
//!   with no default, so an unknown code is a mapping error

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::model::{
    ContactSnapshot, InductionFields, InductionSnapshot, InductionStatus, MappedFields,
    PersonFields, SourceSnapshot, SourceState,
};

/// Base value of the source's induction status option set.
const INDUCTION_STATUS_BASE: i32 = 389_040_000;

/// A snapshot that cannot be mirrored as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Unknown state code: {0}")]
    UnknownStateCode(i32),

    #[error("Unknown induction status: {0}")]
    UnknownInductionStatus(i32),

    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("{0}")]
    BusinessRule(String),
}

/// Mapper output for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapped {
    pub fields: MappedFields,
    pub source_state: SourceState,
}

/// Map a snapshot to target fields.
///
/// # Errors
///
/// Returns a [`MappingError`] when a code has no translation, a required
/// field is absent, or a business rule is violated.
pub fn map(snapshot: &SourceSnapshot) -> Result<Mapped, MappingError> {
    let source_state = translate_state(snapshot.meta().state_code)?;
    let fields = match snapshot {
        SourceSnapshot::Contact(contact) => MappedFields::Person(map_contact(contact)?),
        SourceSnapshot::Induction(induction) => {
            MappedFields::Induction(map_induction(induction)?)
        }
    };
    Ok(Mapped {
        fields,
        source_state,
    })
}

/// Translate the source's numeric state code.
///
/// # Errors
///
/// Returns [`MappingError::UnknownStateCode`] for anything but 0, 1 or 2.
pub fn translate_state(code: i32) -> Result<SourceState, MappingError> {
    match code {
        0 => Ok(SourceState::Active),
        1 => Ok(SourceState::Inactive),
        2 => Ok(SourceState::Merged),
        other => Err(MappingError::UnknownStateCode(other)),
    }
}

/// Translate an induction status option-set value.
///
/// # Errors
///
/// Returns [`MappingError::UnknownInductionStatus`] outside the known range.
pub fn translate_induction_status(code: i32) -> Result<InductionStatus, MappingError> {
    let status = match code.checked_sub(INDUCTION_STATUS_BASE) {
        Some(0) => InductionStatus::Exempt,
        Some(1) => InductionStatus::Fail,
        Some(2) => InductionStatus::FailedInWales,
        Some(3) => InductionStatus::InductionExtended,
        Some(4) => InductionStatus::InProgress,
        Some(5) => InductionStatus::NotYetCompleted,
        Some(6) => InductionStatus::Pass,
        Some(7) => InductionStatus::PassedInWales,
        Some(8) => InductionStatus::RequiredToComplete,
        _ => return Err(MappingError::UnknownInductionStatus(code)),
    };
    Ok(status)
}

/// Recover the calendar date from a date-only value carried as an instant.
///
/// The source stores local midnight, so a date in British Summer Time
/// arrives as 23:00Z on the previous day. Rounding to the nearest UTC
/// midnight yields the intended date in both cases.
#[must_use]
pub fn correct_date(instant: DateTime<Utc>) -> NaiveDate {
    (instant + Duration::hours(12)).date_naive()
}

/// Stated value if non-blank, else the primary value if non-blank.
fn resolve_name(stated: Option<&str>, primary: Option<&str>) -> Option<String> {
    clean(stated).or_else(|| clean(primary))
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn map_contact(contact: &ContactSnapshot) -> Result<PersonFields, MappingError> {
    let a = &contact.attributes;

    let first_name = resolve_name(a.stated_first_name.as_deref(), a.first_name.as_deref())
        .ok_or(MappingError::MissingField {
            field: "first_name",
        })?;
    let middle_name = resolve_name(a.stated_middle_name.as_deref(), a.middle_name.as_deref());
    let last_name = resolve_name(a.stated_last_name.as_deref(), a.last_name.as_deref())
        .ok_or(MappingError::MissingField { field: "last_name" })?;

    let trn = clean(a.trn.as_deref());
    if let Some(trn) = &trn {
        if trn.len() != 7 || !trn.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MappingError::InvalidField {
                field: "trn",
                message: format!("expected 7 digits, got '{trn}'"),
            });
        }
    }

    Ok(PersonFields {
        trn,
        first_name,
        middle_name,
        last_name,
        date_of_birth: a.birth_date.map(correct_date),
        email_address: clean(a.email_address.as_deref()),
        national_insurance_number: clean(a.national_insurance_number.as_deref())
            .map(|ni| ni.to_ascii_uppercase()),
        merged_into_external_id: clean(a.merged_into.as_deref()),
    })
}

fn map_induction(induction: &InductionSnapshot) -> Result<InductionFields, MappingError> {
    let a = &induction.attributes;

    let person_external_id =
        clean(Some(&a.person_external_id)).ok_or(MappingError::MissingField {
            field: "person_external_id",
        })?;
    let status = a
        .status_code
        .ok_or(MappingError::MissingField { field: "status" })
        .and_then(translate_induction_status)?;
    let start_date = a.start_date.map(correct_date);
    let completion_date = a.completion_date.map(correct_date);

    if let (Some(start), Some(completed)) = (start_date, completion_date) {
        if completed < start {
            return Err(MappingError::BusinessRule(format!(
                "completion date {completed} precedes start date {start}"
            )));
        }
    }

    Ok(InductionFields {
        person_external_id,
        status,
        start_date,
        completion_date,
    })
}
