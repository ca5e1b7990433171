//! Change record decoder.
//!
//! Turns a raw feed entry into a typed [`ChangeRecord`]. Decoding never
//! fails: anything malformed becomes [`ChangeRecord::Invalid`] carrying a
//! readable reason and, when it can be recovered, the external id.
//!
//! Payloads are JSON objects:
//!
//! ```json
//! {"change":"upsert","id":"C1","createdon":"2024-01-01T09:00:00Z",
//!  "modifiedon":"2024-02-01T09:00:00Z","statecode":0,
//!  "attributes":{"firstname":"Ann","lastname":"Smith"}}
//! ```
//!
//! `change` defaults to `upsert`; a removal only needs `id`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::model::{
    ChangeRecord, ContactAttributes, ContactSnapshot, EntityType, InductionAttributes,
    InductionSnapshot, SnapshotMeta, SourceSnapshot,
};
use crate::sync::feed::RawFeedEntry;

type Attributes = Map<String, Value>;

/// Decode one feed entry.
#[must_use]
pub fn decode(entry: &RawFeedEntry) -> ChangeRecord {
    if let Some(reason) = &entry.unreadable {
        return ChangeRecord::Invalid {
            entity_type: entry.entity_type.clone(),
            external_id: None,
            reason: reason.clone(),
        };
    }

    let parsed: Result<Value, _> = serde_json::from_str(&entry.payload);
    let recovered_id = parsed
        .as_ref()
        .ok()
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let invalid = |reason: String| ChangeRecord::Invalid {
        entity_type: entry.entity_type.clone(),
        external_id: recovered_id.clone(),
        reason,
    };

    let entity_type = match entry.entity_type.parse::<EntityType>() {
        Ok(entity_type) => entity_type,
        Err(_) => {
            return invalid(format!("unsupported entity type '{}'", entry.entity_type));
        }
    };

    let value = match parsed {
        Ok(value) => value,
        Err(e) => return invalid(format!("malformed payload: {e}")),
    };
    let Some(object) = value.as_object() else {
        return invalid("payload is not a JSON object".to_string());
    };

    match decode_object(entity_type, object) {
        Ok(record) => record,
        Err(reason) => invalid(reason),
    }
}

fn decode_object(entity_type: EntityType, object: &Attributes) -> Result<ChangeRecord, String> {
    let external_id = required_text(object, "id")?;

    let change = optional_text(object, "change")?;
    match change.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("upsert") => {}
        Some("remove") => {
            return Ok(ChangeRecord::Removed {
                entity_type,
                external_id,
            });
        }
        Some(other) => return Err(format!("unsupported change kind '{other}'")),
    }

    let meta = SnapshotMeta {
        external_id,
        created_on: required_timestamp(object, "createdon")?,
        modified_on: required_timestamp(object, "modifiedon")?,
        state_code: optional_int(object, "statecode")?
            .ok_or_else(|| "missing field 'statecode'".to_string())?,
    };

    let empty = Attributes::new();
    let attributes = match object.get("attributes") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err("field 'attributes' must be an object".to_string()),
    };

    let snapshot = match entity_type {
        EntityType::Contact => SourceSnapshot::Contact(ContactSnapshot {
            meta,
            attributes: contact_attributes(attributes)?,
        }),
        EntityType::Induction => SourceSnapshot::Induction(InductionSnapshot {
            meta,
            attributes: induction_attributes(attributes)?,
        }),
    };
    Ok(ChangeRecord::Upserted(snapshot))
}

fn contact_attributes(a: &Attributes) -> Result<ContactAttributes, String> {
    Ok(ContactAttributes {
        trn: optional_text(a, "dfeta_trn")?,
        first_name: optional_text(a, "firstname")?,
        middle_name: optional_text(a, "middlename")?,
        last_name: optional_text(a, "lastname")?,
        stated_first_name: optional_text(a, "dfeta_statedfirstname")?,
        stated_middle_name: optional_text(a, "dfeta_statedmiddlename")?,
        stated_last_name: optional_text(a, "dfeta_statedlastname")?,
        birth_date: optional_date(a, "birthdate")?,
        email_address: optional_text(a, "emailaddress1")?,
        national_insurance_number: optional_text(a, "dfeta_ninumber")?,
        merged_into: optional_text(a, "masterid")?,
    })
}

fn induction_attributes(a: &Attributes) -> Result<InductionAttributes, String> {
    Ok(InductionAttributes {
        person_external_id: required_text(a, "dfeta_personid")?,
        status_code: optional_int(a, "dfeta_inductionstatus")?,
        start_date: optional_date(a, "dfeta_startdate")?,
        completion_date: optional_date(a, "dfeta_completiondate")?,
    })
}

/// Missing, null and empty strings are all absent.
fn optional_text(map: &Attributes, key: &str) -> Result<Option<String>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!(
            "field '{key}' must be a string, got {}",
            type_name(other)
        )),
    }
}

fn required_text(map: &Attributes, key: &str) -> Result<String, String> {
    optional_text(map, key)?
        .map(|s| s.trim().to_string())
        .ok_or_else(|| format!("missing field '{key}'"))
}

fn optional_int(map: &Attributes, key: &str) -> Result<Option<i32>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| format!("field '{key}' is not a 32-bit integer: {n}")),
        Some(other) => Err(format!(
            "field '{key}' must be an integer, got {}",
            type_name(other)
        )),
    }
}

fn required_timestamp(map: &Attributes, key: &str) -> Result<DateTime<Utc>, String> {
    let raw = required_text(map, key)?;
    parse_timestamp(&raw).ok_or_else(|| format!("field '{key}' is not an RFC 3339 timestamp: {raw}"))
}

fn optional_date(map: &Attributes, key: &str) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = optional_text(map, key)? else {
        return Ok(None);
    };
    parse_date(&raw)
        .map(Some)
        .ok_or_else(|| format!("field '{key}' is not a date: {raw}"))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC 3339 instant, or a bare `YYYY-MM-DD` taken as UTC midnight.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(raw).or_else(|| {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    })
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(entity_type: &str, payload: &str) -> RawFeedEntry {
        RawFeedEntry::new(1, entity_type, payload)
    }

    fn reason(record: &ChangeRecord) -> &str {
        match record {
            ChangeRecord::Invalid { reason, .. } => reason,
            other => panic!("expected invalid record, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_contact_upsert() {
        let record = decode(&entry(
            "contact",
            r#"{"id":"C1","createdon":"2024-01-01T10:00:00+01:00","modifiedon":"2024-02-01T09:00:00Z",
               "statecode":0,"attributes":{"firstname":"Ann","middlename":"","lastname":"Smith",
               "dfeta_trn":"1234567","birthdate":"1990-07-14T23:00:00Z"}}"#,
        ));

        let ChangeRecord::Upserted(SourceSnapshot::Contact(contact)) = record else {
            panic!("expected contact upsert, got {record:?}");
        };
        assert_eq!(contact.meta.external_id, "C1");
        assert_eq!(
            contact.meta.created_on,
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
        );
        assert_eq!(contact.attributes.first_name.as_deref(), Some("Ann"));
        assert_eq!(contact.attributes.middle_name, None);
        assert_eq!(contact.attributes.trn.as_deref(), Some("1234567"));
        assert_eq!(
            contact.attributes.birth_date,
            Some(Utc.with_ymd_and_hms(1990, 7, 14, 23, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_induction_upsert_with_plain_dates() {
        let record = decode(&entry(
            "induction",
            r#"{"id":"I1","createdon":"2024-01-01T09:00:00Z","modifiedon":"2024-01-01T09:00:00Z",
               "statecode":0,"attributes":{"dfeta_personid":"C1","dfeta_inductionstatus":389040006,
               "dfeta_startdate":"2020-09-01"}}"#,
        ));

        let ChangeRecord::Upserted(SourceSnapshot::Induction(induction)) = record else {
            panic!("expected induction upsert, got {record:?}");
        };
        assert_eq!(induction.attributes.person_external_id, "C1");
        assert_eq!(induction.attributes.status_code, Some(389_040_006));
        assert_eq!(
            induction.attributes.start_date,
            Some(Utc.with_ymd_and_hms(2020, 9, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(induction.attributes.completion_date, None);
    }

    #[test]
    fn test_decode_remove() {
        let record = decode(&entry("contact", r#"{"change":"remove","id":"C1"}"#));
        assert_eq!(
            record,
            ChangeRecord::Removed {
                entity_type: EntityType::Contact,
                external_id: "C1".into(),
            }
        );
    }

    #[test]
    fn test_malformed_json_is_invalid() {
        let record = decode(&entry("contact", "{not json"));
        assert!(reason(&record).starts_with("malformed payload"));
        assert_eq!(record.external_id(), None);
    }

    #[test]
    fn test_unreadable_bytes_are_invalid() {
        let mut bytes = br#"{"id":"C1","createdon":"2024-01-01T09:00:00Z","modifiedon":"2024-01-01T09:00:00Z","statecode":0,"attributes":{"firstname":"An?n","lastname":"Smith"}}"#.to_vec();
        let at = bytes.iter().position(|&b| b == b'?').unwrap();
        bytes[at] = 0xFF;

        let record = decode(&RawFeedEntry::from_bytes(1, "contact", bytes));
        assert!(reason(&record).contains("not valid UTF-8"));
        assert_eq!(record.external_id(), None);
    }

    #[test]
    fn test_unknown_entity_type_keeps_id() {
        let record = decode(&entry("qualification", r#"{"id":"Q1"}"#));
        assert_eq!(reason(&record), "unsupported entity type 'qualification'");
        assert_eq!(record.external_id(), Some("Q1"));
    }

    #[test]
    fn test_missing_id_is_invalid() {
        let record = decode(&entry("contact", r#"{"change":"remove","id":""}"#));
        assert_eq!(reason(&record), "missing field 'id'");
    }

    #[test]
    fn test_unknown_change_kind_is_invalid() {
        let record = decode(&entry("contact", r#"{"change":"merge","id":"C1"}"#));
        assert_eq!(reason(&record), "unsupported change kind 'merge'");
        assert_eq!(record.external_id(), Some("C1"));
    }

    #[test]
    fn test_bad_timestamp_is_invalid() {
        let record = decode(&entry(
            "contact",
            r#"{"id":"C1","createdon":"yesterday","modifiedon":"2024-01-01T09:00:00Z","statecode":0}"#,
        ));
        assert!(reason(&record).contains("createdon"));
    }

    #[test]
    fn test_wrongly_typed_attribute_is_invalid() {
        let record = decode(&entry(
            "contact",
            r#"{"id":"C1","createdon":"2024-01-01T09:00:00Z","modifiedon":"2024-01-01T09:00:00Z",
               "statecode":0,"attributes":{"firstname":42}}"#,
        ));
        assert_eq!(reason(&record), "field 'firstname' must be a string, got number");
    }

    #[test]
    fn test_induction_requires_person() {
        let record = decode(&entry(
            "induction",
            r#"{"id":"I1","createdon":"2024-01-01T09:00:00Z","modifiedon":"2024-01-01T09:00:00Z",
               "statecode":0,"attributes":{"dfeta_inductionstatus":389040006}}"#,
        ));
        assert_eq!(reason(&record), "missing field 'dfeta_personid'");
    }
}
