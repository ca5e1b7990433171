//! Show command implementation.

use crate::error::{Error, Result};
use crate::model::{EntityType, MappedFields, TargetRow};
use crate::storage::events::Event;
use crate::sync::SyncStateRepository;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use super::open_storage;

#[derive(Serialize)]
struct ShowOutput<'a> {
    row: &'a TargetRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    events: Option<&'a [Event]>,
}

/// Execute the show command.
///
/// # Errors
///
/// Returns [`Error::RowNotFound`] if nothing is mirrored for the id.
pub fn execute(
    db_path: Option<&PathBuf>,
    entity_type: EntityType,
    external_id: &str,
    with_events: bool,
    json: bool,
) -> Result<()> {
    let storage = open_storage(db_path)?;
    let row = storage
        .get_by_external_id(entity_type, external_id)?
        .ok_or_else(|| Error::RowNotFound {
            entity_type,
            external_id: external_id.to_string(),
        })?;
    let events = if with_events {
        Some(storage.events_for(entity_type, external_id, Some(20))?)
    } else {
        None
    };

    if json {
        let output = ShowOutput {
            row: &row,
            events: events.as_deref(),
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    print_row(&row);
    if let Some(events) = events {
        println!();
        println!("{}", "Events:".blue().bold());
        for event in &events {
            let when = chrono::DateTime::from_timestamp_millis(event.created_at)
                .map_or_else(|| event.created_at.to_string(), |t| t.to_rfc3339());
            println!(
                "  {when}  {:<20} {}",
                event.event_type.as_str(),
                event.actor.dimmed()
            );
        }
    }
    Ok(())
}

fn print_row(row: &TargetRow) {
    println!(
        "{} {}",
        row.entity_type().to_string().bold(),
        row.external_id.bold()
    );

    match &row.fields {
        MappedFields::Person(p) => {
            let name = [Some(p.first_name.as_str()), p.middle_name.as_deref(), Some(p.last_name.as_str())]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            println!("  Name:          {name}");
            print_opt("TRN", p.trn.as_deref());
            print_opt("Date of birth", p.date_of_birth.map(|d| d.to_string()).as_deref());
            print_opt("Email", p.email_address.as_deref());
            print_opt("NI number", p.national_insurance_number.as_deref());
            print_opt("Merged into", p.merged_into_external_id.as_deref());
        }
        MappedFields::Induction(i) => {
            println!("  Person:        {}", i.person_external_id);
            println!("  Status:        {}", i.status);
            print_opt("Start date", i.start_date.map(|d| d.to_string()).as_deref());
            print_opt("Completed", i.completion_date.map(|d| d.to_string()).as_deref());
        }
    }

    println!("  State:         {}", row.source_state);
    println!("  Modified:      {}", row.source_modified_on.to_rfc3339());
    println!(
        "  {}",
        format!(
            "first synced {}, last synced {}",
            row.first_synced_at.to_rfc3339(),
            row.last_synced_at.to_rfc3339()
        )
        .dimmed()
    );
}

fn print_opt(label: &str, value: Option<&str>) {
    if let Some(value) = value {
        println!("  {:<14} {value}", format!("{label}:"));
    }
}
