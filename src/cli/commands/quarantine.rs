//! Quarantine command implementations.

use crate::cli::QuarantineCommands;
use crate::error::Result;
use crate::sync::{replay_quarantined, QuarantineEntry};
use chrono::Utc;
use colored::Colorize;
use std::path::PathBuf;

use super::open_storage;

/// Execute quarantine commands.
///
/// # Errors
///
/// Returns an error if the database is missing, the entry does not exist,
/// or a replay write fails.
pub fn execute(
    command: &QuarantineCommands,
    db_path: Option<&PathBuf>,
    actor: &str,
    json: bool,
) -> Result<()> {
    match command {
        QuarantineCommands::List { all } => list(db_path, *all, json),
        QuarantineCommands::Resolve { id, comment } => {
            resolve(db_path, *id, comment.as_deref(), actor, json)
        }
        QuarantineCommands::Replay { id } => replay(db_path, *id, actor, json),
    }
}

fn list(db_path: Option<&PathBuf>, include_resolved: bool, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let entries = storage.list_quarantine(include_resolved)?;

    if json {
        let output = serde_json::json!({
            "count": entries.len(),
            "entries": entries,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{}", "Quarantine is empty.".green());
        return Ok(());
    }

    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn print_entry(entry: &QuarantineEntry) {
    let status = if entry.resolved_at.is_some() {
        "resolved".green()
    } else {
        "open".red()
    };
    println!(
        "[{}] {} {} seq {} {} ({} attempts)",
        entry.id,
        status,
        entry.entity_type,
        entry.sequence,
        entry.external_id.as_deref().unwrap_or("-"),
        entry.attempts
    );
    println!("     {}", entry.reason.dimmed());
}

fn resolve(
    db_path: Option<&PathBuf>,
    id: i64,
    comment: Option<&str>,
    actor: &str,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path)?;
    let changed = storage.resolve_quarantine(id, comment, actor)?;

    if json {
        let output = serde_json::json!({ "id": id, "resolved": true, "changed": changed });
        println!("{}", serde_json::to_string(&output)?);
    } else if changed {
        println!("Resolved quarantine entry {id}");
    } else {
        println!("Quarantine entry {id} was already resolved");
    }
    Ok(())
}

fn replay(db_path: Option<&PathBuf>, id: i64, actor: &str, json: bool) -> Result<()> {
    let mut storage = open_storage(db_path)?.with_actor(actor);
    let report = replay_quarantined(&mut storage, id, Utc::now(), actor)?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else if report.resolved {
        println!("Replayed entry {id}: {} (resolved)", report.outcome);
    } else {
        println!(
            "Replayed entry {id}: {} ({})",
            report.outcome.yellow(),
            report.reason.as_deref().unwrap_or("still failing")
        );
    }
    Ok(())
}
