//! Sync command implementations (run, watch, backfill).
//!
//! Each pass opens its own store and cursor connections, drains the feed
//! for the selected entity types in order, and prints one `BatchResult`
//! per entity type. Fatal stops are reported and then surfaced as
//! [`Error::RunStopped`] so the exit code reflects them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tracing::info;

use crate::cli::{positive_batch_size, EntitySelector, RunArgs};
use crate::config::{default_actor, load_settings, resolve_feed_dir, SyncSettings};
use crate::error::{Error, Result};
use crate::model::EntityType;
use crate::storage::SqliteStorage;
use crate::sync::{
    BatchResult, BatchRunner, CancellationToken, CursorLocks, CursorStore, JsonlFeed,
    MemoryCursorStore, SqliteCursorStore, SyncOptions,
};

use super::existing_db_path;

/// Everything a sync pass needs, resolved once from flags, env and settings.
#[derive(Debug, Clone)]
pub struct SyncEnv {
    pub db_path: PathBuf,
    pub feed_dir: PathBuf,
    pub settings: SyncSettings,
    pub actor: String,
}

impl SyncEnv {
    /// Resolve paths, actor and settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] if the database is missing, or
    /// [`Error::Config`] for unusable settings.
    pub fn resolve(
        db_path: Option<&PathBuf>,
        feed_dir: Option<&PathBuf>,
        config: Option<&PathBuf>,
        actor: Option<&str>,
    ) -> Result<Self> {
        let db_path = existing_db_path(db_path)?;
        let feed_dir = resolve_feed_dir(feed_dir.map(PathBuf::as_path))
            .ok_or_else(|| Error::Config("Could not determine feed directory".to_string()))?;
        let settings = load_settings(config.map(PathBuf::as_path))?;
        let actor = actor.map_or_else(default_actor, str::to_string);

        Ok(Self {
            db_path,
            feed_dir,
            settings,
            actor,
        })
    }
}

/// Execute `run`: drain the feed once.
///
/// # Errors
///
/// Returns an error if a run fails or stops on a batch-fatal condition.
pub fn execute_run(args: &RunArgs, env: &SyncEnv, dry_run: bool, json: bool) -> Result<()> {
    let mut options = env.settings.to_options();
    if let Some(batch_size) = positive_batch_size(args.batch_size)? {
        options.batch_size = batch_size;
    }
    options.ignore_invalid = args.ignore_invalid;
    options.dry_run = dry_run;

    let cursors = SqliteCursorStore::open(&env.db_path, &env.actor)?;
    let results = drain(
        env,
        &Workers::new(env),
        &cursors,
        &args.entity.entity_types(),
        options,
        args.max_batches,
        &CancellationToken::new(),
    )?;

    report(&results, json)?;
    fail_on_fatal_stop(&results)
}

/// Execute `backfill`: bulk load with invalid records never stopping the run.
///
/// With `from_start`, the cursor is rewound first. In a dry run the stored
/// cursor is left alone and the preview starts from the beginning instead.
///
/// # Errors
///
/// Returns an error if the cursor cannot be reset or the run fails.
pub fn execute_backfill(
    entity: EntitySelector,
    from_start: bool,
    batch_size: Option<usize>,
    env: &SyncEnv,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let mut options = env.settings.to_options();
    if let Some(batch_size) = positive_batch_size(batch_size)? {
        options.batch_size = batch_size;
    }
    options.ignore_invalid = true;
    options.dry_run = dry_run;

    let entity_types = entity.entity_types();
    let stored = SqliteCursorStore::open(&env.db_path, &env.actor)?;
    let preview_from_start = MemoryCursorStore::new();

    let cursors: &dyn CursorStore = if from_start && dry_run {
        &preview_from_start
    } else {
        if from_start {
            for &entity_type in &entity_types {
                let previous = stored.reset_cursor(entity_type)?;
                info!(%entity_type, previous = previous.position(), "Cursor rewound for backfill");
                if !json {
                    println!("Rewound {entity_type} cursor from {previous} to 0");
                }
            }
        }
        &stored
    };

    let results = drain(
        env,
        &Workers::new(env),
        cursors,
        &entity_types,
        options,
        None,
        &CancellationToken::new(),
    )?;

    report(&results, json)?;
    fail_on_fatal_stop(&results)
}

/// Execute `watch`: drain, sleep, repeat until Ctrl-C.
///
/// The interrupt is honoured between records; the cursor is left after the
/// last record that was fully applied.
///
/// # Errors
///
/// Returns an error if a pass fails or stops on a batch-fatal condition.
pub fn execute_watch(
    entity: EntitySelector,
    interval: Option<u64>,
    env: &SyncEnv,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))?;

    let mut options = env.settings.to_options();
    options.dry_run = dry_run;
    let interval = interval.map_or_else(|| env.settings.poll_interval(), |s| Duration::from_secs(s.max(1)));

    rt.block_on(watch_loop(
        env.clone(),
        entity.entity_types(),
        options,
        interval,
        json,
    ))
}

async fn watch_loop(
    env: SyncEnv,
    entity_types: Vec<EntityType>,
    options: SyncOptions,
    interval: Duration,
    json: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let workers = Workers::new(&env);
    info!(
        interval_secs = interval.as_secs(),
        feed_dir = %env.feed_dir.display(),
        "Watching feed"
    );

    loop {
        let pass_env = env.clone();
        let pass_types = entity_types.clone();
        let pass_cancel = cancel.clone();
        let pass_workers = workers.clone();
        let mut handle = tokio::task::spawn_blocking(move || -> Result<Vec<BatchResult>> {
            let cursors = SqliteCursorStore::open(&pass_env.db_path, &pass_env.actor)?;
            drain(&pass_env, &pass_workers, &cursors, &pass_types, options, None, &pass_cancel)
        });

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = tokio::signal::ctrl_c() => None,
        };
        let joined = match joined {
            Some(joined) => joined,
            None => {
                info!("Interrupt received, stopping after the current record");
                cancel.cancel();
                handle.await
            }
        };
        let results = joined.map_err(|e| Error::Other(format!("Sync worker failed: {e}")))??;

        report(&results, json)?;
        fail_on_fatal_stop(&results)?;

        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received while idle");
                break;
            }
        }
    }

    Ok(())
}

/// Feed reader and cursor locks shared by every pass in this process.
///
/// The locks serialize runners in-process; the compare-and-swap in the
/// cursor store catches a second process.
#[derive(Debug, Clone)]
struct Workers {
    feed: Arc<JsonlFeed>,
    locks: Arc<CursorLocks>,
}

impl Workers {
    fn new(env: &SyncEnv) -> Self {
        Self {
            feed: Arc::new(JsonlFeed::new(&env.feed_dir)),
            locks: Arc::new(CursorLocks::new()),
        }
    }
}

/// Run each entity type until idle, in order, stopping early on cancellation.
fn drain(
    env: &SyncEnv,
    workers: &Workers,
    cursors: &dyn CursorStore,
    entity_types: &[EntityType],
    options: SyncOptions,
    max_batches: Option<usize>,
    cancel: &CancellationToken,
) -> Result<Vec<BatchResult>> {
    let mut storage = SqliteStorage::open(&env.db_path)?.with_actor(&env.actor);

    let mut results = Vec::with_capacity(entity_types.len());
    for &entity_type in entity_types {
        if cancel.is_cancelled() {
            break;
        }
        let mut runner = BatchRunner::new(workers.feed.as_ref(), &mut storage, cursors, options)
            .with_locks(Arc::clone(&workers.locks))
            .with_cancellation(cancel.clone());
        results.push(runner.run_until_idle(entity_type, max_batches)?);
    }
    Ok(results)
}

fn fail_on_fatal_stop(results: &[BatchResult]) -> Result<()> {
    match results.iter().find(|r| r.stop.is_fatal()) {
        Some(result) => Err(Error::RunStopped(format!(
            "{}: {}",
            result.entity_type, result.stop
        ))),
        None => Ok(()),
    }
}

fn report(results: &[BatchResult], json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({ "results": results });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    for result in results {
        print_result(result);
    }
    Ok(())
}

fn print_result(result: &BatchResult) {
    let title = if result.dry_run {
        format!("{} (dry run)", result.entity_type)
    } else {
        result.entity_type.to_string()
    };
    println!("{}", title.bold());
    println!(
        "  Cursor:      {} -> {} ({} batches)",
        result.cursor_before, result.cursor_after, result.batches
    );
    println!(
        "  Applied:     {} (created {}, updated {}, deleted {}, already absent {})",
        result.applied, result.created, result.updated, result.deleted, result.already_absent
    );
    if result.unchanged > 0 || result.stale > 0 {
        println!(
            "  {}",
            format!(
                "{} updates unchanged, {} stale",
                result.unchanged, result.stale
            )
            .dimmed()
        );
    }
    if result.invalid > 0 {
        println!("  {}     {}", "Invalid:".yellow(), result.invalid);
    }
    if result.failed > 0 {
        println!(
            "  {}      {} ({} quarantined)",
            "Failed:".red(),
            result.failed,
            result.quarantined
        );
    }
    if result.deferred > 0 {
        println!("  {}    {}", "Deferred:".yellow(), result.deferred);
    }

    let stop = result.stop.to_string();
    if result.stop.is_fatal() {
        println!("  Stopped:     {}", stop.red().bold());
    } else {
        println!("  Stopped:     {stop}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::StopReason;
    use std::fs;
    use tempfile::TempDir;

    fn env_in(temp_dir: &TempDir) -> SyncEnv {
        let db_path = temp_dir.path().join("trs.db");
        SqliteStorage::open(&db_path).unwrap();
        let feed_dir = temp_dir.path().join("feed");
        fs::create_dir_all(&feed_dir).unwrap();
        SyncEnv {
            db_path,
            feed_dir,
            settings: SyncSettings::default(),
            actor: "test".to_string(),
        }
    }

    const CONTACT: &str = r#"{"change":"upsert","id":"C1","createdon":"2024-01-01T09:00:00Z","modifiedon":"2024-02-01T09:00:00Z","statecode":0,"attributes":{"firstname":"Ann","lastname":"Smith"}}"#;

    #[test]
    fn test_drain_applies_feed_and_stores_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let env = env_in(&temp_dir);
        fs::write(env.feed_dir.join("contact.jsonl"), format!("{CONTACT}\nnot json\n")).unwrap();

        let cursors = SqliteCursorStore::open(&env.db_path, &env.actor).unwrap();
        let results = drain(
            &env,
            &Workers::new(&env),
            &cursors,
            &EntityType::ALL,
            env.settings.to_options(),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].created, 1);
        assert_eq!(results[0].invalid, 1);
        assert_eq!(results[1].total_processed(), 0);
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap().position(), 2);
        assert!(fail_on_fatal_stop(&results).is_ok());
    }

    #[test]
    fn test_cancelled_drain_skips_remaining_entity_types() {
        let temp_dir = TempDir::new().unwrap();
        let env = env_in(&temp_dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = drain(
            &env,
            &Workers::new(&env),
            &MemoryCursorStore::new(),
            &EntityType::ALL,
            env.settings.to_options(),
            None,
            &cancel,
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_overlapping_drains_share_cursor_locks() {
        let temp_dir = TempDir::new().unwrap();
        let env = env_in(&temp_dir);
        let feed: String = (1..=20)
            .map(|n| format!("{}\n", CONTACT.replace("\"C1\"", &format!("\"C{n}\""))))
            .collect();
        fs::write(env.feed_dir.join("contact.jsonl"), feed).unwrap();

        let workers = Workers::new(&env);
        let mut options = env.settings.to_options();
        options.batch_size = 3;

        let created: usize = std::thread::scope(|scope| {
            let passes: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        let cursors = SqliteCursorStore::open(&env.db_path, &env.actor).unwrap();
                        drain(
                            &env,
                            &workers,
                            &cursors,
                            &[EntityType::Contact],
                            options,
                            None,
                            &CancellationToken::new(),
                        )
                        .unwrap()
                    })
                })
                .collect();
            passes
                .into_iter()
                .flat_map(|pass| pass.join().unwrap())
                .map(|result| result.created)
                .sum()
        });

        assert_eq!(created, 20);
        let cursors = SqliteCursorStore::open(&env.db_path, &env.actor).unwrap();
        assert_eq!(cursors.load_cursor(EntityType::Contact).unwrap().position(), 20);
    }

    #[test]
    fn test_fatal_stop_becomes_run_stopped() {
        let mut result = BatchResult::new(EntityType::Induction, crate::sync::FeedCursor(0));
        result.stop = StopReason::MappingError { sequence: 4 };

        let err = fail_on_fatal_stop(&[result]).unwrap_err();
        assert!(matches!(err, Error::RunStopped(_)));
        assert_eq!(err.exit_code(), 6);
        assert!(err.to_string().contains("mapping error at sequence 4"));
    }
}
