//! CLI definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::model::EntityType;

pub mod commands;

/// trs-sync - mirror the source teacher records into the records store
#[derive(Parser, Debug)]
#[command(name = "trs-sync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.trs-sync/data/trs-sync.db)
    #[arg(long, global = true, env = "TRS_SYNC_DB")]
    pub db: Option<PathBuf>,

    /// Directory holding <entity>.jsonl feed files (default: ~/.trs-sync/feed)
    #[arg(long, global = true, env = "TRS_SYNC_FEED_DIR")]
    pub feed_dir: Option<PathBuf>,

    /// Settings file (default: ~/.trs-sync/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Actor name for audit trail
    #[arg(long, global = true, env = "TRS_SYNC_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Plan and count transitions without writing to the database
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and apply the schema
    Init {
        /// Reapply the schema to an existing database
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Drain the feed once for one or all entity types
    Run(RunArgs),

    /// Keep draining the feed until interrupted
    Watch {
        #[arg(long, value_enum, default_value_t = EntitySelector::All)]
        entity: EntitySelector,

        /// Seconds between polls (default from settings)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Bulk load, never stopping on invalid records
    Backfill {
        #[arg(long, value_enum)]
        entity: EntitySelector,

        /// Rewind the cursor to the start of the feed first
        #[arg(long)]
        from_start: bool,

        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show cursors, row counts, retries and quarantine
    Status,

    /// Show a mirrored row
    Show {
        #[arg(value_enum)]
        entity: EntityArg,

        /// Source external id
        external_id: String,

        /// Include the row's audit events
        #[arg(long)]
        events: bool,
    },

    /// Records that exhausted their retries
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, value_enum, default_value_t = EntitySelector::All)]
    pub entity: EntitySelector,

    /// Log and count invalid records instead of stopping on them
    #[arg(long)]
    pub ignore_invalid: bool,

    /// Feed window size (default from settings)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Stop after this many windows per entity type
    #[arg(long)]
    pub max_batches: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum QuarantineCommands {
    /// List quarantined records
    List {
        /// Include resolved entries
        #[arg(long)]
        all: bool,
    },

    /// Mark an entry resolved without replaying it
    Resolve {
        id: i64,

        /// Note stored on the audit event
        #[arg(long)]
        comment: Option<String>,
    },

    /// Decode and apply the stored payload again; resolves on success
    Replay { id: i64 },
}

/// A single entity type on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityArg {
    Contact,
    Induction,
}

impl From<EntityArg> for EntityType {
    fn from(arg: EntityArg) -> Self {
        match arg {
            EntityArg::Contact => Self::Contact,
            EntityArg::Induction => Self::Induction,
        }
    }
}

/// One entity type, or all of them in processing order.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntitySelector {
    Contact,
    Induction,
    All,
}

impl EntitySelector {
    #[must_use]
    pub fn entity_types(self) -> Vec<EntityType> {
        match self {
            Self::Contact => vec![EntityType::Contact],
            Self::Induction => vec![EntityType::Induction],
            Self::All => EntityType::ALL.to_vec(),
        }
    }
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Reject a zero window size before it reaches the runner.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for zero.
pub fn positive_batch_size(batch_size: Option<usize>) -> Result<Option<usize>> {
    match batch_size {
        Some(0) => Err(Error::InvalidArgument(
            "--batch-size must be at least 1".to_string(),
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_defaults_to_all_entities() {
        let cli = Cli::try_parse_from(["trs-sync", "run"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.entity, EntitySelector::All);
                assert_eq!(args.entity.entity_types(), EntityType::ALL.to_vec());
                assert!(!args.ignore_invalid);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_show_and_globals() {
        let cli = Cli::try_parse_from([
            "trs-sync", "show", "induction", "I-1", "--json", "--db", "/tmp/x.db",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Show { entity: EntityArg::Induction, .. }
        ));
    }

    #[test]
    fn test_unknown_entity_is_rejected() {
        assert!(Cli::try_parse_from(["trs-sync", "run", "--entity", "account"]).is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        assert!(positive_batch_size(Some(0)).is_err());
        assert_eq!(positive_batch_size(Some(5)).unwrap(), Some(5));
        assert_eq!(positive_batch_size(None).unwrap(), None);
    }
}
