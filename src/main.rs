//! trs-sync CLI entry point.

use clap::Parser;
use std::process::ExitCode;
use trs_sync::cli::commands;
use trs_sync::cli::commands::sync::SyncEnv;
use trs_sync::cli::{Cli, Commands};
use trs_sync::config::default_actor;
use trs_sync::error::Error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Logs go to stderr so stdout stays parseable.
    init_tracing(cli.verbose, cli.quiet);

    // Pipes and schedulers get JSON without asking for it.
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // RUST_LOG wins over -v.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let actor = cli.actor.clone().unwrap_or_else(default_actor);
    let sync_env = || {
        SyncEnv::resolve(
            cli.db.as_ref(),
            cli.feed_dir.as_ref(),
            cli.config.as_ref(),
            Some(actor.as_str()),
        )
    };

    match &cli.command {
        Commands::Init { force } => {
            commands::init::execute(cli.db.as_ref(), cli.feed_dir.as_ref(), *force, json)
        }
        Commands::Version => commands::version::execute(json),

        // Sync passes
        Commands::Run(args) => commands::sync::execute_run(args, &sync_env()?, cli.dry_run, json),
        Commands::Watch { entity, interval } => {
            commands::sync::execute_watch(*entity, *interval, &sync_env()?, cli.dry_run, json)
        }
        Commands::Backfill {
            entity,
            from_start,
            batch_size,
        } => commands::sync::execute_backfill(
            *entity,
            *from_start,
            *batch_size,
            &sync_env()?,
            cli.dry_run,
            json,
        ),

        // Inspection
        Commands::Status => commands::status::execute(cli.db.as_ref(), json),
        Commands::Show {
            entity,
            external_id,
            events,
        } => commands::show::execute(cli.db.as_ref(), (*entity).into(), external_id, *events, json),

        Commands::Quarantine { command } => {
            commands::quarantine::execute(command, cli.db.as_ref(), &actor, json)
        }

        // Shell completions
        Commands::Completions { shell } => commands::completions::execute(shell),
    }
}
