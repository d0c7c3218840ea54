//! Backup Rotate - Main entry point
//!
//! Takes a yearly, monthly or daily backup of every configured directory and
//! prunes expired archives. Exit status 0 means every target was archived.

use anyhow::{Context, Result};
use backup_rotate::{
    config::Config,
    controller::{run_locked, Controller, RunReport},
    daemon::ShutdownCoordinator,
    store::{ArchiveStore, BorgStore},
    utils, RotateError, Tier,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Back up every target and prune expired archives (default)
    Run,
    /// Show what a run would create and prune, without changing anything
    Plan,
    /// List the archive catalog grouped into batches
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let _ = utils::logger::init(args.log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!(event = "config_error", error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level, &config.log.format) {
        eprintln!("backup-rotate: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match execute(args.command.unwrap_or(Command::Run), config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(
                event = "run_failed",
                error = %format!("{e:#}"),
                "backup-rotate failed"
            );
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<ExitCode> {
    config.validate()?;

    tracing::info!(
        "Starting backup-rotate v{} (host: {}, targets: {})",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.backup.targets.len()
    );

    let store: Arc<dyn ArchiveStore> = Arc::new(BorgStore::new(&config.store));
    let now = config.backup.now();
    let lock_path = config.lock.path.clone();
    let controller = Controller::new(config, store);

    match command {
        Command::Run => run(controller, lock_path, now).await,
        Command::Plan => {
            let plan = tokio::task::spawn_blocking(move || controller.plan(now)).await??;
            println!("tier: {}", plan.tier);
            for archive in &plan.archives {
                println!("create: {archive}");
            }
            for batch in &plan.expired {
                for member in &batch.members {
                    println!("prune:  {member}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let host = controller.config().host.clone();
            let catalog = tokio::task::spawn_blocking(move || controller.catalog()).await??;
            for tier in Tier::ALL {
                for batch in catalog.batches(&host, tier) {
                    println!("{} ({} archives)", batch.key, batch.members.len());
                }
            }
            for raw in catalog.rejected() {
                println!("unrecognised: {raw}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Hold the lock for the whole run. A signal releases it, stops the running
/// archive tool and exits at once; the blocking run is abandoned.
async fn run(
    controller: Controller,
    lock_path: PathBuf,
    now: chrono::NaiveDateTime,
) -> Result<ExitCode> {
    let mut shutdown = ShutdownCoordinator::install().context("failed to install signal handlers")?;

    let report = match run_locked(controller, &lock_path, now, shutdown.wait_for_signal()).await {
        Ok(report) => report,
        Err(e @ RotateError::Interrupted(_)) => {
            tracing::error!(event = "run_interrupted", error = %e, "Run aborted, lock released");
            // The runtime would otherwise wait for the abandoned blocking task.
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    summarize(&report);

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn summarize(report: &RunReport) {
    let failed = report.targets.iter().filter(|t| !t.succeeded()).count();
    let deleted = report.deleted().count();

    if failed == 0 {
        tracing::info!(
            event = "run_complete",
            run_id = %report.run_id,
            tier = %report.tier,
            targets = report.targets.len(),
            deleted,
            delete_failures = report.delete_failures(),
            rejected = report.rejected.len(),
            "Run complete"
        );
    } else {
        tracing::error!(
            event = "run_complete",
            run_id = %report.run_id,
            tier = %report.tier,
            targets = report.targets.len(),
            failed,
            pruning_skipped = report.pruning_skipped,
            "Run finished with failed backups"
        );
    }
}
