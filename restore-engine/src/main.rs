//! Restore Engine - Main entry point
//!
//! Restores a backup onto this system.

use anyhow::Result;
use clap::Parser;
use restore_engine::restore::{self, RestoreRequest};
use restore_engine::{config::Config, utils};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backup archive address
    address: String,

    /// File holding the archive passphrase
    keyfile: PathBuf,

    /// Restrict the restore (`/path`, `-/path`, `mysql:db[/table]`, `-mysql:db`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    limits: Vec<String>,

    /// Don't restore filesystem
    #[arg(long)]
    skip_files: bool,

    /// Don't restore databases
    #[arg(long)]
    skip_database: bool,

    /// Don't restore new packages
    #[arg(long)]
    skip_packages: bool,

    /// Disable rollback
    #[arg(long)]
    no_rollback: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn run(args: Args) -> Result<()> {
    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting restore-engine v{}", env!("CARGO_PKG_VERSION"));

    let request = RestoreRequest {
        address: args.address,
        keyfile: args.keyfile,
        limits: args.limits,
        skip_files: args.skip_files,
        skip_database: args.skip_database,
        skip_packages: args.skip_packages,
        no_rollback: args.no_rollback,
    };

    let report = restore::restore(&config, &request)?;

    tracing::info!(
        "Restored {} paths ({} overlay errors, {} warnings)",
        report.applied.len(),
        report.overlay_errors.len(),
        report.warnings.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
