//! fieldsync CLI - inspect and drive the offline sync queue
//!
//! Reads the same SQLite store the field client writes, so queued work,
//! dead operations and conflicts can be examined and acted on from a terminal.

mod cli;
mod commands;
mod config_profiles;
mod error;
mod remote;


use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::{load_profile, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::conflicts::run_conflicts;
use crate::commands::queue::run_queue;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "fieldsync=info".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile_name = cli.profile.as_deref();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Config { command } => run_config(command, profile_name),
        command => {
            let profile = load_profile(profile_name)?;
            let db_path = resolve_db_path(cli.db_path, &profile.profile)?;
            match command {
                Commands::Status { json } => run_status(json, &db_path, &profile).await,
                Commands::Sync { json } => run_sync(json, &db_path, &profile).await,
                Commands::Queue { command } => run_queue(command, &db_path, &profile).await,
                Commands::Conflicts { command } => {
                    run_conflicts(command, &db_path, &profile).await
                }
                Commands::Completions { .. } | Commands::Config { .. } => Ok(()),
            }
        }
    }
}
