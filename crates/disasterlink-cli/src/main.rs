//! DisasterLink CLI - raise SOS alerts and queue messages from the terminal
//!
//! Every command works offline against the local ledger; `sync` and `watch`
//! deliver pending changes once the remote authority is reachable.

mod cli;
mod commands;
mod config_profiles;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::alert::run_alert;
use crate::commands::common::resolve_context;
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::conflicts::run_conflicts;
use crate::commands::message::run_message;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::watch::run_watch;
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

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "disasterlink=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Config { command } => run_config(command, cli.profile.as_deref()),
        command => {
            let context = resolve_context(cli.db_path, cli.remote_url, cli.profile.as_deref())?;
            match command {
                Commands::Alert { command } => run_alert(command, &context).await,
                Commands::Message { command } => run_message(command, &context).await,
                Commands::Sync { json } => run_sync(json, &context).await,
                Commands::Conflicts { command } => run_conflicts(command, &context).await,
                Commands::Status { json } => run_status(json, &context).await,
                Commands::Watch { interval } => run_watch(interval, &context).await,
                Commands::Completions { .. } | Commands::Config { .. } => Ok(()),
            }
        }
    }
}
