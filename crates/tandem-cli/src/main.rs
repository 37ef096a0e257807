//! Tandem CLI - drive a sync session from the terminal
//!
//! Edits go through the optimistic update manager and queue like they would
//! in the app; `tandem sync` pushes and pulls them.

mod cli;
mod commands;
mod config_profiles;
mod error;
mod remote;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::backup::run_backup;
use crate::commands::common::{open_session, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::device::run_device;
use crate::commands::entity::{run_delete, run_get, run_list, run_put};
use crate::commands::queue::run_queue;
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
    if let Ok(directive) = "tandem=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
        Commands::Config { command } => run_config(command, profile),
        command => {
            let db_path = resolve_db_path(cli.db_path)?;
            let session = open_session(&db_path, profile)?;
            match command {
                Commands::Put {
                    entity_type,
                    id,
                    payload,
                } => run_put(&session, entity_type, &id, payload.as_deref()),
                Commands::Delete { entity_type, id } => run_delete(&session, entity_type, &id),
                Commands::Get {
                    entity_type,
                    id,
                    json,
                } => run_get(&session, entity_type, &id, json),
                Commands::List { entity_type, json } => run_list(&session, entity_type, json),
                Commands::Queue { command, all, json } => run_queue(&session, command, all, json),
                Commands::Sync { command } => run_sync(&session, command).await,
                Commands::Device { command } => run_device(&session, command).await,
                Commands::Backup { command } => run_backup(&session, command).await,
                Commands::Completions { .. } | Commands::Config { .. } => Ok(()),
            }
        }
    }
}
