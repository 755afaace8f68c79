//! roomsync CLI - composition root for the room sync engine
//!
//! Builds one `SyncService` per process and exposes its operations from the
//! terminal. `serve` keeps the process alive with the maintenance loops.

mod cli;
mod commands;
mod error;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::open_service;
use crate::commands::completions::run_completions;
use crate::commands::serve::run_serve;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::usage::{run_quota, run_usage};
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
    if let Ok(directive) = "roomsync=info".parse::<Directive>() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let service = open_service(cli.db_path).await?;
    let result = match cli.command {
        Commands::Sync {
            kind,
            id,
            force,
            priority,
            no_wait,
        } => run_sync(&service, kind.key(id), force, priority.into(), !no_wait).await,
        Commands::Status { kind, id, json } => run_status(&service, kind.key(id), json),
        Commands::Usage { json } => run_usage(&service, json),
        Commands::Quota { json } => run_quota(&service, json),
        Commands::Serve {
            watch,
            watch_interval_secs,
        } => {
            let period = Duration::from_secs(watch_interval_secs);
            return run_serve(service, watch, period).await;
        }
        Commands::Completions { .. } => Ok(()),
    };

    service.shutdown().await;
    result
}
