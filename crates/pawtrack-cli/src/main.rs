//! Pawtrack CLI - Command-line interface for pet-care visits
//!
//! Every mutation lands in the local log first and is sent to the server
//! when `PAWTRACK_REMOTE_URL` is configured.

mod cli;
mod commands;
mod error;

use clap::{CommandFactory, Parser};

use crate::cli::{BookingCommand, Cli, Commands, VisitCommand};
use crate::commands::booking::{run_add, run_cancel, run_delete, run_notes, NewBooking};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::list::run_list;
use crate::commands::pending::{run_conflicts, run_discard, run_pending, run_retry};
use crate::commands::sync::run_sync;
use crate::commands::visit::{run_check_in, run_check_out, run_create, run_timer, run_undo};
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

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pawtrack=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Completions { shell, output }) => {
            run_completions(shell, output.as_deref())?;
        }
        Some(command) => {
            let db_path = resolve_db_path(cli.db_path)?;
            run_command(command, &db_path).await?;
        }
        None => {
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

async fn run_command(command: Commands, db_path: &std::path::Path) -> Result<(), CliError> {
    match command {
        Commands::Visit { command } => match command {
            VisitCommand::Create {
                id,
                start,
                end,
                booking,
                sitter,
            } => {
                run_create(
                    id.as_deref(),
                    start,
                    end,
                    booking.as_deref(),
                    sitter.as_deref(),
                    db_path,
                )
                .await
            }
            VisitCommand::CheckIn { id } => run_check_in(&id, db_path).await,
            VisitCommand::CheckOut { id } => run_check_out(&id, db_path).await,
            VisitCommand::Undo { id } => run_undo(&id, db_path).await,
            VisitCommand::Timer { id, watch } => run_timer(&id, watch, db_path).await,
        },
        Commands::Booking { command } => match command {
            BookingCommand::Add {
                id,
                owner,
                pet,
                species,
                service,
                start,
                end,
                sitter,
                notes,
            } => {
                let request = NewBooking {
                    id,
                    owner,
                    pet,
                    species,
                    service: service.into(),
                    start,
                    end,
                    sitter,
                    notes,
                };
                run_add(request, db_path).await
            }
            BookingCommand::Notes { id, text } => run_notes(&id, &text, db_path).await,
            BookingCommand::Cancel { id } => run_cancel(&id, db_path).await,
            BookingCommand::Delete { id } => run_delete(&id, db_path).await,
        },
        Commands::List { target, json } => run_list(target, json, db_path).await,
        Commands::Pending { entity, json } => run_pending(entity.as_deref(), json, db_path).await,
        Commands::Retry { operation_id } => run_retry(&operation_id, db_path).await,
        Commands::Discard { operation_id } => run_discard(&operation_id, db_path).await,
        Commands::Conflicts { json } => run_conflicts(json, db_path).await,
        Commands::Sync => run_sync(db_path).await,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref()),
    }
}
