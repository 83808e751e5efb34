use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use pawtrack_core::models::ServiceKind;

#[derive(Parser)]
#[command(name = "pawtrack")]
#[command(about = "Track pet-care visits and bookings, online or offline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Schedule, start, and finish visits
    Visit {
        #[command(subcommand)]
        command: VisitCommand,
    },
    /// Manage bookings
    Booking {
        #[command(subcommand)]
        command: BookingCommand,
    },
    /// List visits or bookings as currently reconciled
    List {
        #[arg(value_enum)]
        target: ListTarget,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show operations waiting for the server
    Pending {
        /// Only show operations for this entity
        #[arg(long, value_name = "ID")]
        entity: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-queue an operation the server rejected
    Retry {
        /// Operation ID
        operation_id: String,
    },
    /// Drop an operation the server rejected
    Discard {
        /// Operation ID
        operation_id: String,
    },
    /// Show conflicts resolved by last-writer-wins
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send queued operations and pull the latest documents
    Sync,
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output file path (defaults to stdout)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum VisitCommand {
    /// Schedule a visit
    Create {
        /// Visit ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Scheduled start (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        start: DateTime<Utc>,
        /// Scheduled end (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        end: DateTime<Utc>,
        /// Booking this visit belongs to
        #[arg(long)]
        booking: Option<String>,
        /// Assigned sitter
        #[arg(long)]
        sitter: Option<String>,
    },
    /// Record the start of a visit
    #[command(alias = "start")]
    CheckIn {
        /// Visit ID
        id: String,
    },
    /// Record the end of a visit
    #[command(alias = "finish")]
    CheckOut {
        /// Visit ID
        id: String,
    },
    /// Reverse a check-in
    Undo {
        /// Visit ID
        id: String,
    },
    /// Show the countdown for a visit
    Timer {
        /// Visit ID
        id: String,
        /// Keep printing until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
pub enum BookingCommand {
    /// Request a booking
    #[command(alias = "new")]
    Add {
        /// Booking ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Pet owner
        #[arg(long)]
        owner: String,
        /// Pet name
        #[arg(long)]
        pet: String,
        /// Pet species
        #[arg(long, default_value = "dog")]
        species: String,
        #[arg(long, value_enum, default_value = "walk")]
        service: ServiceArg,
        /// Start time (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        start: DateTime<Utc>,
        /// End time (RFC 3339)
        #[arg(long, value_parser = parse_time)]
        end: DateTime<Utc>,
        #[arg(long)]
        sitter: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Replace the notes of a booking
    Notes {
        /// Booking ID
        id: String,
        /// New notes; empty clears them
        text: Vec<String>,
    },
    /// Cancel a booking
    Cancel {
        /// Booking ID
        id: String,
    },
    /// Delete a booking
    #[command(alias = "rm")]
    Delete {
        /// Booking ID
        id: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ListTarget {
    Visits,
    Bookings,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ServiceArg {
    Walk,
    DropIn,
    Boarding,
    HouseSitting,
}

impl From<ServiceArg> for ServiceKind {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::Walk => Self::Walk,
            ServiceArg::DropIn => Self::DropIn,
            ServiceArg::Boarding => Self::Boarding,
            ServiceArg::HouseSitting => Self::HouseSitting,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| format!("expected an RFC 3339 timestamp: {error}"))
}
