//! FieldSync CLI
//!
//! Operator tools for inspecting and maintaining a FieldSync store file
//! while the app that owns it is not running.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and health
//! - `cache` - List cached entities and their freshness
//! - `outbox` - List queued writes
//! - `retry` / `discard` - Resolve an abandoned write
//! - `verify` - Check the log for torn or corrupted records
//! - `compact` - Rewrite the log to reclaim space

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FieldSync command-line store tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format shared by the listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Outbox status filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    /// Waiting for delivery (including in flight)
    Pending,
    /// Abandoned, awaiting a decision
    Failed,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and health
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List cached entities
    Cache {
        /// Only show this entity kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List queued writes
    Outbox {
        /// Only show operations with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Put a failed write back in the queue
    Retry {
        /// Operation id
        id: String,
    },

    /// Drop a failed write for good
    Discard {
        /// Operation id
        id: String,
    },

    /// Verify log integrity
    Verify,

    /// Compact the log to reclaim space
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Cache { kind, format } => {
            let path = cli.path.ok_or("Store path required for cache")?;
            commands::cache::run(&path, kind.as_deref(), format)?;
        }
        Commands::Outbox { status, format } => {
            let path = cli.path.ok_or("Store path required for outbox")?;
            commands::outbox::list(&path, status, format)?;
        }
        Commands::Retry { id } => {
            let path = cli.path.ok_or("Store path required for retry")?;
            commands::outbox::retry(&path, &id)?;
        }
        Commands::Discard { id } => {
            let path = cli.path.ok_or("Store path required for discard")?;
            commands::outbox::discard(&path, &id)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("FieldSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("FieldSync Core v{}", fieldsync_core::VERSION);
        }
    }

    Ok(())
}
