//! RowSync CLI
//!
//! Command-line tools for inspecting how a mirrored table reconciles.
//!
//! # Commands
//!
//! - `replay` - Load seed rows, apply a push event log, print the mirror
//! - `identity` - Print the identity of a row
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// RowSync command-line tools.
#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a push event log against seeded rows
    Replay {
        /// Primary-key columns, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        key: Vec<String>,

        /// JSON array of rows held by the remote before loading
        #[arg(short, long)]
        seed: PathBuf,

        /// Push payloads, one JSON event per line
        #[arg(short, long)]
        events: PathBuf,

        /// Relevance condition as column:op:value (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Remote prefilter as column=value
        #[arg(long)]
        prefilter: Option<String>,

        /// Rows per page during the initial load
        #[arg(long, default_value_t = rowsync_engine::DEFAULT_PAGE_SIZE)]
        page_size: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the identity of a row
    Identity {
        /// Primary-key columns, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        key: Vec<String>,

        /// The row as a JSON object
        row: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            key,
            seed,
            events,
            filters,
            prefilter,
            page_size,
            format,
        } => {
            let options = commands::replay::ReplayOptions {
                key,
                filters,
                prefilter,
                page_size,
            };
            let report = commands::replay::run(&seed, &events, &options)?;
            commands::replay::print(&report, &format)?;
        }
        Commands::Identity { key, row } => {
            println!("{}", commands::identity::run(&key, &row)?);
        }
        Commands::Version => {
            println!("RowSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
