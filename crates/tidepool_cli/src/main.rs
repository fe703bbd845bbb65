//! Tidepool CLI
//!
//! Command-line tools for inspecting Tidepool documents and sync traffic.
//!
//! # Commands
//!
//! - `diff` - Compute the operations turning one document into another
//! - `apply` - Replay an operation log and print the resulting documents
//! - `fold` - Fold acknowledged operations into baselines
//! - `decode` - Decode a CBOR or JSON protocol frame

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidepool_core::DiffOptions;
use tracing_subscriber::EnvFilter;

/// Tidepool command-line tools.
#[derive(Parser)]
#[command(name = "tidepool")]
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
    /// Compute the operations turning one document into another
    Diff {
        /// Current document (JSON); `null` for a new document
        from: PathBuf,

        /// Desired document (JSON)
        to: PathBuf,

        /// Root object id of the document (collection/documentId)
        #[arg(long, default_value = "docs/doc")]
        oid: String,

        /// Treat missing fields as unchanged instead of removed
        #[arg(long)]
        default_undefined: bool,

        /// Merge objects without identity into the object they replace
        #[arg(long)]
        merge_unknown_objects: bool,

        /// Replace nested objects wholesale instead of merging them
        #[arg(long)]
        replace_sub_objects: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replay an operation log and print the resulting documents
    Apply {
        /// Log file: an array of operations, or `{baselines, operations}`
        log: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Fold acknowledged operations into baselines
    Fold {
        /// Log file: an array of operations, or `{baselines, operations}`
        log: PathBuf,

        /// Global acknowledgement timestamp; older operations are folded
        #[arg(short, long)]
        ack: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a CBOR or JSON protocol frame
    Decode {
        /// Frame file
        frame: PathBuf,

        /// Which side sent the frame (client, server, auto)
        #[arg(short, long, default_value = "auto")]
        side: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: String,
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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Diff {
            from,
            to,
            oid,
            default_undefined,
            merge_unknown_objects,
            replace_sub_objects,
            format,
        } => {
            let options = DiffOptions::default()
                .with_default_undefined(default_undefined)
                .with_merge_unknown_objects(merge_unknown_objects)
                .with_replace_sub_objects(replace_sub_objects);
            commands::diff::run(&from, &to, &oid, &options, &format)?;
        }
        Commands::Apply { log, format } => {
            commands::apply::run(&log, &format)?;
        }
        Commands::Fold { log, ack, format } => {
            commands::fold::run(&log, &ack, &format)?;
        }
        Commands::Decode {
            frame,
            side,
            format,
        } => {
            commands::decode::run(&frame, &side, &format)?;
        }
        Commands::Version => {
            println!("Tidepool CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Tidepool Core v{}", tidepool_core::VERSION);
        }
    }

    Ok(())
}
