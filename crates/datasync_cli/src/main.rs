//! Datasync CLI
//!
//! Uploads captured files from an edge device and runs the reference
//! ingestion service.
//!
//! # Commands
//!
//! - `sync` - Watch a capture directory and upload what appears in it
//! - `serve` - Run the ingestion service
//! - `pending` - List files with an upload in flight or interrupted
//! - `inspect` - Show how a file would be uploaded

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Datasync edge upload tools.
#[derive(Parser)]
#[command(name = "datasync")]
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
    /// Upload files from a capture directory until interrupted
    Sync {
        /// Directory scanned for files to upload
        #[arg(long)]
        capture_dir: PathBuf,

        /// Directory for durable progress marks
        #[arg(long)]
        progress_dir: PathBuf,

        /// Part id the data is attributed to
        #[arg(long)]
        part_id: String,

        /// Address of the ingestion service
        #[arg(long)]
        server: SocketAddr,

        /// Seconds between directory scans
        #[arg(long, default_value = "10")]
        interval: u64,

        /// Keep marks from a previous run instead of re-uploading their files
        #[arg(long)]
        block_stale: bool,
    },

    /// Run the ingestion service
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7070")]
        bind: SocketAddr,

        /// Directory received files are stored under
        #[arg(long)]
        store_dir: PathBuf,

        /// Maximum concurrent connections
        #[arg(long, default_value = "256")]
        max_connections: usize,
    },

    /// List paths with a progress mark
    Pending {
        /// Directory holding progress marks
        #[arg(long)]
        progress_dir: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show whether a file is a capture file and what it contains
    Inspect {
        /// File to inspect
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Sync {
            capture_dir,
            progress_dir,
            part_id,
            server,
            interval,
            block_stale,
        } => {
            let options = commands::sync::SyncOptions {
                capture_dir,
                progress_dir,
                part_id,
                server,
                interval: std::time::Duration::from_secs(interval.max(1)),
                block_stale,
            };
            commands::sync::run(options)?;
        }
        Commands::Serve {
            bind,
            store_dir,
            max_connections,
        } => {
            commands::serve::run(bind, &store_dir, max_connections)?;
        }
        Commands::Pending {
            progress_dir,
            format,
        } => {
            commands::pending::run(&progress_dir, &format)?;
        }
        Commands::Inspect { file, format } => {
            commands::inspect::run(&file, &format)?;
        }
    }

    Ok(())
}
