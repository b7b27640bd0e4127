//! Taskboard CLI
//!
//! Runs the Taskboard real-time sync server.
//!
//! # Commands
//!
//! - `serve` - Accept sync connections on a TCP socket
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::serve::ServeOptions;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Taskboard real-time sync tools.
#[derive(Parser)]
#[command(name = "taskboard")]
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
    /// Run the sync server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        bind: SocketAddr,

        /// Outbound queue capacity per connection
        #[arg(long, default_value = "256")]
        queue_capacity: usize,

        /// Seconds without a heartbeat before a connection is dropped
        #[arg(long, default_value = "30")]
        heartbeat_timeout: u64,

        /// Seconds between maintenance passes
        #[arg(long, default_value = "5")]
        reap_interval: u64,

        /// Milliseconds allowed for one entity store call
        #[arg(long, default_value = "5000")]
        store_timeout_ms: u64,

        /// Hours tombstones are kept after a delete
        #[arg(long, default_value = "24")]
        tombstone_hours: u64,

        /// Days notifications are kept
        #[arg(long, default_value = "30")]
        notification_days: u64,
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
        Commands::Serve {
            bind,
            queue_capacity,
            heartbeat_timeout,
            reap_interval,
            store_timeout_ms,
            tombstone_hours,
            notification_days,
        } => {
            commands::serve::run(ServeOptions {
                bind,
                queue_capacity,
                heartbeat_timeout,
                reap_interval,
                store_timeout_ms,
                tombstone_hours,
                notification_days,
            })?;
        }
        Commands::Version => {
            println!("Taskboard CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
