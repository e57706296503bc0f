//! DriftKV CLI
//!
//! Opens a database directory locally, runs one command and closes it.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use driftkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// DriftKV CLI
#[derive(Parser, Debug)]
#[command(name = "driftkv-cli")]
#[command(about = "Local admin tool for a DriftKV database")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./driftkv_data")]
    data_dir: String,

    /// Data segment size in MB (must match the size the database was created with)
    #[arg(long, default_value = "32")]
    max_file_mb: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// Print engine counters
    Stats,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,driftkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .max_file_size(args.max_file_mb * 1024 * 1024)
        .build();

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = run(&engine, args.command);
    let closed = engine.close();

    match (outcome, closed) {
        (Ok(()), Ok(())) => ExitCode::SUCCESS,
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(engine: &Engine, command: Commands) -> driftkv::Result<()> {
    match command {
        Commands::Get { key } => {
            let result = engine.get(key.as_bytes())?;
            match (result.value, result.sequence_number) {
                (Some(value), Some(seq)) => {
                    println!("{} (seq {})", String::from_utf8_lossy(&value), seq)
                }
                _ => println!("(nil)"),
            }
        }
        Commands::Put { key, value } => {
            let result = engine.put(key.as_bytes(), value.as_bytes())?;
            println!("OK (seq {})", result.sequence_number.unwrap_or_default());
        }
        Commands::Delete { key } => {
            let result = engine.delete(key.as_bytes())?;
            if result.success {
                println!("OK (seq {})", result.sequence_number.unwrap_or_default());
            } else {
                println!("(not found)");
            }
        }
        Commands::Stats => {
            let stats = engine.stats();
            println!("live_keys: {}", stats.live_keys);
            println!("data_files: {}", stats.data_files);
            println!("tombstone_files: {}", stats.tombstone_files);
            println!("pending_compactions: {}", stats.pending_compactions);
            for (file_id, bytes) in &stats.stale_bytes {
                println!("stale_bytes[{}]: {}", file_id, bytes);
            }
        }
    }
    Ok(())
}
