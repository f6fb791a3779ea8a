//! # Main — CLI Entry Point
//!
//! Routes subcommands to the block-campaign services.
//!
//! ## Subcommands
//!
//! - `serve`: HTTP/WebSocket dashboard over the block store.
//! - `run`: headless run of a single block with progress logged.
//! - `migrate`: create the PostgreSQL schema.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection for the block store.
//! - `--engine-threads` / `ENGINE_THREADS`: engine pool size (0 = all cores).
//! - `--checkpoint-interval`: iterations between engine checkpoints (0 = ~1%).
//! - `--subscriber-buffer`: per-observer progress buffer.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "mersenne-lab",
    about = "Resumable Lucas-Lehmer campaigns over million-wide exponent blocks"
)]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Engine thread pool size (0 = all logical cores)
    #[arg(long, env = "ENGINE_THREADS", default_value_t = 0)]
    engine_threads: usize,

    /// Lucas-Lehmer iterations between progress checkpoints (0 = ~1% of the test)
    #[arg(long, env = "CHECKPOINT_INTERVAL", default_value_t = 0)]
    checkpoint_interval: u64,

    /// Per-subscriber progress buffer; messages beyond it are dropped for that subscriber
    #[arg(long, default_value_t = mersenne_lab::events::DEFAULT_BUFFER)]
    subscriber_buffer: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST API, progress WebSockets and metrics
    Serve {
        /// Listen port
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Directory of static frontend assets to serve as a fallback
        #[arg(long)]
        static_dir: Option<PathBuf>,
        /// Keep all state in memory instead of PostgreSQL
        #[arg(long)]
        ephemeral: bool,
    },
    /// Test one block from the command line, logging progress until it finishes
    Run {
        /// Block id; block N covers exponents [N·1e6, (N+1)·1e6)
        #[arg(long)]
        block: i64,
        /// Units tested concurrently
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Keep all state in memory instead of PostgreSQL
        #[arg(long)]
        ephemeral: bool,
    },
    /// Create the blocks/exponents schema if missing
    Migrate,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve {
            port,
            static_dir,
            ephemeral,
        } => rt.block_on(cli::run_serve(&cli, *port, static_dir.as_deref(), *ephemeral)),
        Commands::Run {
            block,
            concurrency,
            ephemeral,
        } => rt.block_on(cli::run_block(&cli, *block, *concurrency, *ephemeral)),
        Commands::Migrate => rt.block_on(cli::run_migrate(&cli)),
    }
}
