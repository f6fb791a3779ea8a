//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Wires the store,
//! engine, bus, and scheduler together for each subcommand.

use anyhow::Result;
use mersenne_lab::dashboard::{self, AppState};
use mersenne_lab::db::{BlockStore, Database, MemoryStore};
use mersenne_lab::engine::LucasLehmer;
use mersenne_lab::events::{BlockBus, BusMessage};
use mersenne_lab::prom_metrics::Metrics;
use mersenne_lab::scheduler::{BlockScheduler, SchedulerConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::Cli;

fn database_url(cli: &Cli) -> Result<&str> {
    cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "DATABASE_URL is required (set via --database-url or env, or pass --ephemeral)"
        )
    })
}

/// Open the block store: in-memory when `ephemeral`, otherwise PostgreSQL
/// with the schema applied.
async fn open_store(cli: &Cli, ephemeral: bool) -> Result<Arc<dyn BlockStore>> {
    if ephemeral {
        info!("using in-memory block store; nothing will persist");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let db = Database::connect(database_url(cli)?).await?;
    db.migrate().await?;
    info!("connected to PostgreSQL block store");
    Ok(Arc::new(db))
}

fn build_scheduler(
    cli: &Cli,
    store: Arc<dyn BlockStore>,
    metrics: Arc<Metrics>,
) -> Result<Arc<BlockScheduler>> {
    let bus = Arc::new(BlockBus::new(cli.subscriber_buffer));
    BlockScheduler::new(
        store,
        Arc::new(LucasLehmer),
        bus,
        metrics,
        SchedulerConfig {
            engine_threads: cli.engine_threads,
            checkpoint_interval: cli.checkpoint_interval,
        },
    )
}

// ── serve ───────────────────────────────────────────────────────

pub async fn run_serve(
    cli: &Cli,
    port: u16,
    static_dir: Option<&Path>,
    ephemeral: bool,
) -> Result<()> {
    let store = open_store(cli, ephemeral).await?;
    let metrics = Arc::new(Metrics::new());
    let scheduler = build_scheduler(cli, store, Arc::clone(&metrics))?;
    let state = AppState::new(scheduler, metrics);
    dashboard::run(state, port, static_dir).await
}

// ── run ─────────────────────────────────────────────────────────

/// Run one block to completion (or Ctrl-C) and log progress. Only every
/// tenth percent of per-unit progress is logged to keep output readable.
pub async fn run_block(
    cli: &Cli,
    block_id: i64,
    concurrency: usize,
    ephemeral: bool,
) -> Result<()> {
    let store = open_store(cli, ephemeral).await?;
    let scheduler = build_scheduler(cli, store, Arc::new(Metrics::new()))?;

    let mut sub = scheduler.bus().subscribe(block_id);
    let outcome = scheduler.start(block_id, concurrency).await?;
    info!(block_id, outcome = %serde_json::to_string(&outcome)?, "run requested");

    let mut interrupted = false;
    loop {
        tokio::select! {
            message = sub.recv() => {
                let Some(message) = message else { break };
                match message.as_ref() {
                    BusMessage::Progress { candidate, pct, .. } => {
                        if pct % 10 == 0 {
                            info!(block_id, candidate, pct, "progress");
                        }
                    }
                    BusMessage::Coverage { last_candidate, tested, total, .. } => {
                        let candidate = last_candidate;
                        info!(block_id, candidate, tested, total, "unit done");
                    }
                    BusMessage::Finished { tested, total, stopped, .. } => {
                        let stopped = stopped.unwrap_or(false);
                        info!(block_id, tested, total, stopped, "block finished");
                    }
                    BusMessage::Stopped { .. } => info!(block_id, "stop acknowledged, draining"),
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(block_id, "interrupted; stopping at the next checkpoint");
                interrupted = true;
                scheduler.stop(block_id);
            }
        }
    }
    scheduler.wait(block_id).await;

    if let Some(block) = scheduler.store().get_block(block_id).await? {
        info!(
            block_id,
            tested = block.tested_count,
            total = block.candidate_count,
            primes = block.verified_count,
            status = %block.status,
            "block summary"
        );
    }
    Ok(())
}

// ── migrate ─────────────────────────────────────────────────────

pub async fn run_migrate(cli: &Cli) -> Result<()> {
    let db = Database::connect(database_url(cli)?).await?;
    db.migrate().await?;
    info!("schema ready");
    Ok(())
}
