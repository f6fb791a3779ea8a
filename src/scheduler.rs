//! # Scheduler — Block Runs
//!
//! Owns one run per active block: seeds the block if needed, queues its
//! unfinished exponents smallest-first, and drives them through the engine
//! with bounded concurrency while relaying progress onto the bus.
//!
//! ## Run Phases
//!
//! ```text
//! Seeding ──▶ Dispatching ──▶ Draining ──▶ Finalized
//!    │                                        ▲
//!    └──────── nothing unfinished ────────────┘
//! ```
//!
//! - **Seeding**: the run is claimed in the [`RunRegistry`] (a second `start`
//!   on the same block gets [`SchedulerError::Conflict`]); missing blocks are
//!   sieved and stored; `running` rows orphaned by a crash go back to `queued`.
//! - **Dispatching**: `concurrency` worker tasks share one [`WorkQueue`] and
//!   one cancellation flag. Engine calls run on a dedicated rayon pool; the
//!   checkpoint callback crosses back as channel messages that a relay task
//!   publishes on the bus.
//! - **Draining**: the finalizer waits until every dequeued unit is completed
//!   or discarded.
//! - **Finalized**: block status becomes `done` or `idle`, the terminal
//!   message is published, and the topic is closed.
//!
//! ## Cancellation
//!
//! [`BlockScheduler::stop`] sets the flag, discards the pending queue, and
//! publishes `{stopped:true}` without waiting. In-flight engine calls see the
//! flag at their next checkpoint and return [`EngineError::Cancelled`]; the
//! unit goes back to `queued`. Every dequeued unit ends in exactly one of
//! `done`, `error`, or `queued`.
//!
//! ## Jobs
//!
//! [`BlockScheduler::submit_job`] tests one exponent outside any block on the
//! same engine pool. Job checkpoints carry the residue digest and go to the
//! job's topic on a separate [`JobBus`].

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{BlockRow, BlockStatus, BlockStore, UnitRow, UnitStatus, Verdict};
use crate::engine::{progress_pct, Checkpoint, Engine, EngineError, EngineReport};
use crate::events::{BlockBus, BusMessage, JobBus, JobProgress};
use crate::jobs::{JobRecord, JobRegistry, JobResult};
use crate::prom_metrics::Metrics;
use crate::{lock_or_recover, sieve};

/// Highest block id whose exponents all fit in 32 bits.
pub const MAX_BLOCK_ID: i64 = (u32::MAX as i64 + 1) / sieve::BLOCK_WIDTH as i64 - 1;

/// Upper bound for `list_blocks`, which seeds every missing id below it.
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),
    #[error("block {0} already has an active run")]
    Conflict(i64),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StartOutcome {
    Scheduled {
        scheduled: usize,
        block_id: i64,
        concurrency: usize,
    },
    AlreadyComplete {
        scheduled: usize,
        message: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub ok: bool,
    pub block_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Seeding,
    Dispatching,
    Draining,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Engine pool size; 0 lets rayon pick one thread per core.
    pub engine_threads: usize,
    /// Iterations between engine checkpoints; 0 means ~1%.
    pub checkpoint_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            engine_threads: 0,
            checkpoint_interval: 0,
        }
    }
}

// ── Work queue ──────────────────────────────────────────────────

struct QueueState {
    items: VecDeque<i64>,
    /// Items handed out or still queued that have not been marked done.
    unfinished: usize,
}

/// FIFO with join semantics: filled once, then drained by workers. `join`
/// resolves when every item was either completed with `task_done` or dropped
/// by `discard_all`.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    drained: Notify,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = i64>) -> Self {
        let items: VecDeque<i64> = items.into_iter().collect();
        let unfinished = items.len();
        WorkQueue {
            state: Mutex::new(QueueState { items, unfinished }),
            drained: Notify::new(),
        }
    }

    /// Append items. Only called before any worker is spawned.
    pub fn fill(&self, items: impl IntoIterator<Item = i64>) {
        let mut s = lock_or_recover(&self.state);
        let before = s.items.len();
        s.items.extend(items);
        let added = s.items.len() - before;
        s.unfinished += added;
    }

    /// Take the next item. `None` once the queue is empty.
    pub fn pop(&self) -> Option<i64> {
        lock_or_recover(&self.state).items.pop_front()
    }

    pub fn task_done(&self) {
        let mut s = lock_or_recover(&self.state);
        s.unfinished = s.unfinished.saturating_sub(1);
        if s.unfinished == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Drop every queued item without running it. Returns how many.
    pub fn discard_all(&self) -> usize {
        let mut s = lock_or_recover(&self.state);
        let n = s.items.len();
        s.items.clear();
        s.unfinished = s.unfinished.saturating_sub(n);
        if s.unfinished == 0 {
            self.drained.notify_waiters();
        }
        n
    }

    pub fn pending(&self) -> usize {
        lock_or_recover(&self.state).items.len()
    }

    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock_or_recover(&self.state).unfinished == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ── Runs ────────────────────────────────────────────────────────

struct Run {
    block_id: i64,
    queue: WorkQueue,
    limiter: Semaphore,
    cancelled: AtomicBool,
    phase: watch::Sender<RunPhase>,
}

impl Run {
    /// The limiter starts without permits; dispatch grants one per worker.
    fn new(block_id: i64) -> Self {
        Run {
            block_id,
            queue: WorkQueue::new(std::iter::empty()),
            limiter: Semaphore::new(0),
            cancelled: AtomicBool::new(false),
            phase: watch::Sender::new(RunPhase::Seeding),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }
}

/// Active runs keyed by block id. At most one run per block.
#[derive(Default)]
struct RunRegistry {
    runs: Mutex<HashMap<i64, Arc<Run>>>,
}

impl RunRegistry {
    fn claim(&self, run: Arc<Run>) -> Result<(), SchedulerError> {
        let mut runs = lock_or_recover(&self.runs);
        if runs.contains_key(&run.block_id) {
            return Err(SchedulerError::Conflict(run.block_id));
        }
        runs.insert(run.block_id, run);
        Ok(())
    }

    fn get(&self, block_id: i64) -> Option<Arc<Run>> {
        lock_or_recover(&self.runs).get(&block_id).cloned()
    }

    /// Remove `run` if it is still the registered one.
    fn release(&self, run: &Arc<Run>) {
        let mut runs = lock_or_recover(&self.runs);
        if runs.get(&run.block_id).is_some_and(|r| Arc::ptr_eq(r, run)) {
            runs.remove(&run.block_id);
        }
    }

    fn active(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock_or_recover(&self.runs).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ── Scheduler ───────────────────────────────────────────────────

pub struct BlockScheduler {
    store: Arc<dyn BlockStore>,
    engine: Arc<dyn Engine>,
    bus: Arc<BlockBus>,
    job_bus: Arc<JobBus>,
    metrics: Arc<Metrics>,
    pool: rayon::ThreadPool,
    runs: RunRegistry,
    jobs: Arc<JobRegistry>,
    checkpoint_interval: u64,
}

fn validate_block_id(block_id: i64) -> Result<(), SchedulerError> {
    if !(0..=MAX_BLOCK_ID).contains(&block_id) {
        return Err(SchedulerError::Validation(format!(
            "block_id must be in 0..={}, got {}",
            MAX_BLOCK_ID, block_id
        )));
    }
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("engine panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("engine panicked: {}", s)
    } else {
        "engine panicked".to_string()
    }
}

impl BlockScheduler {
    pub fn new(
        store: Arc<dyn BlockStore>,
        engine: Arc<dyn Engine>,
        bus: Arc<BlockBus>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.engine_threads)
            .thread_name(|i| format!("engine-{}", i))
            .build()?;
        info!(
            threads = pool.current_num_threads(),
            checkpoint_interval = config.checkpoint_interval,
            "engine pool ready"
        );
        let job_bus = Arc::new(JobBus::new(bus.buffer()));
        Ok(Arc::new(BlockScheduler {
            store,
            engine,
            bus,
            job_bus,
            metrics,
            pool,
            runs: RunRegistry::default(),
            jobs: Arc::new(JobRegistry::default()),
            checkpoint_interval: config.checkpoint_interval,
        }))
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<BlockBus> {
        &self.bus
    }

    pub fn job_bus(&self) -> &Arc<JobBus> {
        &self.job_bus
    }

    /// Block ids with an active run, ascending.
    pub fn active_runs(&self) -> Vec<i64> {
        self.runs.active()
    }

    /// Phase of the block's active run, if any.
    pub fn phase(&self, block_id: i64) -> Option<RunPhase> {
        self.runs.get(block_id).map(|run| *run.phase.borrow())
    }

    /// Resolve once the block's current run (if any) has finalized.
    pub async fn wait(&self, block_id: i64) {
        let Some(run) = self.runs.get(block_id) else {
            return;
        };
        let mut rx = run.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == RunPhase::Finalized).await;
    }

    /// Fetch the block row, sieving and seeding it first if it does not exist.
    pub async fn ensure_block(&self, block_id: i64) -> Result<BlockRow, SchedulerError> {
        validate_block_id(block_id)?;
        if let Some(block) = self.store.get_block(block_id).await? {
            return Ok(block);
        }

        let (start, end) = sieve::block_bounds(block_id as u64);
        let candidates = tokio::task::spawn_blocking(move || {
            sieve::primes_in_range(start, end)
                .into_iter()
                .map(|p| p as i64)
                .collect::<Vec<i64>>()
        })
        .await
        .map_err(|e| anyhow::anyhow!("sieve task failed: {}", e))?;

        self.store
            .upsert_block(block_id, start as i64, end as i64, candidates.len() as i64)
            .await?;
        let inserted = self.store.seed_units(block_id, &candidates).await?;
        info!(block_id, start, end, candidates = candidates.len(), inserted, "block seeded");

        self.store
            .get_block(block_id)
            .await?
            .ok_or_else(|| {
                SchedulerError::Store(anyhow::anyhow!("block {} missing after seeding", block_id))
            })
    }

    /// The first `limit` blocks by id, seeding any missing id in `[0, limit)`.
    pub async fn list_blocks(&self, limit: i64) -> Result<Vec<BlockRow>, SchedulerError> {
        if !(1..=MAX_LIST_LIMIT).contains(&limit) {
            return Err(SchedulerError::Validation(format!(
                "limit must be in 1..={}, got {}",
                MAX_LIST_LIMIT, limit
            )));
        }
        let rows = self.store.list_blocks(limit).await?;
        let missing: Vec<i64> = (0..limit)
            .filter(|id| !rows.iter().any(|r| r.id == *id))
            .collect();
        if missing.is_empty() {
            return Ok(rows);
        }
        for block_id in missing {
            self.ensure_block(block_id).await?;
        }
        Ok(self.store.list_blocks(limit).await?)
    }

    /// Block row plus every unit, seeding the block first if needed.
    pub async fn block_detail(
        &self,
        block_id: i64,
    ) -> Result<(BlockRow, Vec<UnitRow>), SchedulerError> {
        let block = self.ensure_block(block_id).await?;
        let units = self.store.units_by_block(block_id).await?;
        Ok((block, units))
    }

    /// Start (or resume) a run over the block's unfinished exponents.
    ///
    /// At most one worker per scheduled unit is spawned; extra requested
    /// concurrency would only find an empty queue.
    pub async fn start(
        self: &Arc<Self>,
        block_id: i64,
        concurrency: usize,
    ) -> Result<StartOutcome, SchedulerError> {
        validate_block_id(block_id)?;
        if concurrency == 0 {
            return Err(SchedulerError::Validation(
                "concurrency must be >= 1".to_string(),
            ));
        }

        let run = Arc::new(Run::new(block_id));
        self.runs.claim(Arc::clone(&run))?;

        let todo = match self.seed_run(block_id).await {
            Ok(todo) => todo,
            Err(e) => {
                self.runs.release(&run);
                return Err(e);
            }
        };

        if todo.is_empty() {
            self.runs.release(&run);
            self.finish_empty(block_id).await?;
            return Ok(StartOutcome::AlreadyComplete {
                scheduled: 0,
                message: "already complete",
            });
        }

        let scheduled = todo.len();
        let workers = concurrency.min(scheduled);
        run.queue.fill(todo);
        run.limiter.add_permits(workers);

        if let Err(e) = self.store.set_block_status(block_id, BlockStatus::Running).await {
            self.runs.release(&run);
            return Err(e.into());
        }
        run.set_phase(RunPhase::Dispatching);
        self.metrics.runs_active.inc();

        let (events_tx, events_rx) = mpsc::unbounded_channel::<BusMessage>();
        let relay = tokio::spawn(relay_progress(Arc::clone(&self.bus), block_id, events_rx));

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let this = Arc::clone(self);
            let run = Arc::clone(&run);
            let events = events_tx.clone();
            tasks.spawn(async move { this.worker(run, events).await });
        }
        drop(events_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.finalize(run, tasks, relay).await });

        info!(block_id, scheduled, concurrency, workers, "block run started");
        Ok(StartOutcome::Scheduled {
            scheduled,
            block_id,
            concurrency,
        })
    }

    /// Request cooperative cancellation. Never blocks; a no-op without a run.
    pub fn stop(&self, block_id: i64) -> StopOutcome {
        if let Some(run) = self.runs.get(block_id) {
            run.cancel();
            let discarded = run.queue.discard_all();
            self.bus.publish(
                block_id,
                BusMessage::Stopped {
                    block_id,
                    stopped: true,
                },
            );
            info!(block_id, discarded, "block run stop requested");
        } else {
            debug!(block_id, "stop without an active run");
        }
        StopOutcome { ok: true, block_id }
    }

    /// Queue a single-exponent test on the engine pool and return its id.
    /// Checkpoints stream on the job's [`job_bus`](Self::job_bus) topic, which
    /// is closed once the job record holds its result or error. Must be
    /// called from within the tokio runtime.
    pub fn submit_job(&self, p: i64, progress_stride: Option<i64>) -> Result<Uuid, SchedulerError> {
        if p < 2 {
            return Err(SchedulerError::Validation("p must be >= 2".to_string()));
        }
        let stride = match progress_stride {
            None => 0,
            Some(s) => u64::try_from(s).map_err(|_| {
                SchedulerError::Validation(format!("progress_stride must be >= 0, got {}", s))
            })?,
        };
        let candidate = p as u64;
        let id = self.jobs.insert(candidate);

        let (events_tx, events_rx) = mpsc::unbounded_channel::<JobProgress>();
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let jobs = Arc::clone(&self.jobs);
        self.pool.spawn(move || {
            jobs.mark_running(&id);
            let mut on_progress = |iteration: u64, digest: &[u8]| {
                let _ = events_tx.send(JobProgress {
                    iteration,
                    pct: progress_pct(iteration, candidate),
                    digest: hex::encode(digest),
                });
                Checkpoint::Continue
            };
            let _ = tx.send(guarded_test(engine.as_ref(), candidate, stride, &mut on_progress));
        });

        let job_bus = Arc::clone(&self.job_bus);
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let relay = tokio::spawn(relay_job_progress(Arc::clone(&job_bus), id, events_rx));
            let outcome = rx
                .await
                .unwrap_or_else(|_| Err(EngineError::Failed("engine task dropped".to_string())));
            if let Err(e) = relay.await {
                warn!(job = %id.simple(), error = %e, "job relay ended abnormally");
            }
            match outcome {
                Ok(report) => {
                    let result = JobResult::from_report(candidate, &report);
                    info!(
                        job = %id.simple(),
                        p = candidate,
                        is_prime = result.is_prime,
                        "job done"
                    );
                    jobs.finish(&id, Ok(result));
                }
                Err(e) => {
                    warn!(job = %id.simple(), p = candidate, error = %e, "job failed");
                    jobs.finish(&id, Err(e.to_string()));
                }
            }
            job_bus.close(id);
        });

        info!(job = %id.simple(), p = candidate, stride, "job queued");
        Ok(id)
    }

    /// Snapshot of a job record.
    pub fn job(&self, id: &Uuid) -> Option<JobRecord> {
        self.jobs.get(id)
    }

    async fn seed_run(&self, block_id: i64) -> Result<Vec<i64>, SchedulerError> {
        self.ensure_block(block_id).await?;
        let orphaned = self.store.reset_orphaned(block_id).await?;
        if orphaned > 0 {
            warn!(block_id, orphaned, "reset units left running by an earlier process");
        }
        Ok(self.store.units_unfinished(block_id).await?)
    }

    async fn finish_empty(&self, block_id: i64) -> Result<(), SchedulerError> {
        let block = self
            .store
            .get_block(block_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("block {} not found", block_id))?;
        if block.status != BlockStatus::Done {
            self.store.set_block_status(block_id, BlockStatus::Done).await?;
        }
        self.bus.publish(
            block_id,
            BusMessage::Finished {
                block_id,
                tested: block.tested_count,
                total: block.candidate_count,
                done: true,
                stopped: None,
            },
        );
        self.bus.close(block_id);
        info!(block_id, "block already complete");
        Ok(())
    }

    async fn worker(self: Arc<Self>, run: Arc<Run>, events: mpsc::UnboundedSender<BusMessage>) {
        while let Some(p) = run.queue.pop() {
            if run.is_cancelled() {
                run.queue.discard_all();
                run.queue.task_done();
                break;
            }
            self.process_unit(&run, p, &events).await;
            run.queue.task_done();
        }
    }

    async fn process_unit(
        &self,
        run: &Arc<Run>,
        p: i64,
        events: &mpsc::UnboundedSender<BusMessage>,
    ) {
        let block_id = run.block_id;
        let Ok(_permit) = run.limiter.acquire().await else {
            return;
        };
        if let Err(e) = self.store.unit_start(p).await {
            warn!(block_id, candidate = p, error = %e, "failed to mark unit running");
            return;
        }

        match self.invoke_engine(run, p, events.clone()).await {
            Ok(report) => self.record_verdict(run, p, report, events).await,
            Err(EngineError::Cancelled) => {
                self.rollback(block_id, p).await;
                self.metrics.units_reset.inc();
                run.cancel();
                debug!(block_id, candidate = p, "unit cancelled at checkpoint");
            }
            Err(EngineError::Failed(detail)) => {
                self.metrics.units_failed.inc();
                warn!(block_id, candidate = p, error = %detail, "engine failed");
                if let Err(e) = self.store.unit_fail(p, &detail).await {
                    warn!(block_id, candidate = p, error = %e, "failed to record unit error");
                    self.rollback(block_id, p).await;
                }
            }
        }
    }

    async fn record_verdict(
        &self,
        run: &Arc<Run>,
        p: i64,
        report: EngineReport,
        events: &mpsc::UnboundedSender<BusMessage>,
    ) {
        let block_id = run.block_id;
        let ns = i64::try_from(report.elapsed.as_nanos()).unwrap_or(i64::MAX);
        if let Err(e) = self
            .store
            .unit_finish_ok(p, report.verdict, ns, &report.engine_info)
            .await
        {
            warn!(block_id, candidate = p, error = %e, "failed to record verdict");
            if self.store.unit_fail(p, &e.to_string()).await.is_err() {
                self.rollback(block_id, p).await;
            }
            return;
        }
        self.metrics.units_tested.inc();
        if report.verdict == Verdict::Prime {
            self.metrics.primes_found.inc();
            info!(
                block_id,
                candidate = p,
                digits = crate::mersenne_digits(p as u64),
                "Mersenne prime found"
            );
        }

        if let Err(e) = self.store.bump_tested(block_id, 1).await {
            warn!(block_id, error = %e, "failed to bump tested count");
        }
        match self.store.get_block(block_id).await {
            Ok(Some(block)) => {
                let _ = events.send(BusMessage::Coverage {
                    block_id,
                    last_candidate: p,
                    tested: block.tested_count,
                    total: block.candidate_count,
                });
            }
            Ok(None) => warn!(block_id, "block vanished during run"),
            Err(e) => warn!(block_id, error = %e, "failed to read coverage"),
        }
    }

    async fn rollback(&self, block_id: i64, p: i64) {
        if let Err(e) = self.store.unit_reset(p).await {
            warn!(block_id, candidate = p, error = %e, "failed to reset unit");
        }
    }

    /// Run the engine on the compute pool; checkpoints become bus messages.
    async fn invoke_engine(
        &self,
        run: &Arc<Run>,
        p: i64,
        events: mpsc::UnboundedSender<BusMessage>,
    ) -> Result<EngineReport, EngineError> {
        let candidate = u64::try_from(p)
            .map_err(|_| EngineError::Failed(format!("negative candidate {}", p)))?;
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let run = Arc::clone(run);
        let interval = self.checkpoint_interval;

        self.pool.spawn(move || {
            let block_id = run.block_id;
            let mut on_progress = |iteration: u64, _digest: &[u8]| {
                if run.is_cancelled() {
                    return Checkpoint::Abort;
                }
                let _ = events.send(BusMessage::Progress {
                    block_id,
                    candidate: p,
                    pct: progress_pct(iteration, candidate),
                });
                Checkpoint::Continue
            };
            let _ = tx.send(guarded_test(engine.as_ref(), candidate, interval, &mut on_progress));
        });

        rx.await
            .unwrap_or_else(|_| Err(EngineError::Failed("engine task dropped".to_string())))
    }

    async fn finalize(
        self: Arc<Self>,
        run: Arc<Run>,
        mut workers: JoinSet<()>,
        relay: tokio::task::JoinHandle<()>,
    ) {
        let block_id = run.block_id;
        run.set_phase(RunPhase::Draining);
        run.queue.join().await;

        workers.abort_all();
        while workers.join_next().await.is_some() {}
        if let Err(e) = relay.await {
            warn!(block_id, error = %e, "progress relay ended abnormally");
        }

        let stopped = run.is_cancelled();
        // A unit whose rollback failed is still `running`; that is not complete.
        let complete = match self.store.units_by_block(block_id).await {
            Ok(units) => units.iter().all(|u| u.status == UnitStatus::Done),
            Err(e) => {
                warn!(block_id, error = %e, "failed to read block units");
                false
            }
        };
        let status = if complete { BlockStatus::Done } else { BlockStatus::Idle };
        if let Err(e) = self.store.set_block_status(block_id, status).await {
            warn!(block_id, error = %e, "failed to update block status");
        }

        let (tested, total) = match self.store.get_block(block_id).await {
            Ok(Some(b)) => (b.tested_count, b.candidate_count),
            Ok(None) => (0, 0),
            Err(e) => {
                warn!(block_id, error = %e, "failed to read block counts");
                (0, 0)
            }
        };
        self.bus.publish(
            block_id,
            BusMessage::Finished {
                block_id,
                tested,
                total,
                done: true,
                stopped: Some(stopped),
            },
        );
        self.bus.close(block_id);

        run.cancelled.store(false, Ordering::SeqCst);
        self.runs.release(&run);
        run.set_phase(RunPhase::Finalized);
        self.metrics.runs_active.dec();
        info!(block_id, tested, total, stopped, status = %status, "block run finalized");
    }
}

/// Run the engine with panics turned into [`EngineError::Failed`].
fn guarded_test(
    engine: &dyn Engine,
    candidate: u64,
    interval: u64,
    on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
) -> Result<EngineReport, EngineError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        engine.test(candidate, interval, on_progress)
    }))
    .unwrap_or_else(|payload| Err(EngineError::Failed(panic_message(payload))))
}

async fn relay_job_progress(
    bus: Arc<JobBus>,
    id: Uuid,
    mut rx: mpsc::UnboundedReceiver<JobProgress>,
) {
    while let Some(message) = rx.recv().await {
        bus.publish(id, message);
    }
}

async fn relay_progress(
    bus: Arc<BlockBus>,
    block_id: i64,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
) {
    while let Some(message) = rx.recv().await {
        bus.publish(block_id, message);
    }
}
