//! Shared test helpers for integration tests.

#![allow(dead_code)]

use mersenne_lab::dashboard::{self, AppState};
use async_trait::async_trait;
use mersenne_lab::db::{
    BlockRow, BlockStatus, BlockStore, Database, MemoryStore, PrimeHit, UnitRow, Verdict,
};
use mersenne_lab::engine::{Checkpoint, Engine, EngineError, EngineReport};
use mersenne_lab::events::BlockBus;
use mersenne_lab::prom_metrics::Metrics;
use mersenne_lab::scheduler::{BlockScheduler, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// == PostgreSQL ================================================================

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// Connect, apply the schema, and empty both tables.
pub async fn setup_test_db() -> Database {
    let db = Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("schema migration failed");
    sqlx::raw_sql("TRUNCATE TABLE exponents, blocks CASCADE")
        .execute(db.pool())
        .await
        .unwrap();
    db
}

// == Stub engines ==============================================================

/// Verdict from trial division, no checkpoints beyond one at the end.
pub struct InstantEngine;

impl Engine for InstantEngine {
    fn test(
        &self,
        candidate: u64,
        _checkpoint_interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        if on_progress(candidate.saturating_sub(3), &[0u8; 32]) == Checkpoint::Abort {
            return Err(EngineError::Cancelled);
        }
        let verdict = if [2u64, 3, 5, 7, 13, 17, 19, 31].contains(&candidate) {
            Verdict::Prime
        } else {
            Verdict::Composite
        };
        Ok(EngineReport {
            verdict,
            elapsed: Duration::from_micros(5),
            engine_info: "stub:instant".to_string(),
        })
    }
}

/// Aborts at its first checkpoint regardless of the callback's answer.
pub struct CancellingEngine {
    pub calls: AtomicUsize,
}

impl CancellingEngine {
    pub fn new() -> Self {
        CancellingEngine {
            calls: AtomicUsize::new(0),
        }
    }
}

impl Engine for CancellingEngine {
    fn test(
        &self,
        _candidate: u64,
        _checkpoint_interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = on_progress(0, &[0u8; 32]);
        Err(EngineError::Cancelled)
    }
}

/// Fails every candidate listed in `failing`, otherwise behaves like `InstantEngine`.
pub struct FailingEngine {
    pub failing: Vec<u64>,
}

impl Engine for FailingEngine {
    fn test(
        &self,
        candidate: u64,
        interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        if self.failing.contains(&candidate) {
            return Err(EngineError::Failed(format!("stub failure on {}", candidate)));
        }
        InstantEngine.test(candidate, interval, on_progress)
    }
}

/// Panics on every call.
pub struct PanickingEngine;

impl Engine for PanickingEngine {
    fn test(
        &self,
        candidate: u64,
        _interval: u64,
        _on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        panic!("residue overflow on {}", candidate);
    }
}

/// Emits checkpoints in a loop until the gate opens, aborting as soon as the
/// callback asks. Lets tests hold units in flight deterministically.
pub struct GatedEngine {
    open: Mutex<bool>,
    cv: Condvar,
    pub entered: AtomicUsize,
}

impl GatedEngine {
    pub fn new() -> Self {
        GatedEngine {
            open: Mutex::new(false),
            cv: Condvar::new(),
            entered: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Spin until at least `n` engine calls have started.
    pub async fn wait_entered(&self, n: usize) {
        for _ in 0..500 {
            if self.entered.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never entered {} calls", n);
    }
}

impl Engine for GatedEngine {
    fn test(
        &self,
        candidate: u64,
        _interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut iteration = 0;
        loop {
            if on_progress(iteration, &[0u8; 32]) == Checkpoint::Abort {
                return Err(EngineError::Cancelled);
            }
            iteration += 1;
            let open = self.open.lock().unwrap();
            let (open, _) = self
                .cv
                .wait_timeout(open, Duration::from_millis(5))
                .unwrap();
            if *open {
                break;
            }
        }
        InstantEngine.test(candidate, 0, &mut |_, _| Checkpoint::Continue)
    }
}

/// Reports its last checkpoint, then holds the finished verdict until the gate
/// opens. Models a unit that a stop arrives too late to cancel.
pub struct FinalCheckpointEngine {
    open: Mutex<bool>,
    cv: Condvar,
    pub entered: AtomicUsize,
}

impl FinalCheckpointEngine {
    pub fn new() -> Self {
        FinalCheckpointEngine {
            open: Mutex::new(false),
            cv: Condvar::new(),
            entered: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Spin until at least `n` calls are past their final checkpoint.
    pub async fn wait_entered(&self, n: usize) {
        for _ in 0..500 {
            if self.entered.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never passed {} final checkpoints", n);
    }
}

impl Engine for FinalCheckpointEngine {
    fn test(
        &self,
        candidate: u64,
        _interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        if on_progress(candidate.saturating_sub(3), &[0u8; 32]) == Checkpoint::Abort {
            return Err(EngineError::Cancelled);
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
        drop(open);
        InstantEngine.test(candidate, 0, &mut |_, _| Checkpoint::Continue)
    }
}

// == Stub stores ===============================================================

/// Memory store whose `unit_reset` always fails; everything else delegates.
pub struct ResetFailingStore {
    pub inner: MemoryStore,
}

impl ResetFailingStore {
    pub fn new() -> Self {
        ResetFailingStore {
            inner: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl BlockStore for ResetFailingStore {
    async fn upsert_block(
        &self,
        id: i64,
        start: i64,
        end: i64,
        candidate_count: i64,
    ) -> anyhow::Result<()> {
        self.inner.upsert_block(id, start, end, candidate_count).await
    }

    async fn get_block(&self, id: i64) -> anyhow::Result<Option<BlockRow>> {
        self.inner.get_block(id).await
    }

    async fn list_blocks(&self, limit: i64) -> anyhow::Result<Vec<BlockRow>> {
        self.inner.list_blocks(limit).await
    }

    async fn set_block_status(&self, id: i64, status: BlockStatus) -> anyhow::Result<()> {
        self.inner.set_block_status(id, status).await
    }

    async fn seed_units(&self, block_id: i64, candidates: &[i64]) -> anyhow::Result<u64> {
        self.inner.seed_units(block_id, candidates).await
    }

    async fn units_by_block(&self, block_id: i64) -> anyhow::Result<Vec<UnitRow>> {
        self.inner.units_by_block(block_id).await
    }

    async fn units_unfinished(&self, block_id: i64) -> anyhow::Result<Vec<i64>> {
        self.inner.units_unfinished(block_id).await
    }

    async fn reset_orphaned(&self, block_id: i64) -> anyhow::Result<u64> {
        self.inner.reset_orphaned(block_id).await
    }

    async fn unit_start(&self, p: i64) -> anyhow::Result<()> {
        self.inner.unit_start(p).await
    }

    async fn unit_finish_ok(
        &self,
        p: i64,
        verdict: Verdict,
        ns_elapsed: i64,
        engine_info: &str,
    ) -> anyhow::Result<()> {
        self.inner.unit_finish_ok(p, verdict, ns_elapsed, engine_info).await
    }

    async fn unit_fail(&self, p: i64, error: &str) -> anyhow::Result<()> {
        self.inner.unit_fail(p, error).await
    }

    async fn unit_reset(&self, p: i64) -> anyhow::Result<()> {
        anyhow::bail!("store offline while resetting {}", p)
    }

    async fn bump_tested(&self, block_id: i64, by: i64) -> anyhow::Result<()> {
        self.inner.bump_tested(block_id, by).await
    }

    async fn bump_verified(&self, block_id: i64, by: i64) -> anyhow::Result<()> {
        self.inner.bump_verified(block_id, by).await
    }

    async fn primes_recent(&self, limit: i64) -> anyhow::Result<Vec<PrimeHit>> {
        self.inner.primes_recent(limit).await
    }

    async fn prime_count(&self) -> anyhow::Result<i64> {
        self.inner.prime_count().await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        self.inner.health_check().await
    }
}

// == Wiring ====================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<BlockBus>,
    pub metrics: Arc<Metrics>,
    pub scheduler: Arc<BlockScheduler>,
}

/// Scheduler over a fresh memory store with the given engine.
pub fn harness(engine: Arc<dyn Engine>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(BlockBus::new(1024));
    let metrics = Arc::new(Metrics::new());
    let scheduler = BlockScheduler::new(
        Arc::clone(&store) as Arc<dyn BlockStore>,
        engine,
        Arc::clone(&bus),
        Arc::clone(&metrics),
        SchedulerConfig {
            engine_threads: 2,
            checkpoint_interval: 0,
        },
    )
    .unwrap();
    Harness {
        store,
        bus,
        metrics,
        scheduler,
    }
}

/// Create a block row with exactly `units` as its exponents.
pub async fn seed_block(store: &dyn BlockStore, block_id: i64, units: &[i64]) {
    let start = block_id * 1_000_000;
    store
        .upsert_block(block_id, start, start + 1_000_000, units.len() as i64)
        .await
        .unwrap();
    store.seed_units(block_id, units).await.unwrap();
}

/// Axum router over a harness.
pub fn build_test_app(h: &Harness) -> axum::Router {
    let state = AppState::new(Arc::clone(&h.scheduler), Arc::clone(&h.metrics));
    dashboard::build_router(state, None)
}

/// Serve the harness router on an ephemeral localhost port.
pub async fn spawn_server(h: &Harness) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_test_app(h);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Wait for the block's run to finalize, failing the test after 10 s.
pub async fn wait_run(scheduler: &BlockScheduler, block_id: i64) {
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait(block_id))
        .await
        .expect("run did not finalize in time");
}
