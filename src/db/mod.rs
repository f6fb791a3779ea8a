//! # Database — Block Store
//!
//! Persistent record of exponent blocks and their work units. The scheduler
//! talks to storage only through the [`BlockStore`] trait so a run can be
//! driven against PostgreSQL in production or an in-process map in tests and
//! `--ephemeral` mode.
//!
//! ## Schema
//!
//! - `blocks`: id, [start_p, end_p_excl), candidate/tested/verified counters, status
//! - `exponents`: one row per prime exponent, keyed by the exponent itself,
//!   referencing its block with `ON DELETE CASCADE`
//!
//! ## Module Structure
//!
//! - [`postgres`] — `BlockStore` for [`Database`] (sqlx `PgPool`)
//! - [`memory`] — `BlockStore` for [`MemoryStore`]
//!
//! ## Atomicity
//!
//! Every mutation touches one row, except `unit_finish_ok` on a prime verdict,
//! which bumps `verified_count` on the unit's own block inside the same
//! transaction. Callers never pass the block id for that bump, so the counter
//! cannot drift from the unit rows.

mod memory;
mod postgres;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::fmt;

const SCHEMA_SQL: &str = include_str!("../../migrations/001_blocks.sql");

// ── Status enums ────────────────────────────────────────────────

/// Aggregate state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Idle,
    Running,
    Done,
}

/// Life cycle of a single exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Queued,
    Running,
    Done,
    Error,
}

/// Engine verdict on M_p. Only `Prime`/`Composite` once a unit is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Unknown,
    Prime,
    Composite,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(value: String) -> std::result::Result<Self, <Self as TryFrom<String>>::Error> {
                match value.as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(BlockStatus { Idle => "idle", Running => "running", Done => "done" });
text_enum!(UnitStatus {
    Queued => "queued",
    Running => "running",
    Done => "done",
    Error => "error",
});
text_enum!(Verdict { Unknown => "unknown", Prime => "prime", Composite => "composite" });

// ── Row types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BlockRow {
    pub id: i64,
    pub start_p: i64,
    pub end_p_excl: i64,
    pub candidate_count: i64,
    pub tested_count: i64,
    pub verified_count: i64,
    #[sqlx(try_from = "String")]
    pub status: BlockStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UnitRow {
    pub p: i64,
    pub block_id: i64,
    #[sqlx(try_from = "String")]
    pub status: UnitStatus,
    #[sqlx(try_from = "String")]
    pub verdict: Verdict,
    pub ns_elapsed: Option<i64>,
    pub engine_info: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A done unit whose verdict is prime, for the discoveries feed.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PrimeHit {
    pub p: i64,
    pub block_id: i64,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub engine_info: Option<String>,
    pub ns_elapsed: Option<i64>,
}

// ── Store contract ──────────────────────────────────────────────

/// Atomic CRUD accessors the scheduler needs. Each call is durable on return.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Insert a block or refresh its range and candidate count. Counters and
    /// status are left untouched on conflict.
    async fn upsert_block(
        &self,
        id: i64,
        start: i64,
        end: i64,
        candidate_count: i64,
    ) -> Result<()>;

    async fn get_block(&self, id: i64) -> Result<Option<BlockRow>>;

    /// Blocks in ascending id order.
    async fn list_blocks(&self, limit: i64) -> Result<Vec<BlockRow>>;

    /// Set block status; `running` stamps `started_at`, `done` stamps `finished_at`.
    async fn set_block_status(&self, id: i64, status: BlockStatus) -> Result<()>;

    /// Insert-if-absent one queued unit per candidate. Returns rows inserted.
    async fn seed_units(&self, block_id: i64, candidates: &[i64]) -> Result<u64>;

    /// Every unit of the block, ascending by exponent.
    async fn units_by_block(&self, block_id: i64) -> Result<Vec<UnitRow>>;

    /// Exponents whose status is neither `done` nor `running`, ascending.
    async fn units_unfinished(&self, block_id: i64) -> Result<Vec<i64>>;

    /// Return `running` units of a block to `queued`. Only valid while no run
    /// owns the block; returns the number of rows reset.
    async fn reset_orphaned(&self, block_id: i64) -> Result<u64>;

    async fn unit_start(&self, p: i64) -> Result<()>;

    /// Mark done with a verdict. A prime verdict bumps the owning block's
    /// `verified_count` in the same transaction.
    async fn unit_finish_ok(
        &self,
        p: i64,
        verdict: Verdict,
        ns_elapsed: i64,
        engine_info: &str,
    ) -> Result<()>;

    async fn unit_fail(&self, p: i64, error: &str) -> Result<()>;

    /// Cancel rollback: back to `queued` with timing and error cleared.
    async fn unit_reset(&self, p: i64) -> Result<()>;

    async fn bump_tested(&self, block_id: i64, by: i64) -> Result<()>;

    async fn bump_verified(&self, block_id: i64, by: i64) -> Result<()>;

    /// Prime discoveries, most recently finished first.
    async fn primes_recent(&self, limit: i64) -> Result<Vec<PrimeHit>>;

    async fn prime_count(&self) -> Result<i64>;

    async fn health_check(&self) -> Result<()>;
}

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Parses the URL by hand so percent-encoded usernames and passwords
    /// survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `blocks`/`exponents` schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}
