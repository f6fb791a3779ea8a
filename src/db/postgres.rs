//! `BlockStore` over PostgreSQL.
//!
//! Each operation is a single statement except `unit_finish_ok`, which runs the
//! unit update and the verified bump in one transaction.

use super::{BlockRow, BlockStatus, BlockStore, Database, PrimeHit, UnitRow, Verdict};
use anyhow::{bail, Result};
use async_trait::async_trait;

const BLOCK_COLUMNS: &str = "id, start_p, end_p_excl, candidate_count, tested_count, verified_count,
     status, created_at, started_at, finished_at";

const UNIT_COLUMNS: &str = "p, block_id, status, verdict, ns_elapsed, engine_info, error,
     started_at, finished_at";

#[async_trait]
impl BlockStore for Database {
    async fn upsert_block(
        &self,
        id: i64,
        start: i64,
        end: i64,
        candidate_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocks (id, start_p, end_p_excl, candidate_count)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
               start_p = EXCLUDED.start_p,
               end_p_excl = EXCLUDED.end_p_excl,
               candidate_count = EXCLUDED.candidate_count",
        )
        .bind(id)
        .bind(start)
        .bind(end)
        .bind(candidate_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_block(&self, id: i64) -> Result<Option<BlockRow>> {
        let row = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_blocks(&self, limit: i64) -> Result<Vec<BlockRow>> {
        let rows = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_block_status(&self, id: i64, status: BlockStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE blocks SET
               status = $2::text,
               started_at = CASE WHEN $2::text = 'running' THEN NOW() ELSE started_at END,
               finished_at = CASE WHEN $2::text = 'done' THEN NOW()
                                  WHEN $2::text = 'running' THEN NULL
                                  ELSE finished_at END
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("block {} not found", id);
        }
        Ok(())
    }

    async fn seed_units(&self, block_id: i64, candidates: &[i64]) -> Result<u64> {
        if candidates.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "INSERT INTO exponents (p, block_id)
             SELECT p, $2 FROM UNNEST($1::bigint[]) AS t(p)
             ON CONFLICT (p) DO NOTHING",
        )
        .bind(candidates)
        .bind(block_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn units_by_block(&self, block_id: i64) -> Result<Vec<UnitRow>> {
        let rows = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM exponents WHERE block_id = $1 ORDER BY p"
        ))
        .bind(block_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn units_unfinished(&self, block_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT p FROM exponents
             WHERE block_id = $1 AND status NOT IN ('done', 'running')
             ORDER BY p",
        )
        .bind(block_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn reset_orphaned(&self, block_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE exponents
             SET status = 'queued', started_at = NULL, finished_at = NULL,
                 ns_elapsed = NULL, error = NULL
             WHERE block_id = $1 AND status = 'running'",
        )
        .bind(block_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unit_start(&self, p: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE exponents SET status = 'running', started_at = NOW(), error = NULL
             WHERE p = $1",
        )
        .bind(p)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("exponent {} not found", p);
        }
        Ok(())
    }

    async fn unit_finish_ok(
        &self,
        p: i64,
        verdict: Verdict,
        ns_elapsed: i64,
        engine_info: &str,
    ) -> Result<()> {
        if verdict == Verdict::Unknown {
            bail!("exponent {}: finished unit needs a prime or composite verdict", p);
        }
        let mut tx = self.pool.begin().await?;
        let block_id: Option<(i64,)> = sqlx::query_as(
            "UPDATE exponents
             SET status = 'done', verdict = $2, ns_elapsed = $3, engine_info = $4,
                 error = NULL, finished_at = NOW()
             WHERE p = $1
             RETURNING block_id",
        )
        .bind(p)
        .bind(verdict.as_str())
        .bind(ns_elapsed)
        .bind(engine_info)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((block_id,)) = block_id else {
            bail!("exponent {} not found", p);
        };
        if verdict == Verdict::Prime {
            sqlx::query("UPDATE blocks SET verified_count = verified_count + 1 WHERE id = $1")
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unit_fail(&self, p: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE exponents SET status = 'error', error = $2, finished_at = NOW()
             WHERE p = $1",
        )
        .bind(p)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("exponent {} not found", p);
        }
        Ok(())
    }

    async fn unit_reset(&self, p: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE exponents
             SET status = 'queued', started_at = NULL, finished_at = NULL,
                 ns_elapsed = NULL, error = NULL
             WHERE p = $1",
        )
        .bind(p)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("exponent {} not found", p);
        }
        Ok(())
    }

    async fn bump_tested(&self, block_id: i64, by: i64) -> Result<()> {
        let result = sqlx::query("UPDATE blocks SET tested_count = tested_count + $2 WHERE id = $1")
            .bind(block_id)
            .bind(by)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("block {} not found", block_id);
        }
        Ok(())
    }

    async fn bump_verified(&self, block_id: i64, by: i64) -> Result<()> {
        let sql = "UPDATE blocks SET verified_count = verified_count + $2 WHERE id = $1";
        let result = sqlx::query(sql)
            .bind(block_id)
            .bind(by)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("block {} not found", block_id);
        }
        Ok(())
    }

    async fn primes_recent(&self, limit: i64) -> Result<Vec<PrimeHit>> {
        let rows = sqlx::query_as::<_, PrimeHit>(
            "SELECT p, block_id, finished_at, engine_info, ns_elapsed
             FROM exponents
             WHERE status = 'done' AND verdict = 'prime'
             ORDER BY finished_at DESC NULLS LAST, p DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prime_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM exponents WHERE status = 'done' AND verdict = 'prime'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
