//! In-process `BlockStore` for `--ephemeral` runs and tests.
//!
//! All state sits behind one mutex, so every operation is trivially atomic.
//! Nothing survives the process.

use super::{BlockRow, BlockStatus, BlockStore, PrimeHit, UnitRow, UnitStatus, Verdict};
use crate::lock_or_recover;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<i64, BlockRow>,
    units: BTreeMap<i64, UnitRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn clear_unit(unit: &mut UnitRow) {
    unit.status = UnitStatus::Queued;
    unit.started_at = None;
    unit.finished_at = None;
    unit.ns_elapsed = None;
    unit.error = None;
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn upsert_block(
        &self,
        id: i64,
        start: i64,
        end: i64,
        candidate_count: i64,
    ) -> Result<()> {
        if start >= end {
            bail!("block {}: empty range [{}, {})", id, start, end);
        }
        let mut t = lock_or_recover(&self.tables);
        t.blocks
            .entry(id)
            .and_modify(|b| {
                b.start_p = start;
                b.end_p_excl = end;
                b.candidate_count = candidate_count;
            })
            .or_insert_with(|| BlockRow {
                id,
                start_p: start,
                end_p_excl: end,
                candidate_count,
                tested_count: 0,
                verified_count: 0,
                status: BlockStatus::Idle,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            });
        Ok(())
    }

    async fn get_block(&self, id: i64) -> Result<Option<BlockRow>> {
        Ok(lock_or_recover(&self.tables).blocks.get(&id).cloned())
    }

    async fn list_blocks(&self, limit: i64) -> Result<Vec<BlockRow>> {
        let take = usize::try_from(limit).unwrap_or(0);
        Ok(lock_or_recover(&self.tables)
            .blocks
            .values()
            .take(take)
            .cloned()
            .collect())
    }

    async fn set_block_status(&self, id: i64, status: BlockStatus) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(block) = t.blocks.get_mut(&id) else {
            bail!("block {} not found", id);
        };
        block.status = status;
        match status {
            BlockStatus::Running => {
                block.started_at = Some(Utc::now());
                block.finished_at = None;
            }
            BlockStatus::Done => block.finished_at = Some(Utc::now()),
            BlockStatus::Idle => {}
        }
        Ok(())
    }

    async fn seed_units(&self, block_id: i64, candidates: &[i64]) -> Result<u64> {
        let mut t = lock_or_recover(&self.tables);
        if !t.blocks.contains_key(&block_id) {
            bail!("block {} not found", block_id);
        }
        let mut inserted = 0;
        for &p in candidates {
            if t.units.contains_key(&p) {
                continue;
            }
            t.units.insert(
                p,
                UnitRow {
                    p,
                    block_id,
                    status: UnitStatus::Queued,
                    verdict: Verdict::Unknown,
                    ns_elapsed: None,
                    engine_info: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn units_by_block(&self, block_id: i64) -> Result<Vec<UnitRow>> {
        Ok(lock_or_recover(&self.tables)
            .units
            .values()
            .filter(|u| u.block_id == block_id)
            .cloned()
            .collect())
    }

    async fn units_unfinished(&self, block_id: i64) -> Result<Vec<i64>> {
        Ok(lock_or_recover(&self.tables)
            .units
            .values()
            .filter(|u| u.block_id == block_id)
            .filter(|u| !matches!(u.status, UnitStatus::Done | UnitStatus::Running))
            .map(|u| u.p)
            .collect())
    }

    async fn reset_orphaned(&self, block_id: i64) -> Result<u64> {
        let mut t = lock_or_recover(&self.tables);
        let mut reset = 0;
        for unit in t.units.values_mut() {
            if unit.block_id == block_id && unit.status == UnitStatus::Running {
                clear_unit(unit);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn unit_start(&self, p: i64) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(unit) = t.units.get_mut(&p) else {
            bail!("exponent {} not found", p);
        };
        unit.status = UnitStatus::Running;
        unit.started_at = Some(Utc::now());
        unit.error = None;
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
        let mut t = lock_or_recover(&self.tables);
        let Some(unit) = t.units.get_mut(&p) else {
            bail!("exponent {} not found", p);
        };
        unit.status = UnitStatus::Done;
        unit.verdict = verdict;
        unit.ns_elapsed = Some(ns_elapsed);
        unit.engine_info = Some(engine_info.to_string());
        unit.error = None;
        unit.finished_at = Some(Utc::now());
        let block_id = unit.block_id;
        if verdict == Verdict::Prime {
            if let Some(block) = t.blocks.get_mut(&block_id) {
                block.verified_count += 1;
            }
        }
        Ok(())
    }

    async fn unit_fail(&self, p: i64, error: &str) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(unit) = t.units.get_mut(&p) else {
            bail!("exponent {} not found", p);
        };
        unit.status = UnitStatus::Error;
        unit.error = Some(error.to_string());
        unit.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn unit_reset(&self, p: i64) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(unit) = t.units.get_mut(&p) else {
            bail!("exponent {} not found", p);
        };
        clear_unit(unit);
        Ok(())
    }

    async fn bump_tested(&self, block_id: i64, by: i64) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(block) = t.blocks.get_mut(&block_id) else {
            bail!("block {} not found", block_id);
        };
        block.tested_count += by;
        Ok(())
    }

    async fn bump_verified(&self, block_id: i64, by: i64) -> Result<()> {
        let mut t = lock_or_recover(&self.tables);
        let Some(block) = t.blocks.get_mut(&block_id) else {
            bail!("block {} not found", block_id);
        };
        block.verified_count += by;
        Ok(())
    }

    async fn primes_recent(&self, limit: i64) -> Result<Vec<PrimeHit>> {
        let t = lock_or_recover(&self.tables);
        let mut hits: Vec<PrimeHit> = t
            .units
            .values()
            .filter(|u| u.status == UnitStatus::Done && u.verdict == Verdict::Prime)
            .map(|u| PrimeHit {
                p: u.p,
                block_id: u.block_id,
                finished_at: u.finished_at,
                engine_info: u.engine_info.clone(),
                ns_elapsed: u.ns_elapsed,
            })
            .collect();
        // Newest first; ties (same timestamp) fall back to larger exponent first.
        hits.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.p.cmp(&a.p)));
        hits.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(hits)
    }

    async fn prime_count(&self) -> Result<i64> {
        let t = lock_or_recover(&self.tables);
        Ok(t.units
            .values()
            .filter(|u| u.status == UnitStatus::Done && u.verdict == Verdict::Prime)
            .count() as i64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
