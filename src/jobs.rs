//! # Jobs — Single-Exponent Lucas-Lehmer Tests
//!
//! Ad hoc tests of one exponent outside any block. A job is accepted with
//! `{p, progress_stride}`, runs on the scheduler's engine pool, and streams
//! `{iteration, pct, digest}` checkpoints on its own [`JobBus`] topic until
//! the topic is closed at completion. Job records live in memory only and are
//! not written to the block store.
//!
//! [`JobBus`]: crate::events::JobBus

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db::Verdict;
use crate::engine::EngineReport;
use crate::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub p: u64,
    pub is_prime: bool,
    /// Squarings in a full test: `p - 2`, zero for p = 2.
    pub iterations: u64,
    pub ns_elapsed: i64,
    pub final_residue_is_zero: bool,
    pub engine_info: String,
}

impl JobResult {
    pub fn from_report(p: u64, report: &EngineReport) -> Self {
        let is_prime = report.verdict == Verdict::Prime;
        JobResult {
            p,
            is_prime,
            iterations: p.saturating_sub(2),
            ns_elapsed: i64::try_from(report.elapsed.as_nanos()).unwrap_or(i64::MAX),
            final_residue_is_zero: is_prime,
            engine_info: report.engine_info.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    #[serde(serialize_with = "serialize_simple")]
    pub id: Uuid,
    pub p: u64,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

fn serialize_simple<S: serde::Serializer>(id: &Uuid, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&id.simple().to_string())
}

/// In-memory job table.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    /// Register a queued job for `p` and return its id.
    pub fn insert(&self, p: u64) -> Uuid {
        let id = Uuid::new_v4();
        lock_or_recover(&self.jobs).insert(
            id,
            JobRecord {
                id,
                p,
                status: JobStatus::Queued,
                result: None,
                error: None,
            },
        );
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        lock_or_recover(&self.jobs).get(id).cloned()
    }

    pub fn mark_running(&self, id: &Uuid) {
        if let Some(job) = lock_or_recover(&self.jobs).get_mut(id) {
            job.status = JobStatus::Running;
        }
    }

    pub fn finish(&self, id: &Uuid, outcome: Result<JobResult, String>) {
        if let Some(job) = lock_or_recover(&self.jobs).get_mut(id) {
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Done;
                    job.result = Some(result);
                }
                Err(error) => {
                    job.status = JobStatus::Error;
                    job.error = Some(error);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
