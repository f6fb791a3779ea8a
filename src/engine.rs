//! # Engine — Lucas-Lehmer Primality Test for M_p = 2^p - 1
//!
//! The scheduler treats the primality test as an opaque synchronous call
//! behind the [`Engine`] trait. The call reports progress through a checkpoint
//! callback that can ask the engine to abort; an abort surfaces as the typed
//! [`EngineError::Cancelled`] so callers never inspect error text to tell a
//! cancellation from a real failure.
//!
//! ## Algorithm
//!
//! s₀ = 4, sᵢ₊₁ = sᵢ² - 2 mod M_p. M_p is prime iff s_{p-2} ≡ 0. Reduction
//! modulo 2^p - 1 uses the identity x ≡ (x mod 2^p) + (x >> p), so each
//! iteration costs one GMP squaring plus shifts and adds.
//!
//! ## Checkpoints
//!
//! With `checkpoint_interval = 0` the stride is `max(1, (p-2)/100)`,
//! roughly one checkpoint per percent. A checkpoint fires after iteration `i`
//! when `(i+1) % stride == 0` and always after the final iteration. Each
//! checkpoint passes the 0-based iteration index and a SHA-256 digest of the
//! current residue.
//!
//! ## References
//!
//! - Lucas-Lehmer test: <https://en.wikipedia.org/wiki/Lucas%E2%80%93Lehmer_primality_test>
//! - GIMPS: <https://www.mersenne.org/>

use rug::integer::{IsPrime, Order};
use rug::Integer;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::db::Verdict;

/// Returned by the checkpoint callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Abort,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    /// The checkpoint callback asked the engine to stop.
    #[error("cancelled at checkpoint")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct EngineReport {
    pub verdict: Verdict,
    pub elapsed: Duration,
    pub engine_info: String,
}

/// Synchronous primality engine. Runs on a compute thread, never on the
/// async runtime.
pub trait Engine: Send + Sync {
    fn test(
        &self,
        candidate: u64,
        checkpoint_interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError>;
}

/// Checkpoint stride for `total` iterations; `interval = 0` means ~1%.
pub fn checkpoint_stride(total: u64, interval: u64) -> u64 {
    if interval != 0 {
        interval
    } else {
        (total / 100).max(1)
    }
}

/// Progress percentage after 0-based `iteration` of the test of M_`candidate`.
pub fn progress_pct(iteration: u64, candidate: u64) -> u64 {
    (iteration + 1) * 100 / candidate.saturating_sub(2).max(1)
}

/// x mod 2^p - 1 for x in (-2^p, 2^(2p)).
fn mersenne_reduce(x: &mut Integer, m: &Integer, p: u32) {
    if *x < 0 {
        *x += m;
    }
    let hi = Integer::from(&*x >> p);
    x.keep_bits_mut(p);
    *x += hi;
    // One fold leaves x < 2^(p+1), so at most one more subtraction.
    if *x >= *m {
        *x -= m;
    }
}

fn residue_digest(s: &Integer) -> [u8; 32] {
    let bytes = s.to_digits::<u8>(Order::Lsf);
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(&bytes));
    out
}

/// GMP-backed Lucas-Lehmer engine.
#[derive(Debug, Clone, Default)]
pub struct LucasLehmer;

impl LucasLehmer {
    fn info() -> String {
        format!("rug-gmp; lucas-lehmer; {}", env!("CARGO_PKG_VERSION"))
    }
}

impl Engine for LucasLehmer {
    fn test(
        &self,
        candidate: u64,
        checkpoint_interval: u64,
        on_progress: &mut dyn FnMut(u64, &[u8]) -> Checkpoint,
    ) -> Result<EngineReport, EngineError> {
        if candidate < 2 {
            return Err(EngineError::Failed(format!("exponent {} must be >= 2", candidate)));
        }
        let p = u32::try_from(candidate)
            .map_err(|_| EngineError::Failed(format!("exponent {} exceeds 32 bits", candidate)))?;
        if crate::mr_screened_test(&Integer::from(p), 25) == IsPrime::No {
            return Err(EngineError::Failed(format!("exponent {} is not prime", candidate)));
        }

        let started = Instant::now();
        if p == 2 {
            return Ok(EngineReport {
                verdict: Verdict::Prime,
                elapsed: started.elapsed(),
                engine_info: Self::info(),
            });
        }

        let total = u64::from(p - 2);
        let stride = checkpoint_stride(total, checkpoint_interval);
        let m = (Integer::from(1) << p) - 1u32;
        let mut s = Integer::from(4);

        for i in 0..total {
            if i > 0 && s == 0 {
                // Zero before the last step stays at -2 afterwards: composite.
                return Ok(EngineReport {
                    verdict: Verdict::Composite,
                    elapsed: started.elapsed(),
                    engine_info: Self::info(),
                });
            }
            s.square_mut();
            s -= 2u32;
            mersenne_reduce(&mut s, &m, p);

            if (i + 1) % stride == 0 || i + 1 == total {
                let digest = residue_digest(&s);
                if on_progress(i, &digest) == Checkpoint::Abort {
                    return Err(EngineError::Cancelled);
                }
            }
        }

        let verdict = if s == 0 { Verdict::Prime } else { Verdict::Composite };
        Ok(EngineReport {
            verdict,
            elapsed: started.elapsed(),
            engine_info: Self::info(),
        })
    }
}
