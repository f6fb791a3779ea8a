pub mod dashboard;
pub mod db;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod prom_metrics;
pub mod scheduler;
pub mod sieve;

use rug::Integer;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering from poisoning.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Two-round Miller-Rabin pre-screening: run 2 fast rounds first, full rounds only for survivors.
pub fn mr_screened_test(candidate: &Integer, mr_rounds: u32) -> rug::integer::IsPrime {
    use rug::integer::IsPrime;
    if mr_rounds > 2 && candidate.is_probably_prime(2) == IsPrime::No {
        return IsPrime::No;
    }
    candidate.is_probably_prime(mr_rounds)
}

/// Decimal digit count of the Mersenne number 2^p - 1.
///
/// 2^p is never a power of ten for p >= 1, so 2^p - 1 has as many digits as
/// 2^p, which is floor(p·log10 2) + 1.
pub fn mersenne_digits(p: u64) -> u64 {
    if p == 0 {
        return 1;
    }
    (p as f64 * std::f64::consts::LOG10_2) as u64 + 1
}
