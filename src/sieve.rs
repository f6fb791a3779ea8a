//! # Sieve — Candidate Generation for Exponent Blocks
//!
//! Produces the prime exponents a block run will test. Two layers:
//!
//! 1. **Base primes** via a wheel-30 sieve of Eratosthenes (`generate_primes`),
//!    storing only residues coprime to {2, 3, 5}.
//! 2. **Segmented range sieve** (`primes_in_range`): base primes up to √b
//!    cross off composites inside [a, b), so memory is proportional to the
//!    segment width rather than to b.
//!
//! ## Algorithm: Segmented Sieve
//!
//! For each base prime p ≤ √(b−1), the first multiple to cross off is
//! max(p², ⌈a/p⌉·p). Anything smaller than p² was already removed by a smaller
//! base prime, and p itself must survive when it lies inside the segment.
//! Survivors are packed into a [`BitSieve`] (one bit per integer).
//!
//! Complexity: O(√b log log √b + (b−a) log log b) time, O((b−a)/8) bytes.
//! A 1M-wide block anywhere below 2^32 sieves in a few milliseconds, so the
//! scheduler calls this on demand and relies on the store as its cache.
//!
//! ## References
//!
//! - Eratosthenes of Cyrene, ~240 BCE (sieve algorithm).
//! - Carter Bays and Richard H. Hudson, "The segmented sieve of Eratosthenes
//!   and primes in arithmetic progressions to 10^12", BIT 17 (1977).

/// Width of every exponent block: block `k` covers [k·W, k·W + W).
pub const BLOCK_WIDTH: u64 = 1_000_000;

/// Half-open exponent range [start, end) covered by `block_id`.
pub fn block_bounds(block_id: u64) -> (u64, u64) {
    let start = block_id * BLOCK_WIDTH;
    (start, start + BLOCK_WIDTH)
}

/// Generate all primes up to `limit` (inclusive) using a wheel-30 sieve.
///
/// Uses a mod-30 wheel to store only numbers coprime to {2,3,5}, reducing
/// memory to 8/30 ≈ 26.7% of the naive sieve.
pub fn generate_primes(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return vec![];
    }
    if limit < 7 {
        return [2, 3, 5].iter().copied().filter(|&p| p <= limit).collect();
    }

    // Residues coprime to 30: these are the only positions we track
    const RESIDUES: [u8; 8] = [1, 7, 11, 13, 17, 19, 23, 29];

    // Map residue → index in the wheel (255 = not coprime to 30)
    const RES_TO_IDX: [u8; 30] = [
        255, 0, 255, 255, 255, 255, 255, 1, 255, 255, 255, 2, 255, 3, 255, 255, 255, 4, 255, 5,
        255, 255, 255, 6, 255, 255, 255, 255, 255, 7,
    ];

    let limit = limit as usize;
    let num_segments = limit / 30 + 1;
    let mut sieve = vec![0xFFu8; num_segments];

    let sqrt_limit = isqrt(limit as u64) as usize;
    for seg in 0..num_segments {
        for &ri in &RESIDUES {
            let n = seg * 30 + ri as usize;
            if n < 7 || n > sqrt_limit {
                continue;
            }
            let idx = RES_TO_IDX[ri as usize] as usize;
            if sieve[seg] & (1 << idx) == 0 {
                continue;
            }
            let mut m = n * n;
            while m <= limit {
                let mr = m % 30;
                if RES_TO_IDX[mr] != 255 {
                    sieve[m / 30] &= !(1 << RES_TO_IDX[mr]);
                }
                m += n;
            }
        }
    }

    let mut primes = Vec::with_capacity(estimate_prime_count(limit));
    primes.extend_from_slice(&[2, 3, 5]);

    for (seg, &byte) in sieve.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for (bit_idx, &r) in RESIDUES.iter().enumerate() {
            if byte & (1 << bit_idx) != 0 {
                let n = seg * 30 + r as usize;
                if n > 5 && n <= limit {
                    primes.push(n as u64);
                }
            }
        }
    }
    primes
}

/// Ordered primes in the half-open range [start, end).
///
/// `end <= 2` yields nothing and `start` is clamped to 2. Deterministic and
/// side-effect free, so results may be cached by range.
pub fn primes_in_range(start: u64, end: u64) -> Vec<u64> {
    if end <= 2 {
        return vec![];
    }
    let start = start.max(2);
    if start >= end {
        return vec![];
    }

    let base = generate_primes(isqrt(end - 1));
    let mut segment = BitSieve::new_all_set((end - start) as usize);
    for &p in &base {
        let first = (p * p).max(start.div_ceil(p) * p);
        if first >= end {
            continue;
        }
        for m in (first..end).step_by(p as usize) {
            segment.clear((m - start) as usize);
        }
    }

    segment
        .iter_set_bits()
        .map(|i| start + i as u64)
        .collect()
}

/// Floor of the square root, exact for every u64.
fn isqrt(n: u64) -> u64 {
    let mut r = (n as f64).sqrt() as u64;
    while r.checked_mul(r).map_or(true, |sq| sq > n) {
        r -= 1;
    }
    while (r + 1).checked_mul(r + 1).is_some_and(|sq| sq <= n) {
        r += 1;
    }
    r
}

/// Estimate prime count up to n (over-estimate, used for Vec capacity).
fn estimate_prime_count(n: usize) -> usize {
    if n < 10 {
        return 4;
    }
    let nf = n as f64;
    (1.3 * nf / nf.ln()) as usize
}

/// Packed bit array for sieve results.
///
/// Bit `i` is stored in word `i / 64`, bit position `i % 64`. A set bit means
/// the integer **survives** the sieve; a clear bit means it was eliminated.
pub struct BitSieve {
    words: Vec<u64>,
    len: usize,
}

impl BitSieve {
    /// Create a sieve of `len` bits, all set to 1 (all candidates survive).
    pub fn new_all_set(len: usize) -> Self {
        let num_words = len.div_ceil(64);
        let mut words = vec![u64::MAX; num_words];
        // Clear unused high bits in the last word
        let extra = num_words * 64 - len;
        if extra > 0 && num_words > 0 {
            words[num_words - 1] >>= extra;
        }
        BitSieve { words, len }
    }

    /// Clear bit `index` to 0 (candidate eliminated).
    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    /// Iterate over the indices of all set bits in ascending order.
    pub fn iter_set_bits(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| BitIter {
            word,
            base: wi * 64,
        })
    }
}

// Inspection helpers for the bitmap tests.
#[cfg(test)]
impl BitSieve {
    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Iterator over set bits within a single u64 word.
struct BitIter {
    word: u64,
    base: usize,
}

impl Iterator for BitIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.word == 0 {
            return None;
        }
        let tz = self.word.trailing_zeros() as usize;
        self.word &= self.word - 1; // clear lowest set bit
        Some(self.base + tz)
    }
}
