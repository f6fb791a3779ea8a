use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mersenne_lab::sieve;

fn bench_generate_primes_1m(c: &mut Criterion) {
    c.bench_function("generate_primes(1_000_000)", |b| {
        b.iter(|| sieve::generate_primes(black_box(1_000_000)));
    });
}

fn bench_block_zero(c: &mut Criterion) {
    let (start, end) = sieve::block_bounds(0);
    c.bench_function("primes_in_range(block 0)", |b| {
        b.iter(|| sieve::primes_in_range(black_box(start), black_box(end)));
    });
}

fn bench_block_high(c: &mut Criterion) {
    let (start, end) = sieve::block_bounds(4_000);
    c.bench_function("primes_in_range(block 4000)", |b| {
        b.iter(|| sieve::primes_in_range(black_box(start), black_box(end)));
    });
}

criterion_group!(benches, bench_generate_primes_1m, bench_block_zero, bench_block_high);
criterion_main!(benches);
