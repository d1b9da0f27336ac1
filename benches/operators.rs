//! Throughput of synchronous operator chains.

use criterion::{criterion_group, criterion_main, Bencher, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rivulet::testing::TestSubscriber;
use rivulet::Flux;

/// Map and filter over `n` items, requested all at once.
fn chain(n: usize, b: &mut Bencher<'_>) {
    let flux = Flux::range(0, n)
        .map(|x| x.wrapping_mul(3))
        .filter(|x| x % 2 == 0)
        .map(|x| x + 1);
    b.iter(|| flux.block_last());
}

/// The same chain driven by random small requests.
fn chain_bounded(n: usize, b: &mut Bencher<'_>) {
    let flux = Flux::range(0, n).map(|x| x.wrapping_mul(3)).filter(|x| x % 2 == 0);
    let mut rng = StdRng::seed_from_u64(7);
    b.iter(|| {
        let probe = TestSubscriber::with_request(0);
        flux.subscribe(probe.clone());
        while !probe.is_terminated() {
            probe.request(rng.gen_range(1..64));
        }
    });
}

/// `outer` inner streams of `inner` items each.
fn flatten(outer: usize, inner: usize, b: &mut Bencher<'_>) {
    let merged = Flux::range(0, outer).flat_map(move |x| Flux::range(x, inner));
    let concatenated = Flux::range(0, outer).concat_map(move |x| Flux::range(x, inner));
    b.iter(|| {
        let _ = merged.block_last();
        let _ = concatenated.block_last();
    });
}

/// A reference doing the same arithmetic without streams.
fn chain_ref(n: usize, b: &mut Bencher<'_>) {
    b.iter(|| {
        (0..n as i32)
            .map(|x| x.wrapping_mul(3))
            .filter(|x| x % 2 == 0)
            .map(|x| x + 1)
            .last()
    });
}

fn bench_fn(c: &mut Criterion) {
    c.bench_function("chain 10k reference", |b| chain_ref(10_000, b));
    c.bench_function("chain 10k", |b| chain(10_000, b));
    c.bench_function("chain 10k bounded demand", |b| chain_bounded(10_000, b));
    c.bench_function("flatten 100x100", |b| flatten(100, 100, b));
    c.bench_function("buffer 10k by 16", |b| {
        let flux = Flux::range(0, 10_000).buffer(16);
        b.iter(|| flux.block_last())
    });
}

criterion_group!(benches, bench_fn);
criterion_main!(benches);
