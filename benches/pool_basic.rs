//! Basic benchmarks for the `sentinel_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::num::NonZero;

use criterion::{Criterion, criterion_group, criterion_main};
use sentinel_pool::{SentinelPool, SizeClass};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_basic");

    group.bench_function("build_small_pool", |b| {
        b.iter(|| {
            drop(black_box(
                SentinelPool::builder()
                    .block_count(SizeClass::B32, 64)
                    .build(),
            ));
        });
    });

    group.bench_function("allocate_free_single_block", |b| {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B64, 64)
            .build();
        let size = NonZero::new(48_usize).unwrap();

        b.iter(|| {
            let ptr = pool.allocate(black_box(size)).unwrap();
            pool.free(black_box(ptr.as_ptr()));
        });
    });

    group.bench_function("allocate_free_block_run", |b| {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 64)
            .build();
        let size = NonZero::new(100_usize).unwrap();

        b.iter(|| {
            let ptr = pool.allocate(black_box(size)).unwrap();
            pool.free(black_box(ptr.as_ptr()));
        });
    });

    group.bench_function("reallocate_grow_in_place", |b| {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 64)
            .build();
        let size = NonZero::new(20_usize).unwrap();

        b.iter(|| {
            let ptr = pool.allocate(size).unwrap();
            let grown = pool.reallocate(ptr.as_ptr(), black_box(50)).unwrap();
            pool.free(grown.unwrap().as_ptr());
        });
    });

    group.bench_function("allocate_free_with_full_checks", |b| {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B64, 64)
            .full_overflow_checks(true)
            .build();
        let size = NonZero::new(48_usize).unwrap();

        b.iter(|| {
            let ptr = pool.allocate(black_box(size)).unwrap();
            pool.free(black_box(ptr.as_ptr()));
        });
    });

    group.finish();
}
