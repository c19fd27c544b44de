//! Pool hot-path benchmark: acquire/release cycle and child carving.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use flux_memory::{MemoryBank, MemoryBankManager};

fn pool_acquire_release(c: &mut Criterion) {
    let manager = MemoryBankManager::new();
    manager
        .add_bank(Arc::new(MemoryBank::new_owned("bench", 64 << 20).unwrap()))
        .unwrap();
    let pool = manager.get_paged_pool(128 << 10, 256, "bench", 0, 0).unwrap();

    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            let page = pool.acquire().unwrap();
            criterion::black_box(&page);
        })
    });

    c.bench_function("acquire_block_release", |b| {
        b.iter(|| {
            let page = pool.acquire_block().unwrap();
            criterion::black_box(&page);
        })
    });

    c.bench_function("child_carve", |b| {
        b.iter_batched(
            || pool.acquire_block().unwrap(),
            |parent| {
                while let Some(child) = parent.child_block(4096) {
                    criterion::black_box(&child);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, pool_acquire_release);
criterion_main!(benches);
