//! Benchmark store/fetch/checkpoint throughput.
//!
//! Run with: `cargo bench --bench engine_benchmark`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::tempdir;
use twoskip_core::{Config, Engine, OpenFlags};

fn seeded_engine(dir: &std::path::Path, count: u32) -> Engine {
    let engine = Engine::open(&dir.join("db"), OpenFlags::create(), Config::default()).unwrap();
    for i in 0..count {
        let key = format!("key-{i:08}");
        engine.store(key.as_bytes(), b"benchmark-value", false).unwrap();
    }
    engine
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");

    for count in &[100u32, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("sequential_keys", count), count, |bencher, &count| {
            bencher.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let engine = Engine::open(&dir.join("db"), OpenFlags::create(), Config::default()).unwrap();
                    (dir, engine)
                },
                |(_dir, engine)| {
                    for i in 0..count {
                        let key = format!("key-{i:08}");
                        engine.store(black_box(key.as_bytes()), black_box(b"benchmark-value"), false).unwrap();
                    }
                },
            );
        });
    }

    group.finish();
}

fn bench_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch");

    for count in &[100u32, 1_000, 10_000] {
        let dir = tempdir().unwrap();
        let engine = seeded_engine(dir.path(), *count);
        group.bench_with_input(BenchmarkId::new("random_existing_key", count), count, |bencher, &count| {
            bencher.iter(|| {
                let key = format!("key-{:08}", count / 2);
                black_box(engine.fetch(key.as_bytes()).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");

    for count in &[1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::new("half_deleted", count), count, |bencher, &count| {
            bencher.iter_with_setup(
                || {
                    let dir = tempdir().unwrap();
                    let engine = seeded_engine(dir.path(), count);
                    for i in 0..count / 2 {
                        let key = format!("key-{i:08}");
                        engine.delete(key.as_bytes(), false).unwrap();
                    }
                    (dir, engine)
                },
                |(_dir, engine)| {
                    engine.checkpoint().unwrap();
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_store, bench_fetch, bench_checkpoint);
criterion_main!(benches);
