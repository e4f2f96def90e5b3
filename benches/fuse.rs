//! Benchmarks for binary fuse filter build and query paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stdx::fuse::{BinaryFuse16, BinaryFuse8};

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("fuse_build");
    group.sample_size(10);

    for n in [10_000u64, 100_000, 1_000_000] {
        let keys: Vec<u64> = (0..n).collect();
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("binary_fuse8", n), &keys, |b, keys| {
            b.iter(|| BinaryFuse8::populate(black_box(keys)).unwrap())
        });
    }
    group.finish();
}

fn bench_contains(c: &mut Criterion) {
    let mut group = c.benchmark_group("fuse_contains");
    const PROBES: u64 = 10_000;
    group.throughput(Throughput::Elements(PROBES));

    let keys: Vec<u64> = (0..1_000_000).collect();
    let f8 = BinaryFuse8::populate(&keys).unwrap();
    let f16 = BinaryFuse16::populate(&keys).unwrap();

    group.bench_function("binary_fuse8_hit", |b| {
        b.iter(|| {
            for k in 0..PROBES {
                black_box(f8.contains(black_box(k * 97)));
            }
        })
    });
    group.bench_function("binary_fuse8_miss", |b| {
        b.iter(|| {
            for k in 0..PROBES {
                black_box(f8.contains(black_box(k | (1 << 63))));
            }
        })
    });
    group.bench_function("binary_fuse16_hit", |b| {
        b.iter(|| {
            for k in 0..PROBES {
                black_box(f16.contains(black_box(k * 97)));
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_contains);
criterion_main!(benches);
