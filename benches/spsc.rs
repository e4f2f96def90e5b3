//! Benchmarks for the SPSC queue: single-item vs batched transfer.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::mem::MaybeUninit;
use stdx::spsc::SpscQueue;

const OPS_PER_ITER: u64 = 10_000;

fn bench_push_pop_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    for cap in [8usize, 64, 1024] {
        group.bench_function(format!("push_pop_cycle_cap{cap}"), |b| {
            let mut q: SpscQueue<u64> = SpscQueue::new(cap);
            let (mut tx, mut rx) = q.split();
            b.iter(|| {
                for i in 0..OPS_PER_ITER {
                    let _ = tx.push(black_box(i));
                    black_box(rx.pop());
                }
            })
        });
    }
    group.finish();
}

fn bench_batched(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_batched");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    group.bench_function("push_many_pop_many_cap1024_batch64", |b| {
        let mut q: SpscQueue<u64> = SpscQueue::new(1024);
        let (mut tx, mut rx) = q.split();
        let input: Vec<u64> = (0..64).collect();
        let mut out = [MaybeUninit::<u64>::uninit(); 64];
        b.iter(|| {
            let mut moved = 0u64;
            while moved < OPS_PER_ITER {
                let pushed = tx.push_many(black_box(&input));
                let popped = rx.pop_many(&mut out);
                moved += popped as u64;
                black_box(pushed);
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_push_pop_cycle, bench_batched);
criterion_main!(benches);
