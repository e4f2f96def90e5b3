//! Benchmarks for the MPMC queue.
//!
//! Covers the uncontended single-thread cycle and the cross-thread handoff
//! rate at small and large capacities.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use stdx::mpmc::MpmcQueue;

const OPS_PER_ITER: u64 = 10_000;

fn bench_uncontended_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    for cap in [8usize, 64, 1024] {
        group.bench_function(format!("enqueue_dequeue_cap{cap}"), |b| {
            let q: MpmcQueue<u64> = MpmcQueue::new(cap);
            b.iter(|| {
                for i in 0..OPS_PER_ITER {
                    q.enqueue(black_box(i));
                    black_box(q.dequeue());
                }
            })
        });
    }
    group.finish();
}

fn bench_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_cross_thread");
    group.throughput(Throughput::Elements(OPS_PER_ITER));
    group.sample_size(10);

    group.bench_function("two_producers_two_consumers_cap64", |b| {
        b.iter(|| {
            let q = Arc::new(MpmcQueue::<u64>::new(64));
            std::thread::scope(|s| {
                for _ in 0..2 {
                    let q = Arc::clone(&q);
                    s.spawn(move || {
                        for i in 0..OPS_PER_ITER / 2 {
                            q.enqueue(i);
                        }
                    });
                }
                for _ in 0..2 {
                    let q = Arc::clone(&q);
                    s.spawn(move || {
                        for _ in 0..OPS_PER_ITER / 2 {
                            black_box(q.dequeue());
                        }
                    });
                }
            });
        })
    });
    group.finish();
}

criterion_group!(benches, bench_uncontended_cycle, bench_cross_thread);
criterion_main!(benches);
