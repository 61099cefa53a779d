//! Ring buffer acquire/commit/consume throughput, single and multi-producer.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hop::ring::Ring;
use std::sync::Arc;
use std::thread;

fn single_producer(c: &mut Criterion) {
    c.bench_function("single_producer_acquire_commit", |b| {
        let ring = Ring::new(1 << 20, 1);
        let w = ring.register_worker();
        b.iter_batched(
            || (),
            |()| {
                let mut r = ring.acquire(w, 64).unwrap();
                r.as_mut_slice().fill(1);
                r.commit();
                if ring.readable() >= 64 {
                    ring.release(64);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn multi_producer(c: &mut Criterion) {
    c.bench_function("four_producers_acquire_commit", |b| {
        let ring = Arc::new(Ring::new(1 << 20, 4));
        let workers: Vec<usize> = (0..4).map(|_| ring.register_worker()).collect();
        b.iter_batched(
            || (),
            |()| {
                thread::scope(|scope| {
                    for &w in &workers {
                        let ring = Arc::clone(&ring);
                        scope.spawn(move || {
                            let mut r = ring.acquire(w, 64).unwrap();
                            r.as_mut_slice().fill(2);
                            r.commit();
                        });
                    }
                });
                let n = ring.readable();
                if n > 0 {
                    ring.release(n);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, single_producer, multi_producer);
criterion_main!(benches);
