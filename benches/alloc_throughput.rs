//! Allocation throughput benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shmheap::SharedHeap;
use std::sync::Arc;

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    let heap = SharedHeap::create(64 * 1024 * 1024, None).unwrap();
    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = heap.alloc(size).expect("heap not exhausted");
                unsafe { heap.free(p.as_ptr()) };
            });
        });
    }

    group.finish();
}

fn bench_contended_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_contended");

    let heap = Arc::new(SharedHeap::create(64 * 1024 * 1024, None).unwrap());

    group.throughput(Throughput::Elements(4 * 100));
    group.bench_function("4_threads_100_cycles_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let heap = Arc::clone(&heap);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            if let Some(p) = heap.alloc(1024) {
                                std::hint::black_box(p.as_ptr());
                                unsafe { heap.free(p.as_ptr()) };
                            }
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_contended_alloc_free);
criterion_main!(benches);
