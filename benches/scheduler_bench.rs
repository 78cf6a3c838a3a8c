//! Benchmarks for admission control and the hand-off queues.
//!
//! Benchmarks cover:
//! - Uncontended acquire/release on the scheduler
//! - Contended admission with mixed costs
//! - Probe queue put/poll throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use media_admission_pipeline::core::cost::cost_for_height;
use media_admission_pipeline::core::ResourceScheduler;
use media_admission_pipeline::pipeline::BoundedQueue;

use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

// ============================================================================
// Scheduler Benchmarks
// ============================================================================

fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let scheduler = ResourceScheduler::new(64);

    c.bench_function("scheduler_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = scheduler
                .try_acquire(black_box(8), Duration::from_millis(10))
                .await
                .expect("uncontended grant");
            scheduler.release(handle);
        });
    });
}

fn bench_contended_admission(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("scheduler_contended");
    let heights = [240_u32, 480, 720, 1080, 2160];

    for tasks in [16_u64, 64, 256] {
        group.throughput(Throughput::Elements(tasks));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| async move {
                let scheduler = ResourceScheduler::new(64);
                let mut handles = Vec::with_capacity(tasks as usize);
                for i in 0..tasks as usize {
                    let scheduler = scheduler.clone();
                    let cost = cost_for_height(heights[i % heights.len()]);
                    handles.push(tokio::spawn(async move {
                        let handle = scheduler.acquire(cost).await.expect("scheduler open");
                        tokio::task::yield_now().await;
                        scheduler.release(handle);
                    }));
                }
                for handle in handles {
                    handle.await.expect("task completes");
                }
                black_box(scheduler.current_usage());
            });
        });
    }
    group.finish();
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_put_poll(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_put_poll");

    for size in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let queue = BoundedQueue::new("bench", size as usize);
                for i in 0..size {
                    queue.put(i).await.expect("queue open");
                }
                while let Some(item) = queue.poll(Duration::ZERO).await {
                    black_box(item.into_inner());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_contended_admission,
    bench_queue_put_poll
);
criterion_main!(benches);
