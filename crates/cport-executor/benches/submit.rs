//! Submission throughput benchmarks.
//!
//! Run with: cargo bench -p cport-executor --bench submit

use cport_core::handler::HandlerAction;
use cport_core::packet::Completion;
use cport_core::NoopObserver;
use cport_executor::{AdaptiveWorkerService, CompletionPortPool, PoolConfig, ServiceConfig};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BATCH: usize = 1_000;

fn spin_until(counter: &AtomicUsize, n: usize) {
    while counter.load(Ordering::Acquire) < n {
        thread::yield_now();
    }
}

fn bench_pool_post(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_post");
    for threads in [1usize, 4] {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let pool = CompletionPortPool::with_handler(
            PoolConfig::new("bench").observer(Arc::new(NoopObserver)),
            move |c: Completion<u64>| {
                black_box(c.into_payload());
                d.fetch_add(1, Ordering::Release);
                HandlerAction::Continue
            },
        );
        pool.start(threads, threads, None).expect("pool start");

        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                let base = done.load(Ordering::Acquire);
                for i in 0..BATCH {
                    pool.post_completion(0, 0, i as u64).expect("post");
                }
                spin_until(&done, base + BATCH);
            })
        });
        pool.shutdown(Duration::from_secs(5));
    }
    group.finish();
}

fn bench_service_submit(c: &mut Criterion) {
    let svc = AdaptiveWorkerService::new();
    svc.start(
        ServiceConfig::with_max_threads(8)
            .min_threads(4)
            .observer(Arc::new(NoopObserver)),
    )
    .expect("service start");
    let done = Arc::new(AtomicUsize::new(0));

    c.bench_function("service_submit", |b| {
        b.iter(|| {
            let base = done.load(Ordering::Acquire);
            for _ in 0..BATCH {
                let d = done.clone();
                svc.submit(move || {
                    d.fetch_add(1, Ordering::Release);
                })
                .expect("submit");
            }
            spin_until(&done, base + BATCH);
        })
    });
    svc.shutdown();
}

criterion_group!(benches, bench_pool_post, bench_service_submit);
criterion_main!(benches);
