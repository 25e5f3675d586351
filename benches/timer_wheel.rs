//! Timer benchmarks for Spindle.
//!
//! These benchmarks measure the producer-side hot path and end-to-end
//! throughput:
//! - Scheduling (pool slot + wait-free queue push, O(1) expected)
//! - Cancellation (one generation-checked atomic store, O(1) expected)
//! - Schedule-and-fire churn through the driver thread
//!
//! Performance targets:
//! - Schedule: < 200ns per entry from a single producer
//! - Cancel: < 50ns per handle

#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use spindle::Timer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// SCHEDULING BENCHMARKS
// =============================================================================

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/schedule");

    // The driver is never started: this isolates the producer path. A
    // fresh timer per batch keeps the un-drained queue bounded.
    for (name, delay) in [
        ("level0_50ms", Duration::from_millis(50)),
        ("level1_3s", Duration::from_secs(3)),
        ("level3_1h", Duration::from_secs(3_600)),
        ("level5_1y", Duration::from_secs(31_536_000)),
    ] {
        group.bench_with_input(BenchmarkId::new("horizon", name), &delay, |b, &delay| {
            b.iter_batched_ref(
                || Timer::new(|entry| entry.execute()),
                |timer| {
                    let handle = timer.schedule(delay, || {}).unwrap();
                    black_box(handle);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/cancel");

    group.bench_function("single", |b| {
        let timer = Timer::new(|entry| entry.execute());
        let handle = timer.schedule(Duration::from_secs(3_600), || {}).unwrap();
        b.iter(|| {
            handle.cancel();
            black_box(handle.is_canceled());
        });
    });

    group.finish();
}

// =============================================================================
// END-TO-END CHURN
// =============================================================================

fn bench_fire_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/fire");
    group.throughput(Throughput::Elements(1_000));
    group.sample_size(10);

    group.bench_function("1k_short_deadlines", |b| {
        b.iter(|| {
            let fired = Arc::new(AtomicU64::new(0));
            let timer = Timer::new(|entry| entry.execute());
            timer.start();
            for i in 0..1_000u64 {
                let fired = fired.clone();
                timer
                    .schedule(Duration::from_millis(1 + i % 10), move || {
                        fired.fetch_add(1, Ordering::Relaxed);
                    })
                    .unwrap();
            }
            while fired.load(Ordering::Relaxed) < 1_000 {
                std::hint::spin_loop();
            }
            timer.stop();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_schedule, bench_cancel, bench_fire_churn);
criterion_main!(benches);
