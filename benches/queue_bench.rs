use criterion::{criterion_group, criterion_main, Bencher, Criterion};
use maq::Queue;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ITEMS_PER_THREAD_TARGET: usize = 200_000;
const THREAD_COUNTS_TO_TEST: &[(usize, usize)] = &[(1, 1), (2, 2), (4, 4)];

fn run_mpmc(
    initial_capacity: u64,
    num_producers: usize,
    num_consumers: usize,
    items_per_thread: usize,
) -> Duration {
    let queue = Arc::new(Queue::new(initial_capacity, 1 << 22));
    let ready = Arc::new(AtomicU32::new(0));
    let go = Arc::new(AtomicBool::new(false));
    let consumed = Arc::new(AtomicUsize::new(0));
    let total_items = num_producers * items_per_thread;

    let mut handles = Vec::new();
    for producer in 0..num_producers {
        let queue = Arc::clone(&queue);
        let ready = Arc::clone(&ready);
        let go = Arc::clone(&go);
        handles.push(thread::spawn(move || {
            ready.fetch_add(1, Ordering::AcqRel);
            while !go.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            let base = (producer * items_per_thread) as u64;
            for offset in 0..items_per_thread as u64 {
                queue.enqueue(base + offset);
            }
        }));
    }
    for _ in 0..num_consumers {
        let queue = Arc::clone(&queue);
        let ready = Arc::clone(&ready);
        let go = Arc::clone(&go);
        let consumed = Arc::clone(&consumed);
        handles.push(thread::spawn(move || {
            ready.fetch_add(1, Ordering::AcqRel);
            while !go.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            while consumed.load(Ordering::Relaxed) < total_items {
                if queue.dequeue().is_some() {
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    while ready.load(Ordering::Acquire) < (num_producers + num_consumers) as u32 {
        std::hint::spin_loop();
    }
    let start = Instant::now();
    go.store(true, Ordering::Release);
    for handle in handles {
        handle.join().expect("bench worker panicked");
    }
    start.elapsed()
}

fn bench_presized_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("MostlyAtomicQueue");
    for &(num_prods, num_cons) in THREAD_COUNTS_TO_TEST {
        group.bench_function(format!("{}P_{}C", num_prods, num_cons), |b: &mut Bencher| {
            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    elapsed += run_mpmc(1024, num_prods, num_cons, ITEMS_PER_THREAD_TARGET);
                }
                elapsed
            })
        });
    }
    group.finish();
}

fn bench_growth_from_minimum(c: &mut Criterion) {
    let mut group = c.benchmark_group("MostlyAtomicQueueGrowth");
    for &(num_prods, num_cons) in THREAD_COUNTS_TO_TEST {
        group.bench_function(format!("{}P_{}C", num_prods, num_cons), |b: &mut Bencher| {
            b.iter_custom(|iters| {
                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    // Start at the smallest ring so chaining and
                    // retirement are part of the measured work.
                    elapsed += run_mpmc(4, num_prods, num_cons, ITEMS_PER_THREAD_TARGET / 4);
                }
                elapsed
            })
        });
    }
    group.finish();
}

fn custom_criterion() -> Criterion {
    Criterion::default()
        .warm_up_time(Duration::from_secs(2))
        .measurement_time(Duration::from_secs(10))
        .sample_size(10)
}

criterion_group! {
    name = benches;
    config = custom_criterion();
    targets = bench_presized_pairs, bench_growth_from_minimum
}

criterion_main!(benches);
