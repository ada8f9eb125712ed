//! Processing throughput with a large population of cyclic entries.

use core_time::DATETIME_MSEC;
use core_timer::{Timer, TimerPolicy};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn seeded_timer(entries: u64) -> Timer {
    let timer = Timer::new();
    for i in 0..entries {
        timer
            .add(|| {}, (i + 1) as f64, 0, None, TimerPolicy::CurrentTime)
            .unwrap();
    }
    timer
}

fn bench_process(c: &mut Criterion) {
    c.bench_function("process_10k_entries_1k_passes", |b| {
        b.iter_batched(
            || seeded_timer(10_000),
            |timer| {
                let mut now = 0i64;
                for _ in 0..1_000 {
                    let next = timer.process(black_box(now));
                    now += 100 * DATETIME_MSEC;
                    if next > now {
                        now = next;
                    }
                }
                black_box(timer.next())
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_process);
criterion_main!(benches);
