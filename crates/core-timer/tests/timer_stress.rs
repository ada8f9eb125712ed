//! Stress and property coverage for the ordered timer.

use core_time::{DATETIME_MSEC, DATETIME_SEC};
use core_timer::{Timer, TimerPolicy};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Seed thousands of cyclic entries and drive the timer far into the
/// future. Every remaining entry must be scheduled past the final `now`
/// and the slow entries must have fired roughly once per elapsed interval.
#[test]
fn stress_many_cyclic_entries() {
    const ENTRIES: u64 = 10_000;
    const ITERATIONS: usize = 1_000;

    let timer = Timer::new();
    let counts: Vec<Arc<AtomicU64>> = (0..ENTRIES).map(|_| Arc::new(AtomicU64::new(0))).collect();

    for i in 0..ENTRIES {
        let count = counts[i as usize].clone();
        let interval_ms = (i + 1) as f64;
        timer
            .add(
                move || {
                    count.fetch_add(1, Ordering::Relaxed);
                },
                interval_ms,
                0,
                None,
                TimerPolicy::CurrentTime,
            )
            .unwrap();
    }
    assert_eq!(timer.len(), ENTRIES as usize);

    let mut now = 0i64;
    let mut last_pass = 0i64;
    for _ in 0..ITERATIONS {
        last_pass = now;
        let next = timer.process(now);
        // At least 100 ms between processing passes.
        now += 100 * DATETIME_MSEC;
        if next > now {
            now = next;
        }
    }

    // No entry was lost and none is due at the last processing time.
    assert_eq!(timer.len(), ENTRIES as usize);
    assert!(timer.next() > last_pass);

    // Each entry fired at least once per elapsed interval, allowing the
    // 100 ms pass granularity as slack per firing.
    let elapsed = last_pass;
    for i in 0..ENTRIES {
        let interval = (i + 1) as i64 * DATETIME_MSEC;
        let fired = counts[i as usize].load(Ordering::Relaxed);
        let expected = (elapsed / (interval + 100 * DATETIME_MSEC)) as u64;
        assert!(
            fired >= expected,
            "entry {} fired {} times, expected at least {}",
            i + 1,
            fired,
            expected
        );
    }
}

proptest! {
    /// After `process(t)` the earliest remaining entry lies strictly past `t`.
    #[test]
    fn earliest_entry_past_process_time(
        intervals in prop::collection::vec(1u64..5_000, 1..50),
        steps in prop::collection::vec(1i64..2_000, 1..20),
    ) {
        let timer = Timer::new();
        for ival in &intervals {
            timer
                .add(|| {}, *ival as f64, 0, None, TimerPolicy::CurrentTime)
                .unwrap();
        }
        let mut now = 0i64;
        for step in steps {
            now += step * DATETIME_MSEC;
            let next = timer.process(now);
            prop_assert!(next > now);
            prop_assert_eq!(next, timer.next());
        }
        prop_assert_eq!(timer.len(), intervals.len());
    }

    /// CurrentTime entries keep at least one interval between executions,
    /// regardless of how irregularly the timer is processed.
    #[test]
    fn current_time_spacing(
        interval_ms in 10u64..500,
        steps in prop::collection::vec(1i64..3_000, 2..30),
    ) {
        let timer = Timer::new();
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stamps2 = stamps.clone();
        let now_cell = Arc::new(AtomicU64::new(0));
        let now_cell2 = now_cell.clone();
        timer
            .add(
                move || {
                    stamps2
                        .lock()
                        .unwrap()
                        .push(now_cell2.load(Ordering::Relaxed) as i64);
                },
                interval_ms as f64,
                0,
                None,
                TimerPolicy::CurrentTime,
            )
            .unwrap();

        let mut now = 0i64;
        for step in steps {
            now += step * DATETIME_MSEC;
            now_cell.store(now as u64, Ordering::Relaxed);
            timer.process(now);
        }

        let stamps = stamps.lock().unwrap();
        for pair in stamps.windows(2) {
            prop_assert!(pair[1] - pair[0] >= interval_ms as i64 * DATETIME_MSEC);
        }
    }

    /// BaseTime entries only ever execute on the base-time grid (the
    /// processing timestamp may lag, the scheduled slot may not).
    #[test]
    fn base_time_grid(
        interval_ms in 10i64..500,
        steps in prop::collection::vec(1i64..3_000, 2..30),
    ) {
        let timer = Timer::new();
        timer
            .add(|| {}, interval_ms as f64, 0, Some(0), TimerPolicy::BaseTime)
            .unwrap();

        let mut now = 0i64;
        for step in steps {
            now += step * DATETIME_MSEC;
            let next = timer.process(now);
            prop_assert_eq!(next % (interval_ms * DATETIME_MSEC), 0);
        }
    }
}

/// A timer that falls five seconds behind recovers with a single execution
/// and a full interval of headroom.
#[test]
fn stalled_timer_recovers() {
    let timer = Timer::new();
    let count = Arc::new(AtomicU64::new(0));
    let count2 = count.clone();
    timer
        .add(
            move || {
                count2.fetch_add(1, Ordering::Relaxed);
            },
            100.0,
            0,
            None,
            TimerPolicy::CurrentTime,
        )
        .unwrap();

    let now = 5 * DATETIME_SEC;
    let next = timer.process(now);
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(next, now + 100 * DATETIME_MSEC);
}
