//! Cross-thread cancellation of a blocking `run`.

use core_eventloop::EventLoop;
use std::time::{Duration, Instant};

/// A second thread writes to the self-pipe while `run` blocks with a ten
/// second timeout; `run` has to come back almost immediately.
#[test]
fn cancel_preempts_blocking_run() {
    let el = EventLoop::new();
    el.start().unwrap();

    let el2 = el.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        el2.cancel();
    });

    let begin = Instant::now();
    el.run(10_000).unwrap();
    let elapsed = begin.elapsed();
    canceller.join().unwrap();

    assert!(
        elapsed < Duration::from_millis(1_000),
        "run took {elapsed:?}, expected prompt return after cancel"
    );
    assert!(elapsed >= Duration::from_millis(40));

    el.stop();
}

/// With nothing queued and a zero timeout, `run` does not sleep.
#[test]
fn zero_timeout_returns_immediately() {
    let el = EventLoop::new();
    el.start().unwrap();

    let begin = Instant::now();
    el.run(0).unwrap();
    assert!(begin.elapsed() < Duration::from_millis(200));

    el.stop();
}

/// `run` honors the user timeout when no event arrives.
#[test]
fn run_returns_within_timeout() {
    let el = EventLoop::new();
    el.start().unwrap();

    let begin = Instant::now();
    el.run(100).unwrap();
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_secs(2));

    el.stop();
}
