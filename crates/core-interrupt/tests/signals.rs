//! Signal delivery through the event loop.

use core_eventloop::{EventLoop, EventSource, EventSourceState};
use core_interrupt::{InterruptManager, interrupt_callback};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn drive_until(el: &Arc<EventLoop>, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        el.run(20).unwrap();
    }
    true
}

#[test]
fn signal_registered_before_start_is_delivered() {
    let el = EventLoop::new();
    let im = InterruptManager::new("interrupts");
    el.register_event_source(im.clone()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let count2 = count.clone();
    im.register_interrupt(
        libc::SIGUSR1,
        interrupt_callback(move |signal| {
            assert_eq!(signal, libc::SIGUSR1);
            count2.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .unwrap();

    el.start().unwrap();
    assert_eq!(im.state(), EventSourceState::Started);

    unsafe {
        libc::raise(libc::SIGUSR1);
    }
    assert!(drive_until(&el, || count.load(Ordering::Relaxed) >= 1));

    el.stop();
    assert_eq!(im.state(), EventSourceState::Stopped);
}

#[test]
fn signal_registered_after_start_is_delivered() {
    let el = EventLoop::new();
    let im = InterruptManager::new("interrupts");
    el.register_event_source(im.clone()).unwrap();
    el.start().unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let count2 = count.clone();
    im.register_interrupt(
        libc::SIGUSR2,
        interrupt_callback(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .unwrap();

    unsafe {
        libc::raise(libc::SIGUSR2);
    }
    assert!(drive_until(&el, || count.load(Ordering::Relaxed) >= 1));

    el.stop();
}

#[test]
fn duplicate_registration_fails() {
    let el = EventLoop::new();
    let im = InterruptManager::new("interrupts");
    el.register_event_source(im.clone()).unwrap();

    im.register_interrupt(libc::SIGHUP, interrupt_callback(|_| {}))
        .unwrap();
    let err = im
        .register_interrupt(libc::SIGHUP, interrupt_callback(|_| {}))
        .unwrap_err();
    assert_eq!(err, core_status::UaError::Internal);
    drop(el);
}

#[test]
fn deregistered_signal_is_ignored() {
    let el = EventLoop::new();
    let im = InterruptManager::new("interrupts");
    el.register_event_source(im.clone()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let count2 = count.clone();
    im.register_interrupt(
        libc::SIGWINCH,
        interrupt_callback(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        }),
    )
    .unwrap();
    el.start().unwrap();

    im.deregister_interrupt(libc::SIGWINCH);
    unsafe {
        libc::raise(libc::SIGWINCH);
    }
    // The delivery surfaces but finds no callback.
    for _ in 0..5 {
        el.run(10).unwrap();
    }
    assert_eq!(count.load(Ordering::Relaxed), 0);

    el.stop();
}
