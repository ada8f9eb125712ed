//! Single-threaded cooperative event loop.
//!
//! One loop instance multiplexes a timer of cyclic callbacks, a queue of
//! delayed (next-iteration) callbacks and readiness events on the file
//! descriptors owned by registered event sources. Exactly one stack frame
//! may be inside [`EventLoop::run`] at a time; every other operation is
//! non-blocking and may be called from any thread, including from within
//! the callbacks the loop dispatches.
//!
//! Locking: the loop never holds one of its own locks while running user
//! code (timer callbacks, delayed callbacks, readiness handlers, source
//! lifecycle hooks). Event sources follow the mirror rule and drop their
//! own lock before calling back into the loop.

mod source;

pub use source::{EventSource, EventSourceState, FdEvents, FdHandler};

use core_status::{UaError, UaResult};
use core_time::{DATETIME_MSEC, DateTime};
use core_timer::{Timer, TimerId, TimerPolicy};
use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// The self-pipe. Always armed; writing to it is the only way to preempt a
/// blocking poll.
const WAKER_TOKEN: Token = Token(0);

/// Capacity of one readiness fetch.
const EVENTS_PER_POLL: usize = 64;

/// Lifecycle of the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopLifecycle {
    Fresh,
    Started,
    Stopping,
    Stopped,
}

type DelayedCallback = Box<dyn FnOnce() + Send>;

struct PollCtx {
    poll: Poll,
    events: Events,
}

struct Inner {
    lifecycle: LoopLifecycle,
    sources: Vec<Arc<dyn EventSource>>,
    fds: HashMap<Token, Arc<dyn FdHandler>>,
    registry: Option<Registry>,
    waker: Option<Arc<Waker>>,
    next_token: usize,
}

pub struct EventLoop {
    timer: Timer,
    delayed_tx: Sender<DelayedCallback>,
    delayed_rx: Receiver<DelayedCallback>,
    inner: Mutex<Inner>,
    /// Held for the whole of `run`; doubles as the reentrancy guard.
    poller: Mutex<Option<PollCtx>>,
    self_ref: Weak<EventLoop>,
}

fn to_interest(events: FdEvents) -> UaResult<Interest> {
    let mut interest = None;
    if events.contains(FdEvents::IN) {
        interest = Some(Interest::READABLE);
    }
    if events.contains(FdEvents::OUT) {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest.ok_or(UaError::Internal)
}

impl EventLoop {
    pub fn new() -> Arc<Self> {
        let (delayed_tx, delayed_rx) = unbounded();
        Arc::new_cyclic(|self_ref| EventLoop {
            timer: Timer::new(),
            delayed_tx,
            delayed_rx,
            inner: Mutex::new(Inner {
                lifecycle: LoopLifecycle::Fresh,
                sources: Vec::new(),
                fds: HashMap::new(),
                registry: None,
                waker: None,
                next_token: 1,
            }),
            poller: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn lifecycle(&self) -> LoopLifecycle {
        self.inner.lock().unwrap().lifecycle
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Create the poller and the self-pipe, then start every registered
    /// event source. Fails unless the loop is Fresh or Stopped.
    pub fn start(&self) -> UaResult<()> {
        let sources = {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle != LoopLifecycle::Fresh
                && inner.lifecycle != LoopLifecycle::Stopped
            {
                return Err(UaError::Internal);
            }
            info!(target: "eventloop", "starting the event loop");

            let poll = Poll::new().map_err(|e| {
                error!(target: "eventloop", error = %e, "could not create the poller");
                UaError::Internal
            })?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| {
                error!(target: "eventloop", error = %e, "could not create the self-pipe");
                UaError::Internal
            })?;
            let registry = poll.registry().try_clone().map_err(|e| {
                error!(target: "eventloop", error = %e, "could not clone the poll registry");
                UaError::Internal
            })?;

            inner.registry = Some(registry);
            inner.waker = Some(Arc::new(waker));
            inner.next_token = 1;
            *self.poller.lock().unwrap() = Some(PollCtx {
                poll,
                events: Events::with_capacity(EVENTS_PER_POLL),
            });
            inner.sources.clone()
        };

        // Start the sources with no loop lock held.
        let mut result = Ok(());
        for source in sources {
            if let Err(e) = source.start() {
                error!(target: "eventloop", source = source.name(), error = %e,
                       "event source failed to start");
                result = Err(e);
            }
        }

        self.inner.lock().unwrap().lifecycle = LoopLifecycle::Started;
        result
    }

    /// Move Started → Stopping and ask every source to stop. The loop
    /// reaches Stopped once all sources are Stopped and the delayed queue
    /// has drained; that check runs here and at the end of each `run`
    /// iteration.
    pub fn stop(&self) {
        let (sources, waker) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle != LoopLifecycle::Started {
                warn!(target: "eventloop", "the event loop is not running, cannot be stopped");
                return;
            }
            info!(target: "eventloop", "stopping the event loop");
            inner.lifecycle = LoopLifecycle::Stopping;
            (inner.sources.clone(), inner.waker.clone())
        };

        for source in sources {
            if matches!(
                source.state(),
                EventSourceState::Starting | EventSourceState::Started
            ) {
                source.stop();
            }
        }

        // Cut a concurrent blocking poll short so shutdown makes progress.
        if let Some(waker) = waker {
            let _ = waker.wake();
        }

        if self.check_closed() {
            if let Ok(mut guard) = self.poller.try_lock() {
                *guard = None;
            }
        }
    }

    /// Stopped only when every source is Stopped and no delayed callback is
    /// pending. Returns whether the loop is (now) Stopped.
    fn check_closed(&self) -> bool {
        let sources = self.inner.lock().unwrap().sources.clone();
        if sources
            .iter()
            .any(|s| s.state() != EventSourceState::Stopped)
        {
            return false;
        }
        if !self.delayed_rx.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.lifecycle {
            LoopLifecycle::Stopped => true,
            LoopLifecycle::Stopping => {
                inner.registry = None;
                inner.waker = None;
                inner.lifecycle = LoopLifecycle::Stopped;
                info!(target: "eventloop", "the event loop has stopped");
                true
            }
            _ => false,
        }
    }

    /// One loop iteration: process due timers, drain the delayed queue,
    /// block in the poller for at most `timeout_ms` (bounded by the next
    /// timer) and dispatch readiness to the owning sources.
    ///
    /// Returns `Internal` when called reentrantly or on a loop that is not
    /// running.
    pub fn run(&self, timeout_ms: u32) -> UaResult<()> {
        let Ok(mut poller_guard) = self.poller.try_lock() else {
            error!(target: "eventloop", "cannot run the event loop from the run method itself");
            return Err(UaError::Internal);
        };

        {
            let inner = self.inner.lock().unwrap();
            if inner.lifecycle != LoopLifecycle::Started
                && inner.lifecycle != LoopLifecycle::Stopping
            {
                warn!(target: "eventloop", "cannot iterate a stopped event loop");
                return Err(UaError::Internal);
            }
        }
        let Some(ctx) = poller_guard.as_mut() else {
            return Err(UaError::Internal);
        };

        trace!(target: "eventloop", "iterate the event loop");

        // Process cyclic callbacks.
        let date_before = core_time::now_monotonic();
        let mut date_next = self.timer.process(date_before);

        // Process delayed callbacks here so closed sockets are cleaned up
        // before they would be polled again.
        self.process_delayed();

        // A delayed callback may have enqueued another one (or re-added
        // itself). Do not sleep then: handle queued events and run the new
        // delayed callbacks in the next iteration.
        let mut timeout_ms = timeout_ms;
        if !self.delayed_rx.is_empty() {
            timeout_ms = 0;
        }

        // Remaining time, bounded by the next timer.
        let max_date = date_before + i64::from(timeout_ms) * DATETIME_MSEC;
        if date_next > max_date {
            date_next = max_date;
        }
        let listen_ticks = (date_next - core_time::now_monotonic()).max(0);
        let listen_timeout = Duration::from_nanos(listen_ticks as u64 * 100);

        match ctx.poll.poll(&mut ctx.events, Some(listen_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                // Retried on the next iteration.
                warn!(target: "eventloop", error = %e, "error during poll");
            }
        }

        let mut ready = Vec::new();
        for event in ctx.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                trace!(target: "eventloop", "woken through the self-pipe");
                continue;
            }
            // One event kind per descriptor and pass: IN over OUT over ERR.
            let mask = if event.is_readable() || event.is_read_closed() {
                FdEvents::IN
            } else if event.is_writable() {
                FdEvents::OUT
            } else if event.is_error() || event.is_write_closed() {
                FdEvents::ERR
            } else {
                continue;
            };
            ready.push((token, mask));
        }

        for (token, mask) in ready {
            // Re-resolve per event: a handler may deregister descriptors
            // that became ready in the same pass.
            let handler = self.inner.lock().unwrap().fds.get(&token).cloned();
            if let Some(handler) = handler {
                debug!(target: "eventloop", token = token.0, events = ?mask,
                       "processing descriptor event");
                handler.fd_event(token, mask);
            }
        }

        // A source may have finished its asynchronous shutdown.
        let stopped = {
            let lifecycle = self.inner.lock().unwrap().lifecycle;
            lifecycle == LoopLifecycle::Stopping && self.check_closed()
        };
        if stopped {
            *poller_guard = None;
        }
        Ok(())
    }

    /// Interrupt a blocking `run` from any thread.
    pub fn cancel(&self) {
        let waker = self.inner.lock().unwrap().waker.clone();
        if let Some(waker) = waker {
            let _ = waker.wake();
        }
    }

    // ---------------------------------------------------------------------
    // Delayed callbacks
    // ---------------------------------------------------------------------

    /// Enqueue a callback to run in the next loop iteration. Safe from any
    /// thread; never blocks on the loop lock.
    pub fn add_delayed(&self, callback: impl FnOnce() + Send + 'static) {
        let _ = self.delayed_tx.send(Box::new(callback));
    }

    /// Whether delayed callbacks are waiting.
    pub fn delayed_pending(&self) -> bool {
        !self.delayed_rx.is_empty()
    }

    /// Drain the snapshot taken at entry. Callbacks enqueued while draining
    /// run in the next iteration, which keeps a re-enqueueing callback from
    /// starving the poller.
    fn process_delayed(&self) {
        let pending = self.delayed_rx.len();
        if pending == 0 {
            return;
        }
        trace!(target: "eventloop", pending, "process delayed callbacks");
        for _ in 0..pending {
            match self.delayed_rx.try_recv() {
                Ok(callback) => callback(),
                Err(_) => break,
            }
        }
    }

    // ---------------------------------------------------------------------
    // Timer facade
    // ---------------------------------------------------------------------

    pub fn add_cyclic_callback(
        &self,
        callback: impl FnMut() + Send + 'static,
        interval_ms: f64,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
    ) -> UaResult<TimerId> {
        self.timer.add(
            callback,
            interval_ms,
            core_time::now_monotonic(),
            base_time,
            policy,
        )
    }

    pub fn modify_cyclic_callback(
        &self,
        id: TimerId,
        interval_ms: f64,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
    ) -> UaResult<()> {
        self.timer.modify(
            id,
            interval_ms,
            core_time::now_monotonic(),
            base_time,
            policy,
        )
    }

    pub fn remove_cyclic_callback(&self, id: TimerId) {
        self.timer.remove(id);
    }

    /// One-shot callback at `date` (next iteration when already past).
    pub fn add_timed_callback(
        &self,
        callback: impl FnMut() + Send + 'static,
        date: DateTime,
    ) -> UaResult<TimerId> {
        self.timer
            .add_timed(callback, date, core_time::now_monotonic())
    }

    /// Earliest pending cyclic callback, `i64::MAX` when none.
    pub fn next_cyclic_time(&self) -> DateTime {
        self.timer.next()
    }

    // ---------------------------------------------------------------------
    // Event sources
    // ---------------------------------------------------------------------

    /// Register an event source. The source must be Fresh; it transitions
    /// to Stopped and is started right away when the loop is running.
    pub fn register_event_source(&self, source: Arc<dyn EventSource>) -> UaResult<()> {
        if source.state() != EventSourceState::Fresh {
            error!(target: "eventloop", source = source.name(),
                   "cannot register the event source: already registered");
            return Err(UaError::Internal);
        }
        let event_loop = self.self_ref.upgrade().ok_or(UaError::Internal)?;
        source.attach(&event_loop)?;

        let lifecycle = {
            let mut inner = self.inner.lock().unwrap();
            inner.sources.push(source.clone());
            inner.lifecycle
        };

        if lifecycle == LoopLifecycle::Started {
            source.start()?;
        }
        Ok(())
    }

    /// Remove a source from the loop. The source has to be stopped first.
    pub fn deregister_event_source(&self, source: &Arc<dyn EventSource>) -> UaResult<()> {
        if source.state() != EventSourceState::Stopped {
            warn!(target: "eventloop", source = source.name(),
                  "cannot deregister the event source: has to be stopped first");
            return Err(UaError::Internal);
        }
        let mut inner = self.inner.lock().unwrap();
        // Thin-pointer comparison: fat-pointer equality is unreliable
        // across codegen units.
        let target = Arc::as_ptr(source) as *const ();
        inner
            .sources
            .retain(|other| Arc::as_ptr(other) as *const () != target);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Descriptor registration (used by event sources)
    // ---------------------------------------------------------------------

    /// Reserve a token without arming the poller for it. Used for
    /// descriptors that never listen for events (datagram send sockets) but
    /// still need a connection id from the same number space.
    pub fn alloc_token(&self) -> Token {
        let mut inner = self.inner.lock().unwrap();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        token
    }

    /// Register a descriptor for readiness events. Returns the token under
    /// which events are dispatched to `handler`.
    pub fn register_fd(
        &self,
        io: &mut dyn mio::event::Source,
        events: FdEvents,
        handler: Arc<dyn FdHandler>,
    ) -> UaResult<Token> {
        let interest = to_interest(events)?;
        let mut inner = self.inner.lock().unwrap();
        let Some(registry) = &inner.registry else {
            error!(target: "eventloop", "cannot register a descriptor on a stopped event loop");
            return Err(UaError::Internal);
        };
        let token = Token(inner.next_token);
        registry.register(io, token, interest).map_err(|e| {
            error!(target: "eventloop", error = %e, "could not register the descriptor");
            UaError::Internal
        })?;
        inner.next_token += 1;
        inner.fds.insert(token, handler);
        debug!(target: "eventloop", token = token.0, "registered descriptor");
        Ok(token)
    }

    /// Change the interest mask of a registered descriptor.
    pub fn reregister_fd(
        &self,
        io: &mut dyn mio::event::Source,
        token: Token,
        events: FdEvents,
    ) -> UaResult<()> {
        let interest = to_interest(events)?;
        let inner = self.inner.lock().unwrap();
        let Some(registry) = &inner.registry else {
            return Err(UaError::Internal);
        };
        registry.reregister(io, token, interest).map_err(|e| {
            error!(target: "eventloop", error = %e, "could not modify the descriptor");
            UaError::Internal
        })
    }

    /// Stop receiving events for a descriptor. Does not close it.
    pub fn deregister_fd(&self, io: &mut dyn mio::event::Source, token: Token) {
        let mut inner = self.inner.lock().unwrap();
        inner.fds.remove(&token);
        if let Some(registry) = &inner.registry {
            if let Err(e) = registry.deregister(io) {
                debug!(target: "eventloop", token = token.0, error = %e,
                       "could not deregister the descriptor");
            }
        }
        debug!(target: "eventloop", token = token.0, "deregistered descriptor");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Run leftover delayed callbacks so sources can release their
        // descriptors and buffers.
        while let Ok(callback) = self.delayed_rx.try_recv() {
            callback();
        }
    }
}
