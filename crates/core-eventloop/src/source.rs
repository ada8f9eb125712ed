//! Event-source framework.
//!
//! An event source owns file descriptors and registers them with its event
//! loop. Connection managers and the interrupt manager implement this trait;
//! the loop only drives lifecycle hooks and readiness dispatch, the sources
//! own their sockets.

use crate::EventLoop;
use core_status::UaResult;
use mio::Token;
use std::sync::Arc;

bitflags::bitflags! {
    /// Readiness interest/event mask of a registered file descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdEvents: u8 {
        const IN  = 1;
        const OUT = 2;
        const ERR = 4;
    }
}

/// Lifecycle of an event source.
///
/// `Fresh` until registered, `Stopped` while registered but inactive.
/// `stop` is asynchronous: a source stays `Stopping` until its last open
/// descriptor is gone, which in turn may let the loop leave `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    Fresh,
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A pluggable component driven by the event loop.
///
/// Hooks are invoked with no loop lock held, so a hook may freely call back
/// into the loop (register descriptors, enqueue delayed callbacks).
pub trait EventSource: Send + Sync {
    /// Stable name used for logging.
    fn name(&self) -> &str;

    fn state(&self) -> EventSourceState;

    /// Invoked once at registration. Transitions Fresh → Stopped and hands
    /// the source its event loop.
    fn attach(&self, event_loop: &Arc<EventLoop>) -> UaResult<()>;

    /// Transition Stopped → Started. Called by the loop's `start`, or
    /// directly at registration when the loop is already running.
    fn start(&self) -> UaResult<()>;

    /// Begin an asynchronous shutdown (Started → Stopping). The source
    /// reaches Stopped once all of its descriptors are closed.
    fn stop(&self);
}

/// Readiness dispatch target of a registered file descriptor.
pub trait FdHandler: Send + Sync {
    /// Called by the loop for each ready descriptor, with no loop lock
    /// held. `events` follows the priority IN over OUT over ERR.
    fn fd_event(&self, token: Token, events: FdEvents);
}
