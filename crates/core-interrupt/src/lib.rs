//! OS signals delivered through the event loop.
//!
//! Asynchronous signals cannot run application code safely from the handler
//! context. The manager therefore routes them through a self-pipe: the
//! handler installed by `signal-hook` marks the signal and writes one byte,
//! the loop's poller sees the read end become ready and the next iteration
//! dispatches the registered callback from normal context.
//!
//! Signals registered before the manager starts are queued and activated at
//! `start`; `stop` deactivates all of them.

use core_eventloop::{EventLoop, EventSource, EventSourceState, FdEvents, FdHandler};
use core_status::{UaError, UaResult};
use mio::Token;
use signal_hook_mio::v1_0::Signals;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, error, warn};

/// Callback of a registered signal. Runs with no manager or loop lock held.
pub type InterruptCallback = Arc<Mutex<dyn FnMut(i32) + Send>>;

/// Wrap a closure for use as an interrupt callback.
pub fn interrupt_callback(callback: impl FnMut(i32) + Send + 'static) -> InterruptCallback {
    Arc::new(Mutex::new(callback))
}

struct ImState {
    lifecycle: EventSourceState,
    records: HashMap<i32, InterruptCallback>,
    signals: Option<Signals>,
    token: Option<Token>,
}

/// Event source mapping OS signals to loop-dispatched callbacks.
pub struct InterruptManager {
    name: String,
    state: Mutex<ImState>,
    event_loop: OnceLock<Weak<EventLoop>>,
    self_ref: Weak<InterruptManager>,
}

impl InterruptManager {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| InterruptManager {
            name: name.into(),
            state: Mutex::new(ImState {
                lifecycle: EventSourceState::Fresh,
                records: HashMap::new(),
                signals: None,
                token: None,
            }),
            event_loop: OnceLock::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.get().and_then(Weak::upgrade)
    }

    /// Register a callback for a POSIX signal number. Each signal can carry
    /// one callback; duplicate registration fails. Active immediately when
    /// the manager is started, otherwise at the next `start`.
    pub fn register_interrupt(&self, signal: i32, callback: InterruptCallback) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(&signal) {
            error!(target: "interrupt", signal, "signal already registered");
            return Err(UaError::Internal);
        }

        if state.lifecycle == EventSourceState::Started {
            let signals = state.signals.as_mut().ok_or(UaError::Internal)?;
            signals.add_signal(signal).map_err(|e| {
                error!(target: "interrupt", signal, error = %e,
                       "could not arm the signal handler");
                UaError::Internal
            })?;
        }

        state.records.insert(signal, callback);
        debug!(target: "interrupt", signal, "registered interrupt");
        Ok(())
    }

    /// Drop the callback of a signal. Deliveries already queued are
    /// discarded when they surface.
    pub fn deregister_interrupt(&self, signal: i32) {
        let mut state = self.state.lock().unwrap();
        state.records.remove(&signal);
    }
}

impl EventSource for InterruptManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EventSourceState {
        self.state.lock().unwrap().lifecycle
    }

    fn attach(&self, event_loop: &Arc<EventLoop>) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != EventSourceState::Fresh {
            return Err(UaError::Internal);
        }
        self.event_loop
            .set(Arc::downgrade(event_loop))
            .map_err(|_| UaError::Internal)?;
        state.lifecycle = EventSourceState::Stopped;
        Ok(())
    }

    /// Install the handlers for every queued signal and arm the self-pipe
    /// read end in the loop's poller.
    fn start(&self) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != EventSourceState::Stopped {
            error!(target: "interrupt", "the interrupt manager is already started");
            return Err(UaError::Internal);
        }

        let registered: Vec<i32> = state.records.keys().copied().collect();
        let mut signals = Signals::new(registered).map_err(|e| {
            error!(target: "interrupt", error = %e, "could not install the signal handlers");
            UaError::Internal
        })?;

        let el = self.event_loop().ok_or(UaError::Internal)?;
        let handler: Arc<dyn FdHandler> = self.self_ref.upgrade().ok_or(UaError::Internal)?;
        let token = el.register_fd(&mut signals, FdEvents::IN, handler)?;

        state.signals = Some(signals);
        state.token = Some(token);
        state.lifecycle = EventSourceState::Started;
        Ok(())
    }

    /// Uninstall the handlers; the default disposition is restored.
    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != EventSourceState::Started {
            warn!(target: "interrupt", "the interrupt manager is not started");
            return;
        }
        if let (Some(mut signals), Some(token)) = (state.signals.take(), state.token.take()) {
            if let Some(el) = self.event_loop() {
                el.deregister_fd(&mut signals, token);
            }
        }
        state.lifecycle = EventSourceState::Stopped;
    }
}

impl FdHandler for InterruptManager {
    fn fd_event(&self, _token: Token, _events: FdEvents) {
        // Drain every queued delivery, then dispatch outside the lock.
        let pending: Vec<i32> = {
            let mut state = self.state.lock().unwrap();
            match state.signals.as_mut() {
                Some(signals) => signals.pending().collect(),
                None => return,
            }
        };

        for signal in pending {
            let callback = {
                let state = self.state.lock().unwrap();
                state.records.get(&signal).cloned()
            };
            match callback {
                Some(callback) => {
                    debug!(target: "interrupt", signal, "received a signal");
                    (*callback.lock().unwrap())(signal);
                }
                None => debug!(target: "interrupt", signal, "ignoring deregistered signal"),
            }
        }
    }
}
