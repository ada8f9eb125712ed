//! Connection managers for the event loop.
//!
//! A connection manager is an event source that owns a set of sockets and
//! reports their activity to the application through a per-connection
//! callback. Two realizations exist: stream connections over TCP
//! (listen/accept and connect) and datagram connections over UDP including
//! multicast. Both share the contract that a connection ends with a delayed
//! close which deregisters the descriptor, notifies the application with a
//! `Closing` event and only then releases the descriptor.

mod tcp;
mod udp;

pub use tcp::TcpConnectionManager;
pub use udp::UdpConnectionManager;

use core_eventloop::EventSource;
use core_params::ParamMap;
use core_status::UaResult;
use std::sync::{Arc, Mutex};

/// Identifier of one connection within its manager. Tokens of the loop's
/// descriptor registry double as connection ids.
pub type ConnectionId = u64;

/// State communicated to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An active open is in flight; the connection is not usable yet.
    Opening,
    /// The connection is usable (also reported once for listen sockets,
    /// carrying the effective bound address).
    Established,
    /// Final event of a connection; the descriptor is released right after.
    Closing,
}

/// One activity notification.
pub struct ConnectionEvent<'a> {
    pub connection: ConnectionId,
    pub state: ConnectionState,
    /// Per-event metadata (`listen-address`, `remote-address`, ...).
    pub params: &'a ParamMap,
    /// Received payload; borrowed from the manager's receive buffer for the
    /// duration of this callback only.
    pub data: &'a [u8],
}

/// Application callback of a connection. Invoked with no loop or manager
/// lock held, so it may reenter the manager (send, close, open).
pub type ConnectionCallback = Arc<Mutex<dyn FnMut(ConnectionEvent<'_>) + Send>>;

/// Wrap a closure for use as a connection callback.
pub fn connection_callback(
    callback: impl FnMut(ConnectionEvent<'_>) + Send + 'static,
) -> ConnectionCallback {
    Arc::new(Mutex::new(callback))
}

/// Common contract of the TCP and UDP managers.
pub trait ConnectionManager: EventSource {
    /// Protocol tag ("tcp", "udp").
    fn protocol(&self) -> &str;

    /// Open a connection described by `params` (passive when `listen` is
    /// set, active otherwise). Connection ids are handed to the application
    /// through the callback.
    fn open_connection(&self, params: &ParamMap, callback: ConnectionCallback) -> UaResult<()>;

    /// Synchronously send a full buffer over a connection.
    fn send(&self, connection: ConnectionId, data: &[u8]) -> UaResult<()>;

    /// Trigger the asynchronous shutdown of a connection.
    fn close_connection(&self, connection: ConnectionId) -> UaResult<()>;
}

/// Default receive buffer size when `recv-bufsize` is not configured.
pub(crate) const DEFAULT_RX_BUFSIZE: u32 = 1 << 16;

pub(crate) const MAX_BACKLOG: i32 = 100;
