//! Stream connections over TCP.
//!
//! Passive connections resolve the configured host to all matching
//! address/family combinations and create one listen socket per result.
//! Active connections use a non-blocking connect that completes through a
//! writability event. All sockets run with Nagle's algorithm disabled and
//! without SIGPIPE generation.

use crate::{
    ConnectionCallback, ConnectionEvent, ConnectionId, ConnectionManager, ConnectionState,
    DEFAULT_RX_BUFSIZE, MAX_BACKLOG,
};
use core_eventloop::{EventLoop, EventSource, EventSourceState, FdEvents, FdHandler};
use core_params::{ParamKind, ParamMap, ParamValue, Restriction};
use core_status::{UaError, UaResult};
use mio::Token;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, error, info, warn};

const MANAGER_PARAMS: &[Restriction] = &[
    Restriction::scalar("recv-bufsize", ParamKind::UInt32, false),
    Restriction::scalar("send-bufsize", ParamKind::UInt32, false),
];

const CONNECTION_PARAMS: &[Restriction] = &[
    Restriction::scalar_or_array("address", ParamKind::String),
    Restriction::scalar("port", ParamKind::UInt16, true),
    Restriction::scalar("listen", ParamKind::Bool, false),
    Restriction::scalar("validate", ParamKind::Bool, false),
    Restriction::scalar("reuse", ParamKind::Bool, false),
];

enum TcpSocket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl TcpSocket {
    fn raw_fd(&self) -> i32 {
        match self {
            TcpSocket::Listener(l) => l.as_raw_fd(),
            TcpSocket::Stream(s) => s.as_raw_fd(),
        }
    }
}

struct TcpConn {
    token: Token,
    socket: TcpSocket,
    callback: ConnectionCallback,
    /// Active connect still waiting for its writability event.
    connecting: bool,
    /// Delayed close armed; events on this descriptor are ignored.
    closing: bool,
}

struct TcpState {
    lifecycle: EventSourceState,
    conns: HashMap<ConnectionId, TcpConn>,
}

/// Connection manager for stream sockets.
pub struct TcpConnectionManager {
    name: String,
    params: ParamMap,
    state: Mutex<TcpState>,
    /// Static receive buffer, lent to the application for the duration of
    /// one data callback.
    rx_buffer: Mutex<Vec<u8>>,
    event_loop: OnceLock<Weak<EventLoop>>,
    self_ref: Weak<TcpConnectionManager>,
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

impl TcpConnectionManager {
    /// `params` are the manager-level settings (`recv-bufsize`,
    /// `send-bufsize`), validated at `start`.
    pub fn new(name: impl Into<String>, params: ParamMap) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| TcpConnectionManager {
            name: name.into(),
            params,
            state: Mutex::new(TcpState {
                lifecycle: EventSourceState::Fresh,
                conns: HashMap::new(),
            }),
            rx_buffer: Mutex::new(Vec::new()),
            event_loop: OnceLock::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.get().and_then(Weak::upgrade)
    }

    fn handler(&self) -> UaResult<Arc<dyn FdHandler>> {
        let this = self.self_ref.upgrade().ok_or(UaError::Internal)?;
        Ok(this)
    }

    /// The manager leaves Stopping once its socket set is empty.
    fn check_stopped(&self) {
        let mut state = self.state.lock().unwrap();
        if state.conns.is_empty() && state.lifecycle == EventSourceState::Stopping {
            debug!(target: "net.tcp", "all sockets closed, the connection manager has stopped");
            state.lifecycle = EventSourceState::Stopped;
        }
    }

    /// Idempotent shutdown: wake any in-flight poll via `shutdown(RDWR)`
    /// and arm the delayed close that releases the descriptor.
    fn shutdown_connection(&self, id: ConnectionId) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get_mut(&id) else {
                return;
            };
            if conn.closing {
                debug!(target: "net.tcp", connection = id, "already closing");
                return;
            }
            conn.closing = true;
            unsafe {
                libc::shutdown(conn.socket.raw_fd(), libc::SHUT_RDWR);
            }
            debug!(target: "net.tcp", connection = id, "shutdown triggered");
        }

        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        match self.event_loop() {
            Some(el) => el.add_delayed(move || manager.delayed_close(id)),
            // Loop already gone: close inline.
            None => manager.delayed_close(id),
        }
    }

    /// Runs in the next loop iteration: deregister, notify the application
    /// with `Closing`, then release the descriptor.
    fn delayed_close(&self, id: ConnectionId) {
        let conn = self.state.lock().unwrap().conns.remove(&id);
        let Some(mut conn) = conn else {
            return;
        };
        debug!(target: "net.tcp", connection = id, "delayed closing of the connection");

        if let Some(el) = self.event_loop() {
            match &mut conn.socket {
                TcpSocket::Listener(l) => el.deregister_fd(l, conn.token),
                TcpSocket::Stream(s) => el.deregister_fd(s, conn.token),
            }
        }

        let empty = ParamMap::new();
        (*conn.callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Closing,
            params: &empty,
            data: &[],
        });

        drop(conn);
        info!(target: "net.tcp", connection = id, "socket closed");
        self.check_stopped();
    }

    // -----------------------------------------------------------------
    // Passive open
    // -----------------------------------------------------------------

    fn open_passive(&self, params: &ParamMap, callback: &ConnectionCallback) -> UaResult<()> {
        let port = params.get_u16("port").ok_or(UaError::InvalidArgument)?;
        let reuse = params.get_bool("reuse").unwrap_or(false);
        let validate_only = params.get_bool("validate").unwrap_or(false);

        let hosts = params.get_strings("address");
        if hosts.is_empty() {
            info!(target: "net.tcp", "listening on all interfaces");
            let any: [SocketAddr; 2] = [
                (Ipv6Addr::UNSPECIFIED, port).into(),
                (Ipv4Addr::UNSPECIFIED, port).into(),
            ];
            let mut result = Err(UaError::ConnectionRejected);
            for addr in any {
                if self
                    .register_listen_socket(addr, None, reuse, validate_only, callback)
                    .is_ok()
                {
                    result = Ok(());
                }
            }
            return result;
        }

        let mut result = Err(UaError::ConnectionRejected);
        for host in hosts {
            let resolved = (host, port).to_socket_addrs();
            let addrs: Vec<SocketAddr> = match resolved {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    warn!(target: "net.tcp", host, port, error = %e, "address lookup failed");
                    continue;
                }
            };
            for addr in addrs {
                if self
                    .register_listen_socket(addr, Some(host), reuse, validate_only, callback)
                    .is_ok()
                {
                    result = Ok(());
                }
            }
        }
        result
    }

    fn register_listen_socket(
        &self,
        addr: SocketAddr,
        hostname: Option<&str>,
        reuse: bool,
        validate_only: bool,
        callback: &ConnectionCallback,
    ) -> UaResult<()> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            warn!(target: "net.tcp", %addr, error = %e, "error opening the listen socket");
            UaError::ConnectionRejected
        })?;

        let setup = || -> std::io::Result<()> {
            // Avoid double-binding an AF_INET6 socket to IPv4 as well.
            if addr.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            if reuse {
                socket.set_reuse_address(true)?;
                #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
                socket.set_reuse_port(true)?;
            }
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())
        };
        if let Err(e) = setup() {
            warn!(target: "net.tcp", %addr, error = %e,
                  "error binding the socket to the address");
            return Err(UaError::ConnectionRejected);
        }

        // Only check that the configuration works.
        if validate_only {
            return Ok(());
        }

        if let Err(e) = socket.listen(MAX_BACKLOG) {
            warn!(target: "net.tcp", %addr, error = %e, "error listening on the socket");
            return Err(UaError::ConnectionRejected);
        }

        let effective_port = socket
            .local_addr()
            .ok()
            .and_then(|sa| sa.as_socket())
            .map(|sa| sa.port())
            .unwrap_or(addr.port());

        let mut listener = TcpListener::from_std(socket.into());
        let el = self.event_loop().ok_or(UaError::Internal)?;
        let token = el.register_fd(&mut listener, FdEvents::IN, self.handler()?)?;
        let id = token.0 as ConnectionId;

        {
            let mut state = self.state.lock().unwrap();
            state.conns.insert(
                id,
                TcpConn {
                    token,
                    socket: TcpSocket::Listener(listener),
                    callback: callback.clone(),
                    connecting: false,
                    closing: false,
                },
            );
        }

        // Substitute the local hostname when listening on INADDR_ANY.
        let announced = match hostname {
            Some(h) => h.to_string(),
            None => local_hostname(),
        };
        info!(target: "net.tcp", connection = id, address = %announced,
              port = effective_port, "creating listen socket");

        let mut announce = ParamMap::new();
        announce.insert("listen-address", ParamValue::String(announced));
        announce.insert("listen-port", ParamValue::UInt16(effective_port));
        (*callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Established,
            params: &announce,
            data: &[],
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Active open
    // -----------------------------------------------------------------

    fn open_active(&self, params: &ParamMap, callback: &ConnectionCallback) -> UaResult<()> {
        let port = params.get_u16("port").ok_or(UaError::InvalidArgument)?;
        let validate_only = params.get_bool("validate").unwrap_or(false);
        let hosts = params.get_strings("address");
        let Some(&host) = hosts.first() else {
            error!(target: "net.tcp", "open connection: no hostname defined, aborting");
            return Err(UaError::Internal);
        };

        let addr = match (host, port).to_socket_addrs() {
            Ok(mut iter) => match iter.next() {
                Some(addr) => addr,
                None => {
                    warn!(target: "net.tcp", host, "lookup returned no addresses");
                    return Err(UaError::Internal);
                }
            },
            Err(e) => {
                warn!(target: "net.tcp", host, error = %e, "lookup failed");
                return Err(UaError::Internal);
            }
        };

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            warn!(target: "net.tcp", host, error = %e, "could not create socket");
            UaError::Disconnect
        })?;
        if let Err(e) = socket.set_nonblocking(true).and(socket.set_nodelay(true)) {
            warn!(target: "net.tcp", error = %e, "could not set socket options");
            return Err(UaError::Internal);
        }

        // Only check that the configuration works.
        if validate_only {
            return Ok(());
        }

        // Non-blocking connect completes via a writability event.
        if let Err(e) = socket.connect(&addr.into()) {
            let benign = matches!(
                e.raw_os_error(),
                Some(libc::EINPROGRESS) | Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN)
            );
            if !benign {
                warn!(target: "net.tcp", host, error = %e, "connecting the socket failed");
                return Err(UaError::Disconnect);
            }
        }

        let mut stream = TcpStream::from_std(socket.into());
        let el = self.event_loop().ok_or(UaError::Internal)?;
        let token = el.register_fd(&mut stream, FdEvents::OUT, self.handler()?)?;
        let id = token.0 as ConnectionId;

        {
            let mut state = self.state.lock().unwrap();
            state.conns.insert(
                id,
                TcpConn {
                    token,
                    socket: TcpSocket::Stream(stream),
                    callback: callback.clone(),
                    connecting: true,
                    closing: false,
                },
            );
        }

        info!(target: "net.tcp", connection = id, host, port, "opening a connection");

        let empty = ParamMap::new();
        (*callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Opening,
            params: &empty,
            data: &[],
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Readiness handling
    // -----------------------------------------------------------------

    fn handle_accept(&self, id: ConnectionId) {
        loop {
            let accepted = {
                let state = self.state.lock().unwrap();
                let Some(conn) = state.conns.get(&id) else {
                    return;
                };
                if conn.closing {
                    return;
                }
                let TcpSocket::Listener(listener) = &conn.socket else {
                    return;
                };
                listener.accept()
            };

            match accepted {
                Ok((stream, remote)) => {
                    let callback = {
                        let state = self.state.lock().unwrap();
                        match state.conns.get(&id) {
                            Some(conn) => conn.callback.clone(),
                            None => return,
                        }
                    };
                    self.register_accepted(id, stream, remote, callback);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.state() != EventSourceState::Stopping {
                        warn!(target: "net.tcp", connection = id, error = %e,
                              "accept failed, closing the server socket");
                    }
                    self.shutdown_connection(id);
                    return;
                }
            }
        }
    }

    fn register_accepted(
        &self,
        listener_id: ConnectionId,
        mut stream: TcpStream,
        remote: SocketAddr,
        callback: ConnectionCallback,
    ) {
        // Do not merge packets on the socket (disable Nagle's algorithm).
        if let Err(e) = stream.set_nodelay(true) {
            warn!(target: "net.tcp", error = %e, "error setting the TCP options");
            return;
        }

        let Some(el) = self.event_loop() else {
            return;
        };
        let Ok(handler) = self.handler() else {
            return;
        };
        let token = match el.register_fd(&mut stream, FdEvents::IN, handler) {
            Ok(token) => token,
            Err(_) => {
                warn!(target: "net.tcp", "error registering the accepted socket");
                return;
            }
        };
        let id = token.0 as ConnectionId;

        {
            let mut state = self.state.lock().unwrap();
            state.conns.insert(
                id,
                TcpConn {
                    token,
                    socket: TcpSocket::Stream(stream),
                    callback: callback.clone(),
                    connecting: false,
                    closing: false,
                },
            );
        }

        let remote_addr = remote.ip().to_string();
        info!(target: "net.tcp", connection = id, remote = %remote_addr,
              listener = listener_id, "connection opened via the server socket");

        let mut announce = ParamMap::new();
        announce.insert("remote-address", ParamValue::String(remote_addr));
        (*callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Established,
            params: &announce,
            data: &[],
        });
    }

    /// A writability event finishes a non-blocking connect. Some errors are
    /// also reported this way, so the socket error is checked explicitly.
    fn handle_connect(&self, id: ConnectionId, events: FdEvents) {
        let sock_error = {
            let state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get(&id) else {
                return;
            };
            let TcpSocket::Stream(stream) = &conn.socket else {
                return;
            };
            stream.take_error()
        };

        let failed = events.contains(FdEvents::ERR)
            || match sock_error {
                Ok(None) => false,
                Ok(Some(e)) => {
                    info!(target: "net.tcp", connection = id, error = %e,
                          "the connection closes with an error");
                    true
                }
                Err(e) => {
                    info!(target: "net.tcp", connection = id, error = %e,
                          "could not query the socket error");
                    true
                }
            };
        if failed {
            self.shutdown_connection(id);
            return;
        }

        debug!(target: "net.tcp", connection = id, "opening a new connection");

        let callback = {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get_mut(&id) else {
                return;
            };
            conn.connecting = false;
            // From now on only read events are interesting.
            if let (Some(el), TcpSocket::Stream(stream)) =
                (self.event_loop(), &mut conn.socket)
            {
                let _ = el.reregister_fd(stream, conn.token, FdEvents::IN);
            }
            conn.callback.clone()
        };

        let empty = ParamMap::new();
        (*callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Established,
            params: &empty,
            data: &[],
        });
    }

    fn handle_stream(&self, id: ConnectionId, events: FdEvents) {
        if events.contains(FdEvents::ERR) {
            info!(target: "net.tcp", connection = id, "the connection closes with an error");
            self.shutdown_connection(id);
            return;
        }
        if !events.contains(FdEvents::IN) {
            return;
        }

        // Drain the socket: readiness is edge-triggered.
        loop {
            let mut buffer = self.rx_buffer.lock().unwrap();
            let received = {
                let state = self.state.lock().unwrap();
                let Some(conn) = state.conns.get(&id) else {
                    return;
                };
                if conn.closing {
                    return;
                }
                unsafe {
                    libc::recv(
                        conn.socket.raw_fd(),
                        buffer.as_mut_ptr() as *mut libc::c_void,
                        buffer.len(),
                        libc::MSG_DONTWAIT,
                    )
                }
            };

            if received < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    // Temporary condition on a non-blocking socket.
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return,
                    Some(libc::EINTR) => continue,
                    _ => {
                        drop(buffer);
                        debug!(target: "net.tcp", connection = id, error = %err,
                               "recv failed, shutting down");
                        self.shutdown_connection(id);
                        return;
                    }
                }
            }
            if received == 0 {
                // Orderly shutdown of the socket.
                drop(buffer);
                debug!(target: "net.tcp", connection = id,
                       "recv signaled the socket was shut down");
                self.shutdown_connection(id);
                return;
            }

            let n = received as usize;
            debug!(target: "net.tcp", connection = id, bytes = n, "received message");
            let callback = {
                let state = self.state.lock().unwrap();
                match state.conns.get(&id) {
                    Some(conn) => conn.callback.clone(),
                    None => return,
                }
            };
            let empty = ParamMap::new();
            (*callback.lock().unwrap())(ConnectionEvent {
                connection: id,
                state: ConnectionState::Established,
                params: &empty,
                data: &buffer[..n],
            });
            drop(buffer);
        }
    }
}

impl EventSource for TcpConnectionManager {
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

    fn start(&self) -> UaResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != EventSourceState::Stopped {
            error!(target: "net.tcp",
                   "to start the connection manager it has to be registered and not started");
            return Err(UaError::Internal);
        }
        core_params::validate("tcp", MANAGER_PARAMS, &self.params)?;

        let rx_size = self
            .params
            .get_u32("recv-bufsize")
            .unwrap_or(DEFAULT_RX_BUFSIZE) as usize;
        self.rx_buffer.lock().unwrap().resize(rx_size, 0);

        state.lifecycle = EventSourceState::Started;
        Ok(())
    }

    fn stop(&self) {
        let ids: Vec<ConnectionId> = {
            let mut state = self.state.lock().unwrap();
            info!(target: "net.tcp", "shutting down the connection manager");
            state.lifecycle = EventSourceState::Stopping;
            state.conns.keys().copied().collect()
        };
        for id in ids {
            self.shutdown_connection(id);
        }
        self.check_stopped();
    }
}

impl FdHandler for TcpConnectionManager {
    fn fd_event(&self, token: Token, events: FdEvents) {
        let id = token.0 as ConnectionId;

        enum Kind {
            Listen,
            Connecting,
            Stream,
        }
        let kind = {
            let state = self.state.lock().unwrap();
            match state.conns.get(&id) {
                None => return,
                // Registered for removal; no further events.
                Some(conn) if conn.closing => return,
                Some(conn) => match (&conn.socket, conn.connecting) {
                    (TcpSocket::Listener(_), _) => Kind::Listen,
                    (TcpSocket::Stream(_), true) => Kind::Connecting,
                    (TcpSocket::Stream(_), false) => Kind::Stream,
                },
            }
        };

        match kind {
            Kind::Listen => self.handle_accept(id),
            Kind::Connecting => self.handle_connect(id, events),
            Kind::Stream => self.handle_stream(id, events),
        }
    }
}

impl ConnectionManager for TcpConnectionManager {
    fn protocol(&self) -> &str {
        "tcp"
    }

    fn open_connection(&self, params: &ParamMap, callback: ConnectionCallback) -> UaResult<()> {
        if self.state() != EventSourceState::Started {
            error!(target: "net.tcp",
                   "cannot open a connection for a connection manager that is not started");
            return Err(UaError::Internal);
        }
        core_params::validate("tcp", CONNECTION_PARAMS, params)?;

        if params.get_bool("listen").unwrap_or(false) {
            self.open_passive(params, &callback)
        } else {
            self.open_active(params, &callback)
        }
    }

    /// Send the full buffer. May block in short `poll(POLLOUT)` slices when
    /// the socket cannot take more bytes; fatal errors shut the connection
    /// down and surface as `ConnectionClosed`.
    fn send(&self, connection: ConnectionId, data: &[u8]) -> UaResult<()> {
        let fd = {
            let state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get(&connection) else {
                warn!(target: "net.tcp", connection, "cannot send: connection not found");
                return Err(UaError::NotFound);
            };
            conn.socket.raw_fd()
        };

        let mut written = 0usize;
        while written < data.len() {
            let n = unsafe {
                libc::send(
                    fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                written += n as usize;
                continue;
            }

            let err = std::io::Error::last_os_error();
            let recoverable = matches!(
                err.raw_os_error(),
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
            );
            if !recoverable {
                error!(target: "net.tcp", connection, error = %err, "send failed");
                self.shutdown_connection(connection);
                return Err(UaError::ConnectionClosed);
            }

            // Wait for the socket resources to become available, then retry.
            loop {
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                let ret = unsafe { libc::poll(&mut pfd, 1, 100) };
                if ret < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EINTR) {
                        error!(target: "net.tcp", connection, error = %err, "send failed");
                        self.shutdown_connection(connection);
                        return Err(UaError::ConnectionClosed);
                    }
                }
                if ret > 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    fn close_connection(&self, connection: ConnectionId) -> UaResult<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.conns.contains_key(&connection) {
                warn!(target: "net.tcp", connection, "cannot close connection: not found");
                return Err(UaError::NotFound);
            }
        }
        self.shutdown_connection(connection);
        Ok(())
    }
}
