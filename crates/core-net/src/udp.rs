//! Datagram connections over UDP, including multicast.
//!
//! Listen connections bind a socket and deliver one callback per received
//! datagram with the sender address attached. Send connections keep the
//! resolved destination in the connection record and use `sendto`. A
//! destination in `224.0.0.0/4` or `ff00::/8` triggers the matching
//! multicast membership (listen) or egress interface selection (send).

use crate::{
    ConnectionCallback, ConnectionEvent, ConnectionId, ConnectionManager, ConnectionState,
    DEFAULT_RX_BUFSIZE,
};
use core_eventloop::{EventLoop, EventSource, EventSourceState, FdEvents, FdHandler};
use core_params::{ParamKind, ParamMap, ParamValue, Restriction};
use core_status::{UaError, UaResult};
use mio::Token;
use mio::net::UdpSocket;
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
    Restriction::scalar("listen", ParamKind::Bool, false),
    Restriction::scalar_or_array("address", ParamKind::String),
    Restriction::scalar("port", ParamKind::UInt16, true),
    Restriction::scalar("interface", ParamKind::String, false),
    Restriction::scalar("ttl", ParamKind::UInt32, false),
    Restriction::scalar("loopback", ParamKind::Bool, false),
    Restriction::scalar("reuse", ParamKind::Bool, false),
    Restriction::scalar("sockpriority", ParamKind::UInt32, false),
    Restriction::scalar("validate", ParamKind::Bool, false),
];

struct UdpConn {
    token: Token,
    socket: UdpSocket,
    /// Destination of a send connection.
    send_addr: Option<SocketAddr>,
    /// Whether the descriptor is armed in the poller (send sockets never
    /// listen for events).
    registered: bool,
    callback: ConnectionCallback,
    closing: bool,
}

struct UdpState {
    lifecycle: EventSourceState,
    conns: HashMap<ConnectionId, UdpConn>,
}

/// Connection manager for datagram sockets.
pub struct UdpConnectionManager {
    name: String,
    params: ParamMap,
    state: Mutex<UdpState>,
    rx_buffer: Mutex<Vec<u8>>,
    event_loop: OnceLock<Weak<EventLoop>>,
    self_ref: Weak<UdpConnectionManager>,
}

/// The IPv4 interface to join/send on: the `interface` parameter as a
/// literal address, or the unspecified address (first suitable interface).
fn multicast_interface_v4(params: &ParamMap) -> UaResult<Ipv4Addr> {
    match params.get_str("interface") {
        None => {
            warn!(target: "net.udp",
                  "no network interface defined for multicast, \
                   the first suitable interface is used");
            Ok(Ipv4Addr::UNSPECIFIED)
        }
        Some(raw) => raw.parse().map_err(|_| {
            error!(target: "net.udp", interface = raw,
                   "interface configuration preparation failed");
            UaError::Internal
        }),
    }
}

/// The IPv6 interface index, resolved from the interface name.
fn multicast_interface_v6(params: &ParamMap) -> UaResult<u32> {
    match params.get_str("interface") {
        None => {
            warn!(target: "net.udp",
                  "no network interface defined for multicast, \
                   the first suitable interface is used");
            Ok(0)
        }
        Some(raw) => {
            let name = std::ffi::CString::new(raw).map_err(|_| UaError::Internal)?;
            let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if index == 0 {
                error!(target: "net.udp", interface = raw,
                       "interface configuration preparation failed");
                return Err(UaError::Internal);
            }
            Ok(index)
        }
    }
}

#[cfg(target_os = "linux")]
fn set_socket_priority(socket: &Socket, priority: u32) -> std::io::Result<()> {
    let prio = priority as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            &prio as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Socket settings shared by the listen and send paths (`ttl`, `loopback`,
/// `reuse`, `sockpriority`).
fn apply_socket_options(
    socket: &Socket,
    params: &ParamMap,
    is_v6: bool,
) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    if is_v6 {
        // Use AF_INET6 sockets only for IPv6 to avoid double-binding.
        socket.set_only_v6(true)?;
    }
    if let Some(ttl) = params.get_u32("ttl") {
        if is_v6 {
            socket.set_multicast_hops_v6(ttl)?;
        } else {
            socket.set_multicast_ttl_v4(ttl)?;
        }
    }
    if let Some(loopback) = params.get_bool("loopback") {
        if is_v6 {
            socket.set_multicast_loop_v6(loopback)?;
        } else {
            socket.set_multicast_loop_v4(loopback)?;
        }
    }
    if params.get_bool("reuse").unwrap_or(false) {
        socket.set_reuse_address(true)?;
    }
    #[cfg(target_os = "linux")]
    if let Some(priority) = params.get_u32("sockpriority") {
        set_socket_priority(socket, priority)?;
    }
    Ok(())
}

impl UdpConnectionManager {
    pub fn new(name: impl Into<String>, params: ParamMap) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| UdpConnectionManager {
            name: name.into(),
            params,
            state: Mutex::new(UdpState {
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

    fn check_stopped(&self) {
        let mut state = self.state.lock().unwrap();
        if state.conns.is_empty() && state.lifecycle == EventSourceState::Stopping {
            debug!(target: "net.udp", "all sockets closed, the connection manager has stopped");
            state.lifecycle = EventSourceState::Stopped;
        }
    }

    fn shutdown_connection(&self, id: ConnectionId) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get_mut(&id) else {
                return;
            };
            if conn.closing {
                debug!(target: "net.udp", connection = id, "already closing");
                return;
            }
            conn.closing = true;
            unsafe {
                libc::shutdown(conn.socket.as_raw_fd(), libc::SHUT_RDWR);
            }
        }

        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        match self.event_loop() {
            Some(el) => el.add_delayed(move || manager.delayed_close(id)),
            None => manager.delayed_close(id),
        }
    }

    fn delayed_close(&self, id: ConnectionId) {
        let conn = self.state.lock().unwrap().conns.remove(&id);
        let Some(mut conn) = conn else {
            return;
        };
        debug!(target: "net.udp", connection = id, "closing connection");

        if conn.registered {
            if let Some(el) = self.event_loop() {
                el.deregister_fd(&mut conn.socket, conn.token);
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
        info!(target: "net.udp", connection = id, "socket closed");
        self.check_stopped();
    }

    // -----------------------------------------------------------------
    // Listen path
    // -----------------------------------------------------------------

    fn open_listen(&self, params: &ParamMap, callback: &ConnectionCallback) -> UaResult<()> {
        let port = params.get_u16("port").ok_or(UaError::InvalidArgument)?;
        let validate_only = params.get_bool("validate").unwrap_or(false);

        let hosts = params.get_strings("address");
        if hosts.is_empty() {
            info!(target: "net.udp", "listening on all interfaces");
            let any: [SocketAddr; 2] = [
                (Ipv6Addr::UNSPECIFIED, port).into(),
                (Ipv4Addr::UNSPECIFIED, port).into(),
            ];
            let mut result = Err(UaError::ConnectionRejected);
            for addr in any {
                if self
                    .register_listen_socket(addr, None, params, validate_only, callback)
                    .is_ok()
                {
                    result = Ok(());
                }
            }
            return result;
        }

        let mut result = Err(UaError::ConnectionRejected);
        for host in hosts {
            let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    warn!(target: "net.udp", host, port, error = %e, "address lookup failed");
                    continue;
                }
            };
            for addr in addrs {
                if self
                    .register_listen_socket(addr, Some(host), params, validate_only, callback)
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
        params: &ParamMap,
        validate_only: bool,
        callback: &ConnectionCallback,
    ) -> UaResult<()> {
        let is_v6 = addr.is_ipv6();
        let domain = if is_v6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            warn!(target: "net.udp", %addr, error = %e, "could not create the listen socket");
            UaError::OutOfService
        })?;
        if let Err(e) = apply_socket_options(&socket, params, is_v6) {
            warn!(target: "net.udp", %addr, error = %e, "could not set socket options");
            return Err(UaError::ConnectionRejected);
        }

        let multicast = addr.ip().is_multicast();

        // Windows cannot bind a multicast address directly; it always binds
        // the wildcard with the requested port.
        #[cfg(windows)]
        let bind_addr: SocketAddr = if multicast {
            if is_v6 {
                (Ipv6Addr::UNSPECIFIED, addr.port()).into()
            } else {
                (Ipv4Addr::UNSPECIFIED, addr.port()).into()
            }
        } else {
            addr
        };
        #[cfg(not(windows))]
        let bind_addr = addr;

        if let Err(e) = socket.bind(&bind_addr.into()) {
            warn!(target: "net.udp", %addr, error = %e, "error binding the socket");
            return Err(UaError::ConnectionRejected);
        }

        if multicast {
            let joined = match addr {
                SocketAddr::V4(v4) => {
                    let iface = multicast_interface_v4(params)?;
                    socket.join_multicast_v4(v4.ip(), &iface)
                }
                SocketAddr::V6(v6) => {
                    let index = multicast_interface_v6(params)?;
                    socket.join_multicast_v6(v6.ip(), index)
                }
            };
            if let Err(e) = joined {
                error!(target: "net.udp", %addr, error = %e,
                       "cannot set up the socket for multicast receiving");
                return Err(UaError::ConnectionRejected);
            }
        }

        // Only check that the configuration works.
        if validate_only {
            return Ok(());
        }

        let effective_port = socket
            .local_addr()
            .ok()
            .and_then(|sa| sa.as_socket())
            .map(|sa| sa.port())
            .unwrap_or(addr.port());

        let mut udp = UdpSocket::from_std(socket.into());
        let el = self.event_loop().ok_or(UaError::Internal)?;
        let token = el.register_fd(&mut udp, FdEvents::IN, self.handler()?)?;
        let id = token.0 as ConnectionId;

        {
            let mut state = self.state.lock().unwrap();
            state.conns.insert(
                id,
                UdpConn {
                    token,
                    socket: udp,
                    send_addr: None,
                    registered: true,
                    callback: callback.clone(),
                    closing: false,
                },
            );
        }

        let announced = match hostname {
            Some(h) => h.to_string(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };
        info!(target: "net.udp", connection = id, address = %announced,
              port = effective_port, multicast, "creating listen socket");

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
    // Send path
    // -----------------------------------------------------------------

    fn open_send(&self, params: &ParamMap, callback: &ConnectionCallback) -> UaResult<()> {
        let port = params.get_u16("port").ok_or(UaError::InvalidArgument)?;
        let validate_only = params.get_bool("validate").unwrap_or(false);
        let hosts = params.get_strings("address");
        let Some(&host) = hosts.first() else {
            error!(target: "net.udp", "opening a connection failed: no address configured");
            return Err(UaError::ConnectionRejected);
        };

        let addr = match (host, port).to_socket_addrs() {
            Ok(mut iter) => match iter.next() {
                Some(addr) => addr,
                None => {
                    warn!(target: "net.udp", host, "lookup returned no addresses");
                    return Err(UaError::ConnectionRejected);
                }
            },
            Err(e) => {
                warn!(target: "net.udp", host, error = %e, "lookup failed");
                return Err(UaError::ConnectionRejected);
            }
        };

        let is_v6 = addr.is_ipv6();
        let domain = if is_v6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            warn!(target: "net.udp", host, error = %e, "could not create the send socket");
            UaError::Disconnect
        })?;
        if let Err(e) = apply_socket_options(&socket, params, is_v6) {
            warn!(target: "net.udp", host, error = %e, "could not set socket options");
            return Err(UaError::ConnectionRejected);
        }

        // Select the egress interface for a multicast destination.
        if addr.ip().is_multicast() {
            let selected = match addr {
                SocketAddr::V4(_) => {
                    let iface = multicast_interface_v4(params)?;
                    socket.set_multicast_if_v4(&iface)
                }
                SocketAddr::V6(_) => {
                    let index = multicast_interface_v6(params)?;
                    socket.set_multicast_if_v6(index)
                }
            };
            if let Err(e) = selected {
                error!(target: "net.udp", %addr, error = %e,
                       "cannot set up the socket for multicast sending");
                return Err(UaError::ConnectionRejected);
            }
        }

        if validate_only {
            info!(target: "net.udp", host, port, "connection validated");
            return Ok(());
        }

        let udp = UdpSocket::from_std(socket.into());
        // A send connection never listens for events; it only needs an id
        // from the shared token space.
        let el = self.event_loop().ok_or(UaError::Internal)?;
        let token = el.alloc_token();
        let id = token.0 as ConnectionId;

        {
            let mut state = self.state.lock().unwrap();
            state.conns.insert(
                id,
                UdpConn {
                    token,
                    socket: udp,
                    send_addr: Some(addr),
                    registered: false,
                    callback: callback.clone(),
                    closing: false,
                },
            );
        }

        info!(target: "net.udp", connection = id, host, port, "new send connection");

        let empty = ParamMap::new();
        (*callback.lock().unwrap())(ConnectionEvent {
            connection: id,
            state: ConnectionState::Established,
            params: &empty,
            data: &[],
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------

    fn handle_recv(&self, id: ConnectionId, events: FdEvents) {
        if events.contains(FdEvents::ERR) {
            info!(target: "net.udp", connection = id, "socket error, closing");
            self.shutdown_connection(id);
            return;
        }
        if !events.contains(FdEvents::IN) {
            return;
        }

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
                conn.socket.recv_from(&mut buffer[..])
            };

            match received {
                Ok((n, remote)) => {
                    debug!(target: "net.udp", connection = id, bytes = n, remote = %remote,
                           "received datagram");
                    let callback = {
                        let state = self.state.lock().unwrap();
                        match state.conns.get(&id) {
                            Some(conn) => conn.callback.clone(),
                            None => return,
                        }
                    };
                    let mut params = ParamMap::new();
                    params.insert(
                        "remote-address",
                        ParamValue::String(remote.ip().to_string()),
                    );
                    params.insert("remote-port", ParamValue::UInt16(remote.port()));
                    // An empty datagram is delivered like any other; it
                    // never closes the connection.
                    (*callback.lock().unwrap())(ConnectionEvent {
                        connection: id,
                        state: ConnectionState::Established,
                        params: &params,
                        data: &buffer[..n],
                    });
                    drop(buffer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(buffer);
                    debug!(target: "net.udp", connection = id, error = %e,
                           "recv failed, shutting down");
                    self.shutdown_connection(id);
                    return;
                }
            }
        }
    }
}

impl EventSource for UdpConnectionManager {
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
            error!(target: "net.udp",
                   "to start the connection manager it has to be registered and not started");
            return Err(UaError::Internal);
        }
        core_params::validate("udp", MANAGER_PARAMS, &self.params)?;

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
            info!(target: "net.udp", "shutting down the connection manager");
            state.lifecycle = EventSourceState::Stopping;
            state.conns.keys().copied().collect()
        };
        for id in ids {
            self.shutdown_connection(id);
        }
        self.check_stopped();
    }
}

impl FdHandler for UdpConnectionManager {
    fn fd_event(&self, token: Token, events: FdEvents) {
        self.handle_recv(token.0 as ConnectionId, events);
    }
}

impl ConnectionManager for UdpConnectionManager {
    fn protocol(&self) -> &str {
        "udp"
    }

    fn open_connection(&self, params: &ParamMap, callback: ConnectionCallback) -> UaResult<()> {
        if self.state() != EventSourceState::Started {
            error!(target: "net.udp",
                   "cannot open a connection for a connection manager that is not started");
            return Err(UaError::Internal);
        }
        core_params::validate("udp", CONNECTION_PARAMS, params)?;

        if params.get_bool("listen").unwrap_or(false) {
            self.open_listen(params, &callback)
        } else {
            self.open_send(params, &callback)
        }
    }

    /// One datagram per send. Recoverable conditions are retried through a
    /// short `poll(POLLOUT)` wait; anything else closes the connection.
    fn send(&self, connection: ConnectionId, data: &[u8]) -> UaResult<()> {
        let (fd, dest) = {
            let state = self.state.lock().unwrap();
            let Some(conn) = state.conns.get(&connection) else {
                warn!(target: "net.udp", connection, "cannot send: connection not found");
                return Err(UaError::NotFound);
            };
            (conn.socket.as_raw_fd(), conn.send_addr)
        };
        let Some(dest) = dest else {
            error!(target: "net.udp", connection, "cannot send on a listen connection");
            return Err(UaError::Internal);
        };
        let raw: socket2::SockAddr = dest.into();

        loop {
            let n = unsafe {
                libc::sendto(
                    fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_NOSIGNAL,
                    raw.as_ptr() as *const libc::sockaddr,
                    raw.len(),
                )
            };
            if n >= 0 {
                return Ok(());
            }

            let err = std::io::Error::last_os_error();
            let recoverable = matches!(
                err.raw_os_error(),
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
            );
            if !recoverable {
                error!(target: "net.udp", connection, error = %err, "send failed");
                self.shutdown_connection(connection);
                return Err(UaError::ConnectionClosed);
            }

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
                        error!(target: "net.udp", connection, error = %err, "send failed");
                        self.shutdown_connection(connection);
                        return Err(UaError::ConnectionClosed);
                    }
                }
                if ret > 0 {
                    break;
                }
            }
        }
    }

    fn close_connection(&self, connection: ConnectionId) -> UaResult<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.conns.contains_key(&connection) {
                warn!(target: "net.udp", connection, "cannot close connection: not found");
                return Err(UaError::NotFound);
            }
        }
        self.shutdown_connection(connection);
        Ok(())
    }
}
