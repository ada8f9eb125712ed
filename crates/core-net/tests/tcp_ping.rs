//! Two loops, one passive and one active TCP endpoint.

use core_eventloop::EventLoop;
use core_net::{
    ConnectionId, ConnectionManager, ConnectionState, TcpConnectionManager, connection_callback,
};
use core_params::{ParamMap, ParamValue};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Log {
    established: Vec<ConnectionId>,
    closing: Vec<ConnectionId>,
    data: Vec<(ConnectionId, Vec<u8>)>,
    listen_port: Option<u16>,
    remote_address: Option<String>,
}

fn logging_callback(log: Arc<Mutex<Log>>) -> core_net::ConnectionCallback {
    connection_callback(move |event| {
        let mut log = log.lock().unwrap();
        match event.state {
            ConnectionState::Opening => {}
            ConnectionState::Established => {
                log.established.push(event.connection);
                if let Some(port) = event.params.get_u16("listen-port") {
                    log.listen_port = Some(port);
                }
                if let Some(remote) = event.params.get_str("remote-address") {
                    log.remote_address = Some(remote.to_string());
                }
                if !event.data.is_empty() {
                    log.data.push((event.connection, event.data.to_vec()));
                }
            }
            ConnectionState::Closing => log.closing.push(event.connection),
        }
    })
}

fn drive(loops: &[&Arc<EventLoop>], mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "test timed out");
        for el in loops {
            el.run(5).unwrap();
        }
    }
}

#[test]
fn tcp_single_connection_ping() {
    let el_a = EventLoop::new();
    let el_b = EventLoop::new();
    let cm_a = TcpConnectionManager::new("tcp-a", ParamMap::new());
    let cm_b = TcpConnectionManager::new("tcp-b", ParamMap::new());
    el_a.register_event_source(cm_a.clone()).unwrap();
    el_b.register_event_source(cm_b.clone()).unwrap();
    el_a.start().unwrap();
    el_b.start().unwrap();

    // Passive side on an ephemeral port.
    let log_a = Arc::new(Mutex::new(Log::default()));
    let mut listen_params = ParamMap::new();
    listen_params.insert("address", ParamValue::String("127.0.0.1".into()));
    listen_params.insert("port", ParamValue::UInt16(0));
    listen_params.insert("listen", ParamValue::Bool(true));
    listen_params.insert("reuse", ParamValue::Bool(true));
    cm_a.open_connection(&listen_params, logging_callback(log_a.clone()))
        .unwrap();

    let port = log_a.lock().unwrap().listen_port.expect("listen announced");
    assert_ne!(port, 0);

    // Active side connects to the announced port.
    let log_b = Arc::new(Mutex::new(Log::default()));
    let mut connect_params = ParamMap::new();
    connect_params.insert("address", ParamValue::String("127.0.0.1".into()));
    connect_params.insert("port", ParamValue::UInt16(port));
    cm_b.open_connection(&connect_params, logging_callback(log_b.clone()))
        .unwrap();

    // Both sides observe the connection.
    drive(&[&el_a, &el_b], || {
        !log_b.lock().unwrap().established.is_empty()
            && log_a.lock().unwrap().established.len() >= 2
    });
    let b_conn = log_b.lock().unwrap().established[0];
    assert!(log_a.lock().unwrap().remote_address.is_some());

    // B sends "ping"; A's connection callback observes the exact bytes.
    cm_b.send(b_conn, b"ping").unwrap();
    drive(&[&el_a, &el_b], || !log_a.lock().unwrap().data.is_empty());
    {
        let log = log_a.lock().unwrap();
        assert_eq!(log.data.len(), 1);
        assert_eq!(log.data[0].1, b"ping");
    }

    // Closing B's side delivers a Closing callback on both ends and no
    // further data afterwards.
    cm_b.close_connection(b_conn).unwrap();
    drive(&[&el_a, &el_b], || {
        !log_b.lock().unwrap().closing.is_empty() && !log_a.lock().unwrap().closing.is_empty()
    });
    let data_after_close = log_a.lock().unwrap().data.len();
    for el in [&el_a, &el_b] {
        el.run(5).unwrap();
    }
    assert_eq!(log_a.lock().unwrap().data.len(), data_after_close);

    // Clean shutdown of both loops.
    el_a.stop();
    el_b.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while (el_a.lifecycle() != core_eventloop::LoopLifecycle::Stopped
        || el_b.lifecycle() != core_eventloop::LoopLifecycle::Stopped)
        && Instant::now() < deadline
    {
        let _ = el_a.run(5);
        let _ = el_b.run(5);
    }
    assert_eq!(el_a.lifecycle(), core_eventloop::LoopLifecycle::Stopped);
    assert_eq!(el_b.lifecycle(), core_eventloop::LoopLifecycle::Stopped);
}

#[test]
fn tcp_validate_does_not_register() {
    let el = EventLoop::new();
    let cm = TcpConnectionManager::new("tcp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    let log = Arc::new(Mutex::new(Log::default()));
    let mut params = ParamMap::new();
    params.insert("address", ParamValue::String("127.0.0.1".into()));
    params.insert("port", ParamValue::UInt16(0));
    params.insert("listen", ParamValue::Bool(true));
    params.insert("validate", ParamValue::Bool(true));
    cm.open_connection(&params, logging_callback(log.clone()))
        .unwrap();

    // Validation binds and closes without announcing anything.
    assert!(log.lock().unwrap().established.is_empty());
    el.stop();
}

#[test]
fn tcp_unknown_parameter_rejected() {
    let el = EventLoop::new();
    let cm = TcpConnectionManager::new("tcp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    let log = Arc::new(Mutex::new(Log::default()));
    let mut params = ParamMap::new();
    params.insert("port", ParamValue::UInt16(4840));
    params.insert("frobnicate", ParamValue::Bool(true));
    let err = cm
        .open_connection(&params, logging_callback(log))
        .unwrap_err();
    assert_eq!(err, core_status::UaError::InvalidArgument);
    el.stop();
}

#[test]
fn tcp_send_on_unknown_connection() {
    let el = EventLoop::new();
    let cm = TcpConnectionManager::new("tcp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();
    assert_eq!(cm.send(9999, b"x"), Err(core_status::UaError::NotFound));
    assert_eq!(
        cm.close_connection(9999),
        Err(core_status::UaError::NotFound)
    );
    el.stop();
}
