//! Datagram delivery, sender reporting and multicast loopback.

use core_eventloop::EventLoop;
use core_net::{
    ConnectionId, ConnectionManager, ConnectionState, UdpConnectionManager, connection_callback,
};
use core_params::{ParamMap, ParamValue};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Log {
    established: Vec<ConnectionId>,
    closing: Vec<ConnectionId>,
    datagrams: Vec<(Vec<u8>, Option<String>, Option<u16>)>,
    listen_port: Option<u16>,
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
                if !event.data.is_empty() {
                    let remote = event.params.get_str("remote-address").map(str::to_string);
                    let port = event.params.get_u16("remote-port");
                    log.datagrams.push((event.data.to_vec(), remote, port));
                }
            }
            ConnectionState::Closing => log.closing.push(event.connection),
        }
    })
}

fn drive(el: &Arc<EventLoop>, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        el.run(5).unwrap();
    }
    true
}

#[test]
fn udp_unicast_roundtrip() {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    let rx_log = Arc::new(Mutex::new(Log::default()));
    let mut listen_params = ParamMap::new();
    listen_params.insert("address", ParamValue::String("127.0.0.1".into()));
    listen_params.insert("port", ParamValue::UInt16(0));
    listen_params.insert("listen", ParamValue::Bool(true));
    cm.open_connection(&listen_params, logging_callback(rx_log.clone()))
        .unwrap();
    let port = rx_log.lock().unwrap().listen_port.expect("listen announced");

    let tx_log = Arc::new(Mutex::new(Log::default()));
    let mut send_params = ParamMap::new();
    send_params.insert("address", ParamValue::String("127.0.0.1".into()));
    send_params.insert("port", ParamValue::UInt16(port));
    cm.open_connection(&send_params, logging_callback(tx_log.clone()))
        .unwrap();
    let tx_conn = tx_log.lock().unwrap().established[0];

    cm.send(tx_conn, b"datagram-1").unwrap();
    assert!(drive(&el, || !rx_log.lock().unwrap().datagrams.is_empty()));

    {
        let log = rx_log.lock().unwrap();
        let (data, remote, remote_port) = &log.datagrams[0];
        assert_eq!(data, b"datagram-1");
        assert_eq!(remote.as_deref(), Some("127.0.0.1"));
        assert!(remote_port.is_some());
    }

    // Closing both connections drains the manager.
    cm.close_connection(tx_conn).unwrap();
    let rx_conn = rx_log.lock().unwrap().established[0];
    cm.close_connection(rx_conn).unwrap();
    assert!(drive(&el, || {
        !rx_log.lock().unwrap().closing.is_empty() && !tx_log.lock().unwrap().closing.is_empty()
    }));

    el.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while el.lifecycle() != core_eventloop::LoopLifecycle::Stopped && Instant::now() < deadline {
        let _ = el.run(5);
    }
    assert_eq!(el.lifecycle(), core_eventloop::LoopLifecycle::Stopped);
}

#[test]
fn udp_multicast_loopback() {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    let group = "224.0.1.75";
    let rx_log = Arc::new(Mutex::new(Log::default()));
    let mut listen_params = ParamMap::new();
    listen_params.insert("address", ParamValue::String(group.into()));
    listen_params.insert("port", ParamValue::UInt16(40_987));
    listen_params.insert("listen", ParamValue::Bool(true));
    listen_params.insert("reuse", ParamValue::Bool(true));
    listen_params.insert("interface", ParamValue::String("127.0.0.1".into()));
    if cm
        .open_connection(&listen_params, logging_callback(rx_log.clone()))
        .is_err()
    {
        // Environments without multicast membership support.
        eprintln!("skipping multicast test: join failed");
        el.stop();
        return;
    }

    let tx_log = Arc::new(Mutex::new(Log::default()));
    let mut send_params = ParamMap::new();
    send_params.insert("address", ParamValue::String(group.into()));
    send_params.insert("port", ParamValue::UInt16(40_987));
    send_params.insert("interface", ParamValue::String("127.0.0.1".into()));
    send_params.insert("loopback", ParamValue::Bool(true));
    send_params.insert("ttl", ParamValue::UInt32(1));
    cm.open_connection(&send_params, logging_callback(tx_log.clone()))
        .unwrap();
    let tx_conn = tx_log.lock().unwrap().established[0];

    cm.send(tx_conn, b"multicast-datagram").unwrap();
    let delivered = drive(&el, || !rx_log.lock().unwrap().datagrams.is_empty());
    assert!(delivered, "multicast datagram was not looped back");
    assert_eq!(rx_log.lock().unwrap().datagrams[0].0, b"multicast-datagram");

    el.stop();
}

#[test]
fn udp_validate_does_not_register() {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp", ParamMap::new());
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
    assert!(log.lock().unwrap().established.is_empty());
    el.stop();
}

#[test]
fn udp_empty_datagram_does_not_close() {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    let rx_log = Arc::new(Mutex::new(Log::default()));
    let mut listen_params = ParamMap::new();
    listen_params.insert("address", ParamValue::String("127.0.0.1".into()));
    listen_params.insert("port", ParamValue::UInt16(0));
    listen_params.insert("listen", ParamValue::Bool(true));
    cm.open_connection(&listen_params, logging_callback(rx_log.clone()))
        .unwrap();
    let port = rx_log.lock().unwrap().listen_port.unwrap();

    let tx_log = Arc::new(Mutex::new(Log::default()));
    let mut send_params = ParamMap::new();
    send_params.insert("address", ParamValue::String("127.0.0.1".into()));
    send_params.insert("port", ParamValue::UInt16(port));
    cm.open_connection(&send_params, logging_callback(tx_log.clone()))
        .unwrap();
    let tx_conn = tx_log.lock().unwrap().established[0];

    // An empty datagram followed by a regular one: the socket stays open
    // and both events reach the application in order.
    cm.send(tx_conn, b"").unwrap();
    cm.send(tx_conn, b"after-empty").unwrap();
    assert!(drive(&el, || !rx_log.lock().unwrap().datagrams.is_empty()));
    assert_eq!(rx_log.lock().unwrap().datagrams[0].0, b"after-empty");
    assert!(rx_log.lock().unwrap().closing.is_empty());

    el.stop();
}
