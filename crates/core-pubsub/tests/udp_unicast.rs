//! End-to-end unicast publish/subscribe over one loop.

use core_eventloop::EventLoop;
use core_net::UdpConnectionManager;
use core_params::ParamMap;
use core_pubsub::{DataValue, Publisher, ReaderGroupConfig, Subscriber, WriterGroupConfig};
use std::time::{Duration, Instant};

#[test]
fn int32_reaches_the_subscriber_target() {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp-pubsub", ParamMap::new());
    el.register_event_source(cm.clone()).unwrap();
    el.start().unwrap();

    // Subscriber on port 4801, matching publisher 2234 / group 100 /
    // writer 62541, with one Int32 target.
    let subscriber = Subscriber::new(
        cm.clone(),
        ReaderGroupConfig {
            address: "localhost".to_string(),
            port: 4801,
            publisher_id: 2234,
            writer_group_id: 100,
            dataset_writer_id: 62541,
            targets: vec!["ns=1;i=1002".to_string()],
        },
    );
    subscriber.start().unwrap();

    // Publisher towards 127.0.0.1:4801 with one Int32 variable.
    let publisher = Publisher::new(
        cm.clone(),
        el.clone(),
        WriterGroupConfig {
            address: "127.0.0.1".to_string(),
            port: 4801,
            publisher_id: 2234,
            writer_group_id: 100,
            dataset_writer_id: 62541,
            publishing_interval_ms: 15.0,
        },
    );
    publisher.add_field("ns=1;i=1000", DataValue::Int32(42));
    publisher.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while subscriber.value("ns=1;i=1002").is_none() {
        assert!(Instant::now() < deadline, "no sample arrived");
        el.run(5).unwrap();
    }
    assert_eq!(subscriber.value("ns=1;i=1002"), Some(DataValue::Int32(42)));

    // A value update propagates with the next cycles.
    publisher
        .write_value("ns=1;i=1000", DataValue::Int32(1234))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while subscriber.value("ns=1;i=1002") != Some(DataValue::Int32(1234)) {
        assert!(Instant::now() < deadline, "update never arrived");
        el.run(5).unwrap();
    }

    // Messages from a foreign writer group do not touch the target.
    let foreign = Publisher::new(
        cm.clone(),
        el.clone(),
        WriterGroupConfig {
            address: "127.0.0.1".to_string(),
            port: 4801,
            publisher_id: 2234,
            writer_group_id: 999,
            dataset_writer_id: 62541,
            publishing_interval_ms: 5.0,
        },
    );
    foreign.add_field("ns=1;i=3000", DataValue::Int32(777));
    foreign.start().unwrap();
    for _ in 0..30 {
        el.run(5).unwrap();
    }
    assert_eq!(subscriber.value("ns=1;i=1002"), Some(DataValue::Int32(1234)));

    publisher.stop();
    foreign.stop();
    subscriber.stop();
    el.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while el.lifecycle() != core_eventloop::LoopLifecycle::Stopped && Instant::now() < deadline {
        let _ = el.run(5);
    }
    assert_eq!(el.lifecycle(), core_eventloop::LoopLifecycle::Stopped);
}
