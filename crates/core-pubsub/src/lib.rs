//! Publish/subscribe transport over the UDP connection manager.
//!
//! One datagram carries one network message: a compact header with the
//! publisher id, a group header with the writer-group id, a payload header
//! listing the dataset-writer ids and one dataset message per writer. The
//! publisher emits cyclically from the loop timer; the subscriber binds a
//! listen connection, filters on the configured ids and writes the decoded
//! fields into named target variables.

use core_eventloop::EventLoop;
use core_net::{ConnectionId, ConnectionManager, ConnectionState, UdpConnectionManager};
use core_params::{ParamMap, ParamValue};
use core_status::{UaError, UaResult};
use core_timer::{TimerId, TimerPolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, info, warn};

mod codec;

pub use codec::{DataSetMessage, DataValue, NetworkMessage};

/// Cyclic publisher of one writer group with a single dataset writer.
#[derive(Debug, Clone)]
pub struct WriterGroupConfig {
    /// Destination host (unicast or multicast).
    pub address: String,
    pub port: u16,
    pub publisher_id: u16,
    pub writer_group_id: u16,
    pub dataset_writer_id: u16,
    /// Publish cycle in milliseconds.
    pub publishing_interval_ms: f64,
}

/// Publishes the current values of its dataset fields on every cycle.
pub struct Publisher {
    manager: Arc<UdpConnectionManager>,
    event_loop: Arc<EventLoop>,
    config: WriterGroupConfig,
    /// Field values in dataset order, keyed by source variable name.
    fields: Arc<Mutex<Vec<(String, DataValue)>>>,
    connection: OnceLock<ConnectionId>,
    timer: Mutex<Option<TimerId>>,
    self_ref: Weak<Publisher>,
}

impl Publisher {
    pub fn new(
        manager: Arc<UdpConnectionManager>,
        event_loop: Arc<EventLoop>,
        config: WriterGroupConfig,
    ) -> Arc<Publisher> {
        Arc::new_cyclic(|self_ref| Publisher {
            manager,
            event_loop,
            config,
            fields: Arc::new(Mutex::new(Vec::new())),
            connection: OnceLock::new(),
            timer: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// Add a published variable. Fields appear in the dataset in the order
    /// they were added.
    pub fn add_field(&self, source: impl Into<String>, initial: DataValue) {
        self.fields.lock().unwrap().push((source.into(), initial));
    }

    /// Update a published variable by source name.
    pub fn write_value(&self, source: &str, value: DataValue) -> UaResult<()> {
        let mut fields = self.fields.lock().unwrap();
        for (name, slot) in fields.iter_mut() {
            if name == source {
                *slot = value;
                return Ok(());
            }
        }
        Err(UaError::NotFound)
    }

    /// Open the send connection and arm the publish cycle.
    pub fn start(&self) -> UaResult<()> {
        let mut params = ParamMap::new();
        params.insert("address", ParamValue::String(self.config.address.clone()));
        params.insert("port", ParamValue::UInt16(self.config.port));

        let connection = Arc::new(Mutex::new(None::<ConnectionId>));
        let connection2 = connection.clone();
        self.manager.open_connection(
            &params,
            core_net::connection_callback(move |event| {
                if event.state == ConnectionState::Established {
                    *connection2.lock().unwrap() = Some(event.connection);
                }
            }),
        )?;
        let Some(id) = *connection.lock().unwrap() else {
            warn!(target: "pubsub", "the send connection did not open");
            return Err(UaError::ConnectionRejected);
        };
        self.connection.set(id).map_err(|_| UaError::Internal)?;

        let publisher = self.self_ref.upgrade().ok_or(UaError::Internal)?;
        let timer_id = self.event_loop.add_cyclic_callback(
            move || publisher.publish_once(),
            self.config.publishing_interval_ms,
            None,
            TimerPolicy::CurrentTime,
        )?;
        *self.timer.lock().unwrap() = Some(timer_id);

        info!(target: "pubsub", publisher_id = self.config.publisher_id,
              writer_group = self.config.writer_group_id,
              interval_ms = self.config.publishing_interval_ms, "publisher started");
        Ok(())
    }

    /// Disarm the publish cycle and close the send connection.
    pub fn stop(&self) {
        if let Some(timer_id) = self.timer.lock().unwrap().take() {
            self.event_loop.remove_cyclic_callback(timer_id);
        }
        if let Some(&connection) = self.connection.get() {
            let _ = self.manager.close_connection(connection);
        }
    }

    fn publish_once(&self) {
        let Some(&connection) = self.connection.get() else {
            return;
        };
        let message = NetworkMessage {
            publisher_id: self.config.publisher_id,
            writer_group_id: self.config.writer_group_id,
            messages: vec![DataSetMessage {
                dataset_writer_id: self.config.dataset_writer_id,
                fields: self
                    .fields
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(_, value)| *value)
                    .collect(),
            }],
        };
        let payload = message.encode();
        if let Err(e) = self.manager.send(connection, &payload) {
            debug!(target: "pubsub", error = %e, "publish failed");
        }
    }
}

/// Subscription to one dataset writer of one publisher.
#[derive(Debug, Clone)]
pub struct ReaderGroupConfig {
    /// Bind host; for multicast the group address.
    pub address: String,
    pub port: u16,
    pub publisher_id: u16,
    pub writer_group_id: u16,
    pub dataset_writer_id: u16,
    /// Target variable names, one per dataset field in order.
    pub targets: Vec<String>,
}

/// Receives network messages and stores matching fields in its targets.
pub struct Subscriber {
    config: ReaderGroupConfig,
    values: Arc<Mutex<HashMap<String, DataValue>>>,
    manager: Arc<UdpConnectionManager>,
    connection: OnceLock<ConnectionId>,
    self_ref: Weak<Subscriber>,
}

impl Subscriber {
    pub fn new(
        manager: Arc<UdpConnectionManager>,
        config: ReaderGroupConfig,
    ) -> Arc<Subscriber> {
        Arc::new_cyclic(|self_ref| Subscriber {
            config,
            values: Arc::new(Mutex::new(HashMap::new())),
            manager,
            connection: OnceLock::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Bind the listen connection.
    pub fn start(&self) -> UaResult<()> {
        let mut params = ParamMap::new();
        params.insert("address", ParamValue::String(self.config.address.clone()));
        params.insert("port", ParamValue::UInt16(self.config.port));
        params.insert("listen", ParamValue::Bool(true));
        params.insert("reuse", ParamValue::Bool(true));

        let subscriber = self.self_ref.upgrade().ok_or(UaError::Internal)?;
        let connection = Arc::new(Mutex::new(None::<ConnectionId>));
        let connection2 = connection.clone();
        self.manager.open_connection(
            &params,
            core_net::connection_callback(move |event| match event.state {
                ConnectionState::Established if event.data.is_empty() => {
                    *connection2.lock().unwrap() = Some(event.connection);
                }
                ConnectionState::Established => subscriber.consume(event.data),
                _ => {}
            }),
        )?;
        if let Some(id) = *connection.lock().unwrap() {
            let _ = self.connection.set(id);
        }
        info!(target: "pubsub", publisher_id = self.config.publisher_id,
              writer_group = self.config.writer_group_id, "subscriber started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(&connection) = self.connection.get() {
            let _ = self.manager.close_connection(connection);
        }
    }

    /// Current value of a target variable.
    pub fn value(&self, target: &str) -> Option<DataValue> {
        self.values.lock().unwrap().get(target).copied()
    }

    fn consume(&self, datagram: &[u8]) {
        let message = match NetworkMessage::decode(datagram) {
            Ok(message) => message,
            Err(_) => {
                debug!(target: "pubsub", "dropping malformed network message");
                return;
            }
        };
        if message.publisher_id != self.config.publisher_id
            || message.writer_group_id != self.config.writer_group_id
        {
            return;
        }
        for dataset in &message.messages {
            if dataset.dataset_writer_id != self.config.dataset_writer_id {
                continue;
            }
            let mut values = self.values.lock().unwrap();
            for (target, field) in self.config.targets.iter().zip(dataset.fields.iter()) {
                values.insert(target.clone(), *field);
            }
        }
    }
}
