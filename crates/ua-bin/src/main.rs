//! Oxua entrypoint: drives the runtime substrate as a TCP echo service or
//! as a PubSub publisher/subscriber pair.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use core_eventloop::{EventLoop, LoopLifecycle};
use core_interrupt::{InterruptManager, interrupt_callback};
use core_net::{
    ConnectionManager, ConnectionState, TcpConnectionManager, UdpConnectionManager,
    connection_callback,
};
use core_params::{ParamMap, ParamValue};
use core_pubsub::{DataValue, Publisher, ReaderGroupConfig, Subscriber, WriterGroupConfig};
use core_timer::TimerPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "oxua", version, about = "OPC UA runtime substrate demo")] // minimal metadata
struct Args {
    /// Optional directory for the log file; stderr when omitted.
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for TCP connections and echo every received buffer.
    Echo {
        /// Bind address; all interfaces when omitted.
        #[arg(long)]
        address: Option<String>,
        #[arg(long, default_value_t = 4840)]
        port: u16,
    },
    /// Publish a counter over UDP and subscribe to it on the same port.
    Pubsub {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long, default_value_t = 4801)]
        port: u16,
        /// Publish cycle in milliseconds.
        #[arg(long, default_value_t = 100.0)]
        interval_ms: f64,
    },
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "oxua.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Stop the loop on SIGINT/SIGTERM, delivered through the loop itself.
fn install_shutdown(el: &Arc<EventLoop>) -> Result<Arc<AtomicBool>> {
    let im = InterruptManager::new("interrupts");
    el.register_event_source(im.clone())
        .map_err(|e| anyhow::anyhow!("registering the interrupt manager failed: {e}"))?;
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let shutdown = shutdown.clone();
        im.register_interrupt(
            signal,
            interrupt_callback(move |signal| {
                info!(signal, "shutdown requested");
                shutdown.store(true, Ordering::SeqCst);
            }),
        )
        .map_err(|e| anyhow::anyhow!("registering signal {signal} failed: {e}"))?;
    }
    Ok(shutdown)
}

fn drive(el: &Arc<EventLoop>, shutdown: &AtomicBool) -> Result<()> {
    loop {
        match el.lifecycle() {
            LoopLifecycle::Stopped => return Ok(()),
            LoopLifecycle::Started if shutdown.load(Ordering::SeqCst) => el.stop(),
            _ => {}
        }
        el.run(100)
            .map_err(|e| anyhow::anyhow!("event loop iteration failed: {e}"))?;
    }
}

fn run_echo(address: Option<String>, port: u16) -> Result<()> {
    let el = EventLoop::new();
    let cm = TcpConnectionManager::new("tcp", ParamMap::new());
    el.register_event_source(cm.clone())
        .map_err(|e| anyhow::anyhow!("registering the TCP manager failed: {e}"))?;
    let shutdown = install_shutdown(&el)?;
    el.start()
        .map_err(|e| anyhow::anyhow!("starting the event loop failed: {e}"))?;

    let mut params = ParamMap::new();
    if let Some(address) = address {
        params.insert("address", ParamValue::String(address));
    }
    params.insert("port", ParamValue::UInt16(port));
    params.insert("listen", ParamValue::Bool(true));
    params.insert("reuse", ParamValue::Bool(true));

    let echo_cm = cm.clone();
    cm.open_connection(
        &params,
        connection_callback(move |event| match event.state {
            ConnectionState::Established if !event.data.is_empty() => {
                if let Err(e) = echo_cm.send(event.connection, event.data) {
                    warn!(connection = event.connection, error = %e, "echo send failed");
                }
            }
            ConnectionState::Established => {
                if let Some(port) = event.params.get_u16("listen-port") {
                    info!(port, "echo service listening");
                } else {
                    info!(connection = event.connection, "connection established");
                }
            }
            ConnectionState::Closing => {
                info!(connection = event.connection, "connection closed");
            }
            ConnectionState::Opening => {}
        }),
    )
    .map_err(|e| anyhow::anyhow!("opening the listen socket failed: {e}"))?;

    drive(&el, &shutdown)
}

fn run_pubsub(address: String, port: u16, interval_ms: f64) -> Result<()> {
    let el = EventLoop::new();
    let cm = UdpConnectionManager::new("udp", ParamMap::new());
    el.register_event_source(cm.clone())
        .map_err(|e| anyhow::anyhow!("registering the UDP manager failed: {e}"))?;
    let shutdown = install_shutdown(&el)?;
    el.start()
        .map_err(|e| anyhow::anyhow!("starting the event loop failed: {e}"))?;

    let subscriber = Subscriber::new(
        cm.clone(),
        ReaderGroupConfig {
            address: address.clone(),
            port,
            publisher_id: 2234,
            writer_group_id: 100,
            dataset_writer_id: 62541,
            targets: vec!["counter".to_string()],
        },
    );
    subscriber
        .start()
        .map_err(|e| anyhow::anyhow!("starting the subscriber failed: {e}"))?;

    let publisher = Publisher::new(
        cm.clone(),
        el.clone(),
        WriterGroupConfig {
            address,
            port,
            publisher_id: 2234,
            writer_group_id: 100,
            dataset_writer_id: 62541,
            publishing_interval_ms: interval_ms,
        },
    );
    publisher.add_field("counter", DataValue::Int32(0));
    publisher
        .start()
        .map_err(|e| anyhow::anyhow!("starting the publisher failed: {e}"))?;

    // Count upwards on every publish cycle and report what arrives.
    let counter = Arc::new(AtomicI32::new(0));
    {
        let counter = counter.clone();
        let publisher = publisher.clone();
        el.add_cyclic_callback(
            move || {
                let value = counter.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = publisher.write_value("counter", DataValue::Int32(value));
            },
            interval_ms,
            None,
            TimerPolicy::CurrentTime,
        )
        .map_err(|e| anyhow::anyhow!("arming the counter failed: {e}"))?;
    }
    {
        let subscriber = subscriber.clone();
        el.add_cyclic_callback(
            move || {
                if let Some(DataValue::Int32(value)) = subscriber.value("counter") {
                    info!(value, "subscriber sample");
                }
            },
            1_000.0,
            None,
            TimerPolicy::CurrentTime,
        )
        .map_err(|e| anyhow::anyhow!("arming the report timer failed: {e}"))?;
    }

    let result = drive(&el, &shutdown);
    publisher.stop();
    subscriber.stop();
    result
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_ref());
    info!(version = env!("CARGO_PKG_VERSION"), "oxua starting");

    match args.command {
        Command::Echo { address, port } => {
            run_echo(address, port).context("echo service failed")
        }
        Command::Pubsub {
            address,
            port,
            interval_ms,
        } => run_pubsub(address, port, interval_ms).context("pubsub demo failed"),
    }
}
