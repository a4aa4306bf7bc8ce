//! Structured log listener for containers using streamed logging.
//!
//! Containers send GELF-style JSON events either as UDP datagrams (plain,
//! gzip or zlib compressed) or as NUL-delimited frames over TCP. Each event
//! must carry `host`, `level`, `timestamp` and `short_message`. An event is
//! accepted only when its `host` is a prefix of the container's runtime id;
//! everything else is dropped with a notice.

use std::io::Read;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LogTransport;
use crate::error::DockerError;
use crate::execution::docker_client::ContainerEngine;

const BIND_ADDR: &str = "0.0.0.0";
const MAX_DATAGRAM: usize = 65_536;
/// After a stop request, pending events are read until the socket stays
/// quiet this long.
const DRAIN_IDLE: Duration = Duration::from_millis(100);
/// Upper bound on the whole drain.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// One accepted log event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEvent {
    pub host: String,
    pub level: u8,
    pub timestamp: f64,
    pub short_message: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEvent {
    /// Syslog levels 0-3 are errors.
    pub fn is_error(&self) -> bool {
        self.level <= 3
    }
}

/// Counters and the last error line seen by a listener.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSummary {
    pub delivered: usize,
    pub dropped: usize,
    pub last_error: Option<String>,
}

/// Resolves the container's runtime id on first use and checks event hosts
/// against it.
pub struct Correlator {
    engine: Arc<dyn ContainerEngine>,
    container_name: String,
    container_id: OnceCell<String>,
}

impl Correlator {
    pub fn new(engine: Arc<dyn ContainerEngine>, container_name: impl Into<String>) -> Self {
        Self {
            engine,
            container_name: container_name.into(),
            container_id: OnceCell::new(),
        }
    }

    async fn matches(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let id = self
            .container_id
            .get_or_try_init(|| async {
                self.engine
                    .inspect_container(&self.container_name)
                    .await
                    .map(|inspection| inspection.id)
            })
            .await;
        match id {
            Ok(id) => id.starts_with(host),
            Err(e) => {
                debug!(container = %self.container_name, error = %e, "Container id not available yet");
                false
            }
        }
    }
}

struct Shared {
    correlator: Correlator,
    summary: Mutex<LogSummary>,
}

impl Shared {
    async fn handle(&self, payload: &[u8]) {
        let event: LogEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                info!(container = %self.correlator.container_name, error = %e, "Dropping malformed log event");
                self.record_drop();
                return;
            }
        };

        if !self.correlator.matches(&event.host).await {
            info!(
                container = %self.correlator.container_name,
                host = %event.host,
                "Dropping log event from unexpected host"
            );
            self.record_drop();
            return;
        }

        emit(&self.correlator.container_name, &event);
        if let Ok(mut summary) = self.summary.lock() {
            summary.delivered += 1;
            if event.is_error() {
                summary.last_error = Some(event.short_message.clone());
            }
        }
    }

    fn record_drop(&self) {
        if let Ok(mut summary) = self.summary.lock() {
            summary.dropped += 1;
        }
    }

    fn snapshot(&self) -> LogSummary {
        self.summary
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

fn emit(container: &str, event: &LogEvent) {
    let message = event.short_message.as_str();
    match event.level {
        0..=3 => error!(target: "container", container = %container, "{}", message),
        4 => warn!(target: "container", container = %container, "{}", message),
        5 | 6 => info!(target: "container", container = %container, "{}", message),
        _ => debug!(target: "container", container = %container, "{}", message),
    }
}

/// Inflates gzip or zlib datagrams; anything else is returned as is.
fn decode_datagram(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match data {
        [0x1f, 0x8b, ..] => {
            GzDecoder::new(data).read_to_end(&mut out)?;
        }
        [first @ 0x78, second, ..] if ((u16::from(*first) << 8) | u16::from(*second)) % 31 == 0 => {
            ZlibDecoder::new(data).read_to_end(&mut out)?;
        }
        _ => out.extend_from_slice(data),
    }
    Ok(out)
}

/// A bound listener. The port is released when the listener is shut down
/// or dropped.
pub struct LogListener {
    port: u16,
    shared: Arc<Shared>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LogListener {
    /// Binds the first free port of `ports` and starts accepting events.
    pub async fn start(
        transport: LogTransport,
        ports: RangeInclusive<u16>,
        correlator: Correlator,
    ) -> Result<Self, DockerError> {
        let shared = Arc::new(Shared {
            correlator,
            summary: Mutex::new(LogSummary::default()),
        });

        for port in ports.clone() {
            let addr: SocketAddr = match format!("{}:{}", BIND_ADDR, port).parse() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let (stop, stopped) = oneshot::channel();
            let task = match transport {
                LogTransport::Udp => match UdpSocket::bind(addr).await {
                    Ok(socket) => tokio::spawn(serve_udp(socket, Arc::clone(&shared), stopped)),
                    Err(_) => continue,
                },
                LogTransport::Tcp => match TcpListener::bind(addr).await {
                    Ok(listener) => {
                        tokio::spawn(serve_tcp(listener, Arc::clone(&shared), stopped))
                    }
                    Err(_) => continue,
                },
            };
            info!(port, transport = ?transport, "Log listener bound");
            return Ok(Self {
                port,
                shared,
                stop: Some(stop),
                task: Some(task),
            });
        }

        Err(DockerError::RunFailed(format!(
            "No free log listener port in range {}-{}",
            ports.start(),
            ports.end()
        )))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn summary(&self) -> LogSummary {
        self.shared.snapshot()
    }

    /// Stops accepting events, releases the port and returns the summary.
    ///
    /// Events already queued on the socket are still processed, bounded by
    /// a short drain period.
    pub async fn shutdown(mut self) -> LogSummary {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(DRAIN_LIMIT + DRAIN_IDLE, &mut task)
                .await
                .is_err()
            {
                warn!(port = self.port, "Log listener did not drain in time");
                task.abort();
                let _ = task.await;
            }
        }
        debug!(port = self.port, "Log listener released");
        self.shared.snapshot()
    }
}

impl Drop for LogListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Time left for one drain step, or `None` once the deadline passed.
fn drain_step(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left.min(DRAIN_IDLE))
}

async fn handle_datagram(shared: &Shared, data: &[u8]) {
    match decode_datagram(data) {
        Ok(payload) => shared.handle(&payload).await,
        Err(e) => {
            info!(error = %e, "Dropping undecodable log datagram");
            shared.record_drop();
        }
    }
}

async fn serve_udp(
    socket: UdpSocket,
    shared: Arc<Shared>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => handle_datagram(&shared, &buf[..len]).await,
                Err(e) => warn!(error = %e, "Log listener receive failed"),
            },
            _ = &mut stopped => break,
        }
    }

    let deadline = Instant::now() + DRAIN_LIMIT;
    while let Some(idle) = drain_step(deadline) {
        match tokio::time::timeout(idle, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => handle_datagram(&shared, &buf[..len]).await,
            Ok(Err(e)) => warn!(error = %e, "Log listener receive failed"),
            Err(_) => break,
        }
    }
}

async fn serve_tcp(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_tcp_connection(stream, Arc::clone(&shared)));
                }
                Err(e) => warn!(error = %e, "Log listener accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut stopped => break,
        }
    }

    let deadline = Instant::now() + DRAIN_LIMIT;
    while let Some(idle) = drain_step(deadline) {
        match tokio::time::timeout(idle, listener.accept()).await {
            Ok(Ok((stream, _))) => {
                connections.spawn(serve_tcp_connection(stream, Arc::clone(&shared)));
            }
            Ok(Err(e)) => warn!(error = %e, "Log listener accept failed"),
            Err(_) => break,
        }
    }
    drop(listener);

    let finished = tokio::time::timeout_at(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        debug!(open = connections.len(), "Closing unfinished log connections");
        connections.abort_all();
    }
}

async fn serve_tcp_connection(stream: TcpStream, shared: Arc<Shared>) {
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    loop {
        frame.clear();
        match reader.read_until(0, &mut frame).await {
            Ok(0) => break,
            Ok(_) => {
                if frame.last() == Some(&0) {
                    frame.pop();
                }
                if !frame.is_empty() {
                    shared.handle(&frame).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Log connection read failed");
                break;
            }
        }
    }
}
