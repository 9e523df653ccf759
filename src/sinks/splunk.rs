//! Splunk TCP sink.
//!
//! Messages are accepted into a bounded queue without ever blocking the
//! pump; when the queue is full the message is dropped. A separate delivery
//! task drains the queue and writes one JSON event per line to a persistent
//! TCP connection, reconnecting at a fixed interval when a write fails.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Sink, SinkError};
use crate::message::Message;

const LOG_TARGET: &str = "splunk_pump::sink";
const EVENT_SOURCE: &str = "splunk-pump";

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SplunkConfig {
    /// Target address (host:port)
    pub destination: String,
    /// Messages held between the pump and the connection
    pub queue_capacity: usize,
    /// Wait between reconnect attempts
    pub reconnect_interval: Duration,
    pub connection_timeout: Duration,
    /// How long a closing sink keeps delivering what is already queued
    pub drain_timeout: Duration,
}

impl SplunkConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connection_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    #[cfg(test)]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub queued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
    pub reconnects: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct SplunkEvent<'a> {
    event: EventBody<'a>,
    time: String,
    host: &'a str,
    source: &'static str,
}

#[derive(Serialize)]
struct EventBody<'a> {
    line: &'a str,
    source: &'a str,
    attrs: EventAttrs<'a>,
}

#[derive(Serialize)]
struct EventAttrs<'a> {
    #[serde(rename = "ContainerName")]
    container_name: &'a str,
    #[serde(rename = "ContainerID")]
    container_id: &'a str,
}

/// Serializes `message` as a newline-terminated JSON event.
fn encode(message: &Message, host_name: &str) -> Result<Vec<u8>, serde_json::Error> {
    let event = SplunkEvent {
        event: EventBody {
            line: &message.data,
            source: message.source.as_ref(),
            attrs: EventAttrs {
                container_name: message.container.name(),
                container_id: message.container.id(),
            },
        },
        time: format!(
            "{}.{:06}",
            message.time.timestamp(),
            message.time.timestamp_subsec_micros()
        ),
        host: host_name,
        source: EVENT_SOURCE,
    };
    let mut buf = serde_json::to_vec(&event)?;
    buf.push(b'\n');
    Ok(buf)
}

pub struct SplunkSink {
    config: SplunkConfig,
    queue: Mutex<Option<Sender<Arc<Message>>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    /// Cancelled once input has ended; a writer without a connection gives up.
    draining: CancellationToken,
    stats: Arc<SinkStats>,
}

impl SplunkSink {
    /// Resolves the destination, opens the first connection and starts the
    /// delivery task.
    pub async fn connect(config: SplunkConfig) -> Result<Arc<Self>, SinkError> {
        if config.destination.is_empty() {
            return Err(SinkError::MissingDestination);
        }
        let address = resolve(&config.destination).await?;
        let host_name = nix::unistd::gethostname()
            .map_err(std::io::Error::from)?
            .to_string_lossy()
            .into_owned();
        let connection = open_connection(address, config.connection_timeout)
            .await
            .map_err(|source| SinkError::Connect {
                destination: config.destination.clone(),
                source,
            })?;
        log::info!(target: LOG_TARGET, "connected to {} ({address})", config.destination);

        let (sink, queue) = Self::assemble(config);
        let writer = Writer {
            destination: sink.config.destination.clone(),
            address,
            host_name,
            connection: Some(connection),
            reconnect_interval: sink.config.reconnect_interval,
            connection_timeout: sink.config.connection_timeout,
            shutdown: sink.shutdown.clone(),
            draining: sink.draining.clone(),
            stats: Arc::clone(&sink.stats),
        };
        let handle = tokio::spawn(writer.run(queue));
        *sink.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(Arc::new(sink))
    }

    /// Builds the sink and hands back the receiving end of its queue without
    /// starting delivery.
    fn assemble(config: SplunkConfig) -> (Self, Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let sink = Self {
            config,
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(None),
            draining: shutdown.child_token(),
            shutdown,
            stats: Arc::new(SinkStats::default()),
        };
        (sink, rx)
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops delivery: abandons any reconnect in progress and drops the
    /// connection. Queued messages that were not written are lost.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn offer(&self, queue: &Sender<Arc<Message>>, message: Arc<Message>) {
        match queue.try_send(message) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(message)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    target: LOG_TARGET,
                    "queue for {} is full, dropping {} line from {}",
                    self.config.destination,
                    message.source,
                    message.container.id()
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(target: LOG_TARGET, "delivery to {} has stopped, dropping line", self.config.destination);
            }
        }
    }
}

impl std::fmt::Display for SplunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "splunk://{}", self.config.destination)
    }
}

#[async_trait]
impl Sink for SplunkSink {
    async fn stream(self: Arc<Self>, mut messages: Receiver<Arc<Message>>) {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(queue) = queue else {
            log::warn!(target: LOG_TARGET, "{} is closed, not streaming", self);
            return;
        };

        while let Some(message) = messages.recv().await {
            self.offer(&queue, message);
        }

        // Let the delivery task work through what is already queued, as long
        // as it still has a connection to write to.
        drop(queue);
        self.draining.cancel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(self.config.drain_timeout, &mut writer)
                .await
                .is_err()
            {
                log::warn!(target: LOG_TARGET, "{} did not drain within {:?}", self, self.config.drain_timeout);
                self.close();
                let _ = writer.await;
            }
        }
        self.close();

        let stats = self.stats();
        log::info!(
            target: LOG_TARGET,
            "{} closed: queued={} sent={} dropped={} failed={} reconnects={}",
            self,
            stats.queued,
            stats.sent,
            stats.dropped,
            stats.failed,
            stats.reconnects
        );
    }
}

/// Owns the connection and drains the queue.
struct Writer {
    destination: String,
    address: SocketAddr,
    host_name: String,
    connection: Option<TcpStream>,
    reconnect_interval: Duration,
    connection_timeout: Duration,
    shutdown: CancellationToken,
    draining: CancellationToken,
    stats: Arc<SinkStats>,
}

impl Writer {
    async fn run(mut self, mut queue: Receiver<Arc<Message>>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let payload = match encode(&message, &self.host_name) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!(target: LOG_TARGET, "unable to encode line for {}: {e}", self.destination);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self.write(&payload).await {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::error!(target: LOG_TARGET, "failed to write to {}: {e}", self.destination);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        if let Some(mut connection) = self.connection.take() {
            let _ = connection.shutdown().await;
        }
        log::debug!(target: LOG_TARGET, "delivery to {} stopped", self.destination);
    }

    async fn write(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let connection = self.connection.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no connection")
        })?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "sink closed",
            )),
            result = connection.write_all(payload) => result,
        }
    }

    /// Replaces the connection, retrying every `reconnect_interval` until it
    /// succeeds. Returns false if the sink was closed or its input ended
    /// first.
    async fn reconnect(&mut self) -> bool {
        self.connection = None;
        loop {
            if self.draining.is_cancelled() {
                return false;
            }
            let attempt = tokio::select! {
                _ = self.draining.cancelled() => return false,
                attempt = open_connection(self.address, self.connection_timeout) => attempt,
            };
            match attempt {
                Ok(connection) => {
                    self.connection = Some(connection);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::info!(target: LOG_TARGET, "reconnected to {}", self.destination);
                    return true;
                }
                Err(e) => {
                    log::error!(target: LOG_TARGET, "reconnect to {} failed: {e}", self.destination);
                }
            }
            tokio::select! {
                _ = self.draining.cancelled() => return false,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }
}

async fn resolve(destination: &str) -> Result<SocketAddr, SinkError> {
    let mut addresses =
        tokio::net::lookup_host(destination)
            .await
            .map_err(|source| SinkError::Resolve {
                destination: destination.to_string(),
                source,
            })?;
    addresses.next().ok_or_else(|| SinkError::NoAddress {
        destination: destination.to_string(),
    })
}

async fn open_connection(address: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"))??;

    if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
        log::debug!(target: LOG_TARGET, "unable to enable keep-alive for {address}: {e}");
    }
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!(target: LOG_TARGET, "unable to set TCP_NODELAY for {address}: {e}");
    }
    Ok(stream)
}

/// Factory suitable for registration with the orchestrator.
pub fn factory(template: SplunkConfig) -> super::SinkFactory {
    Arc::new(move |destination: String| -> super::SinkFuture {
        let config = SplunkConfig {
            destination,
            ..template.clone()
        };
        Box::pin(async move {
            let sink: Arc<dyn Sink> = SplunkSink::connect(config).await?;
            Ok(sink)
        })
    })
}
