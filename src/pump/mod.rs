//! Per-container log pump.
//!
//! A pump owns one read loop per output stream of a container. Each loop
//! frames raw bytes into [`Message`]s and fans them out to every sink bound
//! to the pump, then records a checkpoint for the container.

pub mod framing;
pub mod pipe;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use futures_util::future;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::container::Container;
use crate::message::{Message, Source};
use crate::sinks::Sink;
use crate::storage::CheckpointStore;

pub use framing::Framing;
pub use pipe::{PipeReader, PipeWriter, pipe};

const LOG_TARGET: &str = "splunk_pump::pump";

/// Capacity of the channel between a pump and a sink. Kept at one so a pump
/// hands each message over directly; sinks do their own buffering.
const SINK_CHANNEL_CAPACITY: usize = 1;

struct SinkChannel {
    tx: mpsc::Sender<Arc<Message>>,
    task: JoinHandle<()>,
}

/// State shared between the pump handle and its read loops.
struct Fanout {
    container: Arc<Container>,
    store: Arc<CheckpointStore>,
    sinks: Mutex<HashMap<String, SinkChannel>>,
}

impl Fanout {
    /// Delivers `message` to every bound sink, in the caller's order, and
    /// schedules a checkpoint write for its timestamp.
    async fn send(&self, message: Message) {
        let message = Arc::new(message);
        {
            let sinks = self.sinks.lock().await;
            for (name, channel) in sinks.iter() {
                if channel.tx.send(Arc::clone(&message)).await.is_err() {
                    log::warn!(target: LOG_TARGET, "sink {name} for {} stopped accepting messages", self.container.id());
                }
            }
        }
        self.schedule_checkpoint(message.time.timestamp());
    }

    /// Best effort: the write happens off the fan-out path and failures are
    /// only logged.
    fn schedule_checkpoint(&self, ts: i64) {
        let store = Arc::clone(&self.store);
        let id = self.container.id().to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.put_last_log_ts(&id, ts) {
                log::error!(target: LOG_TARGET, "unable to store checkpoint for {id}: {e}");
            }
        });
    }
}

pub struct ContainerPump {
    fanout: Arc<Fanout>,
    closers: [PipeWriter; 2],
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ContainerPump {
    /// Starts the stdout and stderr read loops for `container`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<CheckpointStore>,
        container: Arc<Container>,
        stdout: PipeReader,
        stderr: PipeReader,
        framing: Framing,
    ) -> Self {
        let fanout = Arc::new(Fanout {
            container,
            store,
            sinks: Mutex::new(HashMap::new()),
        });
        let closers = [stdout.closer(), stderr.closer()];
        let loops = vec![
            tokio::spawn(read_loop(
                Arc::clone(&fanout),
                Source::Stdout,
                stdout,
                framing,
            )),
            tokio::spawn(read_loop(
                Arc::clone(&fanout),
                Source::Stderr,
                stderr,
                framing,
            )),
        ];
        Self {
            fanout,
            closers,
            loops: std::sync::Mutex::new(loops),
        }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.fanout.container
    }

    /// Binds `sinks` to this pump, one channel each. A sink whose identity is
    /// already bound is skipped. Returns how many sinks were added.
    ///
    /// Sinks are expected to be added before the container produces output.
    pub async fn add_sinks(&self, sinks: impl IntoIterator<Item = Arc<dyn Sink>>) -> usize {
        let mut bound = self.fanout.sinks.lock().await;
        let mut added = 0;
        for sink in sinks {
            let name = sink.to_string();
            if bound.contains_key(&name) {
                log::warn!(target: LOG_TARGET, "sink {name} already bound to {}, skipping", self.fanout.container.id());
                continue;
            }
            let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
            let task = tokio::spawn(sink.stream(rx));
            bound.insert(name, SinkChannel { tx, task });
            added += 1;
        }
        added
    }

    #[cfg(test)]
    pub async fn sink_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fanout.sinks.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes both streams, waits for the read loops to finish, then closes
    /// every sink channel and waits for all sinks to wind down together.
    ///
    /// Call once per pump.
    pub async fn close(&self) {
        for closer in &self.closers {
            closer.close().await;
        }

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in loops {
            if let Err(e) = handle.await {
                log::error!(target: LOG_TARGET, "read loop for {} panicked: {e}", self.fanout.container.id());
            }
        }

        let channels: Vec<(String, SinkChannel)> =
            self.fanout.sinks.lock().await.drain().collect();
        let (names, tasks): (Vec<String>, Vec<JoinHandle<()>>) = channels
            .into_iter()
            .map(|(name, SinkChannel { tx, task })| {
                drop(tx);
                (name, task)
            })
            .unzip();
        for (name, result) in names.iter().zip(future::join_all(tasks).await) {
            if let Err(e) = result {
                log::error!(target: LOG_TARGET, "sink {name} panicked: {e}");
            }
        }

        log::info!(target: LOG_TARGET, "closed container pump for container {}", self.fanout.container.id());
    }
}

async fn read_loop<R>(fanout: Arc<Fanout>, source: Source, input: R, framing: Framing)
where
    R: AsyncRead + Unpin,
{
    let id = fanout.container.id().to_string();
    log::info!(target: LOG_TARGET, "start container pump for source {source}[{id}]");

    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                match framing::frame_line(&line, framing) {
                    Ok((time, data)) => {
                        let message =
                            Message::new(Arc::clone(&fanout.container), source, data, time);
                        fanout.send(message).await;
                    }
                    Err(e) => {
                        log::error!(target: LOG_TARGET, "{source}[{id}]: {e}");
                        break;
                    }
                }
            }
            Err(e) => {
                log::error!(target: LOG_TARGET, "read {source}[{id}]: {e}");
                break;
            }
        }
    }

    log::info!(target: LOG_TARGET, "stopped container pump for source {source}[{id}]");
}
