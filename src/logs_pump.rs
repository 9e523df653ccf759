//! Keeps one [`ContainerPump`] per running container and feeds it from the
//! runtime's log streams.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::{StreamExt, future};
use tokio::sync::{Mutex, mpsc};

use crate::container::Container;
use crate::pump::{ContainerPump, Framing, PipeWriter, pipe};
use crate::runtime::{ContainerRuntime, EventStatus, LogChunk, LogsRequest, RuntimeError};
use crate::sinks::{Sink, SinkError, SinkFactory};
use crate::storage::{CheckpointStore, StoreError};

const LOG_TARGET: &str = "splunk_pump::pump";

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),
    #[error("Unable to create sink for {destination} after {attempts} attempts: {source}")]
    SinkUnavailable {
        destination: String,
        attempts: u32,
        source: SinkError,
    },
    #[error("Container event stream closed")]
    EventStreamClosed,
    #[error("Shutting down")]
    ShuttingDown,
}

/// How hard to try when a sink factory fails. Attempt `n` waits `n * step`
/// before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            step: Duration::from_secs(1),
        }
    }
}

/// Where a newly pumped container starts reading its log history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// From the stored checkpoint, or no backlog at all.
    StoredOnly,
    /// From the stored checkpoint, or the store's lookback window.
    Lookback,
}

struct Registration {
    destination: String,
    factory: SinkFactory,
}

pub struct EnsuredPump {
    pub pump: Arc<ContainerPump>,
    /// Write ends of the pump's stdout and stderr, only for a newly created
    /// pump.
    pub feed: Option<[PipeWriter; 2]>,
}

#[derive(Default)]
struct PumpTable {
    pumps: HashMap<String, Arc<ContainerPump>>,
    /// Containers to pump again once their current pump retires.
    restarts: HashSet<String>,
    closed: bool,
}

pub struct LogsPump<R> {
    runtime: Arc<R>,
    store: Arc<CheckpointStore>,
    table: Mutex<PumpTable>,
    registrations: RwLock<Vec<Registration>>,
    retry: RetryPolicy,
}

impl<R: ContainerRuntime> LogsPump<R> {
    pub fn new(runtime: Arc<R>, store: Arc<CheckpointStore>) -> Self {
        Self {
            runtime,
            store,
            table: Mutex::new(PumpTable::default()),
            registrations: RwLock::new(Vec::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Registers `factory` for `destination`. Every pump created afterwards
    /// gets one sink from it; existing pumps are left alone. Registering the
    /// same destination again replaces its factory.
    pub fn register_sink(&self, factory: SinkFactory, destination: impl Into<String>) {
        let destination = destination.into();
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match registrations
            .iter_mut()
            .find(|r| r.destination == destination)
        {
            Some(existing) => existing.factory = factory,
            None => registrations.push(Registration {
                destination: destination.clone(),
                factory,
            }),
        }
        log::info!(target: LOG_TARGET, "registered sink for {destination}");
    }

    #[cfg(test)]
    pub async fn pump(&self, id: &str) -> Option<Arc<ContainerPump>> {
        self.table.lock().await.pumps.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn pump_count(&self) -> usize {
        self.table.lock().await.pumps.len()
    }

    /// Returns the pump for `container`, creating it and its sinks if none
    /// exists yet. Concurrent calls for one container create one pump; only
    /// the call that created it gets the feed.
    pub async fn ensure_container_pump(
        &self,
        container: Arc<Container>,
    ) -> Result<EnsuredPump, PumpError> {
        let mut table = self.table.lock().await;
        if table.closed {
            return Err(PumpError::ShuttingDown);
        }
        if let Some(pump) = table.pumps.get(container.id()) {
            return Ok(EnsuredPump {
                pump: Arc::clone(pump),
                feed: None,
            });
        }

        let sinks = self.create_sinks().await?;

        let (stdout_writer, stdout_reader) = pipe();
        let (stderr_writer, stderr_reader) = pipe();
        let pump = Arc::new(ContainerPump::new(
            Arc::clone(&self.store),
            Arc::clone(&container),
            stdout_reader,
            stderr_reader,
            Framing::Timestamped,
        ));
        pump.add_sinks(sinks).await;
        table
            .pumps
            .insert(container.id().to_string(), Arc::clone(&pump));
        log::info!(target: LOG_TARGET, "created container pump for {container}");

        Ok(EnsuredPump {
            pump,
            feed: Some([stdout_writer, stderr_writer]),
        })
    }

    async fn create_sinks(&self) -> Result<Vec<Arc<dyn Sink>>, PumpError> {
        let registrations: Vec<(String, SinkFactory)> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (r.destination.clone(), Arc::clone(&r.factory)))
            .collect();

        let mut sinks = Vec::with_capacity(registrations.len());
        for (destination, factory) in registrations {
            match self.create_sink(&destination, &factory).await {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    release(sinks);
                    return Err(e);
                }
            }
        }
        Ok(sinks)
    }

    async fn create_sink(
        &self,
        destination: &str,
        factory: &SinkFactory,
    ) -> Result<Arc<dyn Sink>, PumpError> {
        let mut attempt = 1;
        loop {
            match factory(destination.to_string()).await {
                Ok(sink) => return Ok(sink),
                Err(e) if attempt < self.retry.attempts => {
                    log::warn!(
                        target: LOG_TARGET,
                        "unable to create sink for {destination} (attempt {attempt}/{}): {e}",
                        self.retry.attempts
                    );
                    tokio::time::sleep(self.retry.step * attempt).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PumpError::SinkUnavailable {
                        destination: destination.to_string(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Removes and closes the pump for `id`. Unknown ids are ignored.
    pub async fn remove_container_pump(&self, id: &str) {
        let pump = {
            let mut table = self.table.lock().await;
            table.restarts.remove(id);
            table.pumps.remove(id)
        };
        if let Some(pump) = pump {
            pump.close().await;
        }
    }

    /// Like [`Self::remove_container_pump`], but leaves a newer pump
    /// registered under the same id untouched. Returns whether the container
    /// asked to be pumped again in the meantime.
    async fn remove_pump_instance(&self, id: &str, pump: &Arc<ContainerPump>) -> bool {
        let restart = {
            let mut table = self.table.lock().await;
            if !table
                .pumps
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, pump))
            {
                return false;
            }
            table.pumps.remove(id);
            table.restarts.remove(id)
        };
        pump.close().await;
        restart
    }

    /// Marks `id` to be pumped again when `pump` retires. Returns false if
    /// `pump` has already retired.
    async fn pump_again_after(&self, id: &str, pump: &Arc<ContainerPump>) -> bool {
        let mut table = self.table.lock().await;
        if table
            .pumps
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, pump))
        {
            table.restarts.insert(id.to_string());
            true
        } else {
            false
        }
    }

    /// Pumps every running container, calls `started`, then follows lifecycle
    /// events until the runtime closes the event stream.
    pub async fn run(self: Arc<Self>, started: impl FnOnce() + Send) -> Result<(), PumpError> {
        self.start().await?;
        started();
        self.watch().await
    }

    /// Starts pumping the containers that are already running. Those with a
    /// checkpoint resume from it; the rest skip their backlog.
    pub async fn start(self: &Arc<Self>) -> Result<(), PumpError> {
        let ids = self.runtime.list_running().await?;
        log::info!(target: LOG_TARGET, "found {} running containers", ids.len());
        for id in ids {
            Arc::clone(self).pump_logs(id, Resume::StoredOnly).await;
        }
        Ok(())
    }

    /// Follows container lifecycle events. Only returns with an error, once
    /// the event stream is gone.
    pub async fn watch(self: &Arc<Self>) -> Result<(), PumpError> {
        let mut events = self.runtime.events();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    log::debug!(target: LOG_TARGET, "event: {} {}", event.id, event.status.as_ref());
                    if matches!(event.status, EventStatus::Start | EventStatus::Restart) {
                        tokio::spawn(Arc::clone(self).pump_logs(event.id, Resume::Lookback));
                    }
                }
                Err(e) => log::error!(target: LOG_TARGET, "container event error: {e}"),
            }
        }
        Err(PumpError::EventStreamClosed)
    }

    /// Boxed so the feed it spawns can in turn spawn it again.
    fn pump_logs(self: Arc<Self>, id: String, resume: Resume) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let container = match self.runtime.inspect(&id).await {
                Ok(container) => Arc::new(container),
                Err(e) => {
                    log::error!(target: LOG_TARGET, "unable to inspect container {id}: {e}");
                    return;
                }
            };
            if !container.can_pump() {
                return;
            }

            let request = match self.resume_request(&container, resume) {
                Ok(request) => request,
                Err(e) => {
                    log::error!(target: LOG_TARGET, "unable to read checkpoint for {container}: {e}");
                    return;
                }
            };

            loop {
                let ensured = match self.ensure_container_pump(Arc::clone(&container)).await {
                    Ok(ensured) => ensured,
                    Err(e) => {
                        log::error!(target: LOG_TARGET, "unable to pump {container}: {e}");
                        return;
                    }
                };
                if let Some(writers) = ensured.feed {
                    log::info!(target: LOG_TARGET, "pumping {container} since {:?}", request.since);
                    tokio::spawn(self.feed(ensured.pump, writers, request));
                    return;
                }
                if resume == Resume::StoredOnly {
                    log::debug!(target: LOG_TARGET, "already pumping {container}");
                    return;
                }
                // A start event can overtake the end of the previous log stream.
                if self.pump_again_after(container.id(), &ensured.pump).await {
                    log::debug!(target: LOG_TARGET, "{container} will be pumped again when its current pump retires");
                    return;
                }
            }
        })
    }

    fn resume_request(&self, container: &Container, resume: Resume) -> Result<LogsRequest, StoreError> {
        let since = match resume {
            Resume::StoredOnly => self.store.checkpoint(container.id())?,
            Resume::Lookback => Some(self.store.get_last_log_ts(container.id())?),
        };
        Ok(LogsRequest::follow_since(since))
    }

    /// Copies the container's log stream into the pump until either side
    /// gives up, then retires the pump.
    async fn feed(self: Arc<Self>, pump: Arc<ContainerPump>, writers: [PipeWriter; 2], request: LogsRequest) {
        let container = Arc::clone(pump.container());
        let [stdout, stderr] = writers;
        let mut logs = self.runtime.logs(container.full_id(), request);

        let reason = loop {
            let written = match logs.next().await {
                Some(Ok(LogChunk::Stdout(bytes))) => stdout.write_all(&bytes).await,
                Some(Ok(LogChunk::Stderr(bytes))) => stderr.write_all(&bytes).await,
                Some(Err(e)) => break e.to_string(),
                None => break "log stream ended".to_string(),
            };
            if let Err(e) = written {
                break format!("pump stopped reading: {e}");
            }
        };
        log::debug!(target: LOG_TARGET, "stopped feeding {container}: {reason}");

        stdout.close().await;
        stderr.close().await;
        if self.remove_pump_instance(container.id(), &pump).await {
            let id = container.full_id().to_string();
            tokio::spawn(Arc::clone(&self).pump_logs(id, Resume::Lookback));
        }
    }

    /// Closes every pump concurrently, then the checkpoint store. No pump is
    /// created afterwards.
    pub async fn shutdown(&self) -> Result<(), PumpError> {
        let ids: Vec<String> = {
            let mut table = self.table.lock().await;
            table.closed = true;
            table.pumps.keys().cloned().collect()
        };
        future::join_all(ids.iter().map(|id| self.remove_container_pump(id))).await;
        self.store.close()?;
        Ok(())
    }
}

/// Lets sinks that never got bound to a pump wind down.
fn release(sinks: Vec<Arc<dyn Sink>>) {
    for sink in sinks {
        let (_, rx) = mpsc::channel(1);
        tokio::spawn(sink.stream(rx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::testing::CollectSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::{self, BoxStream};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    type EventItem = Result<crate::runtime::LifecycleEvent, RuntimeError>;
    type LogItem = Result<LogChunk, RuntimeError>;

    #[derive(Default)]
    struct FakeRuntime {
        running: Vec<String>,
        containers: HashMap<String, Container>,
        events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<EventItem>>>,
        logs: std::sync::Mutex<HashMap<String, VecDeque<mpsc::UnboundedReceiver<LogItem>>>>,
        requests: std::sync::Mutex<Vec<(String, LogsRequest)>>,
    }

    impl FakeRuntime {
        fn with_container(mut self, id: &str, env: &[&str], tty: bool, running: bool) -> Self {
            let env = env.iter().map(|e| e.to_string()).collect();
            self.containers
                .insert(id.to_string(), Container::new(id, format!("/{id}"), env, tty));
            if running {
                self.running.push(id.to_string());
            }
            self
        }

        fn event_sender(&self) -> mpsc::UnboundedSender<EventItem> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(rx);
            tx
        }

        fn log_sender(&self, id: &str) -> mpsc::UnboundedSender<LogItem> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.logs
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .push_back(rx);
            tx
        }

        fn requests(&self) -> Vec<(String, LogsRequest)> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn receiver_stream<T: Send + 'static>(
        rx: mpsc::UnboundedReceiver<T>,
    ) -> BoxStream<'static, T> {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(self.running.clone())
        }

        fn events(&self) -> BoxStream<'static, EventItem> {
            match self.events.lock().unwrap().take() {
                Some(rx) => receiver_stream(rx),
                None => stream::empty().boxed(),
            }
        }

        async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
            self.containers
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::Container(crate::container::ContainerError::MissingId))
        }

        fn logs(&self, id: &str, request: LogsRequest) -> BoxStream<'static, LogItem> {
            self.requests.lock().unwrap().push((id.to_string(), request));
            match self
                .logs
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(|queue| queue.pop_front())
            {
                Some(rx) => receiver_stream(rx),
                None => stream::pending().boxed(),
            }
        }
    }

    /// A factory handing out fresh [`CollectSink`]s and remembering them.
    #[derive(Clone, Default)]
    struct Collector {
        sinks: Arc<std::sync::Mutex<Vec<Arc<CollectSink>>>>,
        calls: Arc<AtomicU32>,
        linger: Duration,
    }

    impl Collector {
        /// Sinks from this collector take `linger` to close.
        fn lingering(linger: Duration) -> Self {
            Self {
                linger,
                ..Self::default()
            }
        }

        /// The first `failures` calls fail.
        fn factory(&self, failures: u32) -> SinkFactory {
            let collector = self.clone();
            Arc::new(move |destination: String| -> crate::sinks::SinkFuture {
                let collector = collector.clone();
                Box::pin(async move {
                    let call = collector.calls.fetch_add(1, Ordering::SeqCst);
                    if call < failures {
                        return Err(SinkError::MissingDestination);
                    }
                    let sink = CollectSink::lingering(&destination, collector.linger);
                    collector.sinks.lock().unwrap().push(Arc::clone(&sink));
                    Ok(sink as Arc<dyn Sink>)
                })
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn sinks(&self) -> Vec<Arc<CollectSink>> {
            self.sinks.lock().unwrap().clone()
        }
    }

    fn logs_pump(runtime: FakeRuntime) -> Arc<LogsPump<FakeRuntime>> {
        let store = CheckpointStore::open_temporary().expect("open store");
        Arc::new(LogsPump::new(Arc::new(runtime), Arc::new(store)))
    }

    fn container(id: &str) -> Arc<Container> {
        Arc::new(Container::new(id, id, Vec::new(), false))
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: AsyncFnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition().await {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    const LINE: &[u8] = b"2021-06-15T12:30:45.123456789Z hello\n";

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");

        let first = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;
        let second = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(collector.calls(), 1);
        assert_eq!(pumps.pump_count().await, 1);
        assert_eq!(first.sink_names().await, vec!["splunk:9997".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_one_pump() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");

        let (a, b) = tokio::join!(
            pumps.ensure_container_pump(container("c1")),
            pumps.ensure_container_pump(container("c1"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a.pump, &b.pump));
        assert!(a.feed.is_some() != b.feed.is_some());
        assert_eq!(collector.calls(), 1);
    }

    #[tokio::test]
    async fn test_one_sink_per_registration() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "a:1");
        pumps.register_sink(collector.factory(0), "b:2");

        let pump = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;
        assert_eq!(pump.sink_names().await, vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[tokio::test]
    async fn test_registering_a_destination_again_replaces_it() {
        let pumps = logs_pump(FakeRuntime::default());
        let old = Collector::default();
        let new = Collector::default();
        pumps.register_sink(old.factory(0), "a:1");
        pumps.register_sink(new.factory(0), "a:1");

        pumps.ensure_container_pump(container("c1")).await.unwrap();
        assert_eq!(old.calls(), 0);
        assert_eq!(new.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_creation_is_retried_with_backoff() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(2), "splunk:9997");

        let started = tokio::time::Instant::now();
        let pump = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;

        assert_eq!(collector.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(pump.sink_names().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_fails_once_retries_are_exhausted() {
        let store = CheckpointStore::open_temporary().unwrap();
        let pumps = LogsPump::new(Arc::new(FakeRuntime::default()), Arc::new(store)).with_retry(
            RetryPolicy {
                attempts: 3,
                step: Duration::from_secs(1),
            },
        );
        let healthy = Collector::default();
        let broken = Collector::default();
        pumps.register_sink(healthy.factory(0), "a:1");
        pumps.register_sink(broken.factory(u32::MAX), "b:2");

        let err = pumps
            .ensure_container_pump(container("c1"))
            .await
            .err()
            .expect("sink creation should fail");

        assert!(matches!(
            err,
            PumpError::SinkUnavailable { ref destination, attempts: 3, .. } if destination == "b:2"
        ));
        assert_eq!(broken.calls(), 3);
        assert_eq!(pumps.pump_count().await, 0);

        // The sink that was created is released rather than leaked.
        let sink = &healthy.sinks()[0];
        wait_until(async || sink.is_closed()).await;
    }

    #[tokio::test]
    async fn test_remove_closes_pump() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");
        pumps.ensure_container_pump(container("c1")).await.unwrap();

        pumps.remove_container_pump("c1").await;
        pumps.remove_container_pump("unknown").await;

        assert_eq!(pumps.pump_count().await, 0);
        assert!(collector.sinks()[0].is_closed());
    }

    #[tokio::test]
    async fn test_running_containers_are_pumped() {
        let runtime = FakeRuntime::default()
            .with_container("c1", &[], false, true)
            .with_container("tty", &[], true, true)
            .with_container("quiet", &["SPLUNKPUMP=ignore"], false, true);
        let logs = runtime.log_sender("c1");
        let pumps = logs_pump(runtime);
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");

        pumps.start().await.unwrap();
        assert_eq!(pumps.pump_count().await, 1);
        assert!(pumps.pump("c1").await.is_some());

        logs.send(Ok(LogChunk::Stdout(Bytes::from_static(LINE)))).unwrap();
        let received = collector.sinks()[0].wait_for(1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data, "hello");
        assert_eq!(received[0].container.name(), "c1");
    }

    #[tokio::test]
    async fn test_startup_resumes_only_from_checkpoints() {
        let runtime = FakeRuntime::default()
            .with_container("fresh", &[], false, true)
            .with_container("known", &[], false, true);
        let pumps = logs_pump(runtime);
        pumps.store().put_last_log_ts("known", 1_600_000_000).unwrap();

        pumps.start().await.unwrap();
        wait_until(async || pumps.runtime.requests().len() == 2).await;

        let mut requests = pumps.runtime.requests();
        requests.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            requests,
            vec![
                ("fresh".to_string(), LogsRequest::follow_since(None)),
                ("known".to_string(), LogsRequest::follow_since(Some(1_600_000_000))),
            ]
        );
    }

    #[tokio::test]
    async fn test_started_containers_resume_from_lookback() {
        let runtime = FakeRuntime::default().with_container("c1", &[], false, false);
        let events = runtime.event_sender();
        let pumps = logs_pump(runtime);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let run = tokio::spawn(Arc::clone(&pumps).run(move || {
            let _ = started_tx.send(());
        }));
        started_rx.await.expect("run reports startup");
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Start)))
            .unwrap();
        wait_until(async || !pumps.runtime.requests().is_empty()).await;

        let requests = pumps.runtime.requests();
        assert_eq!(requests.len(), 1);
        let since = requests[0].1.since.expect("lookback");
        let expected = (chrono::Utc::now() - chrono::Duration::hours(24)).timestamp();
        assert!((since - expected).abs() <= 5);

        drop(events);
        assert!(matches!(run.await.unwrap(), Err(PumpError::EventStreamClosed)));
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let runtime = FakeRuntime::default().with_container("c1", &[], false, false);
        let events = runtime.event_sender();
        let pumps = logs_pump(runtime);

        let run = tokio::spawn(Arc::clone(&pumps).run(|| ()));
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Die)))
            .unwrap();
        events
            .send(Ok(crate::runtime::LifecycleEvent::new(
                "c1",
                EventStatus::Other("pause".to_string()),
            )))
            .unwrap();
        drop(events);

        assert!(matches!(run.await.unwrap(), Err(PumpError::EventStreamClosed)));
        assert_eq!(pumps.pump_count().await, 0);
    }

    #[tokio::test]
    async fn test_ended_feed_retires_pump() {
        let runtime = FakeRuntime::default().with_container("c1", &[], false, false);
        let events = runtime.event_sender();
        let first = runtime.log_sender("c1");
        let second = runtime.log_sender("c1");
        let pumps = logs_pump(runtime);
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");

        tokio::spawn(Arc::clone(&pumps).run(|| ()));
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Start)))
            .unwrap();
        wait_until(async || pumps.pump_count().await == 1).await;

        first.send(Ok(LogChunk::Stdout(Bytes::from_static(LINE)))).unwrap();
        drop(first);
        wait_until(async || pumps.pump_count().await == 0).await;
        let sinks = collector.sinks();
        assert_eq!(sinks[0].received().len(), 1);
        assert!(sinks[0].is_closed());

        // A restart builds a fresh pump with fresh sinks.
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Restart)))
            .unwrap();
        wait_until(async || pumps.pump_count().await == 1).await;
        second.send(Ok(LogChunk::Stderr(Bytes::from_static(LINE)))).unwrap();
        let received = collector.sinks()[1].wait_for(1).await;
        assert_eq!(received[0].source, crate::message::Source::Stderr);
    }

    #[tokio::test]
    async fn test_malformed_output_retires_pump() {
        let runtime = FakeRuntime::default().with_container("c1", &[], false, true);
        let logs = runtime.log_sender("c1");
        let pumps = logs_pump(runtime);

        pumps.start().await.unwrap();
        logs.send(Ok(LogChunk::Stdout(Bytes::from_static(b"no timestamp here\n"))))
            .unwrap();

        // The stdout loop is gone, so the next stdout write fails.
        wait_until(async || {
            let _ = logs.send(Ok(LogChunk::Stdout(Bytes::from_static(LINE))));
            pumps.pump_count().await == 0
        })
        .await;
    }

    #[tokio::test]
    async fn test_stale_feed_leaves_new_pump_alone() {
        let pumps = logs_pump(FakeRuntime::default());
        let old = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;
        pumps.remove_container_pump("c1").await;
        let new = pumps.ensure_container_pump(container("c1")).await.unwrap().pump;

        assert!(!pumps.remove_pump_instance("c1", &old).await);

        let current = pumps.pump("c1").await.expect("pump");
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");
        pumps.ensure_container_pump(container("c1")).await.unwrap();
        pumps.ensure_container_pump(container("c2")).await.unwrap();

        pumps.shutdown().await.unwrap();

        assert_eq!(pumps.pump_count().await, 0);
        assert!(collector.sinks().iter().all(|sink| sink.is_closed()));
        assert!(matches!(
            pumps.store().put_last_log_ts("c1", 1),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            pumps.ensure_container_pump(container("c3")).await,
            Err(PumpError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_pumps_concurrently() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::lingering(Duration::from_secs(2));
        pumps.register_sink(collector.factory(0), "splunk:9997");
        for id in ["c1", "c2", "c3", "c4"] {
            pumps.ensure_container_pump(container(id)).await.unwrap();
        }

        let started = tokio::time::Instant::now();
        pumps.shutdown().await.unwrap();

        // One sink's close time, not one per pump.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(collector.sinks().len(), 4);
        assert!(collector.sinks().iter().all(|sink| sink.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_pump_does_not_block_others() {
        let pumps = logs_pump(FakeRuntime::default());
        let collector = Collector::lingering(Duration::from_secs(10));
        pumps.register_sink(collector.factory(0), "splunk:9997");
        pumps.ensure_container_pump(container("c1")).await.unwrap();

        let removing = tokio::spawn({
            let pumps = Arc::clone(&pumps);
            async move { pumps.remove_container_pump("c1").await }
        });
        wait_until(async || pumps.pump_count().await == 0).await;

        let started = tokio::time::Instant::now();
        pumps.ensure_container_pump(container("c2")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!collector.sinks()[0].is_closed());

        removing.await.unwrap();
        assert!(collector.sinks()[0].is_closed());
    }

    #[tokio::test]
    async fn test_start_before_old_stream_ends_pumps_again() {
        let runtime = FakeRuntime::default().with_container("c1", &[], false, false);
        let events = runtime.event_sender();
        let first = runtime.log_sender("c1");
        let second = runtime.log_sender("c1");
        let pumps = logs_pump(runtime);
        let collector = Collector::default();
        pumps.register_sink(collector.factory(0), "splunk:9997");

        tokio::spawn(Arc::clone(&pumps).run(|| ()));
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Start)))
            .unwrap();
        wait_until(async || pumps.runtime.requests().len() == 1).await;
        let old = pumps.pump("c1").await.expect("pump");

        // The restart arrives while the old log stream is still open.
        events
            .send(Ok(crate::runtime::LifecycleEvent::new("c1", EventStatus::Restart)))
            .unwrap();
        wait_until(async || pumps.table.lock().await.restarts.contains("c1")).await;
        assert_eq!(pumps.runtime.requests().len(), 1);

        drop(first);
        wait_until(async || pumps.runtime.requests().len() == 2).await;
        wait_until(async || {
            pumps
                .pump("c1")
                .await
                .is_some_and(|current| !Arc::ptr_eq(&current, &old))
        })
        .await;
        assert!(pumps.runtime.requests()[1].1.since.is_some());

        second.send(Ok(LogChunk::Stdout(Bytes::from_static(LINE)))).unwrap();
        let received = collector.sinks()[1].wait_for(1).await;
        assert_eq!(received.len(), 1);
    }
}
