//! Docker runtime using bollard.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use futures::stream::BoxStream;
use futures_util::{StreamExt, future};

use super::{
    ContainerRuntime, EventStatus, LifecycleEvent, LogChunk, LogsRequest, RuntimeError,
};
use crate::container::Container;

const LOG_TARGET: &str = "splunk_pump::runtime";
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to `host` (`unix://...`, `tcp://...` or `http://...`), or to
    /// the local defaults (honouring `DOCKER_HOST`) when no host is given.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => Docker::connect_with_local_defaults()?,
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
        };
        Ok(Self { docker })
    }
}

fn lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let id = message.actor.and_then(|actor| actor.id)?;
    let action = message.action?;
    Some(LifecycleEvent::new(id, EventStatus::from(action.as_str())))
}

fn log_chunk(output: LogOutput) -> Option<LogChunk> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(LogChunk::Stdout(message))
        }
        LogOutput::StdErr { message } => Some(LogChunk::Stderr(message)),
        LogOutput::StdIn { .. } => None,
    }
}

fn logs_options(request: LogsRequest) -> LogsOptions {
    let builder = LogsOptionsBuilder::new()
        .follow(request.follow)
        .stdout(true)
        .stderr(true)
        .timestamps(request.timestamps);
    match request.since {
        // The API takes 32-bit seconds.
        Some(since) => builder
            .since(i32::try_from(since.max(0)).unwrap_or(i32::MAX))
            .build(),
        None => builder.tail("0").build(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().build();
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent, RuntimeError>> {
        let options: EventsOptions = EventsOptionsBuilder::new().build();
        self.docker
            .events(Some(options))
            .filter_map(|event| {
                future::ready(match event {
                    Ok(message) => lifecycle_event(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::DockerApi(e))),
                })
            })
            .boxed()
    }

    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let response = self.docker.inspect_container(id, Some(options)).await?;
        Ok(Container::try_from(response)?)
    }

    fn logs(
        &self,
        id: &str,
        request: LogsRequest,
    ) -> BoxStream<'static, Result<LogChunk, RuntimeError>> {
        log::debug!(target: LOG_TARGET, "opening log stream for {id}: {request:?}");
        self.docker
            .logs(id, Some(logs_options(request)))
            .filter_map(|output| {
                future::ready(match output {
                    Ok(output) => log_chunk(output).map(Ok),
                    Err(e) => Some(Err(RuntimeError::DockerApi(e))),
                })
            })
            .boxed()
    }
}
