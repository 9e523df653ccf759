//! The container runtime the pump reads from.
//!
//! Only the handful of calls the orchestrator needs are exposed, so the
//! orchestrator can be driven by something other than a Docker daemon.

pub mod docker;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::container::{Container, ContainerError};

pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Invalid container: {0}")]
    Container(#[from] ContainerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Restart,
    Die,
    Other(String),
}

impl From<&str> for EventStatus {
    fn from(action: &str) -> Self {
        match action {
            "start" => Self::Start,
            "restart" => Self::Restart,
            "die" => Self::Die,
            other => Self::Other(other.to_string()),
        }
    }
}

impl AsRef<str> for EventStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Die => "die",
            Self::Other(other) => other,
        }
    }
}

/// A container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub id: String,
    pub status: EventStatus,
}

impl LifecycleEvent {
    pub fn new(id: impl Into<String>, status: EventStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

/// One demultiplexed piece of container output. Chunks carry no line
/// boundary guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogsRequest {
    pub follow: bool,
    /// Unix seconds to replay from. `None` skips the backlog entirely.
    pub since: Option<i64>,
    pub timestamps: bool,
}

impl LogsRequest {
    pub fn follow_since(since: Option<i64>) -> Self {
        Self {
            follow: true,
            since,
            timestamps: true,
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Ids of the containers currently running.
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;

    /// Container lifecycle events, until the runtime closes the feed.
    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent, RuntimeError>>;

    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError>;

    /// Combined stdout/stderr output of a container.
    fn logs(&self, id: &str, request: LogsRequest)
    -> BoxStream<'static, Result<LogChunk, RuntimeError>>;
}
