pub mod splunk;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc::Receiver;

use crate::message::Message;

pub use splunk::SplunkConfig;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink destination is missing")]
    MissingDestination,
    #[error("Unable to resolve {destination}: {source}")]
    Resolve {
        destination: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{destination} did not resolve to any address")]
    NoAddress { destination: String },
    #[error("Connection to {destination} failed: {source}")]
    Connect {
        destination: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A downstream consumer of log messages.
///
/// The `Display` form is the sink's identity: it is used in logs and to
/// reject a second registration of the same sink on a pump.
#[async_trait]
pub trait Sink: Send + Sync + std::fmt::Display {
    /// Consumes `messages` until the sender side closes, then releases the
    /// sink. Must keep accepting promptly so the pump is never stalled.
    async fn stream(self: Arc<Self>, messages: Receiver<Arc<Message>>);
}

pub type SinkFuture = BoxFuture<'static, Result<Arc<dyn Sink>, SinkError>>;

/// Builds a sink for a destination. One sink is built per pump.
pub type SinkFactory = Arc<dyn Fn(String) -> SinkFuture + Send + Sync>;
