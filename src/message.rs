use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::container::Container;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Stdout,
    Stderr,
}

impl AsRef<str> for Source {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A single log line read from a container.
///
/// Built once per line and shared with every sink behind an `Arc`, so sinks
/// only ever see it immutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub container: Arc<Container>,
    pub source: Source,
    /// Line payload without the trailing newline.
    pub data: String,
    pub time: DateTime<Utc>,
}

impl Message {
    pub fn new(
        container: Arc<Container>,
        source: Source,
        data: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            container,
            source,
            data: data.into(),
            time,
        }
    }
}
