use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::logs_pump::RetryPolicy;
use crate::sinks::SplunkConfig;

pub const DEFAULT_STORAGE_PATH: &str = "/opt/splunkpump.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

/// Settings read from the optional config file. Every key has a default.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PumpConfigFile {
    pub storage_path: PathBuf,
    pub queue_capacity: usize,
    pub reconnect_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub sink_retry_attempts: u32,
    pub sink_retry_step_secs: u64,
    pub lookback_hours: u32,
    pub docker_host: Option<String>,
}

impl Default for PumpConfigFile {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            queue_capacity: 1024,
            reconnect_interval_secs: 1,
            connect_timeout_secs: 10,
            sink_retry_attempts: 10,
            sink_retry_step_secs: 1,
            lookback_hours: 24,
            docker_host: None,
        }
    }
}

impl PumpConfigFile {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(val)?;
        config.validate()?;
        Ok(config)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::try_init_from_string(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_capacity",
                reason: "must be at least 1",
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "connect_timeout_secs",
                reason: "must be at least 1",
            });
        }
        if self.sink_retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "sink_retry_attempts",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Everything the daemon needs, after merging the command line over the
/// config file.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub destination: String,
    pub storage_path: PathBuf,
    pub docker_host: Option<String>,
    pub lookback: chrono::Duration,
    pub retry: RetryPolicy,
    pub sink: SplunkConfig,
}

impl PumpConfig {
    pub fn from_args(destination: &str, args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => PumpConfigFile::try_init(path)?,
            None => PumpConfigFile::default(),
        };
        Ok(Self::merge(destination, args.storage.clone(), file))
    }

    fn merge(destination: &str, storage: Option<PathBuf>, file: PumpConfigFile) -> Self {
        let sink = SplunkConfig::new(destination)
            .with_queue_capacity(file.queue_capacity)
            .with_reconnect_interval(Duration::from_secs(file.reconnect_interval_secs))
            .with_connection_timeout(Duration::from_secs(file.connect_timeout_secs));
        Self {
            destination: destination.to_string(),
            storage_path: storage.unwrap_or(file.storage_path),
            docker_host: file.docker_host,
            lookback: chrono::Duration::hours(i64::from(file.lookback_hours)),
            retry: RetryPolicy {
                attempts: file.sink_retry_attempts,
                step: Duration::from_secs(file.sink_retry_step_secs),
            },
            sink,
        }
    }
}
