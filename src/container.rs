use bollard::models::ContainerInspectResponse;

/// Environment variable a container can set to opt out of log pumping.
pub const IGNORE_ENV_KEY: &str = "SPLUNKPUMP";
const IGNORE_ENV_VALUE: &str = "ignore";
const SHORT_ID_LEN: usize = 12;

/// Snapshot of a container taken when it was discovered.
///
/// The snapshot is never updated in place. Lifecycle events fetch a fresh one
/// from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    id: String,
    name: String,
    env: Vec<String>,
    tty: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Container inspect response has no id")]
    MissingId,
}

impl Container {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        env: Vec<String>,
        tty: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            env,
            tty,
        }
    }

    /// Canonical short id used for display and checkpoint keys.
    pub fn id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn full_id(&self) -> &str {
        &self.id
    }

    /// Container name without the leading `/` the runtime reports.
    pub fn name(&self) -> &str {
        normal_name(&self.name)
    }

    pub fn is_ignored(&self) -> bool {
        self.env.iter().any(|kv| match kv.split_once('=') {
            Some((key, value)) => {
                key == IGNORE_ENV_KEY && value.eq_ignore_ascii_case(IGNORE_ENV_VALUE)
            }
            None => false,
        })
    }

    /// TTY containers merge stdout and stderr into a raw terminal stream
    /// that cannot be framed, so they are never pumped.
    pub fn can_pump(&self) -> bool {
        if self.tty {
            log::debug!(target: "splunk_pump::container", "container {self} ignored: tty enabled");
            return false;
        }
        if self.is_ignored() {
            log::debug!(target: "splunk_pump::container", "container {self} ignored: {IGNORE_ENV_KEY}={IGNORE_ENV_VALUE}");
            return false;
        }
        true
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.id(), self.name())
    }
}

impl TryFrom<ContainerInspectResponse> for Container {
    type Error = ContainerError;

    fn try_from(response: ContainerInspectResponse) -> Result<Self, Self::Error> {
        let id = response.id.ok_or(ContainerError::MissingId)?;
        let name = response.name.unwrap_or_default();
        let (env, tty) = match response.config {
            Some(config) => (config.env.unwrap_or_default(), config.tty.unwrap_or(false)),
            None => (Vec::new(), false),
        };
        Ok(Container::new(id, name, env, tty))
    }
}

pub fn short_id(id: &str) -> &str {
    // Docker ids are hex, so slicing on a byte offset is safe. Guard anyway
    // for runtimes that hand us something else.
    match id.get(..SHORT_ID_LEN) {
        Some(short) => short,
        None => id,
    }
}

pub fn normal_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}
