//! Implementation of the engine configuration.
//!
//! Loading configuration from files or the environment is the embedder's
//! concern; the engine consumes the typed form only.

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// The default start-to-close timeout for activity execution, in seconds.
pub const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 300;

/// The default timeout for shell runs, in seconds.
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 60;

/// The default timeout for container runs, in seconds.
pub const DEFAULT_CONTAINER_TIMEOUT_SECS: u64 = 120;

/// The longest wait an ephemeral in-process instance accepts, in seconds.
pub const MAX_EPHEMERAL_WAIT_SECS: u64 = 60;

/// Represents the engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The execution backend configuration.
    pub backend: BackendConfig,
    /// The HTTP caller configuration.
    pub http: HttpConfig,
    /// The `run` task configuration.
    pub run: RunConfig,
    /// The scheduler bridge configuration.
    pub scheduler: SchedulerConfig,
    /// The `listen` task configuration.
    pub listen: ListenConfig,
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        self.http.validate()?;
        self.run.validate()?;
        Ok(())
    }
}

/// Represents the supported execution backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendConfig {
    /// Use the in-process backend.
    InProcess(InProcessBackendConfig),
    /// Use the durable backend.
    Durable(DurableBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::InProcess(Default::default())
    }
}

impl BackendConfig {
    /// Validates the backend configuration.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::InProcess(config) => config.validate(),
            Self::Durable(config) => config.validate(),
        }
    }
}

/// Represents the configuration of the in-process backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InProcessBackendConfig {
    /// Whether instances are ephemeral.
    ///
    /// Ephemeral instances reject `wait` durations longer than one minute.
    pub ephemeral: bool,
}

impl Default for InProcessBackendConfig {
    fn default() -> Self {
        Self { ephemeral: true }
    }
}

impl InProcessBackendConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Represents the configuration of the durable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableBackendConfig {
    /// The task queue activities are scheduled on.
    pub task_queue: String,
    /// The start-to-close timeout for activity execution, in seconds.
    pub activity_timeout_seconds: u64,
    /// The number of completed root tasks after which the backend suggests
    /// continuing as new.
    ///
    /// `None` disables the suggestion.
    pub continue_as_new_after: Option<u64>,
}

impl Default for DurableBackendConfig {
    fn default() -> Self {
        Self {
            task_queue: "thand".to_string(),
            activity_timeout_seconds: DEFAULT_ACTIVITY_TIMEOUT_SECS,
            continue_as_new_after: None,
        }
    }
}

impl DurableBackendConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.task_queue.is_empty() {
            bail!("the durable backend requires a task queue name");
        }
        if self.activity_timeout_seconds == 0 {
            bail!("the activity timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Represents the configuration of the HTTP caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// The request timeout, in seconds.
    pub timeout_seconds: u64,
    /// The maximum number of redirects followed.
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_redirects: 10,
        }
    }
}

impl HttpConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            bail!("the HTTP timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Represents the configuration of the `run` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// The timeout for shell runs, in seconds.
    pub shell_timeout_seconds: u64,
    /// The timeout for container runs, in seconds.
    pub container_timeout_seconds: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell_timeout_seconds: DEFAULT_SHELL_TIMEOUT_SECS,
            container_timeout_seconds: DEFAULT_CONTAINER_TIMEOUT_SECS,
        }
    }
}

impl RunConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.shell_timeout_seconds == 0 || self.container_timeout_seconds == 0 {
            bail!("run timeouts must be greater than zero");
        }
        Ok(())
    }
}

/// Represents the configuration of the scheduler bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// The URL deferred self-callbacks are posted to.
    pub callback_url: Option<String>,
}

/// Represents the configuration of the `listen` task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// The termination semantics of the `all` predicate.
    pub all_mode: ListenAllMode,
}

/// Represents the termination semantics of a `listen` task's `all`
/// predicate.
///
/// The two modes exist because implementations of the dialect disagree:
/// `first_match` terminates on the first filter match (treating `all` like
/// `any`), while `all_types` terminates only once every filter has matched
/// at least one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenAllMode {
    /// Terminate on the first filter match.
    #[default]
    FirstMatch,
    /// Terminate once every filter has matched an event.
    AllTypes,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults should validate");
    }

    #[test]
    fn empty_task_queue_is_rejected() {
        let config = Config {
            backend: BackendConfig::Durable(DurableBackendConfig {
                task_queue: String::new(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
