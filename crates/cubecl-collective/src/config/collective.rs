use super::logger::{LogLevel, LoggerConfig};
use core::time::Duration;

/// Configuration of the process groups.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CollectiveConfig {
    /// Whether waiting on a task also blocks the host until the task completes.
    #[serde(default)]
    pub blocking_wait: bool,

    /// Whether inputs are recorded on the communication stream before an operation, so the
    /// allocator keeps them alive until the stream passes that point.
    #[serde(default)]
    pub stream_safe_allocator: bool,

    /// How tasks are waited on.
    #[serde(default)]
    pub wait: WaitConfig,

    /// Logger configuration for process group logs.
    #[serde(default)]
    pub logger: LoggerConfig<CollectiveLogLevel>,
}

/// Timeout and polling settings used when waiting on a task in blocking mode.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WaitConfig {
    /// Timeout used by [synchronize](crate::Task::synchronize).
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Whether a blocking wait fails once the timeout is reached. Otherwise it polls until
    /// completion.
    #[serde(default = "default_enforce_timeout")]
    pub enforce_timeout: bool,

    /// First delay between two polls, in microseconds.
    #[serde(default = "default_poll_min_us")]
    pub poll_min_us: u64,

    /// The delay doubles after every poll, up to this value in microseconds.
    #[serde(default = "default_poll_max_us")]
    pub poll_max_us: u64,
}

impl WaitConfig {
    /// The default timeout as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            enforce_timeout: default_enforce_timeout(),
            poll_min_us: default_poll_min_us(),
            poll_max_us: default_poll_max_us(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_enforce_timeout() -> bool {
    true
}

fn default_poll_min_us() -> u64 {
    100
}

fn default_poll_max_us() -> u64 {
    10_000
}

/// Log levels for process groups.
#[derive(
    Default,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum CollectiveLogLevel {
    /// Logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Communicator creation and bootstrap id exchanges are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every issued operation is logged as well.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for CollectiveLogLevel {}
