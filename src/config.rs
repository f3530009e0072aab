//! Orchestrator configuration
//!
//! Use the builder methods or read overrides from the environment:
//!
//! ```ignore
//! let config = OrchestratorConfig::from_env()?
//!     .with_queue_capacity(50)
//!     .with_autosave(true);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{OrchestratorError, OrchestratorResult};
use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "AGENT_HIVE_";

/// Tunables for the session manager and its background units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Default per-session queue capacity
    pub queue_capacity: usize,

    /// Bound on one worker dequeue wait
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Scheduler tick period
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Failures tolerated per session; one more stops it
    pub max_error_count: u32,

    /// How long `stop_session` waits for a running task
    #[serde(with = "duration_ms")]
    pub stop_drain_timeout: Duration,

    /// Timeout used by `send_mail_with_switch` when none is given
    #[serde(with = "duration_ms")]
    pub default_mail_timeout: Duration,

    /// Event bus queue depth
    pub event_buffer: usize,

    /// Save a snapshot after every task, sleep and stop
    pub autosave: bool,

    /// Snapshot directory; snapshots stay in memory when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(250),
            tick_interval: Duration::from_millis(100),
            max_error_count: 5,
            stop_drain_timeout: Duration::from_secs(5),
            default_mail_timeout: Duration::from_secs(30),
            event_buffer: 1024,
            autosave: false,
            state_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `AGENT_HIVE_*` variables
    ///
    /// Durations are given in milliseconds (`AGENT_HIVE_TICK_INTERVAL_MS`).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("TICK_INTERVAL_MS")? {
            config.tick_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("MAX_ERROR_COUNT")? {
            config.max_error_count = v;
        }
        if let Some(v) = env_parse::<u64>("STOP_DRAIN_TIMEOUT_MS")? {
            config.stop_drain_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("MAIL_TIMEOUT_MS")? {
            config.default_mail_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("EVENT_BUFFER")? {
            config.event_buffer = v;
        }
        if let Some(v) = env_parse::<bool>("AUTOSAVE")? {
            config.autosave = v;
        }
        if let Some(v) = env_var("STATE_DIR") {
            config.state_dir = Some(PathBuf::from(v));
        }

        config.validate()?;
        tracing::debug!(?config, "Loaded orchestrator config");
        Ok(config)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_error_count(mut self, count: u32) -> Self {
        self.max_error_count = count;
        self
    }

    pub fn with_stop_drain_timeout(mut self, timeout: Duration) -> Self {
        self.stop_drain_timeout = timeout;
        self
    }

    pub fn with_default_mail_timeout(mut self, timeout: Duration) -> Self {
        self.default_mail_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, buffer: usize) -> Self {
        self.event_buffer = buffer;
        self
    }

    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.queue_capacity == 0 {
            return Err(OrchestratorError::validation("queue_capacity must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(OrchestratorError::validation("event_buffer must be positive"));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("tick_interval", self.tick_interval),
            ("default_mail_timeout", self.default_mail_timeout),
        ] {
            if value.is_zero() {
                return Err(OrchestratorError::validation(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {ENV_PREFIX}{name}: {raw}"))
        })
        .transpose()
}

/// Serialize `Duration` as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_error_count, 5);
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert!(config.state_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = OrchestratorConfig::new()
            .with_queue_capacity(0)
            .with_autosave(true);
        assert!(config.autosave);
        assert!(matches!(config.validate(), Err(OrchestratorError::Validation(_))));

        let config = OrchestratorConfig::new().with_tick_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let config = OrchestratorConfig::new().with_poll_interval(Duration::from_millis(40));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["poll_interval"], json!(40));

        let parsed: OrchestratorConfig =
            serde_json::from_value(json!({ "queue_capacity": 7, "stop_drain_timeout": 1500 })).unwrap();
        assert_eq!(parsed.queue_capacity, 7);
        assert_eq!(parsed.stop_drain_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.tick_interval, Duration::from_millis(100));
    }
}
