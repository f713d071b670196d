//! Configuration types for the task hub.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level hub configuration (`config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Process-wide task defaults.
    pub task_defaults: TaskDefaultsConfig,
    /// Message bus connection and broker settings.
    pub message_bus: MessageBusConfig,
    /// Worker pool sizing.
    pub worker_pool: WorkerPoolConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
}

/// Defaults applied to every task instance unless it overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaultsConfig {
    /// Hop ceiling for event-triggered tasks that do not declare `max_hops`.
    pub event_max_hops: u32,
    /// What to do with an event that arrives while the task is executing.
    pub event_busy_policy: BusyPolicy,
    /// Start enabled tasks as soon as they are loaded.
    pub autostart: bool,
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        Self {
            event_max_hops: 5,
            event_busy_policy: BusyPolicy::default(),
            autostart: true,
        }
    }
}

/// Busy-guard policy for event triggers.
///
/// Schedule triggers always skip when busy; this only governs events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Drop the event and log it.
    Drop,
    /// Keep up to `capacity` events and run them in arrival order.
    Queue {
        /// Maximum number of waiting events per task.
        capacity: usize,
    },
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self::Queue { capacity: 8 }
    }
}

impl std::fmt::Display for BusyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Queue { capacity } => write!(f, "queue({capacity})"),
        }
    }
}

/// Where the message broker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// Broker runs in-process, managed by the service registry.
    #[default]
    Embedded,
    /// Broker is operated externally at `host:port`.
    External,
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded => f.write_str("embedded"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Message bus client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Embedded or external broker.
    pub mode: BrokerMode,
    /// Broker host. The embedded broker binds here too.
    pub host: String,
    /// Broker port. Port 0 lets the embedded broker pick a free port.
    pub port: u16,
    /// Client identifier sent on connect (None = random).
    pub client_id: Option<String>,
    /// Service registry name of the embedded broker.
    pub broker_service: String,
    /// How long `connect()` waits for the embedded broker to reach `Running`.
    pub broker_start_timeout_secs: u64,
    /// Upper bound for the reconnect backoff.
    pub reconnect_interval_max_secs: u64,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Embedded,
            host: "127.0.0.1".to_owned(),
            port: 1883,
            client_id: None,
            broker_service: "message_broker".to_owned(),
            broker_start_timeout_secs: 10,
            reconnect_interval_max_secs: 60,
        }
    }
}

impl MessageBusConfig {
    /// `host:port` string for binding or connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Broker readiness timeout as a [`Duration`].
    pub fn broker_start_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_start_timeout_secs)
    }

    /// Reconnect backoff cap as a [`Duration`].
    pub fn reconnect_interval_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_max_secs.max(1))
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum number of task bodies executing at once.
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 10 }
    }
}

/// Filesystem overrides. `None` falls back to [`crate::hub_dirs`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Module template root.
    pub modules_dir: Option<PathBuf>,
    /// Task instance root.
    pub tasks_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Effective module template root.
    pub fn modules_dir(&self) -> PathBuf {
        self.modules_dir
            .clone()
            .unwrap_or_else(crate::hub_dirs::modules_dir)
    }

    /// Effective task instance root.
    pub fn tasks_dir(&self) -> PathBuf {
        self.tasks_dir.clone().unwrap_or_else(crate::hub_dirs::tasks_dir)
    }
}

impl HubConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| HubError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| HubError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::hub_dirs::config_file()
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool.max_workers == 0 {
            return Err(HubError::Config(
                "worker_pool.max_workers must be at least 1".to_owned(),
            ));
        }
        if let BusyPolicy::Queue { capacity: 0 } = self.task_defaults.event_busy_policy {
            return Err(HubError::Config(
                "task_defaults.event_busy_policy queue capacity must be at least 1".to_owned(),
            ));
        }
        if self.message_bus.host.trim().is_empty() {
            return Err(HubError::Config("message_bus.host cannot be empty".to_owned()));
        }
        if self.message_bus.broker_service.trim().is_empty() {
            return Err(HubError::Config(
                "message_bus.broker_service cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
