//! Task instances: configuration, lifecycle, and dispatch.
//!
//! A task instance is created from a module template, owns a directory
//! under the tasks root (copied manifest, entry script, assets,
//! `config.toml`, `state.json`), and is bound to exactly one trigger.
//!
//! Lifecycle: `Created`/`Configured` → `Scheduled`/`Listening` (bound) →
//! `Stopped`. A bound instance can be `Paused` and resumed without losing
//! its binding. While a body executes the instance reports `Running`.

pub mod config;
pub mod context;
pub mod registry;
pub mod retry;
pub(crate) mod slot;
pub mod state;

pub use config::{CONFIG_FILE, TaskConfig, TaskOptions, validate_task_name};
pub use context::{TaskContext, TaskLogger};
pub use registry::{DispatchOutcome, LoadReport, TaskRegistry, TaskSummary, TriggerSource};
pub use retry::{Backoff, RetryPolicy};
pub use state::{STATE_FILE, StateStore};

use serde::{Deserialize, Serialize};

/// Observable lifecycle status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Just created from a template.
    Created,
    /// Loaded or reconfigured, not bound.
    Configured,
    /// Bound to a schedule job.
    Scheduled,
    /// Subscribed to its event topic.
    Listening,
    /// Bound, but its trigger firings are ignored until resumed.
    Paused,
    /// A body is executing.
    Running,
    /// Unbound.
    Stopped,
}

impl TaskStatus {
    /// Whether the instance is bound to its trigger.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Scheduled | Self::Listening | Self::Paused)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Configured => f.write_str("configured"),
            Self::Scheduled => f.write_str("scheduled"),
            Self::Listening => f.write_str("listening"),
            Self::Paused => f.write_str("paused"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}
