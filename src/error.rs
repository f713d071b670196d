//! Error types for the task hub.

/// Top-level error type for task orchestration and event routing.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Manifest or instance configuration has an invalid shape.
    #[error("validation failed: {reason}")]
    Validation {
        /// What was wrong with the input.
        reason: String,
    },

    /// A declared asset path is absolute or escapes the template root.
    #[error("unsafe asset path `{path}`: {reason}")]
    UnsafeAssetPath {
        /// The offending path as written in the manifest.
        path: String,
        /// Why the path was rejected.
        reason: String,
    },

    /// A required input field was absent and has no default.
    #[error("task `{task}` is missing required input `{field}`")]
    MissingRequiredInput {
        /// Task instance that was being dispatched.
        task: String,
        /// The missing field.
        field: String,
    },

    /// An inbound event was forwarded too many times.
    #[error("task `{task}` dropped event at hop {hop_count} (max {max_hops})")]
    HopLimitExceeded {
        /// Task instance that rejected the event.
        task: String,
        /// Hop count carried by the event.
        hop_count: u32,
        /// Effective ceiling for the instance.
        max_hops: u32,
    },

    /// The embedded broker did not reach `Running` in time.
    #[error("broker service `{service}` not ready: {reason}")]
    BrokerNotReady {
        /// Name of the broker service in the service registry.
        service: String,
        /// Timeout or terminal state that aborted the wait.
        reason: String,
    },

    /// A task instance with this name already exists.
    #[error("task `{name}` already exists")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// The task is already bound to its trigger (or busy for manual runs).
    #[error("task `{name}` is already running")]
    AlreadyRunning {
        /// Task instance name.
        name: String,
    },

    /// The task is not bound to its trigger.
    #[error("task `{name}` is not started")]
    NotStarted {
        /// Task instance name.
        name: String,
    },

    /// No module template is registered under this type.
    #[error("unknown module template `{module_type}`")]
    UnknownTemplate {
        /// The module type that was looked up.
        module_type: String,
    },

    /// No task instance is registered under this name.
    #[error("unknown task `{name}`")]
    UnknownTask {
        /// The task name that was looked up.
        name: String,
    },

    /// No background service is registered under this name.
    #[error("unknown service `{name}`")]
    UnknownService {
        /// The service name that was looked up.
        name: String,
    },

    /// A background service failed to start.
    #[error("service `{name}` failed: {reason}")]
    Service {
        /// Service name.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// A task body panicked or the worker pool was closed.
    #[error("worker error: {reason}")]
    Worker {
        /// Failure description.
        reason: String,
    },

    /// Message bus transport or protocol error.
    #[error("message bus error: {0}")]
    Bus(String),

    /// Trigger engine error (bad schedule, no runtime).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Shorthand for [`HubError::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HubError>;
