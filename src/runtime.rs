//! Runtime events emitted by the hub for UI and observability.
//!
//! [`RuntimeEvents`] is a thin wrapper around [`tokio::sync::broadcast`]. Every
//! component that changes observable state (services, the bus connection,
//! task instances) publishes here; any number of consumers subscribe.
//!
//! ## Rules
//! - `emit()` never blocks; with no receivers the event is dropped.
//! - Each receiver observes events in the order they were sent.
//! - A receiver only gets events sent after it subscribed.
//! - Dropping the receiver unsubscribes it.
//! - A receiver that falls more than the channel capacity behind gets
//!   `RecvError::Lagged(n)` and resumes at the oldest retained event.

use crate::bus::ConnectionState;
use crate::services::ServiceState;
use crate::tasks::TaskStatus;
use tokio::sync::broadcast;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Severity of a task log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for TaskLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Info => f.write_str("info"),
            Self::Warn => f.write_str("warn"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Why a trigger firing did not run the task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A required input had no value and no default.
    MissingInput,
    /// An input value had the wrong type.
    InvalidInput,
    /// The event's hop count exceeded the task's ceiling.
    HopLimit,
    /// The task was busy and the trigger is not queued.
    Busy,
    /// The task was busy and its event backlog is full.
    BacklogFull,
    /// The task is paused.
    Paused,
}

/// Events that describe what the hub is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A registered service changed state.
    ServiceStateChanged {
        service: String,
        old: ServiceState,
        new: ServiceState,
    },
    /// The message bus client connection changed state.
    BusStateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// A message left this process through the bus client.
    MessagePublished { topic: String },
    /// A task instance changed lifecycle status.
    TaskStatusChanged { task: String, status: TaskStatus },
    /// A trigger firing was rejected before the body ran.
    TaskRejected {
        task: String,
        reason: RejectReason,
        /// Human-readable error text.
        detail: String,
    },
    /// A task body finished successfully.
    TaskSucceeded {
        task: String,
        /// Attempt number that succeeded (1-based).
        attempt: u32,
        duration_ms: u64,
    },
    /// A task body failed on every attempt.
    TaskFailed {
        task: String,
        attempts: u32,
        error: String,
    },
    /// A log line written by a task body through its context.
    TaskLog {
        task: String,
        level: TaskLogLevel,
        message: String,
    },
}

/// Process-wide broadcast channel for [`RuntimeEvent`]s.
///
/// Cheap to clone; all clones share the same channel.
#[derive(Clone, Debug)]
pub struct RuntimeEvents {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl RuntimeEvents {
    /// Creates a channel with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a channel with the given capacity (clamped to at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    /// Creates a new receiver that observes subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for RuntimeEvents {
    fn default() -> Self {
        Self::new()
    }
}
