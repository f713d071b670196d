//! Execution context handed to task bodies.

use super::state::StateStore;
use crate::bus::{HOPS_FIELD, MessageBus, Payload, hop_count};
use crate::error::Result;
use crate::runtime::{RuntimeEvent, RuntimeEvents, TaskLogLevel};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log sink scoped to one task instance.
///
/// Lines go to `tracing` with a `task` field and are re-emitted as
/// [`RuntimeEvent::TaskLog`] for log viewers.
#[derive(Clone)]
pub struct TaskLogger {
    task: String,
    events: RuntimeEvents,
}

impl TaskLogger {
    pub(crate) fn new(task: &str, events: RuntimeEvents) -> Self {
        Self {
            task: task.to_owned(),
            events,
        }
    }

    pub fn log(&self, level: TaskLogLevel, message: &str) {
        let task = self.task.as_str();
        match level {
            TaskLogLevel::Debug => tracing::debug!(%task, "{message}"),
            TaskLogLevel::Info => tracing::info!(%task, "{message}"),
            TaskLogLevel::Warn => tracing::warn!(%task, "{message}"),
            TaskLogLevel::Error => tracing::error!(%task, "{message}"),
        }
        self.events.emit(RuntimeEvent::TaskLog {
            task: self.task.clone(),
            level,
            message: message.to_owned(),
        });
    }

    pub fn debug(&self, message: &str) {
        self.log(TaskLogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(TaskLogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(TaskLogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(TaskLogLevel::Error, message);
    }
}

/// What a task body can see and do during one execution.
pub struct TaskContext {
    task_name: String,
    task_dir: PathBuf,
    settings: Payload,
    hop_count: u32,
    attempt: u32,
    total_attempts: u32,
    logger: TaskLogger,
    bus: Arc<dyn MessageBus>,
    state: Arc<StateStore>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_name: &str,
        task_dir: &Path,
        settings: Payload,
        hop_count: u32,
        attempt: u32,
        total_attempts: u32,
        logger: TaskLogger,
        bus: Arc<dyn MessageBus>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            task_name: task_name.to_owned(),
            task_dir: task_dir.to_path_buf(),
            settings,
            hop_count,
            attempt: attempt.max(1),
            total_attempts: total_attempts.max(1),
            logger,
            bus,
            state,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Instance directory holding the copied assets.
    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Resolved instance settings.
    pub fn settings(&self) -> &Payload {
        &self.settings
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Hop count of the event that triggered this run (0 for schedule and
    /// manual runs).
    pub fn hop_count(&self) -> u32 {
        self.hop_count
    }

    /// Current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn logger(&self) -> &TaskLogger {
        &self.logger
    }

    /// Logs `message` prefixed with `[attempt n/m]`.
    pub fn log_progress(&self, message: &str) {
        let prefix = format!("[attempt {}/{}]", self.attempt, self.total_attempts);
        if message.is_empty() {
            self.logger.info(&prefix);
        } else {
            self.logger.info(&format!("{prefix} {message}"));
        }
    }

    /// Publishes on the message bus, one hop further than the triggering event.
    ///
    /// The outgoing `__hops` is `max(payload hops, inbound hops) + 1`, so a
    /// body cannot reset the chain by dropping or lowering the field.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bus`](crate::HubError::Bus) if the topic is
    /// malformed or the bus is disconnected.
    pub fn publish(&self, topic: &str, mut payload: Payload) -> Result<()> {
        let hops = hop_count(&payload).max(self.hop_count).saturating_add(1);
        payload.insert(HOPS_FIELD.to_owned(), Value::from(hops));
        self.bus.publish(topic, payload)
    }

    /// Value stored in the instance state.
    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.state.get(key)
    }

    /// Stores a value in the instance state, flushing it if the instance
    /// persists state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn update_state(&self, key: &str, value: Value) -> Result<()> {
        self.state.update(key, value)
    }

    /// The instance state store, for multi-key updates.
    pub fn state(&self) -> &StateStore {
        &self.state
    }
}
