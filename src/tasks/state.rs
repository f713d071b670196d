//! Per-instance key/value state (`state.json`).
//!
//! State lives in memory and, when the instance sets `persist_state`, is
//! flushed to `state.json` in the instance directory after every write.
//! Each write is one scoped acquisition: lock, mutate, flush, unlock.

use crate::bus::Payload;
use crate::error::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of persisted instance state.
pub const STATE_FILE: &str = "state.json";

/// Owned state of one task instance.
#[derive(Debug)]
pub struct StateStore {
    path: Mutex<PathBuf>,
    persist: AtomicBool,
    values: Mutex<Payload>,
}

impl StateStore {
    /// Opens the store for the instance directory `task_dir`.
    ///
    /// An existing `state.json` is loaded whether or not `persist` is set;
    /// an unreadable one is logged and treated as empty.
    pub fn open(task_dir: &Path, persist: bool) -> Self {
        let path = task_dir.join(STATE_FILE);
        let values = load(&path);
        Self {
            path: Mutex::new(path),
            persist: AtomicBool::new(persist),
            values: Mutex::new(values),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Sets `key` and flushes if persistence is on.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn update(&self, key: &str, value: Value) -> Result<()> {
        self.with(|values| {
            values.insert(key.to_owned(), value);
        })
    }

    /// Runs `mutate` under the store lock, then flushes if persistence is on.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written. The in-memory
    /// mutation is kept.
    pub fn with<R>(&self, mutate: impl FnOnce(&mut Payload) -> R) -> Result<R> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let result = mutate(&mut values);
        if self.persist.load(Ordering::Acquire) {
            let path = self.path.lock().unwrap_or_else(|e| e.into_inner()).clone();
            write_atomic(&path, &values)?;
            debug!(path = %path.display(), "task state flushed");
        }
        Ok(result)
    }

    /// Copy of the whole state.
    pub fn snapshot(&self) -> Payload {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether writes are flushed to disk.
    pub fn persists(&self) -> bool {
        self.persist.load(Ordering::Acquire)
    }

    pub(crate) fn set_persist(&self, persist: bool) {
        self.persist.store(persist, Ordering::Release);
    }

    /// Points the store at a renamed instance directory.
    pub(crate) fn relocate(&self, task_dir: &Path) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = task_dir.join(STATE_FILE);
    }
}

fn load(path: &Path) -> Payload {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Payload::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read task state, starting empty");
            return Payload::new();
        }
    };
    if raw.trim().is_empty() {
        return Payload::new();
    }
    match serde_json::from_str(&raw) {
        Ok(values) => values,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt task state, starting empty");
            Payload::new()
        }
    }
}

/// Writes via a sibling temp file and rename so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, values: &Payload) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(values)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
