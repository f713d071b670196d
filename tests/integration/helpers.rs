//! Shared helpers for integration tests.

use std::path::Path;
use std::time::Duration;
use taskhub::config::{BrokerMode, HubConfig};
use taskhub::runtime::RejectReason;
use taskhub::{Payload, RuntimeEvent, TaskHub};
use tokio::sync::broadcast;

/// Writes `modules/<dir>/manifest.toml`.
pub(crate) fn write_module(root: &Path, dir: &str, manifest: &str) {
    let path = root.join("modules").join(dir);
    std::fs::create_dir_all(&path).expect("create module dir");
    std::fs::write(path.join("manifest.toml"), manifest).expect("write manifest");
}

/// Config rooted in `root` with autostart off and the broker on a free port.
pub(crate) fn test_config(root: &Path) -> HubConfig {
    let mut config = HubConfig::default();
    config.paths.modules_dir = Some(root.join("modules"));
    config.paths.tasks_dir = Some(root.join("tasks"));
    config.task_defaults.autostart = false;
    config.worker_pool.max_workers = 4;
    config.message_bus.mode = BrokerMode::Embedded;
    config.message_bus.port = 0;
    config.message_bus.broker_start_timeout_secs = 2;
    config
}

/// Offline hub (in-process bus) over a fresh temp dir populated by `setup`.
pub(crate) async fn offline_hub(setup: impl FnOnce(&Path)) -> (tempfile::TempDir, TaskHub) {
    let dir = tempfile::tempdir().expect("create temp dir");
    setup(dir.path());
    let hub = TaskHub::offline(test_config(dir.path()))
        .await
        .expect("start offline hub");
    (dir, hub)
}

/// JSON object literal to [`Payload`].
pub(crate) fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

/// Waits until an event matching `pred` arrives.
pub(crate) async fn wait_for(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&RuntimeEvent) -> bool,
) -> Option<RuntimeEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Collects events until `done` holds for everything collected so far.
///
/// Panics on timeout with the events seen.
pub(crate) async fn collect_until(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    timeout: Duration,
    mut done: impl FnMut(&[RuntimeEvent]) -> bool,
) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while !done(&seen) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                panic!("condition not reached; events: {seen:#?}")
            }
        }
    }
    seen
}

/// Number of success events for `task`.
pub(crate) fn successes(events: &[RuntimeEvent], task: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::TaskSucceeded { task: t, .. } if t == task))
        .count()
}

/// Rejection reasons recorded for `task`.
pub(crate) fn rejections(events: &[RuntimeEvent], task: &str) -> Vec<RejectReason> {
    events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::TaskRejected { task: t, reason, .. } if t == task => Some(*reason),
            _ => None,
        })
        .collect()
}

/// Whether `event` is a success or failure outcome for `task`.
pub(crate) fn is_outcome(event: &RuntimeEvent, task: &str) -> bool {
    matches!(
        event,
        RuntimeEvent::TaskSucceeded { task: t, .. } | RuntimeEvent::TaskFailed { task: t, .. }
            if t == task
    )
}
