//! Service registry: register, start, stop, and observe named services.
//!
//! The service map is only mutated under the registry's own lock. Each
//! started service gets a supervisor task that awaits its background work
//! and records how it ended.

use super::{Service, ServiceState};
use crate::error::{HubError, Result};
use crate::runtime::{RuntimeEvent, RuntimeEvents};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for background work to exit before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between a registry slot and its supervisor task.
struct StateCell {
    name: String,
    state: Mutex<ServiceState>,
    events: RuntimeEvents,
    stop_requested: AtomicBool,
    detached: AtomicBool,
}

impl StateCell {
    fn new(name: &str, events: RuntimeEvents) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(ServiceState::Stopped),
            events,
            stop_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    fn get(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, new: ServiceState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.set_locked(&mut state, new);
    }

    // Emission happens under the state lock so every receiver sees
    // transitions in the order they were applied.
    fn set_locked(&self, state: &mut ServiceState, new: ServiceState) {
        let old = *state;
        if old == new || self.detached.load(Ordering::Acquire) {
            return;
        }
        *state = new;
        debug!(service = %self.name, %old, %new, "service state changed");
        self.events.emit(RuntimeEvent::ServiceStateChanged {
            service: self.name.clone(),
            old,
            new,
        });
    }

    fn begin_start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.stop_requested.store(false, Ordering::Release);
        self.set_locked(&mut state, ServiceState::Starting);
    }

    /// Moves to `Running` unless a stop was requested meanwhile.
    fn mark_running(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.stop_requested.load(Ordering::Acquire) {
            return false;
        }
        self.set_locked(&mut state, ServiceState::Running);
        true
    }

    fn request_stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.stop_requested.store(true, Ordering::Release);
        self.set_locked(&mut state, ServiceState::Stopping);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Aborts the wrapped task if the supervisor itself is aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ServiceSlot {
    service: Arc<dyn Service>,
    cell: Arc<StateCell>,
    supervisor: Option<JoinHandle<()>>,
}

/// Registry of named background services.
pub struct ServiceRegistry {
    slots: tokio::sync::Mutex<HashMap<String, ServiceSlot>>,
    events: RuntimeEvents,
    stop_timeout: Duration,
}

impl ServiceRegistry {
    /// Creates an empty registry broadcasting on `events`.
    pub fn new(events: RuntimeEvents) -> Self {
        Self {
            slots: tokio::sync::Mutex::new(HashMap::new()),
            events,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    /// Overrides how long `stop` waits before aborting a service.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The channel state transitions are broadcast on.
    pub fn events(&self) -> &RuntimeEvents {
        &self.events
    }

    /// Installs `service` under `name`.
    ///
    /// A service already registered under `name` is stopped and detached
    /// first, and this call returns only after its background work has
    /// exited. If the old service was active the new one is started in its
    /// place.
    pub async fn register(&self, name: &str, service: Arc<dyn Service>) {
        let mut slots = self.slots.lock().await;
        let mut restart = false;
        if let Some(mut old) = slots.remove(name) {
            restart = old.cell.get().is_active();
            info!(service = name, "replacing registered service");
            self.shutdown_slot(&mut old).await;
            old.cell.detached.store(true, Ordering::Release);
        }

        let mut slot = ServiceSlot {
            service,
            cell: Arc::new(StateCell::new(name, self.events.clone())),
            supervisor: None,
        };
        if restart {
            Self::spawn_supervisor(&mut slot);
        }
        slots.insert(name.to_owned(), slot);
        debug!(service = name, "service registered");
    }

    /// Stops and removes the service registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownService`] if nothing is registered under `name`.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let mut slot = slots.remove(name).ok_or_else(|| HubError::UnknownService {
            name: name.to_owned(),
        })?;
        self.shutdown_slot(&mut slot).await;
        slot.cell.detached.store(true, Ordering::Release);
        Ok(())
    }

    /// Requests that `name` start. Returns without waiting for `Running`;
    /// observe [`RuntimeEvent::ServiceStateChanged`] for the outcome.
    ///
    /// Starting an active service is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownService`] if nothing is registered under `name`.
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(name).ok_or_else(|| HubError::UnknownService {
            name: name.to_owned(),
        })?;
        Self::spawn_supervisor(slot);
        Ok(())
    }

    /// Stops `name` and waits for its background work to exit.
    ///
    /// Work that does not exit within the stop timeout is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownService`] if nothing is registered under `name`.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(name).ok_or_else(|| HubError::UnknownService {
            name: name.to_owned(),
        })?;
        self.shutdown_slot(slot).await;
        Ok(())
    }

    /// Stops then starts `name`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownService`] if nothing is registered under `name`.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(name).ok_or_else(|| HubError::UnknownService {
            name: name.to_owned(),
        })?;
        self.shutdown_slot(slot).await;
        Self::spawn_supervisor(slot);
        Ok(())
    }

    /// Stops every registered service.
    pub async fn stop_all(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            self.shutdown_slot(slot).await;
        }
    }

    /// Current state of `name`, or `None` if unregistered.
    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.slots.lock().await.get(name).map(|slot| slot.cell.get())
    }

    /// Whether the service under `name` reports its background work running.
    pub async fn is_running(&self, name: &str) -> bool {
        self.slots
            .lock()
            .await
            .get(name)
            .is_some_and(|slot| slot.service.is_running())
    }

    /// Client endpoint advertised by `name`.
    pub async fn endpoint(&self, name: &str) -> Option<SocketAddr> {
        self.slots
            .lock()
            .await
            .get(name)
            .and_then(|slot| slot.service.endpoint())
    }

    /// Registered service names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn spawn_supervisor(slot: &mut ServiceSlot) {
        if slot.cell.get().is_active() {
            debug!(service = %slot.cell.name, "service already active");
            return;
        }
        slot.cell.begin_start();
        let service = Arc::clone(&slot.service);
        let cell = Arc::clone(&slot.cell);
        slot.supervisor = Some(tokio::spawn(supervise(service, cell)));
    }

    async fn shutdown_slot(&self, slot: &mut ServiceSlot) {
        let Some(mut supervisor) = slot.supervisor.take() else {
            slot.cell.transition(ServiceState::Stopped);
            return;
        };

        slot.cell.request_stop();
        slot.service.stop().await;
        match tokio::time::timeout(self.stop_timeout, &mut supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = %slot.cell.name, error = %e, "service supervisor ended abnormally"),
            Err(_) => {
                warn!(
                    service = %slot.cell.name,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "service did not stop in time, aborting"
                );
                supervisor.abort();
                let _ = supervisor.await;
            }
        }
        slot.cell.transition(ServiceState::Stopped);
        info!(service = %slot.cell.name, "service stopped");
    }
}

async fn supervise(service: Arc<dyn Service>, cell: Arc<StateCell>) {
    let mut work = match service.start().await {
        Ok(work) => AbortOnDrop(work),
        Err(e) => {
            error!(service = %cell.name, error = %e, "service failed to start");
            cell.transition(ServiceState::Failed);
            return;
        }
    };

    if !cell.mark_running() {
        // stop() may have signalled before the service had anything to stop.
        service.stop().await;
        let _ = (&mut work.0).await;
        return;
    }
    info!(service = %cell.name, "service running");

    let outcome = (&mut work.0).await;
    if cell.stop_requested() {
        return;
    }
    match outcome {
        Ok(()) => {
            warn!(service = %cell.name, "service exited without a stop request");
            cell.transition(ServiceState::Stopped);
        }
        Err(e) => {
            error!(service = %cell.name, error = %e, "service task failed");
            cell.transition(ServiceState::Failed);
        }
    }
}
