//! Task registry and lifecycle manager.
//!
//! The registry is the single authority over task instances. It creates
//! them from templates, binds them to the trigger engine or the message bus,
//! validates and maps every firing to inputs, applies the hop and busy
//! guards, and runs bodies on the worker pool.
//!
//! Dispatch order for one firing:
//!
//! 1. resolve inputs (payload, then static inputs, then defaults);
//! 2. hop guard, for event firings only;
//! 3. busy guard: run now, queue, or reject;
//! 4. execute on the worker pool with the instance's retry policy, then
//!    drain any queued firings in arrival order.
//!
//! A rejection at any step is logged and emitted as
//! [`RuntimeEvent::TaskRejected`] and affects only that instance.

use super::TaskStatus;
use super::config::{CONFIG_FILE, TaskConfig, TaskOptions, validate_task_name};
use super::context::{TaskContext, TaskLogger};
use super::slot::{Admission, BusySlot};
use super::state::StateStore;
use crate::bus::{HOPS_FIELD, MessageBus, MessageHandler, Payload, SubscriptionId, hop_count};
use crate::config::{BusyPolicy, TaskDefaultsConfig};
use crate::error::{HubError, Result};
use crate::manifest::{
    Inputs, MANIFEST_FILE, ModuleManifest, TriggerBinding, TriggerKind, safe_relative_path,
};
use crate::modules::ModuleRegistry;
use crate::runtime::{RejectReason, RuntimeEvent, RuntimeEvents};
use crate::scheduler::TriggerEngine;
use crate::worker_pool::WorkerPool;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What caused a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Schedule,
    Event,
    /// [`TaskRegistry::run_now`].
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => f.write_str("schedule"),
            Self::Event => f.write_str("event"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// What happened to one firing of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Submitted to the worker pool.
    Started,
    /// Waiting behind a running execution at this backlog depth.
    Queued { depth: usize },
    /// Dropped before the body ran.
    Rejected(RejectReason),
}

/// One row of [`TaskRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub name: String,
    pub module_type: String,
    pub status: TaskStatus,
    pub enabled: bool,
    pub trigger: TriggerKind,
}

/// Outcome of [`TaskRegistry::load_tasks`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Instances added to the registry, sorted.
    pub loaded: Vec<String>,
    /// Instance directories that could not be loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

struct Dispatch {
    source: TriggerSource,
    inputs: Inputs,
    hop_count: u32,
}

enum Binding {
    Schedule,
    Event { filter: String },
}

struct Lifecycle {
    status: TaskStatus,
    binding: Option<Binding>,
    /// Only meaningful while bound.
    paused: bool,
}

struct Instance {
    name: String,
    dir: PathBuf,
    /// Copy of the template manifest taken at creation.
    manifest: ModuleManifest,
    config: RwLock<TaskConfig>,
    lifecycle: Mutex<Lifecycle>,
    slot: Mutex<BusySlot<Dispatch>>,
    state: Arc<StateStore>,
}

impl Instance {
    fn new(
        dir: PathBuf,
        manifest: ModuleManifest,
        config: TaskConfig,
        state: Arc<StateStore>,
        status: TaskStatus,
    ) -> Self {
        Self {
            name: config.name.clone(),
            dir,
            manifest,
            config: RwLock::new(config),
            lifecycle: Mutex::new(Lifecycle {
                status,
                binding: None,
                paused: false,
            }),
            slot: Mutex::new(BusySlot::default()),
            state,
        }
    }

    fn config(&self) -> TaskConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self) -> MutexGuard<'_, BusySlot<Dispatch>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_bound(&self) -> bool {
        self.lifecycle().binding.is_some()
    }

    fn is_paused(&self) -> bool {
        self.lifecycle().paused
    }

    fn is_busy(&self) -> bool {
        self.slot().is_busy()
    }

    fn status(&self) -> TaskStatus {
        let base = self.lifecycle().status;
        if self.is_busy() {
            TaskStatus::Running
        } else {
            base
        }
    }

    /// Filter of a listening instance. `None` while paused.
    fn event_filter(&self) -> Option<String> {
        let lifecycle = self.lifecycle();
        match &lifecycle.binding {
            Some(Binding::Event { filter }) if !lifecycle.paused => Some(filter.clone()),
            _ => None,
        }
    }
}

/// Bus subscription shared by every instance listening on the same filter.
struct TopicSubscription {
    id: SubscriptionId,
    tasks: BTreeSet<String>,
}

struct Inner {
    tasks_dir: PathBuf,
    defaults: TaskDefaultsConfig,
    modules: Arc<ModuleRegistry>,
    bus: Arc<dyn MessageBus>,
    engine: Arc<TriggerEngine>,
    pool: WorkerPool,
    events: RuntimeEvents,
    instances: RwLock<BTreeMap<String, Arc<Instance>>>,
    topics: Mutex<HashMap<String, TopicSubscription>>,
    /// Serializes create/start/stop/delete/rename/update.
    manage: Mutex<()>,
    drivers: TaskTracker,
}

/// Owner of all task instances. Cheap to clone.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

impl TaskRegistry {
    /// Creates an empty registry rooted at `tasks_dir`.
    pub fn new(
        tasks_dir: impl Into<PathBuf>,
        defaults: TaskDefaultsConfig,
        modules: Arc<ModuleRegistry>,
        bus: Arc<dyn MessageBus>,
        engine: Arc<TriggerEngine>,
        pool: WorkerPool,
        events: RuntimeEvents,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks_dir: tasks_dir.into(),
                defaults,
                modules,
                bus,
                engine,
                pool,
                events,
                instances: RwLock::new(BTreeMap::new()),
                topics: Mutex::new(HashMap::new()),
                manage: Mutex::new(()),
                drivers: TaskTracker::new(),
            }),
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Root directory holding one sub-directory per instance.
    pub fn tasks_dir(&self) -> &Path {
        &self.inner.tasks_dir
    }

    /// Process-wide task defaults in effect.
    pub fn defaults(&self) -> &TaskDefaultsConfig {
        &self.inner.defaults
    }

    // ── management ────────────────────────────────────────────────────

    /// Creates an instance of `module_type` named `name`.
    ///
    /// Copies the template manifest, entry script, and assets into
    /// `tasks_dir/name/` and writes `config.toml`. The new instance is
    /// `Created` and unbound.
    ///
    /// # Errors
    ///
    /// - [`HubError::Validation`] for a bad name, a trigger of the wrong
    ///   kind, undeclared or mistyped static inputs, or a missing asset.
    /// - [`HubError::UnknownTemplate`] if `module_type` is not in the catalog.
    /// - [`HubError::DuplicateName`] if the name is taken.
    pub fn create(&self, module_type: &str, name: &str, options: TaskOptions) -> Result<()> {
        let _guard = self.manage();
        validate_task_name(name)?;
        let template =
            self.inner
                .modules
                .get(module_type)
                .ok_or_else(|| HubError::UnknownTemplate {
                    module_type: module_type.to_owned(),
                })?;
        let dir = self.inner.tasks_dir.join(name);
        if self.instance(name).is_some() || dir.exists() {
            return Err(HubError::DuplicateName {
                name: name.to_owned(),
            });
        }

        let config = TaskConfig::from_manifest(name, &template.manifest, options);
        config.validate_against(&template.manifest)?;

        std::fs::create_dir_all(&self.inner.tasks_dir)?;
        std::fs::create_dir(&dir)?;
        if let Err(e) = populate_instance_dir(&template.dir, &template.manifest, &config, &dir) {
            if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %cleanup, "cannot clean up partial task directory");
            }
            return Err(e);
        }

        let state = Arc::new(StateStore::open(&dir, config.persist_state));
        let instance = Instance::new(
            dir,
            template.manifest.clone(),
            config,
            state,
            TaskStatus::Created,
        );
        self.instances_mut()
            .insert(name.to_owned(), Arc::new(instance));
        self.emit_status(name, TaskStatus::Created);
        info!(task = %name, %module_type, "task created");
        Ok(())
    }

    /// Loads every instance directory under the tasks root.
    ///
    /// Broken instances are skipped, logged, and reported. Instances already
    /// in the registry are left alone. Loaded instances are `Configured`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the tasks root cannot be created or listed.
    pub fn load_tasks(&self) -> Result<LoadReport> {
        let _guard = self.manage();
        let mut report = LoadReport::default();
        let root = &self.inner.tasks_dir;
        if !root.is_dir() {
            std::fs::create_dir_all(root)?;
            return Ok(report);
        }

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && path.join(CONFIG_FILE).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            match self.load_instance(&dir) {
                Ok(instance) => {
                    let name = instance.name.clone();
                    if self.instance(&name).is_some() {
                        debug!(task = %name, "task already loaded");
                        continue;
                    }
                    self.instances_mut()
                        .insert(name.clone(), Arc::new(instance));
                    self.emit_status(&name, TaskStatus::Configured);
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping task");
                    report.skipped.push((dir, e.to_string()));
                }
            }
        }
        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "tasks loaded"
        );
        Ok(report)
    }

    /// Binds every enabled, unbound instance. Returns how many were bound.
    ///
    /// Failures are logged per instance and do not stop the others.
    pub fn start_enabled(&self) -> usize {
        let _guard = self.manage();
        let mut started = 0;
        for instance in self.instances_snapshot() {
            if !instance.config().enabled || instance.is_bound() {
                continue;
            }
            match self.bind(&instance) {
                Ok(_) => started += 1,
                Err(e) => error!(task = %instance.name, error = %e, "cannot start task"),
            }
        }
        started
    }

    /// Binds the instance to its trigger and marks it `enabled` in
    /// `config.toml`, so it is bound again after a restart.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownTask`] if no instance has this name.
    /// - [`HubError::AlreadyRunning`] if it is already bound.
    /// - Trigger engine or bus errors from binding.
    /// - Config write errors; the binding is undone in that case.
    pub fn start(&self, name: &str) -> Result<TaskStatus> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        let status = self.bind(&instance)?;
        if let Err(e) = self.persist_enabled(&instance, true) {
            self.unbind(&instance);
            return Err(e);
        }
        Ok(status)
    }

    /// Unbinds the instance and marks it disabled in `config.toml`.
    /// Idempotent.
    ///
    /// An execution already in flight runs to completion and its outcome is
    /// still reported; queued firings are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name, or a
    /// config write error.
    pub fn stop(&self, name: &str) -> Result<()> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        self.unbind(&instance);
        self.persist_enabled(&instance, false)
    }

    /// Suspends a bound instance without unbinding it. Idempotent.
    ///
    /// Schedule jobs keep their timer but skip fires; event instances stop
    /// receiving events. Manual runs still work. Pausing is not persisted,
    /// and re-binding (restart, rename, trigger change) clears it.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownTask`] if no instance has this name.
    /// - [`HubError::NotStarted`] if it is not bound.
    pub fn pause(&self, name: &str) -> Result<()> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        self.set_paused(&instance, true).map(|_| ())
    }

    /// Resumes a paused instance. Idempotent.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownTask`] if no instance has this name.
    /// - [`HubError::NotStarted`] if it is not bound.
    pub fn resume(&self, name: &str) -> Result<()> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        self.set_paused(&instance, false).map(|_| ())
    }

    /// Pauses every bound instance. Returns how many changed.
    pub fn pause_all(&self) -> usize {
        self.set_paused_all(true)
    }

    /// Resumes every paused instance. Returns how many changed.
    pub fn resume_all(&self) -> usize {
        self.set_paused_all(false)
    }

    /// Unbinds every instance.
    pub fn stop_all(&self) {
        let _guard = self.manage();
        for instance in self.instances_snapshot() {
            self.unbind(&instance);
        }
    }

    /// Stops and removes the instance and its directory.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownTask`] if no instance has this name.
    /// - [`HubError::AlreadyRunning`] while a body is executing.
    /// - An I/O error if the directory cannot be removed.
    pub fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        if instance.is_busy() {
            return Err(HubError::AlreadyRunning {
                name: name.to_owned(),
            });
        }
        self.unbind(&instance);
        self.instances_mut().remove(name);
        std::fs::remove_dir_all(&instance.dir)?;
        info!(task = %name, "task deleted");
        Ok(())
    }

    /// Renames an instance, moving its directory and re-binding it if it was bound.
    ///
    /// # Errors
    ///
    /// - [`HubError::Validation`] for a bad new name.
    /// - [`HubError::UnknownTask`] / [`HubError::DuplicateName`].
    /// - [`HubError::AlreadyRunning`] while a body is executing.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self.manage();
        validate_task_name(new)?;
        let instance = self.require(old)?;
        if old == new {
            return Ok(());
        }
        let new_dir = self.inner.tasks_dir.join(new);
        if self.instance(new).is_some() || new_dir.exists() {
            return Err(HubError::DuplicateName {
                name: new.to_owned(),
            });
        }
        if instance.is_busy() {
            return Err(HubError::AlreadyRunning {
                name: old.to_owned(),
            });
        }

        let was_bound = instance.is_bound();
        self.unbind(&instance);
        std::fs::rename(&instance.dir, &new_dir)?;
        let mut config = instance.config();
        config.name = new.to_owned();
        if let Err(e) = config.save(&new_dir) {
            if let Err(undo) = std::fs::rename(&new_dir, &instance.dir) {
                error!(task = %old, error = %undo, "cannot roll back task rename");
            }
            return Err(e);
        }
        instance.state.relocate(&new_dir);

        let renamed = Arc::new(Instance::new(
            new_dir,
            instance.manifest.clone(),
            config,
            Arc::clone(&instance.state),
            TaskStatus::Configured,
        ));
        {
            let mut instances = self.instances_mut();
            instances.remove(old);
            instances.insert(new.to_owned(), Arc::clone(&renamed));
        }
        info!(from = %old, to = %new, "task renamed");

        if was_bound {
            self.bind(&renamed)?;
        } else {
            self.emit_status(new, TaskStatus::Configured);
        }
        Ok(())
    }

    /// Applies `mutate` to the instance config, validates, persists, re-reads,
    /// and reconciles the binding.
    ///
    /// - bound and now disabled: unbound;
    /// - bound with a changed trigger: re-bound;
    /// - unbound and newly enabled: bound.
    ///
    /// # Errors
    ///
    /// - [`HubError::UnknownTask`] if no instance has this name.
    /// - [`HubError::Validation`] if the result is invalid, or `mutate`
    ///   changed `name` or `module_type`. Nothing is written in that case.
    pub fn update_config(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut TaskConfig),
    ) -> Result<TaskConfig> {
        let _guard = self.manage();
        let instance = self.require(name)?;
        let before = instance.config();
        let mut updated = before.clone();
        mutate(&mut updated);
        if updated.name != before.name {
            return Err(HubError::validation(
                "task name cannot be changed through update_config; use rename",
            ));
        }
        if updated.module_type != before.module_type {
            return Err(HubError::validation("module_type of a task cannot change"));
        }
        updated.validate_against(&instance.manifest)?;
        updated.save(&instance.dir)?;

        let reloaded = TaskConfig::load(&instance.dir)?;
        *instance.config.write().unwrap_or_else(|e| e.into_inner()) = reloaded.clone();
        instance.state.set_persist(reloaded.persist_state);
        info!(task = %name, "task config updated");

        if instance.is_bound() {
            if !reloaded.enabled {
                self.unbind(&instance);
            } else if reloaded.trigger != before.trigger {
                self.unbind(&instance);
                self.bind(&instance)?;
            }
        } else if reloaded.enabled && !before.enabled {
            self.bind(&instance)?;
        } else {
            let mut lifecycle = instance.lifecycle();
            self.set_status(&instance, &mut lifecycle, TaskStatus::Configured);
        }
        Ok(reloaded)
    }

    // ── triggers ──────────────────────────────────────────────────────

    /// Schedule entry point, called by the trigger engine.
    ///
    /// A firing while the previous run is still executing is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn on_trigger(&self, name: &str, inputs: &Payload) -> Result<DispatchOutcome> {
        let instance = self.require(name)?;
        if instance.is_paused() {
            return Ok(self.reject(
                name,
                TriggerSource::Schedule,
                RejectReason::Paused,
                &"task is paused",
            ));
        }
        Ok(self.dispatch(&instance, TriggerSource::Schedule, inputs, 0))
    }

    /// Event entry point: dispatches to every listening instance whose filter
    /// matches `topic`. Paused instances are not listening.
    ///
    /// The payload's `__hops` field is read as the hop count and removed
    /// before input resolution.
    pub fn on_event(&self, topic: &str, payload: &Payload) -> Vec<(String, DispatchOutcome)> {
        let hops = hop_count(payload);
        let payload = without_hops(payload);
        let targets: Vec<Arc<Instance>> = self
            .instances_snapshot()
            .into_iter()
            .filter(|instance| {
                instance
                    .event_filter()
                    .is_some_and(|filter| crate::bus::topic_matches(&filter, topic))
            })
            .collect();
        debug!(%topic, hop_count = hops, targets = targets.len(), "event received");
        targets
            .iter()
            .map(|instance| {
                let outcome = self.dispatch(instance, TriggerSource::Event, &payload, hops);
                (instance.name.clone(), outcome)
            })
            .collect()
    }

    /// Runs the instance once now, bound or not.
    ///
    /// Uses the same input resolution and busy policy as an event firing,
    /// without the hop guard.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn run_now(&self, name: &str, inputs: &Payload) -> Result<DispatchOutcome> {
        let instance = self.require(name)?;
        let inputs = without_hops(inputs);
        Ok(self.dispatch(&instance, TriggerSource::Manual, &inputs, 0))
    }

    // ── queries ───────────────────────────────────────────────────────

    /// Current status, `Running` while a body executes.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn status(&self, name: &str) -> Result<TaskStatus> {
        Ok(self.require(name)?.status())
    }

    /// Current config of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn config(&self, name: &str) -> Result<TaskConfig> {
        Ok(self.require(name)?.config())
    }

    /// Snapshot of an instance's state.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn state(&self, name: &str) -> Result<Payload> {
        Ok(self.require(name)?.state.snapshot())
    }

    /// All instances, ordered by name.
    pub fn list(&self) -> Vec<TaskSummary> {
        self.instances_snapshot()
            .iter()
            .map(|instance| {
                let config = instance.config();
                TaskSummary {
                    name: instance.name.clone(),
                    module_type: config.module_type,
                    status: instance.status(),
                    enabled: config.enabled,
                    trigger: config.trigger.kind(),
                }
            })
            .collect()
    }

    /// Instance names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Number of instances with a body executing.
    pub fn running_count(&self) -> usize {
        self.instances_snapshot()
            .iter()
            .filter(|instance| instance.is_busy())
            .count()
    }

    /// Number of firings waiting behind the running execution.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTask`] if no instance has this name.
    pub fn backlog(&self, name: &str) -> Result<usize> {
        Ok(self.require(name)?.slot().backlog_len())
    }

    /// Next scheduled fire time of a schedule-bound instance.
    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.inner.engine.next_run(name)
    }

    /// Unbinds everything and waits for in-flight executions to finish.
    pub async fn shutdown(&self) {
        self.stop_all();
        self.inner.drivers.close();
        self.inner.drivers.wait().await;
        info!("task registry shut down");
    }

    // ── internals ─────────────────────────────────────────────────────

    fn load_instance(&self, dir: &Path) -> Result<Instance> {
        let config = TaskConfig::load(dir)?;
        let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if config.name != dir_name {
            return Err(HubError::Validation {
                reason: format!(
                    "config name `{}` does not match directory `{dir_name}`",
                    config.name
                ),
            });
        }
        let manifest = if dir.join(MANIFEST_FILE).is_file() {
            ModuleManifest::load_from_dir(dir)?
        } else {
            self.inner
                .modules
                .get(&config.module_type)
                .map(|template| template.manifest.clone())
                .ok_or_else(|| HubError::UnknownTemplate {
                    module_type: config.module_type.clone(),
                })?
        };
        config.validate_against(&manifest)?;
        let state = Arc::new(StateStore::open(dir, config.persist_state));
        Ok(Instance::new(
            dir.to_path_buf(),
            manifest,
            config,
            state,
            TaskStatus::Configured,
        ))
    }

    fn bind(&self, instance: &Arc<Instance>) -> Result<TaskStatus> {
        let mut lifecycle = instance.lifecycle();
        if lifecycle.binding.is_some() {
            return Err(HubError::AlreadyRunning {
                name: instance.name.clone(),
            });
        }
        let config = instance.config();
        let (binding, status) = match &config.trigger {
            TriggerBinding::Schedule(spec) => {
                let weak = Arc::downgrade(&self.inner);
                let name = instance.name.clone();
                self.inner.engine.add_job(
                    &instance.name,
                    spec,
                    Arc::new(move || {
                        if let Some(registry) = TaskRegistry::upgrade(&weak)
                            && let Err(e) = registry.on_trigger(&name, &Payload::new())
                        {
                            debug!(task = %name, error = %e, "schedule fired for a removed task");
                        }
                    }),
                )?;
                (Binding::Schedule, TaskStatus::Scheduled)
            }
            TriggerBinding::Event(spec) => {
                self.subscribe_topic(&spec.topic, &instance.name)?;
                (
                    Binding::Event {
                        filter: spec.topic.clone(),
                    },
                    TaskStatus::Listening,
                )
            }
        };
        lifecycle.binding = Some(binding);
        self.set_status(instance, &mut lifecycle, status);
        info!(task = %instance.name, trigger = %config.trigger.kind(), "task started");
        Ok(status)
    }

    fn unbind(&self, instance: &Arc<Instance>) {
        let mut lifecycle = instance.lifecycle();
        lifecycle.paused = false;
        match lifecycle.binding.take() {
            Some(Binding::Schedule) => {
                self.inner.engine.remove_job(&instance.name);
            }
            Some(Binding::Event { filter }) => self.unsubscribe_topic(&filter, &instance.name),
            None => {}
        }
        let dropped = instance.slot().clear_backlog();
        if dropped > 0 {
            info!(task = %instance.name, dropped, "discarded queued firings");
        }
        if lifecycle.status != TaskStatus::Stopped {
            self.set_status(instance, &mut lifecycle, TaskStatus::Stopped);
            info!(task = %instance.name, "task stopped");
        }
    }

    /// Returns whether the pause state changed.
    fn set_paused(&self, instance: &Arc<Instance>, paused: bool) -> Result<bool> {
        let mut lifecycle = instance.lifecycle();
        let Some(binding) = &lifecycle.binding else {
            return Err(HubError::NotStarted {
                name: instance.name.clone(),
            });
        };
        if lifecycle.paused == paused {
            return Ok(false);
        }
        let bound_status = match binding {
            Binding::Schedule => {
                if paused {
                    self.inner.engine.pause_job(&instance.name)?;
                } else {
                    self.inner.engine.resume_job(&instance.name)?;
                }
                TaskStatus::Scheduled
            }
            Binding::Event { .. } => TaskStatus::Listening,
        };
        lifecycle.paused = paused;
        let status = if paused { TaskStatus::Paused } else { bound_status };
        self.set_status(instance, &mut lifecycle, status);
        if paused {
            info!(task = %instance.name, "task paused");
        } else {
            info!(task = %instance.name, "task resumed");
        }
        Ok(true)
    }

    fn set_paused_all(&self, paused: bool) -> usize {
        let _guard = self.manage();
        let mut changed = 0;
        for instance in self.instances_snapshot() {
            if !instance.is_bound() {
                continue;
            }
            match self.set_paused(&instance, paused) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(task = %instance.name, paused, error = %e, "cannot change pause state"),
            }
        }
        changed
    }

    /// Writes `enabled` through the same save-and-reread path as
    /// [`update_config`](Self::update_config).
    fn persist_enabled(&self, instance: &Instance, enabled: bool) -> Result<()> {
        let mut config = instance.config();
        if config.enabled == enabled {
            return Ok(());
        }
        config.enabled = enabled;
        config.save(&instance.dir)?;
        let reloaded = TaskConfig::load(&instance.dir)?;
        *instance.config.write().unwrap_or_else(|e| e.into_inner()) = reloaded;
        debug!(task = %instance.name, enabled, "task enabled flag saved");
        Ok(())
    }

    fn subscribe_topic(&self, filter: &str, task: &str) -> Result<()> {
        let mut topics = self.topics();
        if let Some(subscription) = topics.get_mut(filter) {
            subscription.tasks.insert(task.to_owned());
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let key = filter.to_owned();
        let handler: MessageHandler = Arc::new(move |topic: &str, payload: &Payload| {
            if let Some(registry) = TaskRegistry::upgrade(&weak) {
                registry.deliver(&key, topic, payload);
            }
        });
        let id = self.inner.bus.subscribe(filter, handler)?;
        topics.insert(
            filter.to_owned(),
            TopicSubscription {
                id,
                tasks: BTreeSet::from([task.to_owned()]),
            },
        );
        debug!(%filter, "bus subscription added");
        Ok(())
    }

    fn unsubscribe_topic(&self, filter: &str, task: &str) {
        let mut topics = self.topics();
        let Some(subscription) = topics.get_mut(filter) else {
            return;
        };
        subscription.tasks.remove(task);
        if subscription.tasks.is_empty()
            && let Some(subscription) = topics.remove(filter)
        {
            self.inner.bus.unsubscribe(subscription.id);
            debug!(%filter, "bus subscription removed");
        }
    }

    /// Bus callback for one shared subscription.
    fn deliver(&self, filter: &str, topic: &str, payload: &Payload) {
        let names: Vec<String> = self
            .topics()
            .get(filter)
            .map(|subscription| subscription.tasks.iter().cloned().collect())
            .unwrap_or_default();
        if names.is_empty() {
            return;
        }
        let hops = hop_count(payload);
        let payload = without_hops(payload);
        debug!(%topic, %filter, hop_count = hops, targets = names.len(), "event received");
        for name in names {
            let Some(instance) = self.instance(&name) else {
                continue;
            };
            if instance.event_filter().as_deref() == Some(filter) {
                self.dispatch(&instance, TriggerSource::Event, &payload, hops);
            }
        }
    }

    fn dispatch(
        &self,
        instance: &Arc<Instance>,
        source: TriggerSource,
        payload: &Payload,
        hops: u32,
    ) -> DispatchOutcome {
        let name = instance.name.as_str();
        let config = instance.config();

        let inputs = match instance.manifest.inputs.resolve(name, payload, &config.inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                let reason = if matches!(e, HubError::MissingRequiredInput { .. }) {
                    RejectReason::MissingInput
                } else {
                    RejectReason::InvalidInput
                };
                return self.reject(name, source, reason, &e);
            }
        };

        if source == TriggerSource::Event {
            let max_hops = match &config.trigger {
                TriggerBinding::Event(spec) => spec.max_hops,
                TriggerBinding::Schedule(_) => None,
            }
            .unwrap_or(self.inner.defaults.event_max_hops);
            if hops > max_hops {
                let e = HubError::HopLimitExceeded {
                    task: name.to_owned(),
                    hop_count: hops,
                    max_hops,
                };
                return self.reject(name, source, RejectReason::HopLimit, &e);
            }
        }

        let queue_capacity = match source {
            TriggerSource::Schedule => None,
            TriggerSource::Event | TriggerSource::Manual => {
                match config
                    .busy_policy
                    .unwrap_or(self.inner.defaults.event_busy_policy)
                {
                    BusyPolicy::Drop => None,
                    BusyPolicy::Queue { capacity } => Some(capacity),
                }
            }
        };
        let dispatch = Dispatch {
            source,
            inputs,
            hop_count: hops,
        };
        let admission = instance.slot().admit(dispatch, queue_capacity);
        match admission {
            Admission::Run(dispatch) => {
                self.spawn_driver(Arc::clone(instance), dispatch);
                DispatchOutcome::Started
            }
            Admission::Queued(depth) => {
                info!(task = %name, %source, depth, "task busy, firing queued");
                DispatchOutcome::Queued { depth }
            }
            Admission::Rejected(reason) => {
                let detail = match reason {
                    RejectReason::BacklogFull => "previous run still in progress and backlog is full",
                    _ => "previous run still in progress",
                };
                self.reject(name, source, reason, &detail)
            }
        }
    }

    fn reject(
        &self,
        task: &str,
        source: TriggerSource,
        reason: RejectReason,
        detail: &dyn std::fmt::Display,
    ) -> DispatchOutcome {
        match reason {
            RejectReason::Busy | RejectReason::BacklogFull => {
                warn!(%task, %source, ?reason, "{detail}, skipping");
            }
            RejectReason::MissingInput | RejectReason::InvalidInput | RejectReason::HopLimit => {
                error!(%task, %source, ?reason, error = %detail, "dispatch aborted");
            }
            RejectReason::Paused => debug!(%task, %source, "{detail}, skipping"),
        }
        self.emit(RuntimeEvent::TaskRejected {
            task: task.to_owned(),
            reason,
            detail: detail.to_string(),
        });
        DispatchOutcome::Rejected(reason)
    }

    fn spawn_driver(&self, instance: Arc<Instance>, first: Dispatch) {
        let registry = self.clone();
        let driver = self
            .inner
            .drivers
            .track_future(async move { registry.drive(instance, first).await });
        // Detached; `shutdown` waits on the tracker.
        drop(self.inner.pool.spawn(driver));
    }

    /// Runs `first`, then every queued firing, while holding the busy slot.
    async fn drive(self, instance: Arc<Instance>, first: Dispatch) {
        let mut next = Some(first);
        while let Some(dispatch) = next {
            self.emit_status(&instance.name, TaskStatus::Running);
            self.execute(&instance, dispatch).await;
            next = instance.slot().finish();
        }
        self.emit_status(&instance.name, instance.status());
    }

    async fn execute(&self, instance: &Arc<Instance>, dispatch: Dispatch) {
        let name = instance.name.clone();
        let config = instance.config();
        let total = config.retry.attempts();

        let body = match self
            .inner
            .modules
            .resolve_body(&instance.manifest, &instance.dir)
        {
            Ok(body) => body,
            Err(e) => {
                error!(task = %name, error = %e, "cannot resolve task body");
                self.emit(RuntimeEvent::TaskFailed {
                    task: name,
                    attempts: 0,
                    error: e.to_string(),
                });
                return;
            }
        };

        let source = dispatch.source;
        let hops = dispatch.hop_count;
        let inputs = Arc::new(dispatch.inputs);
        for attempt in 1..=total {
            let ctx = TaskContext::new(
                &name,
                &instance.dir,
                config.settings.clone(),
                hops,
                attempt,
                total,
                TaskLogger::new(&name, self.inner.events.clone()),
                Arc::clone(&self.inner.bus),
                Arc::clone(&instance.state),
            );
            let job_body = Arc::clone(&body);
            let job_inputs = Arc::clone(&inputs);
            let started = Instant::now();
            debug!(task = %name, %source, attempt, total, "executing task body");

            let outcome = self
                .inner
                .pool
                .run(move || job_body.execute(&ctx, &job_inputs))
                .await;
            let error = match outcome {
                Ok(Ok(())) => {
                    let duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    info!(task = %name, %source, attempt, duration_ms, "task succeeded");
                    self.emit(RuntimeEvent::TaskSucceeded {
                        task: name,
                        attempt,
                        duration_ms,
                    });
                    return;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => e.to_string(),
            };

            if attempt < total {
                let delay = config.retry.delay_after(attempt);
                warn!(
                    task = %name,
                    attempt,
                    total,
                    retry_in_secs = delay.as_secs_f64(),
                    %error,
                    "task attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                error!(task = %name, attempts = total, %error, "task failed");
                self.emit(RuntimeEvent::TaskFailed {
                    task: name.clone(),
                    attempts: total,
                    error,
                });
            }
        }
    }

    fn set_status(&self, instance: &Instance, lifecycle: &mut Lifecycle, status: TaskStatus) {
        if lifecycle.status != status {
            lifecycle.status = status;
            self.emit_status(&instance.name, status);
        }
    }

    fn emit_status(&self, task: &str, status: TaskStatus) {
        self.emit(RuntimeEvent::TaskStatusChanged {
            task: task.to_owned(),
            status,
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        self.inner.events.emit(event);
    }

    fn require(&self, name: &str) -> Result<Arc<Instance>> {
        self.instance(name).ok_or_else(|| HubError::UnknownTask {
            name: name.to_owned(),
        })
    }

    fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        self.inner
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn instances_snapshot(&self) -> Vec<Arc<Instance>> {
        self.inner
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn instances_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Instance>>> {
        self.inner
            .instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicSubscription>> {
        self.inner.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn manage(&self) -> MutexGuard<'_, ()> {
        self.inner.manage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn without_hops(payload: &Payload) -> Payload {
    let mut clean = payload.clone();
    clean.remove(HOPS_FIELD);
    clean
}

/// Copies the manifest, entry, and assets of a template and writes the config.
fn populate_instance_dir(
    template_dir: &Path,
    manifest: &ModuleManifest,
    config: &TaskConfig,
    dir: &Path,
) -> Result<()> {
    std::fs::copy(template_dir.join(MANIFEST_FILE), dir.join(MANIFEST_FILE))?;
    for raw in manifest.files_to_copy() {
        let relative = safe_relative_path(raw)?;
        let source = template_dir.join(&relative);
        let target = dir.join(&relative);
        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else if source.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
        } else {
            return Err(HubError::Validation {
                reason: format!(
                    "asset `{raw}` not found in template {}",
                    template_dir.display()
                ),
            });
        }
    }
    config.save(dir)
}

/// Recursive copy. Symlinks are skipped so a template cannot pull in files
/// from outside its root.
fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let to = target.join(entry.file_name());
        if kind.is_dir() {
            copy_dir(&entry.path(), &to)?;
        } else if kind.is_file() {
            std::fs::copy(entry.path(), &to)?;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular asset");
        }
    }
    Ok(())
}
