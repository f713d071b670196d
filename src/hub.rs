//! Top-level wiring of the hub.
//!
//! [`TaskHub`] owns one instance of every component and brings them up in
//! dependency order:
//!
//! 1. runtime event channel and service registry;
//! 2. embedded broker registration (embedded mode only);
//! 3. message bus connection, gated on the broker;
//! 4. module discovery;
//! 5. trigger engine and worker pool;
//! 6. task registry: load instances, then bind the enabled ones.
//!
//! Shutdown runs the same steps in reverse.

use crate::bus::{EmbeddedBroker, InMemoryBus, MessageBus, MessageBusClient};
use crate::config::{BrokerMode, HubConfig};
use crate::error::Result;
use crate::modules::{DiscoveryReport, ModuleRegistry};
use crate::runtime::{RuntimeEvent, RuntimeEvents};
use crate::scheduler::TriggerEngine;
use crate::services::ServiceRegistry;
use crate::tasks::{LoadReport, TaskRegistry};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::info;

/// A running hub.
pub struct TaskHub {
    config: HubConfig,
    events: RuntimeEvents,
    services: Arc<ServiceRegistry>,
    bus: Arc<dyn MessageBus>,
    bus_client: Option<Arc<MessageBusClient>>,
    modules: Arc<ModuleRegistry>,
    engine: Arc<TriggerEngine>,
    pool: WorkerPool,
    tasks: TaskRegistry,
    discovery: DiscoveryReport,
    load: LoadReport,
}

impl TaskHub {
    /// Starts the hub with a networked message bus.
    ///
    /// In embedded mode the broker is registered under
    /// `message_bus.broker_service` and started by the bus client's connect.
    ///
    /// # Errors
    ///
    /// - [`HubError::Config`](crate::HubError::Config) for an invalid config.
    /// - [`HubError::BrokerNotReady`](crate::HubError::BrokerNotReady) if the
    ///   embedded broker does not come up.
    /// - [`HubError::Bus`](crate::HubError::Bus) if the broker cannot be reached.
    /// - I/O errors from module discovery or task loading.
    pub async fn start(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let events = RuntimeEvents::new();
        let services = Arc::new(ServiceRegistry::new(events.clone()));

        if config.message_bus.mode == BrokerMode::Embedded {
            let broker = EmbeddedBroker::new(config.message_bus.address());
            services
                .register(&config.message_bus.broker_service, Arc::new(broker))
                .await;
        }

        let client = Arc::new(MessageBusClient::new(
            config.message_bus.clone(),
            Arc::clone(&services),
        ));
        client.connect().await?;
        let bus: Arc<dyn MessageBus> = Arc::clone(&client) as Arc<dyn MessageBus>;
        Self::assemble(config, events, services, bus, Some(client))
    }

    /// Starts the hub with an in-process bus and no broker.
    ///
    /// Events published by tasks only reach tasks of this hub.
    ///
    /// # Errors
    ///
    /// Same as [`TaskHub::start`], minus the bus errors.
    pub async fn offline(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let events = RuntimeEvents::new();
        let services = Arc::new(ServiceRegistry::new(events.clone()));
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(events.clone()));
        Self::assemble(config, events, services, bus, None)
    }

    fn assemble(
        config: HubConfig,
        events: RuntimeEvents,
        services: Arc<ServiceRegistry>,
        bus: Arc<dyn MessageBus>,
        bus_client: Option<Arc<MessageBusClient>>,
    ) -> Result<Self> {
        let modules = Arc::new(ModuleRegistry::new(config.paths.modules_dir()));
        let discovery = modules.discover()?;

        let runtime = Handle::current();
        let engine = Arc::new(TriggerEngine::new(runtime.clone()));
        let pool = WorkerPool::new(config.worker_pool.max_workers, runtime);

        let tasks = TaskRegistry::new(
            config.paths.tasks_dir(),
            config.task_defaults.clone(),
            Arc::clone(&modules),
            Arc::clone(&bus),
            Arc::clone(&engine),
            pool.clone(),
            events.clone(),
        );
        let load = tasks.load_tasks()?;
        let started = if config.task_defaults.autostart {
            tasks.start_enabled()
        } else {
            0
        };
        info!(
            modules = discovery.loaded.len(),
            tasks = load.loaded.len(),
            started,
            workers = config.worker_pool.max_workers,
            "task hub ready"
        );

        Ok(Self {
            config,
            events,
            services,
            bus,
            bus_client,
            modules,
            engine,
            pool,
            tasks,
            discovery,
            load,
        })
    }

    /// Stops tasks, waits for running bodies, then tears down the bus and services.
    pub async fn shutdown(&self) {
        info!("shutting down task hub");
        self.tasks.shutdown().await;
        self.engine.shutdown();
        self.pool.close();
        if let Some(client) = &self.bus_client {
            client.disconnect().await;
        }
        self.services.stop_all().await;
        info!("task hub stopped");
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// The bus the task registry publishes and subscribes through.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// The networked client, when started with [`TaskHub::start`].
    pub fn bus_client(&self) -> Option<&Arc<MessageBusClient>> {
        self.bus_client.as_ref()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Module discovery outcome from startup.
    pub fn discovery(&self) -> &DiscoveryReport {
        &self.discovery
    }

    /// Task loading outcome from startup.
    pub fn load_report(&self) -> &LoadReport {
        &self.load
    }

    /// Receiver for every runtime event emitted from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}
