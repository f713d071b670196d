//! taskhub: task orchestration and event routing for a desktop automation hub.
//!
//! Task instances are created from module templates on disk and bound to a
//! trigger: a schedule (cron, interval, or one-shot date) or a message bus
//! topic. Every firing goes through input validation, a hop guard against
//! event loops, and a busy guard against overlapping runs before the body
//! executes on a bounded worker pool.
//!
//! # Architecture
//!
//! - **Services**: named background services with observable state; the
//!   embedded message broker is one of them.
//! - **Bus**: publish/subscribe client whose connect is gated on the
//!   broker reaching `Running`.
//! - **Modules**: template catalog discovered from `manifest.toml` files.
//! - **Scheduler**: timers for schedule triggers, with misfire skipping.
//! - **Tasks**: instance lifecycle, dispatch, retries, and per-task state.
//! - **Hub**: wires the above together in dependency order.

pub mod bus;
pub mod config;
pub mod error;
pub mod hub;
pub mod hub_dirs;
pub mod manifest;
pub mod modules;
pub mod runtime;
pub mod scheduler;
pub mod services;
pub mod tasks;
pub mod worker_pool;

pub use bus::{MessageBus, Payload};
pub use config::HubConfig;
pub use error::{HubError, Result};
pub use hub::TaskHub;
pub use manifest::ModuleManifest;
pub use modules::{TaskBody, TaskHandle};
pub use runtime::{RuntimeEvent, RuntimeEvents};
pub use tasks::{TaskContext, TaskRegistry, TaskStatus};
