//! Named background services (e.g. the embedded message broker).
//!
//! A [`Service`] brings itself up in [`Service::start`] and hands back the
//! join handle of its background work. The [`ServiceRegistry`] supervises
//! that handle, tracks [`ServiceState`], and broadcasts every transition as
//! [`RuntimeEvent::ServiceStateChanged`](crate::runtime::RuntimeEvent).

pub mod registry;

pub use registry::ServiceRegistry;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceState {
    /// Whether the service is up or coming up.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// A background service managed by the [`ServiceRegistry`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Brings the service up and returns once it is ready for clients.
    ///
    /// The returned handle completes when the background work has exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot become ready (e.g. the port is taken).
    async fn start(&self) -> Result<JoinHandle<()>>;

    /// Signals the background work to exit. Must not wait for it.
    async fn stop(&self);

    /// Whether the background work is currently running.
    fn is_running(&self) -> bool;

    /// Address clients should connect to, once running.
    fn endpoint(&self) -> Option<SocketAddr> {
        None
    }
}
