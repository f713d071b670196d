//! Module templates and task bodies.
//!
//! The [`ModuleRegistry`] holds the catalog of templates discovered on disk.
//! The code that runs when a task fires is a [`TaskBody`], looked up by
//! `module_type` and handed out as an opaque [`TaskHandle`]. Bodies
//! registered in-process take precedence; otherwise the instance's copied
//! entry script runs as a [`ScriptBody`].

pub mod registry;
pub mod script;

pub use registry::{DiscoveryReport, ModuleRegistry, ModuleTemplate};
pub use script::ScriptBody;

use crate::manifest::Inputs;
use crate::tasks::TaskContext;
use std::sync::Arc;

/// Code executed for each run of a task instance.
///
/// Runs on a worker thread and may block. Errors and panics are caught by
/// the task registry.
pub trait TaskBody: Send + Sync {
    /// Executes one run.
    ///
    /// # Errors
    ///
    /// Any error marks the attempt as failed and is retried per the
    /// instance's retry policy.
    fn execute(&self, ctx: &TaskContext, inputs: &Inputs) -> anyhow::Result<()>;
}

impl<F> TaskBody for F
where
    F: Fn(&TaskContext, &Inputs) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext, inputs: &Inputs) -> anyhow::Result<()> {
        self(ctx, inputs)
    }
}

/// Shared handle to a [`TaskBody`].
pub type TaskHandle = Arc<dyn TaskBody>;
