//! Bounded pool for running task bodies.
//!
//! Task bodies are synchronous and may block (file I/O, child processes), so
//! each one runs on tokio's blocking thread pool behind a semaphore that caps
//! how many execute at once.

use crate::error::{HubError, Result};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Bounded executor shared by all task instances.
#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `max_workers` jobs at once (minimum 1).
    pub fn new(max_workers: usize, runtime: Handle) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers)),
            active: Arc::new(AtomicUsize::new(0)),
            max_workers,
        }
    }

    /// Runs a blocking job once a worker is free and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Worker`] if the pool is closed or the job panics.
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| HubError::Worker {
                reason: "worker pool is closed".to_owned(),
            })?;
        let active = Arc::clone(&self.active);
        let running = active.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(running, max = self.max_workers, "worker acquired");

        let outcome = self
            .runtime
            .spawn_blocking(move || {
                let _permit = permit;
                let result = job();
                active.fetch_sub(1, Ordering::AcqRel);
                result
            })
            .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_panic() {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    let reason = panic_message(e.into_panic());
                    error!(%reason, "task body panicked");
                    Err(HubError::Worker {
                        reason: format!("task body panicked: {reason}"),
                    })
                } else {
                    Err(HubError::Worker {
                        reason: "worker was cancelled".to_owned(),
                    })
                }
            }
        }
    }

    /// Spawns async bookkeeping on the pool's runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Configured concurrency limit.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Refuses new jobs. Jobs already running finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
