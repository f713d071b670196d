//! Trigger engine: one timer task per scheduled job.

use super::Schedule;
use crate::error::{HubError, Result};
use crate::manifest::ScheduleSpec;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs that start more than this late are skipped.
pub const MISFIRE_GRACE: Duration = Duration::from_secs(60);

/// Called on every fire. Must return quickly; long work belongs on the worker pool.
pub type JobCallback = Arc<dyn Fn() + Send + Sync>;

/// State shared between a job entry and its timer task.
struct JobShared {
    paused: AtomicBool,
    next_run: Mutex<Option<DateTime<Utc>>>,
}

struct Job {
    token: CancellationToken,
    shared: Arc<JobShared>,
}

/// Schedules callbacks from [`ScheduleSpec`]s.
pub struct TriggerEngine {
    runtime: Handle,
    jobs: Mutex<HashMap<String, Job>>,
    shutdown: CancellationToken,
}

impl TriggerEngine {
    /// Creates an engine whose timers run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Adds a job, replacing any job with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for an invalid schedule and
    /// [`HubError::Scheduler`] after [`shutdown`](Self::shutdown).
    pub fn add_job(&self, id: &str, spec: &ScheduleSpec, callback: JobCallback) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Scheduler(format!(
                "cannot schedule `{id}`: engine is shut down"
            )));
        }
        let schedule = Schedule::compile(spec)?;
        let shared = Arc::new(JobShared {
            paused: AtomicBool::new(false),
            next_run: Mutex::new(schedule.next_after(Utc::now())),
        });
        let token = self.shutdown.child_token();

        let mut jobs = self.jobs();
        if let Some(old) = jobs.remove(id) {
            old.token.cancel();
        }
        self.runtime.spawn(run_job(
            id.to_owned(),
            schedule,
            callback,
            Arc::clone(&shared),
            token.clone(),
        ));
        jobs.insert(id.to_owned(), Job { token, shared });
        info!(job = %id, schedule = %spec, "job scheduled");
        Ok(())
    }

    /// Removes a job. Returns whether it existed.
    pub fn remove_job(&self, id: &str) -> bool {
        match self.jobs().remove(id) {
            Some(job) => {
                job.token.cancel();
                debug!(job = %id, "job removed");
                true
            }
            None => false,
        }
    }

    /// Stops firing a job without forgetting it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Scheduler`] if no job has this id.
    pub fn pause_job(&self, id: &str) -> Result<()> {
        self.set_paused(id, true)
    }

    /// Resumes a paused job.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Scheduler`] if no job has this id.
    pub fn resume_job(&self, id: &str) -> Result<()> {
        self.set_paused(id, false)
    }

    /// Next planned fire time, if the job exists and is not exhausted.
    pub fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        let jobs = self.jobs();
        let job = jobs.get(id)?;
        let next = *job.shared.next_run.lock().unwrap_or_else(|e| e.into_inner());
        next
    }

    /// Cancels every job and refuses new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let jobs: Vec<Job> = self.jobs().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.token.cancel();
        }
        info!(jobs = jobs.len(), "trigger engine shut down");
    }

    fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
        let jobs = self.jobs();
        let job = jobs.get(id).ok_or_else(|| unknown_job(id))?;
        job.shared.paused.store(paused, Ordering::Release);
        debug!(job = %id, paused, "job pause state changed");
        Ok(())
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TriggerEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn unknown_job(id: &str) -> HubError {
    HubError::Scheduler(format!("no job `{id}`"))
}

/// Whether a fire planned for `planned` is too late to run at `now`.
fn is_misfire(planned: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    (now - planned).to_std().is_ok_and(|late| late > grace)
}

async fn run_job(
    id: String,
    schedule: Schedule,
    callback: JobCallback,
    shared: Arc<JobShared>,
    token: CancellationToken,
) {
    let mut next = *shared.next_run.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        *shared.next_run.lock().unwrap_or_else(|e| e.into_inner()) = next;
        let Some(planned) = next else {
            debug!(job = %id, "schedule exhausted");
            break;
        };
        let wait = (planned - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let now = Utc::now();
        if is_misfire(planned, now, MISFIRE_GRACE) {
            warn!(job = %id, planned = %planned, "run missed its grace period, skipping");
            next = schedule.next_after(now);
            continue;
        }
        if shared.paused.load(Ordering::Acquire) {
            debug!(job = %id, "job paused, skipping run");
        } else {
            callback();
        }
        next = schedule.next_after(planned);
    }
}
