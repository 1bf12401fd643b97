//! Job scheduling
//!
//! Every interpreter instance owns one scheduler. Interpreters that are not
//! safe to run concurrently get a [`FifoScheduler`] (one worker, strict
//! submission order); the rest get a [`ParallelScheduler`] bounded by their
//! declared width.

pub mod fifo;
pub mod job;
pub mod parallel;

pub use fifo::FifoScheduler;
pub use job::{Job, JobBody, JobListener, JobStatus, UNKNOWN_STATUS};
pub use parallel::ParallelScheduler;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::Result;

/// How an interpreter wants its jobs run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "width", rename_all = "snake_case")]
pub enum SchedulingPolicy {
    Fifo,
    Parallel(usize),
}

/// A queue of jobs with an execution policy
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Queue a `READY` job; it becomes `PENDING` before this returns.
    fn submit(&self, job: Arc<Job>) -> Result<()>;

    /// A queued or running job by id
    fn get_job(&self, id: &str) -> Option<Arc<Job>>;

    /// Queued and running jobs, in submission order
    fn jobs(&self) -> Vec<Arc<Job>>;

    /// Refuse new jobs and abort everything still pending. Running jobs
    /// finish on their own.
    fn stop(&self);
}

/// Build the scheduler an interpreter asked for.
pub fn create_scheduler(name: impl Into<String>, policy: SchedulingPolicy) -> Arc<dyn Scheduler> {
    let name = name.into();
    tracing::debug!("Creating {:?} scheduler {}", policy, name);
    match policy {
        SchedulingPolicy::Fifo => Arc::new(FifoScheduler::new(name)),
        SchedulingPolicy::Parallel(width) => Arc::new(ParallelScheduler::new(name, width)),
    }
}

/// Jobs a scheduler has accepted and not yet retired
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: Mutex<Vec<Arc<Job>>>,
}

impl JobTable {
    pub(crate) fn push(&self, job: Arc<Job>) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
    }

    pub(crate) fn retire(&self, job: &Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.retain(|j| !std::ptr::eq(Arc::as_ptr(j), job));
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.iter().find(|j| j.id() == id).cloned())
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    /// Abort every job still waiting for a worker.
    pub(crate) fn abort_pending(&self) -> usize {
        let pending: Vec<Arc<Job>> = self
            .snapshot()
            .into_iter()
            .filter(|j| j.status() == JobStatus::Pending)
            .collect();
        for job in &pending {
            job.abort();
        }
        pending.len()
    }
}
