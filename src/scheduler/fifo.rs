//! Serialized scheduler - one worker, strict submission order

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Job, JobTable, Scheduler};
use crate::{AtelierError, Result};

/// Runs jobs one at a time in the order they were submitted.
///
/// Must be created inside a tokio runtime; the worker task lives until the
/// scheduler is stopped (or dropped) and the queue has drained.
pub struct FifoScheduler {
    name: String,
    queue: Mutex<Option<mpsc::UnboundedSender<Arc<Job>>>>,
    jobs: Arc<JobTable>,
}

impl FifoScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Job>>();
        let jobs = Arc::new(JobTable::default());

        let worker_jobs = jobs.clone();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                tracing::debug!(scheduler = %worker_name, job = %job.id(), "Starting job");
                // Aborted while queued: run() leaves it alone
                job.run().await;
                worker_jobs.retire(&job);
            }
            tracing::debug!(scheduler = %worker_name, "FIFO worker exiting");
        });

        Self {
            name,
            queue: Mutex::new(Some(tx)),
            jobs,
        }
    }
}

impl Scheduler for FifoScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Arc<Job>) -> Result<()> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| AtelierError::Scheduler(format!("{} queue poisoned", self.name)))?;
        let Some(tx) = queue.as_ref() else {
            return Err(AtelierError::Scheduler(format!("{} is stopped", self.name)));
        };
        if !job.mark_pending() {
            return Err(AtelierError::Scheduler(format!(
                "job {} is {}, not READY",
                job.id(),
                job.status()
            )));
        }

        self.jobs.push(job.clone());
        if tx.send(job.clone()).is_err() {
            self.jobs.retire(&job);
            job.abort();
            return Err(AtelierError::Scheduler(format!("{} worker is gone", self.name)));
        }
        Ok(())
    }

    fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.get(id)
    }

    fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.snapshot()
    }

    fn stop(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
        let aborted = self.jobs.abort_pending();
        tracing::info!("Stopped scheduler {} ({} pending jobs aborted)", self.name, aborted);
    }
}
