//! Bounded-parallel scheduler

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

use super::{Job, JobTable, Scheduler};
use crate::{AtelierError, Result};

/// Runs up to `width` jobs at once, for interpreters that declare themselves
/// safe for concurrent execution. Start order is not guaranteed.
pub struct ParallelScheduler {
    name: String,
    width: usize,
    permits: Arc<Semaphore>,
    jobs: Arc<JobTable>,
    stopped: AtomicBool,
}

impl ParallelScheduler {
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        let width = width.max(1);
        Self {
            name: name.into(),
            width,
            permits: Arc::new(Semaphore::new(width)),
            jobs: Arc::new(JobTable::default()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl Scheduler for ParallelScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Arc<Job>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AtelierError::Scheduler(format!("{} is stopped", self.name)));
        }
        if !job.mark_pending() {
            return Err(AtelierError::Scheduler(format!(
                "job {} is {}, not READY",
                job.id(),
                job.status()
            )));
        }

        self.jobs.push(job.clone());
        let permits = self.permits.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            // Closed semaphore means the scheduler was stopped; stop() already
            // aborted the job
            if let Ok(_permit) = permits.acquire_owned().await {
                job.run().await;
            }
            jobs.retire(&job);
        });
        Ok(())
    }

    fn get_job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.get(id)
    }

    fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.snapshot()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let aborted = self.jobs.abort_pending();
        self.permits.close();
        tracing::info!("Stopped scheduler {} ({} pending jobs aborted)", self.name, aborted);
    }
}
