use async_trait::async_trait;
use atelier::Result;
use atelier::interpreter::InterpreterResult;
use atelier::scheduler::{FifoScheduler, Job, JobBody, JobStatus, Scheduler};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sleeps, then records its label in the shared completion log
struct Recorded {
    label: usize,
    ms: u64,
    log: Arc<Mutex<Vec<usize>>>,
    running: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobBody for Recorded {
    async fn run(&self, _cancel: CancellationToken) -> Result<InterpreterResult> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlap.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(self.label);
        Ok(InterpreterResult::success(format!("job {}", self.label)))
    }
}

#[derive(Default)]
struct Harness {
    log: Arc<Mutex<Vec<usize>>>,
    running: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
}

impl Harness {
    fn job(&self, label: usize, ms: u64, runs: Arc<AtomicUsize>) -> Arc<Job> {
        Arc::new(Job::new(
            format!("p{}", label),
            format!("paragraph {}", label),
            Arc::new(Recorded {
                label,
                ms,
                log: self.log.clone(),
                running: self.running.clone(),
                overlap: self.overlap.clone(),
                runs,
            }),
        ))
    }
}

#[tokio::test]
async fn fifo_completes_in_submission_order() {
    let harness = Harness::default();
    let scheduler = FifoScheduler::new("fifo");
    let jobs: Vec<Arc<Job>> = (1..=3)
        .map(|label| harness.job(label, if label == 1 { 500 } else { 300 }, Arc::default()))
        .collect();

    let started = Instant::now();
    for job in &jobs {
        scheduler.submit(job.clone()).unwrap();
    }
    for job in &jobs {
        assert_eq!(job.wait_terminated().await, JobStatus::Finished);
    }

    assert_eq!(*harness.log.lock().unwrap(), vec![1, 2, 3]);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(!harness.overlap.load(Ordering::SeqCst));
    assert_eq!(jobs[2].result().unwrap().text(), "job 3");
}

#[tokio::test]
async fn aborted_pending_job_never_runs() {
    let harness = Harness::default();
    let scheduler = FifoScheduler::new("fifo");
    let second_runs = Arc::new(AtomicUsize::new(0));
    let first = harness.job(1, 300, Arc::default());
    let second = harness.job(2, 10, second_runs.clone());

    scheduler.submit(first.clone()).unwrap();
    scheduler.submit(second.clone()).unwrap();
    assert_eq!(second.status(), JobStatus::Pending);
    second.abort();

    assert_eq!(second.wait_terminated().await, JobStatus::Abort);
    assert_eq!(first.wait_terminated().await, JobStatus::Finished);
    // Give the worker a chance to (wrongly) pick the aborted job up
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second_runs.load(Ordering::SeqCst), 0);
    assert_eq!(*harness.log.lock().unwrap(), vec![1]);
}

/// Polls its token until told to stop
struct Polling {
    saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl JobBody for Polling {
    async fn run(&self, cancel: CancellationToken) -> Result<InterpreterResult> {
        for _ in 0..500 {
            if cancel.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
                return Ok(InterpreterResult::error("cancelled"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(InterpreterResult::success("ran to completion"))
    }
}

#[tokio::test]
async fn running_job_cancels_cooperatively() {
    let scheduler = FifoScheduler::new("fifo");
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let job = Arc::new(Job::new(
        "p1",
        "polling",
        Arc::new(Polling {
            saw_cancel: saw_cancel.clone(),
        }),
    ));
    scheduler.submit(job.clone()).unwrap();

    let mut status = job.subscribe();
    status.wait_for(|s| *s == JobStatus::Running).await.unwrap();

    let asked = Instant::now();
    job.abort();
    assert!(asked.elapsed() < Duration::from_millis(100));

    let terminal = tokio::time::timeout(Duration::from_secs(5), job.wait_terminated())
        .await
        .unwrap();
    assert!(terminal.is_terminal());
    assert!(saw_cancel.load(Ordering::SeqCst));
}
