//! Job - one unit of interpreter work
//!
//! A job walks `READY → PENDING → RUNNING → {FINISHED, ERROR, ABORT}`.
//! Only its scheduler moves it forward; anyone may abort it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::interpreter::{InterpreterResult, ResultCode};
use crate::Result;

/// Status name reported for jobs nobody knows about
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Ready,
    Pending,
    Running,
    Finished,
    Error,
    Abort,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error | JobStatus::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Ready => "READY",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
            JobStatus::Abort => "ABORT",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job actually does when it runs
#[async_trait]
pub trait JobBody: Send + Sync {
    /// Run to completion. `cancel` fires when the job is aborted mid-run.
    async fn run(&self, cancel: CancellationToken) -> Result<InterpreterResult>;

    /// Invoked on its own task when a running job is aborted.
    async fn on_abort(&self) {}
}

/// Observer of status transitions.
///
/// Called synchronously, once per transition, in transition order.
/// Implementations must not abort or otherwise transition the job.
pub trait JobListener: Send + Sync {
    fn on_status_change(&self, job: &Job, before: JobStatus, after: JobStatus);
}

struct JobState {
    status: JobStatus,
    result: Option<InterpreterResult>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct Job {
    id: String,
    name: String,
    body: Arc<dyn JobBody>,
    state: Mutex<JobState>,
    /// Serializes transition + notification so listeners see them in order
    transition: Mutex<()>,
    info: Mutex<HashMap<String, String>>,
    listener: Option<Arc<dyn JobListener>>,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>, body: Arc<dyn JobBody>) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Ready);
        Self {
            id: id.into(),
            name: name.into(),
            body,
            state: Mutex::new(JobState {
                status: JobStatus::Ready,
                result: None,
                error: None,
                started_at: None,
                finished_at: None,
            }),
            transition: Mutex::new(()),
            info: Mutex::new(HashMap::new()),
            listener: None,
            cancel: CancellationToken::new(),
            status_tx,
            created_at: Utc::now(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> JobStatus {
        self.lock_state().status
    }

    /// The result, once the job has produced one
    pub fn result(&self) -> Option<InterpreterResult> {
        self.lock_state().result.clone()
    }

    /// Failure description when the body errored or panicked
    pub fn error_message(&self) -> Option<String> {
        self.lock_state().error.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().finished_at
    }

    pub fn info(&self) -> HashMap<String, String> {
        self.info.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn set_info(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut info) = self.info.lock() {
            info.insert(key.into(), value.into());
        }
    }

    /// Token handed to the body; fired by [`Job::abort`] while running.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled() || self.status() == JobStatus::Abort
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the job reaches a terminal status and return it.
    pub async fn wait_terminated(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Abort the job.
    ///
    /// A pending job goes straight to `ABORT` and its body never runs. A
    /// running job only gets its cancellation token fired (plus the body's
    /// abort hook on a separate task); it keeps running until it notices.
    /// Terminal jobs are left alone.
    pub fn abort(&self) {
        let _guard = self.lock_transition();
        let before = {
            let mut state = self.lock_state();
            match state.status {
                JobStatus::Ready | JobStatus::Pending => {
                    let before = state.status;
                    state.status = JobStatus::Abort;
                    state.finished_at = Some(Utc::now());
                    before
                }
                JobStatus::Running => {
                    drop(state);
                    self.cancel.cancel();
                    self.spawn_abort_hook();
                    return;
                }
                _ => return,
            }
        };
        self.cancel.cancel();
        tracing::debug!(job = %self.id, "Aborted while {}", before);
        self.publish(before, JobStatus::Abort);
    }

    /// `READY → PENDING`. False when the job was already submitted or aborted.
    pub(crate) fn mark_pending(&self) -> bool {
        self.transition(JobStatus::Ready, JobStatus::Pending, |_| {})
    }

    /// Run the body on a task of its own so a panic becomes `ERROR`.
    ///
    /// Does nothing unless the job is still `PENDING`.
    pub(crate) async fn run(&self) {
        let started = self.transition(JobStatus::Pending, JobStatus::Running, |state| {
            state.started_at = Some(Utc::now());
        });
        if !started {
            return;
        }

        let body = self.body.clone();
        let token = self.cancel.clone();
        let outcome = tokio::spawn(async move { body.run(token).await }).await;

        let (after, result, error) = match outcome {
            Ok(Ok(result)) if self.cancel.is_cancelled() => (JobStatus::Abort, Some(result), None),
            Ok(Ok(result)) if result.code == ResultCode::Error => {
                (JobStatus::Error, Some(result), None)
            }
            Ok(Ok(result)) => (JobStatus::Finished, Some(result), None),
            Ok(Err(e)) if self.cancel.is_cancelled() => {
                (JobStatus::Abort, None, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                (
                    JobStatus::Error,
                    Some(InterpreterResult::error(message.clone())),
                    Some(message),
                )
            }
            Err(join) => {
                let message = if join.is_panic() {
                    format!("Job {} panicked", self.id)
                } else {
                    format!("Job {} was cancelled", self.id)
                };
                (
                    JobStatus::Error,
                    Some(InterpreterResult::error(message.clone())),
                    Some(message),
                )
            }
        };

        if let Some(message) = &error {
            tracing::warn!(job = %self.id, "Job failed: {}", message);
        }

        self.transition(JobStatus::Running, after, |state| {
            state.result = result;
            state.error = error;
            state.finished_at = Some(Utc::now());
        });
    }

    /// Compare-and-set transition. The mutation runs under the state lock;
    /// listeners and waiters are notified after it is released.
    fn transition(
        &self,
        from: JobStatus,
        to: JobStatus,
        mutate: impl FnOnce(&mut JobState),
    ) -> bool {
        let _guard = self.lock_transition();
        {
            let mut state = self.lock_state();
            if state.status != from {
                return false;
            }
            state.status = to;
            mutate(&mut state);
        }
        self.publish(from, to);
        true
    }

    fn publish(&self, before: JobStatus, after: JobStatus) {
        self.status_tx.send_replace(after);
        if let Some(listener) = &self.listener {
            listener.on_status_change(self, before, after);
        }
    }

    fn spawn_abort_hook(&self) {
        let body = self.body.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { body.on_abort().await });
            }
            Err(_) => tracing::warn!(job = %self.id, "No runtime to run abort hook on"),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
