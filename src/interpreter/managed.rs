//! An interpreter instance as the group holds it: the interpreter itself,
//! its scheduler, and whether it has been opened yet.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::Interpreter;
use crate::Result;
use crate::scheduler::{JobStatus, Scheduler, SchedulingPolicy, create_scheduler};

pub struct ManagedInterpreter {
    inner: Arc<dyn Interpreter>,
    session_id: String,
    user_name: String,
    scheduler: Arc<dyn Scheduler>,
    opened: Mutex<bool>,
}

impl ManagedInterpreter {
    /// Wrap `inner` for `session_id`. An interpreter asking for
    /// `Parallel(0)` gets `parallel_default` workers.
    pub fn new(
        inner: Arc<dyn Interpreter>,
        session_id: impl Into<String>,
        user_name: impl Into<String>,
        parallel_default: usize,
    ) -> Self {
        let session_id = session_id.into();
        let policy = match inner.scheduling() {
            SchedulingPolicy::Parallel(0) => SchedulingPolicy::Parallel(parallel_default),
            other => other,
        };
        let scheduler = create_scheduler(
            format!("{}-{}", inner.class_name(), session_id),
            policy,
        );
        Self {
            inner,
            session_id,
            user_name: user_name.into(),
            scheduler,
            opened: Mutex::new(false),
        }
    }

    pub fn class_name(&self) -> &str {
        self.inner.class_name()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn interpreter(&self) -> &Arc<dyn Interpreter> {
        &self.inner
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Open unless already open. Concurrent callers open it once.
    pub async fn open(&self) -> Result<()> {
        let mut opened = self.opened.lock().await;
        if !*opened {
            tracing::info!("Opening interpreter {} for session {}", self.class_name(), self.session_id);
            self.inner.open().await?;
            *opened = true;
        }
        Ok(())
    }

    /// Stop the scheduler and abort whatever is still running. Once those
    /// jobs have ended the interpreter is closed, if it was ever opened.
    pub async fn close(&self) -> Result<()> {
        self.scheduler.stop();
        let running: Vec<_> = self
            .scheduler
            .jobs()
            .into_iter()
            .filter(|job| job.status() == JobStatus::Running)
            .collect();
        for job in &running {
            tracing::info!(job = %job.id(), "Aborting running job of {}", self.class_name());
            job.abort();
        }
        for job in running {
            job.wait_terminated().await;
        }
        let mut opened = self.opened.lock().await;
        if *opened {
            tracing::info!("Closing interpreter {} for session {}", self.class_name(), self.session_id);
            *opened = false;
            self.inner.close().await?;
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        *self.opened.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{InterpreterContext, InterpreterResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Interpreter for Counting {
        fn class_name(&self) -> &str {
            "counting"
        }
        async fn open(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn interpret(&self, _s: &str, _c: &InterpreterContext) -> Result<InterpreterResult> {
            Ok(InterpreterResult::success(""))
        }
        async fn cancel(&self, _c: &InterpreterContext) -> Result<()> {
            Ok(())
        }
        fn scheduling(&self) -> SchedulingPolicy {
            SchedulingPolicy::Parallel(0)
        }
    }

    #[tokio::test]
    async fn opens_once_and_skips_close_when_never_opened() {
        let inner = Arc::new(Counting::default());
        let managed = ManagedInterpreter::new(inner.clone(), "note1", "alice", 4);
        assert_eq!(managed.scheduler().name(), "counting-note1");

        managed.close().await.unwrap();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 0);

        let inner = Arc::new(Counting::default());
        let managed = Arc::new(ManagedInterpreter::new(inner.clone(), "note1", "alice", 4));
        let (a, b) = tokio::join!(managed.open(), managed.open());
        a.unwrap();
        b.unwrap();
        assert_eq!(inner.opens.load(Ordering::SeqCst), 1);
        assert!(managed.is_open().await);

        managed.close().await.unwrap();
        managed.close().await.unwrap();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }
}
