//! Lifecycle managers - retire interpreter processes nobody is using
//!
//! The process reports traffic ("started", "used"); a manager decides when
//! the process has been idle long enough and asks it to shut down. Shutdown
//! is advisory: the target must tolerate being asked while already stopping.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::{AtelierConfig, LifecycleKind};

/// Something a lifecycle manager can shut down
#[async_trait]
pub trait ShutdownTarget: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

pub trait LifecycleManager: Send + Sync {
    fn on_process_started(&self, group_id: &str);

    /// Called on interpret, progress and status traffic
    fn on_process_used(&self, group_id: &str);

    /// Stop monitoring without shutting anything down
    fn stop(&self) {}
}

/// Never shuts the process down
pub struct NullLifecycleManager;

impl LifecycleManager for NullLifecycleManager {
    fn on_process_started(&self, _group_id: &str) {}
    fn on_process_used(&self, _group_id: &str) {}
}

/// Shuts the process down once it has been idle longer than a threshold
pub struct TimeoutLifecycleManager {
    /// Milliseconds since the epoch
    last_busy: Arc<AtomicI64>,
    fired: Arc<AtomicBool>,
    threshold: Duration,
    cancel: CancellationToken,
}

impl TimeoutLifecycleManager {
    /// Start the check loop. Must be called inside a tokio runtime.
    ///
    /// The loop issues at most one shutdown and then ends.
    pub fn start(target: Weak<dyn ShutdownTarget>, check_interval: Duration, threshold: Duration) -> Self {
        let last_busy = Arc::new(AtomicI64::new(now_millis()));
        let fired = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let loop_busy = last_busy.clone();
        let loop_fired = fired.clone();
        let loop_cancel = cancel.clone();
        let threshold_ms = duration_millis(threshold);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; the first real check is one period in
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let idle = now_millis().saturating_sub(loop_busy.load(Ordering::SeqCst));
                if idle <= threshold_ms {
                    continue;
                }

                tracing::info!(
                    "Interpreter process idle for {} ms (threshold {} ms), shutting down",
                    idle,
                    threshold_ms
                );
                loop_fired.store(true, Ordering::SeqCst);
                match target.upgrade() {
                    Some(target) => {
                        if let Err(e) = target.shutdown().await {
                            tracing::warn!("Idle shutdown failed: {}", e);
                        }
                    }
                    None => tracing::debug!("Shutdown target already gone"),
                }
                break;
            }
        });

        tracing::info!(
            "Timeout lifecycle manager started (interval {:?}, threshold {:?})",
            check_interval,
            threshold
        );
        Self {
            last_busy,
            fired,
            threshold,
            cancel,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Time since the last reported traffic
    pub fn idle_for(&self) -> Duration {
        let idle = now_millis().saturating_sub(self.last_busy.load(Ordering::SeqCst));
        Duration::from_millis(idle.max(0) as u64)
    }

    /// Whether the idle shutdown has been issued
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_busy.store(now_millis(), Ordering::SeqCst);
    }
}

impl LifecycleManager for TimeoutLifecycleManager {
    fn on_process_started(&self, group_id: &str) {
        tracing::debug!("Process {} started", group_id);
        self.touch();
    }

    fn on_process_used(&self, _group_id: &str) {
        self.touch();
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TimeoutLifecycleManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build the manager `config` asks for.
pub fn create_lifecycle_manager(
    config: &AtelierConfig,
    target: Weak<dyn ShutdownTarget>,
) -> Arc<dyn LifecycleManager> {
    match config.lifecycle {
        LifecycleKind::Null => Arc::new(NullLifecycleManager),
        LifecycleKind::Timeout => Arc::new(TimeoutLifecycleManager::start(
            target,
            config.lifecycle_check_interval,
            config.lifecycle_threshold,
        )),
    }
}

/// Milliseconds in `duration`, saturating at `i64::MAX`
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
