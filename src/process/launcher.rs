//! Interpreter launcher - starts a process and waits for it to check in

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::client::InterpreterClient;
use crate::config::AtelierConfig;
use crate::{AtelierError, Result};

/// Launches waiting for their process to register, by group id
#[derive(Default)]
pub struct PendingRegistrations {
    waiters: Mutex<HashMap<String, oneshot::Sender<(String, u16)>>>,
}

impl PendingRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `group_id` to register. A second waiter replaces the first.
    pub fn expect(&self, group_id: &str) -> oneshot::Receiver<(String, u16)> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(group_id.to_string(), tx);
        rx
    }

    /// Hand a registration to its waiter. False when nobody was waiting.
    pub fn complete(&self, group_id: &str, host: &str, port: u16) -> bool {
        match self.lock().remove(group_id) {
            Some(tx) => tx.send((host.to_string(), port)).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, group_id: &str) {
        self.lock().remove(group_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<(String, u16)>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Starts interpreter processes with the configured launch command
pub struct InterpreterLauncher {
    command: Vec<String>,
    connect_timeout: Duration,
    shutdown_grace: Duration,
}

impl InterpreterLauncher {
    pub fn new(config: &AtelierConfig) -> Self {
        Self {
            command: config.launch_command.clone(),
            connect_timeout: config.connect_timeout,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Start a process for `group_id` pointed at the controller's event
    /// endpoint and wait for it to register.
    ///
    /// A process that exits early or misses the connect timeout is killed
    /// and the launch fails.
    pub async fn launch(
        &self,
        group_id: &str,
        event_host: &str,
        event_port: u16,
        registrations: &PendingRegistrations,
    ) -> Result<InterpreterClient> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AtelierError::Launch("launch command is empty".to_string()))?;

        let registered = registrations.expect(group_id);
        tracing::info!("Launching interpreter process for {}: {}", group_id, self.command.join(" "));
        let mut child = match Command::new(program)
            .args(args)
            .arg("--event-host")
            .arg(event_host)
            .arg("--event-port")
            .arg(event_port.to_string())
            .arg("--group-id")
            .arg(group_id)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                registrations.forget(group_id);
                return Err(AtelierError::Launch(format!("failed to start {}: {}", program, e)));
            }
        };

        let outcome = tokio::select! {
            registered = tokio::time::timeout(self.connect_timeout, registered) => match registered {
                Ok(Ok(endpoint)) => Ok(endpoint),
                Ok(Err(_)) => Err(AtelierError::Launch("registration channel dropped".to_string())),
                Err(_) => Err(AtelierError::Launch(format!(
                    "{} did not register within {:?}",
                    group_id, self.connect_timeout
                ))),
            },
            exited = child.wait() => Err(AtelierError::Launch(match exited {
                Ok(status) => format!("{} exited before registering ({})", group_id, status),
                Err(e) => format!("{} could not be waited on: {}", group_id, e),
            })),
        };

        let connected = match outcome {
            Ok((host, port)) => {
                tracing::info!("Interpreter process {} registered at {}:{}", group_id, host, port);
                InterpreterClient::connect(group_id, host, port, self.connect_timeout).await
            }
            Err(e) => Err(e),
        };

        match connected {
            Ok(client) => Ok(client.with_child(child).with_shutdown_grace(self.shutdown_grace)),
            Err(e) => {
                registrations.forget(group_id);
                tracing::error!("Launch of {} failed: {}", group_id, e);
                if let Err(kill_err) = child.kill().await {
                    tracing::debug!("Kill after failed launch: {}", kill_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(command: &[&str], timeout_ms: u64) -> InterpreterLauncher {
        let mut config = AtelierConfig::default();
        config.launch_command = command.iter().map(|s| s.to_string()).collect();
        config.connect_timeout = Duration::from_millis(timeout_ms);
        InterpreterLauncher::new(&config)
    }

    #[test]
    fn registrations_reach_their_waiter() {
        let pending = PendingRegistrations::new();
        let mut rx = pending.expect("g1");
        assert!(!pending.complete("g2", "h", 1));
        assert!(pending.complete("g1", "h", 2));
        assert_eq!(rx.try_recv().unwrap(), ("h".to_string(), 2));
        assert!(!pending.complete("g1", "h", 3));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let pending = PendingRegistrations::new();
        let result = launcher(&["/nonexistent/atelier-interpreter"], 1_000)
            .launch("g1", "127.0.0.1", 1, &pending)
            .await;
        assert!(matches!(result, Err(AtelierError::Launch(_))));
    }

    #[tokio::test]
    async fn early_exit_is_a_launch_failure() {
        let pending = PendingRegistrations::new();
        let result = launcher(&["true"], 5_000)
            .launch("g1", "127.0.0.1", 1, &pending)
            .await;
        match result {
            Err(AtelierError::Launch(message)) => assert!(message.contains("exited")),
            other => panic!("unexpected {:?}", other.map(|c| c.group_id().to_string())),
        }
    }

    #[tokio::test]
    async fn silent_process_times_out_and_is_killed() {
        let pending = PendingRegistrations::new();
        let started = std::time::Instant::now();
        let result = launcher(&["sh", "-c", "exec sleep 30"], 300)
            .launch("g1", "127.0.0.1", 1, &pending)
            .await;
        match result {
            Err(AtelierError::Launch(message)) => assert!(message.contains("did not register")),
            other => panic!("unexpected {:?}", other.map(|c| c.group_id().to_string())),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
