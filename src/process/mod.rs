//! Controller side of the process boundary
//!
//! - [`InterpreterLauncher`] starts an interpreter process and waits for it to register
//! - [`InterpreterClient`] speaks the interpreter protocol to one process
//! - [`ProcessManager`] keeps the registry of processes, serves their events
//!   and restores them from recovery storage

pub mod client;
pub mod launcher;
pub mod manager;

pub use client::InterpreterClient;
pub use launcher::{InterpreterLauncher, PendingRegistrations};
pub use manager::ProcessManager;

use crate::rpc::protocol::InterpreterEvent;

/// Receives the notifications interpreter processes send their controller
/// (output, progress, Angular objects, unregistration).
pub trait ProcessEventListener: Send + Sync {
    fn on_event(&self, group_id: &str, event: &InterpreterEvent);
}

/// Default listener: traces every event
pub struct LoggingEventListener;

impl ProcessEventListener for LoggingEventListener {
    fn on_event(&self, group_id: &str, event: &InterpreterEvent) {
        match event {
            InterpreterEvent::OutputAppend { paragraph_id, data, .. } => {
                tracing::debug!("[{}] {} += {} bytes", group_id, paragraph_id, data.len())
            }
            InterpreterEvent::Progress { paragraph_id, progress, .. } => {
                tracing::debug!("[{}] {} at {}%", group_id, paragraph_id, progress)
            }
            other => tracing::trace!("[{}] {:?}", group_id, other),
        }
    }
}
