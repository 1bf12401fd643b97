//! Atelier: orchestration core for notebook interpreter processes
//!
//! An interpreter process hosts one [`group::InterpreterGroup`] and answers the
//! remote-procedure contract through [`server::InterpreterServer`]. The
//! controller side launches, recovers and retires those processes through
//! [`process::ProcessManager`].

pub mod angular;
pub mod cli;
pub mod config;
pub mod group;
pub mod interpreter;
pub mod lifecycle;
pub mod process;
pub mod recovery;
pub mod resource;
pub mod rpc;
pub mod scheduler;
pub mod server;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtelierError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interpreter process failed to launch: {0}")]
    Launch(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Interpreter process not running: {0}")]
    ProcessNotRunning(String),

    #[error("Remote call failed: {0}")]
    Rpc(String),

    #[error("Interpreter error: {0}")]
    Interpreter(String),

    #[error("Interpreter {class_name} not found in session {session_id}")]
    InterpreterNotFound {
        session_id: String,
        class_name: String,
    },

    #[error("Unknown interpreter class: {0}")]
    UnknownInterpreterClass(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Shutdown timed out: {0}")]
    ShutdownTimeout(String),
}

impl AtelierError {
    /// Whether this error means the peer process is gone or unreachable.
    ///
    /// Callers use this to drop the process from the registry and offer a
    /// relaunch instead of retrying the same endpoint.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            AtelierError::Transport(_) | AtelierError::ProcessNotRunning(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AtelierError>;
