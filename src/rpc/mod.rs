//! RPC between the controller and interpreter processes
//!
//! ```text
//! ┌──────────────────┐  InterpreterRequest   ┌───────────────────────┐
//! │    Controller    │──────────────────────►│  Interpreter process  │
//! │ (ProcessManager) │◄──────────────────────│  (InterpreterServer)  │
//! │                  │     EventRequest      │                       │
//! └──────────────────┘                       └───────────────────────┘
//! ```
//!
//! Both directions are newline-delimited JSON envelopes over TCP.

pub mod event;
pub mod protocol;
pub mod transport;

pub use event::{EventChannel, EventRelay, NullEventChannel, RemoteEventClient};
pub use protocol::{
    Envelope, EventReply, EventRequest, InterpreterEvent, InterpreterReply, InterpreterRequest,
};
pub use transport::{RpcClient, RpcHandler, RpcServer};
