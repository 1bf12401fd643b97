//! Wire protocol between a controller and its interpreter processes
//!
//! Two conversations share the same framing (one JSON [`Envelope`] per line):
//!
//! - controller → interpreter process: [`InterpreterRequest`] answered by
//!   [`InterpreterReply`]
//! - interpreter process → controller: [`EventRequest`] answered by
//!   [`EventReply`] (output callbacks, registration, resource brokering)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::angular::{AngularObject, RegistrySnapshot};
use crate::interpreter::{
    Completion, FormType, InterpreterResult, MessageType, RemoteContext, ResultMessage,
};
use crate::resource::{MethodInvocation, ResourceId, ResourceInfo};

/// Correlates a reply with the request that caused it.
pub type RequestId = u64;

/// One framed message. Replies carry the id of their request; replies on a
/// connection may arrive in any order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: RequestId,
    pub body: T,
}

/// Calls a controller makes against an interpreter process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterpreterRequest {
    /// One-time setup with resolved configuration
    Init { properties: HashMap<String, String> },

    CreateInterpreter {
        group_id: String,
        session_id: String,
        class_name: String,
        properties: HashMap<String, String>,
        user_name: String,
    },

    Open {
        session_id: String,
        class_name: String,
    },

    Close {
        session_id: String,
        class_name: String,
    },

    /// Run a script; answered only once the job is terminal
    Interpret {
        session_id: String,
        class_name: String,
        script: String,
        context: RemoteContext,
    },

    Cancel {
        session_id: String,
        class_name: String,
        context: RemoteContext,
    },

    GetProgress {
        session_id: String,
        class_name: String,
        context: RemoteContext,
    },

    GetStatus { session_id: String, job_id: String },

    GetFormType {
        session_id: String,
        class_name: String,
    },

    Completion {
        session_id: String,
        class_name: String,
        buffer: String,
        cursor: usize,
        context: RemoteContext,
    },

    ResourcePoolGetAll,

    ResourceGet {
        note_id: Option<String>,
        paragraph_id: Option<String>,
        name: String,
    },

    ResourceRemove {
        note_id: Option<String>,
        paragraph_id: Option<String>,
        name: String,
    },

    ResourceInvokeMethod {
        note_id: Option<String>,
        paragraph_id: Option<String>,
        name: String,
        invocation: MethodInvocation,
    },

    AngularObjectAdd {
        name: String,
        note_id: Option<String>,
        paragraph_id: Option<String>,
        value: Value,
    },

    AngularObjectUpdate {
        name: String,
        note_id: Option<String>,
        paragraph_id: Option<String>,
        value: Value,
    },

    AngularObjectRemove {
        name: String,
        note_id: Option<String>,
        paragraph_id: Option<String>,
    },

    /// Replace the whole Angular registry (controller is the source of truth)
    AngularRegistryPush { registry: RegistrySnapshot },

    /// Point the event channel at a (restarted) controller
    Reconnect { host: String, port: u16 },

    /// Liveness probe
    Ping,

    Shutdown,
}

/// Answers from an interpreter process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterpreterReply {
    Ok,

    Result { result: InterpreterResult },

    Progress { progress: u8 },

    Status { status: String },

    FormType { form_type: FormType },

    Completions { completions: Vec<Completion> },

    Resources { resources: Vec<ResourceInfo> },

    /// Serialized value; empty means "nothing available"
    Bytes { data: Vec<u8> },

    Removed { removed: bool },

    Pong { group_id: Option<String> },

    Error { message: String },
}

/// Something an interpreter process tells (or asks) its controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterpreterEvent {
    RegisterProcess { host: String, port: u16 },

    UnregisterProcess,

    OutputAppend {
        note_id: String,
        paragraph_id: String,
        index: usize,
        data: String,
    },

    OutputUpdate {
        note_id: String,
        paragraph_id: String,
        index: usize,
        kind: MessageType,
        data: String,
    },

    OutputUpdateAll {
        note_id: String,
        paragraph_id: String,
        messages: Vec<ResultMessage>,
    },

    OutputClear {
        note_id: String,
        paragraph_id: String,
    },

    Progress {
        note_id: String,
        paragraph_id: String,
        progress: u8,
    },

    AngularObjectAdd { object: AngularObject },

    AngularObjectUpdate { object: AngularObject },

    AngularObjectRemove {
        name: String,
        note_id: Option<String>,
        paragraph_id: Option<String>,
    },

    /// Every resource the rest of the cluster holds
    ResourcePoolGetAll,

    /// Fetch a resource held by another process
    ResourceGet { id: ResourceId },

    /// Invoke a method on a resource held by another process
    ResourceInvokeMethod {
        id: ResourceId,
        invocation: MethodInvocation,
    },
}

impl InterpreterEvent {
    /// Events that expect a payload back rather than a bare acknowledgement.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            InterpreterEvent::ResourcePoolGetAll
                | InterpreterEvent::ResourceGet { .. }
                | InterpreterEvent::ResourceInvokeMethod { .. }
        )
    }
}

/// An event tagged with the process group it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub group_id: String,
    pub event: InterpreterEvent,
}

/// Controller's answer to an [`EventRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventReply {
    Ok,
    Resources { resources: Vec<ResourceInfo> },
    Bytes { data: Vec<u8> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_snake_case() {
        let env = Envelope {
            id: 7,
            body: InterpreterRequest::GetStatus {
                session_id: "note1".to_string(),
                job_id: "p1".to_string(),
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["body"]["type"], "get_status");
        assert_eq!(json["body"]["job_id"], "p1");
    }

    #[test]
    fn unit_variants_parse() {
        let env: Envelope<InterpreterRequest> =
            serde_json::from_str(r#"{"id":1,"body":{"type":"ping"}}"#).unwrap();
        assert!(matches!(env.body, InterpreterRequest::Ping));

        let env: Envelope<EventReply> =
            serde_json::from_str(r#"{"id":2,"body":{"type":"bytes","data":[104,105]}}"#).unwrap();
        match env.body {
            EventReply::Bytes { data } => assert_eq!(data, b"hi"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn queries_are_distinguished_from_notifications() {
        assert!(InterpreterEvent::ResourcePoolGetAll.is_query());
        assert!(!InterpreterEvent::UnregisterProcess.is_query());
        assert!(
            !InterpreterEvent::OutputClear {
                note_id: "n".to_string(),
                paragraph_id: "p".to_string()
            }
            .is_query()
        );
    }
}
