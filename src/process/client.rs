//! Controller-side handle of one interpreter process

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::angular::RegistrySnapshot;
use crate::interpreter::{Completion, FormType, InterpreterResult, RemoteContext};
use crate::recovery::ProcessRegistration;
use crate::resource::{MethodInvocation, ResourceInfo};
use crate::rpc::protocol::{InterpreterReply, InterpreterRequest};
use crate::rpc::transport::RpcClient;
use crate::{AtelierError, Result};

/// An interpreter process the controller talks to, either launched by us
/// (and owning its child) or reattached from recovery storage.
pub struct InterpreterClient {
    group_id: String,
    host: String,
    port: u16,
    rpc: RpcClient<InterpreterRequest, InterpreterReply>,
    child: Mutex<Option<Child>>,
    shutdown_grace: Duration,
}

impl InterpreterClient {
    pub async fn connect(
        group_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let host = host.into();
        let rpc = RpcClient::connect(&format!("{}:{}", host, port), timeout).await?;
        Ok(Self {
            group_id: group_id.into(),
            host,
            port,
            rpc,
            child: Mutex::new(None),
            shutdown_grace: Duration::from_millis(2_000),
        })
    }

    /// Take ownership of the launched child so `stop` can force it.
    pub fn with_child(self, child: Child) -> Self {
        Self {
            child: Mutex::new(Some(child)),
            ..self
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registration(&self) -> ProcessRegistration {
        ProcessRegistration::new(&self.group_id, &self.host, self.port)
    }

    /// Whether the connection has been lost
    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    /// Send a request; an error reply becomes `Err`.
    pub async fn call(&self, request: InterpreterRequest) -> Result<InterpreterReply> {
        match self.rpc.call(request).await? {
            InterpreterReply::Error { message } => Err(AtelierError::Rpc(message)),
            reply => Ok(reply),
        }
    }

    async fn call_ok(&self, request: InterpreterRequest) -> Result<()> {
        match self.call(request).await? {
            InterpreterReply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn init(&self, properties: HashMap<String, String>) -> Result<()> {
        self.call_ok(InterpreterRequest::Init { properties }).await
    }

    pub async fn create_interpreter(
        &self,
        session_id: &str,
        class_name: &str,
        properties: HashMap<String, String>,
        user_name: &str,
    ) -> Result<()> {
        self.call_ok(InterpreterRequest::CreateInterpreter {
            group_id: self.group_id.clone(),
            session_id: session_id.to_string(),
            class_name: class_name.to_string(),
            properties,
            user_name: user_name.to_string(),
        })
        .await
    }

    pub async fn open(&self, session_id: &str, class_name: &str) -> Result<()> {
        self.call_ok(InterpreterRequest::Open {
            session_id: session_id.to_string(),
            class_name: class_name.to_string(),
        })
        .await
    }

    pub async fn close(&self, session_id: &str, class_name: &str) -> Result<()> {
        self.call_ok(InterpreterRequest::Close {
            session_id: session_id.to_string(),
            class_name: class_name.to_string(),
        })
        .await
    }

    pub async fn interpret(
        &self,
        session_id: &str,
        class_name: &str,
        script: &str,
        context: RemoteContext,
    ) -> Result<InterpreterResult> {
        let reply = self
            .call(InterpreterRequest::Interpret {
                session_id: session_id.to_string(),
                class_name: class_name.to_string(),
                script: script.to_string(),
                context,
            })
            .await?;
        match reply {
            InterpreterReply::Result { result } => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, session_id: &str, class_name: &str, context: RemoteContext) -> Result<()> {
        self.call_ok(InterpreterRequest::Cancel {
            session_id: session_id.to_string(),
            class_name: class_name.to_string(),
            context,
        })
        .await
    }

    pub async fn get_progress(&self, session_id: &str, class_name: &str, context: RemoteContext) -> Result<u8> {
        let reply = self
            .call(InterpreterRequest::GetProgress {
                session_id: session_id.to_string(),
                class_name: class_name.to_string(),
                context,
            })
            .await?;
        match reply {
            InterpreterReply::Progress { progress } => Ok(progress),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_status(&self, session_id: &str, job_id: &str) -> Result<String> {
        let reply = self
            .call(InterpreterRequest::GetStatus {
                session_id: session_id.to_string(),
                job_id: job_id.to_string(),
            })
            .await?;
        match reply {
            InterpreterReply::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_form_type(&self, session_id: &str, class_name: &str) -> Result<FormType> {
        let reply = self
            .call(InterpreterRequest::GetFormType {
                session_id: session_id.to_string(),
                class_name: class_name.to_string(),
            })
            .await?;
        match reply {
            InterpreterReply::FormType { form_type } => Ok(form_type),
            other => Err(unexpected(other)),
        }
    }

    pub async fn completion(
        &self,
        session_id: &str,
        class_name: &str,
        buffer: &str,
        cursor: usize,
        context: RemoteContext,
    ) -> Result<Vec<Completion>> {
        let reply = self
            .call(InterpreterRequest::Completion {
                session_id: session_id.to_string(),
                class_name: class_name.to_string(),
                buffer: buffer.to_string(),
                cursor,
                context,
            })
            .await?;
        match reply {
            InterpreterReply::Completions { completions } => Ok(completions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn resource_pool_get_all(&self) -> Result<Vec<ResourceInfo>> {
        match self.call(InterpreterRequest::ResourcePoolGetAll).await? {
            InterpreterReply::Resources { resources } => Ok(resources),
            other => Err(unexpected(other)),
        }
    }

    /// Serialized value, empty when the process does not have it
    pub async fn resource_get(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
    ) -> Result<Vec<u8>> {
        let reply = self
            .call(InterpreterRequest::ResourceGet {
                note_id: note_id.map(str::to_string),
                paragraph_id: paragraph_id.map(str::to_string),
                name: name.to_string(),
            })
            .await?;
        match reply {
            InterpreterReply::Bytes { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub async fn resource_remove(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let reply = self
            .call(InterpreterRequest::ResourceRemove {
                note_id: note_id.map(str::to_string),
                paragraph_id: paragraph_id.map(str::to_string),
                name: name.to_string(),
            })
            .await?;
        match reply {
            InterpreterReply::Removed { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    pub async fn resource_invoke_method(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        invocation: MethodInvocation,
    ) -> Result<Vec<u8>> {
        let reply = self
            .call(InterpreterRequest::ResourceInvokeMethod {
                note_id: note_id.map(str::to_string),
                paragraph_id: paragraph_id.map(str::to_string),
                name: name.to_string(),
                invocation,
            })
            .await?;
        match reply {
            InterpreterReply::Bytes { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub async fn angular_object_add(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        value: Value,
    ) -> Result<()> {
        self.call_ok(InterpreterRequest::AngularObjectAdd {
            name: name.to_string(),
            note_id: note_id.map(str::to_string),
            paragraph_id: paragraph_id.map(str::to_string),
            value,
        })
        .await
    }

    pub async fn angular_object_update(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        value: Value,
    ) -> Result<()> {
        self.call_ok(InterpreterRequest::AngularObjectUpdate {
            name: name.to_string(),
            note_id: note_id.map(str::to_string),
            paragraph_id: paragraph_id.map(str::to_string),
            value,
        })
        .await
    }

    pub async fn angular_object_remove(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
    ) -> Result<()> {
        self.call_ok(InterpreterRequest::AngularObjectRemove {
            name: name.to_string(),
            note_id: note_id.map(str::to_string),
            paragraph_id: paragraph_id.map(str::to_string),
        })
        .await
    }

    pub async fn angular_registry_push(&self, registry: RegistrySnapshot) -> Result<()> {
        self.call_ok(InterpreterRequest::AngularRegistryPush { registry }).await
    }

    pub async fn reconnect(&self, host: &str, port: u16) -> Result<()> {
        self.call_ok(InterpreterRequest::Reconnect {
            host: host.to_string(),
            port,
        })
        .await
    }

    /// Liveness probe: the process answers and hosts our group.
    pub async fn recover(&self) -> bool {
        match self.call(InterpreterRequest::Ping).await {
            Ok(InterpreterReply::Pong { group_id: None }) => true,
            Ok(InterpreterReply::Pong { group_id: Some(id) }) => {
                if id != self.group_id {
                    tracing::warn!(
                        "{} answers for group {}, expected {}",
                        self.rpc.addr(),
                        id,
                        self.group_id
                    );
                }
                id == self.group_id
            }
            Ok(other) => {
                tracing::warn!("Unexpected probe reply {:?}", other);
                false
            }
            Err(e) => {
                tracing::debug!("Probe of {} failed: {}", self.group_id, e);
                false
            }
        }
    }

    /// Ask the process to shut down, then force it if it is still alive
    /// once the grace period is over.
    pub async fn stop(&self) {
        tracing::info!("Stopping interpreter process {}", self.group_id);
        match tokio::time::timeout(self.shutdown_grace, self.rpc.call(InterpreterRequest::Shutdown)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!("Shutdown request to {} failed: {}", self.group_id, e),
            Err(_) => tracing::warn!("Shutdown request to {} timed out", self.group_id),
        }

        let mut child = self.child.lock().await;
        let Some(child) = child.as_mut() else {
            return;
        };
        // The process waits up to its own grace period before exiting
        let deadline = self.shutdown_grace * 2;
        match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("Interpreter process {} exited with {}", self.group_id, status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for {}: {}", self.group_id, e),
            Err(_) => {
                tracing::warn!(
                    "Interpreter process {} still running after {:?}, killing",
                    self.group_id,
                    deadline
                );
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill {}: {}", self.group_id, e);
                }
            }
        }
    }
}

fn unexpected(reply: InterpreterReply) -> AtelierError {
    AtelierError::Rpc(format!("unexpected reply {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{InterpreterFactory, ResultCode};
    use crate::lifecycle::ShutdownTarget;
    use crate::server::InterpreterServer;

    #[tokio::test]
    async fn drives_a_server_over_tcp() {
        let server = InterpreterServer::new("g1", InterpreterFactory::with_defaults());
        let handle = server.start("127.0.0.1", 0, None).await.unwrap();

        let client = InterpreterClient::connect("g1", "127.0.0.1", handle.addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.recover().await);

        client
            .create_interpreter("note1", "sh", HashMap::new(), "alice")
            .await
            .unwrap();
        let result = client
            .interpret("note1", "sh", "echo over the wire", RemoteContext::new("note1", "p1"))
            .await
            .unwrap();
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(result.text(), "over the wire\n");
        assert_eq!(client.get_status("note1", "p1").await.unwrap(), "UNKNOWN");
        assert_eq!(client.get_form_type("note1", "sh").await.unwrap(), FormType::Simple);
        assert!(!client.resource_remove(None, None, "nothing").await.unwrap());

        assert!(matches!(
            client.open("note1", "python").await,
            Err(AtelierError::Rpc(_))
        ));

        server.shutdown().await.unwrap();
        handle.wait().await;
    }

    #[tokio::test]
    async fn probe_rejects_other_group() {
        let server = InterpreterServer::new("g1", InterpreterFactory::with_defaults());
        let handle = server.start("127.0.0.1", 0, None).await.unwrap();

        let client = InterpreterClient::connect("g2", "127.0.0.1", handle.addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!client.recover().await);

        server.shutdown().await.unwrap();
        handle.wait().await;
    }
}
