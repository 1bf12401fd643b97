//! Event channel - interpreter process → controller
//!
//! Output callbacks and registration are fire-and-forget notifications,
//! delivered in emission order. Resource lookups that need the rest of the
//! cluster are request/response on the same channel.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::{EventReply, EventRequest, InterpreterEvent};
use super::transport::RpcClient;
use crate::resource::{MethodInvocation, ResourceId, ResourceInfo};
use crate::{AtelierError, Result};

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Queue a notification; never blocks on the controller
    fn emit(&self, event: InterpreterEvent);

    /// Send an event and wait for the controller's answer
    async fn request(&self, event: InterpreterEvent) -> Result<EventReply>;
}

/// Event channel backed by an RPC connection to the controller
pub struct RemoteEventClient {
    group_id: String,
    client: Arc<RpcClient<EventRequest, EventReply>>,
    outbox: mpsc::UnboundedSender<InterpreterEvent>,
}

impl RemoteEventClient {
    pub async fn connect(
        host: &str,
        port: u16,
        group_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let group_id = group_id.into();
        let addr = format!("{}:{}", host, port);
        let client = Arc::new(RpcClient::connect(&addr, timeout).await?);
        let (outbox, mut rx) = mpsc::unbounded_channel::<InterpreterEvent>();

        let forward = client.clone();
        let forward_group = group_id.clone();
        tokio::spawn(async move {
            // One at a time so the controller sees events in emission order
            while let Some(event) = rx.recv().await {
                let request = EventRequest {
                    group_id: forward_group.clone(),
                    event,
                };
                match forward.call(request).await {
                    Ok(EventReply::Error { message }) => {
                        tracing::warn!("Controller rejected event: {}", message)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Dropping event for {}: {}", forward.addr(), e);
                    }
                }
            }
        });

        tracing::info!("Event channel for {} connected to {}", group_id, addr);
        Ok(Self {
            group_id,
            client,
            outbox,
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

#[async_trait]
impl EventChannel for RemoteEventClient {
    fn emit(&self, event: InterpreterEvent) {
        if self.outbox.send(event).is_err() {
            tracing::warn!("Event forwarder for {} is gone", self.group_id);
        }
    }

    async fn request(&self, event: InterpreterEvent) -> Result<EventReply> {
        self.client
            .call(EventRequest {
                group_id: self.group_id.clone(),
                event,
            })
            .await
    }
}

/// Channel used before `init` connects one, and by standalone contexts
pub struct NullEventChannel;

#[async_trait]
impl EventChannel for NullEventChannel {
    fn emit(&self, event: InterpreterEvent) {
        tracing::trace!("No event channel, dropping {:?}", event);
    }

    async fn request(&self, event: InterpreterEvent) -> Result<EventReply> {
        Ok(match event {
            InterpreterEvent::ResourcePoolGetAll => EventReply::Resources {
                resources: Vec::new(),
            },
            InterpreterEvent::ResourceGet { .. } | InterpreterEvent::ResourceInvokeMethod { .. } => {
                EventReply::Bytes { data: Vec::new() }
            }
            _ => EventReply::Ok,
        })
    }
}

/// The current event channel, swappable at runtime (`init`, `reconnect`)
pub struct EventRelay {
    channel: RwLock<Arc<dyn EventChannel>>,
}

impl EventRelay {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self {
            channel: RwLock::new(channel),
        }
    }

    pub fn detached() -> Self {
        Self::new(Arc::new(NullEventChannel))
    }

    pub fn replace(&self, channel: Arc<dyn EventChannel>) {
        match self.channel.write() {
            Ok(mut current) => *current = channel,
            Err(poisoned) => *poisoned.into_inner() = channel,
        }
    }

    pub fn current(&self) -> Arc<dyn EventChannel> {
        match self.channel.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn emit(&self, event: InterpreterEvent) {
        self.current().emit(event);
    }

    pub async fn request(&self, event: InterpreterEvent) -> Result<EventReply> {
        let channel = self.current();
        channel.request(event).await
    }

    /// Ask the controller for a resource held elsewhere. `None` when nobody
    /// has it or it cannot be serialized.
    pub async fn fetch_resource(&self, id: &ResourceId) -> Result<Option<Vec<u8>>> {
        let reply = self
            .request(InterpreterEvent::ResourceGet { id: id.clone() })
            .await?;
        bytes_reply(reply)
    }

    pub async fn fetch_all_resources(&self) -> Result<Vec<ResourceInfo>> {
        match self.request(InterpreterEvent::ResourcePoolGetAll).await? {
            EventReply::Resources { resources } => Ok(resources),
            EventReply::Error { message } => Err(AtelierError::Resource(message)),
            other => Err(AtelierError::Rpc(format!("unexpected reply {:?}", other))),
        }
    }

    pub async fn invoke_remote(
        &self,
        id: &ResourceId,
        invocation: &MethodInvocation,
    ) -> Result<Option<Vec<u8>>> {
        let reply = self
            .request(InterpreterEvent::ResourceInvokeMethod {
                id: id.clone(),
                invocation: invocation.clone(),
            })
            .await?;
        bytes_reply(reply)
    }
}

fn bytes_reply(reply: EventReply) -> Result<Option<Vec<u8>>> {
    match reply {
        EventReply::Bytes { data } if data.is_empty() => Ok(None),
        EventReply::Bytes { data } => Ok(Some(data)),
        EventReply::Error { message } => Err(AtelierError::Resource(message)),
        other => Err(AtelierError::Rpc(format!("unexpected reply {:?}", other))),
    }
}
