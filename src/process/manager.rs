//! Process manager - the controller's registry of interpreter processes
//!
//! Owns the event server every process calls back into, launches processes
//! on demand, brokers resource lookups between groups, and reattaches to
//! surviving processes from recovery storage after a restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::client::InterpreterClient;
use super::launcher::{InterpreterLauncher, PendingRegistrations};
use super::{LoggingEventListener, ProcessEventListener};
use crate::config::AtelierConfig;
use crate::interpreter::{InterpreterResult, RemoteContext};
use crate::recovery::RecoveryStorage;
use crate::resource::{MethodInvocation, ResourceId, ResourceInfo};
use crate::rpc::protocol::{EventReply, EventRequest, InterpreterEvent};
use crate::rpc::transport::{RpcHandler, RpcServer};
use crate::{AtelierError, Result};

pub struct ProcessManager {
    config: AtelierConfig,
    launcher: InterpreterLauncher,
    storage: Arc<dyn RecoveryStorage>,
    listener: Arc<dyn ProcessEventListener>,
    clients: Mutex<HashMap<String, Arc<InterpreterClient>>>,
    /// One launch at a time so a group is never launched twice
    launching: tokio::sync::Mutex<()>,
    registrations: PendingRegistrations,
    event_host: String,
    event_addr: Mutex<Option<SocketAddr>>,
    stop: CancellationToken,
    this: Weak<ProcessManager>,
}

impl ProcessManager {
    pub fn new(
        config: AtelierConfig,
        storage: Arc<dyn RecoveryStorage>,
        listener: Option<Arc<dyn ProcessEventListener>>,
    ) -> Arc<Self> {
        let listener = listener.unwrap_or_else(|| Arc::new(LoggingEventListener));
        Arc::new_cyclic(|this| Self {
            launcher: InterpreterLauncher::new(&config),
            config,
            storage,
            listener,
            clients: Mutex::new(HashMap::new()),
            launching: tokio::sync::Mutex::new(()),
            registrations: PendingRegistrations::new(),
            event_host: "127.0.0.1".to_string(),
            event_addr: Mutex::new(None),
            stop: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Bind the event server (port 0 picks a free one) and start serving.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| AtelierError::Transport("manager dropped during start".to_string()))?;
        let server = RpcServer::bind(&self.event_host, port).await?;
        let addr = server.local_addr()?;
        *lock(&self.event_addr) = Some(addr);
        tokio::spawn(server.serve(this, self.stop.clone()));
        tracing::info!("Controller event server listening on {}", addr);
        Ok(addr)
    }

    pub fn event_addr(&self) -> Option<SocketAddr> {
        *lock(&self.event_addr)
    }

    pub fn config(&self) -> &AtelierConfig {
        &self.config
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<InterpreterClient>> {
        lock(&self.clients).get(group_id).cloned()
    }

    /// Group ids with a live client, sorted
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.clients).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reattach to every stored process that still answers; purge the rest.
    /// Never fails: problems are logged. Returns the restored group ids.
    pub async fn restore(&self) -> Vec<String> {
        let registrations = match self.storage.load_all() {
            Ok(registrations) => registrations,
            Err(e) => {
                tracing::error!("Failed to load registrations: {}", e);
                return Vec::new();
            }
        };
        let Some(event_addr) = self.event_addr() else {
            tracing::error!("Restore before the event server started");
            return Vec::new();
        };

        let mut restored = Vec::new();
        for registration in registrations {
            let group_id = registration.group_id.clone();
            let probe_timeout = self.config.connect_timeout.min(Duration::from_secs(5));
            let client = match InterpreterClient::connect(
                &group_id,
                &registration.host,
                registration.port,
                probe_timeout,
            )
            .await
            {
                Ok(client) => client.with_shutdown_grace(self.config.shutdown_grace),
                Err(e) => {
                    tracing::warn!("Dropping registration of {} ({}): {}", group_id, registration.endpoint(), e);
                    self.forget_registration(&group_id);
                    continue;
                }
            };

            if !client.recover().await {
                tracing::warn!("Dropping registration of {}: probe failed", group_id);
                self.forget_registration(&group_id);
                continue;
            }
            if let Err(e) = client.reconnect(&self.event_host, event_addr.port()).await {
                tracing::warn!("Dropping registration of {}: reconnect failed: {}", group_id, e);
                self.forget_registration(&group_id);
                continue;
            }

            tracing::info!("Restored interpreter process {} at {}", group_id, registration.endpoint());
            lock(&self.clients).insert(group_id.clone(), Arc::new(client));
            restored.push(group_id);
        }
        restored
    }

    fn forget_registration(&self, group_id: &str) {
        if let Err(e) = self.storage.on_client_stop(group_id) {
            tracing::warn!("Failed to remove registration of {}: {}", group_id, e);
        }
    }

    /// The live client for `group_id`, launching a process when there is none
    /// (or the one we had has gone away).
    pub async fn get_or_launch(&self, group_id: &str) -> Result<Arc<InterpreterClient>> {
        let _launching = self.launching.lock().await;
        if let Some(client) = self.get(group_id) {
            if !client.is_closed() {
                return Ok(client);
            }
            tracing::warn!("Interpreter process {} is gone, relaunching", group_id);
            self.remove_client(group_id);
        }

        let event_addr = self
            .event_addr()
            .ok_or_else(|| AtelierError::Launch("event server not started".to_string()))?;
        let client = self
            .launcher
            .launch(group_id, &self.event_host, event_addr.port(), &self.registrations)
            .await?;

        if let Err(e) = client.init(self.config.to_properties()).await {
            tracing::error!("Init of {} failed: {}", group_id, e);
            client.stop().await;
            return Err(AtelierError::Launch(format!("init failed: {}", e)));
        }
        if let Err(e) = self.storage.on_client_start(&client.registration()) {
            tracing::warn!("Failed to record {}: {}", group_id, e);
        }

        let client = Arc::new(client);
        lock(&self.clients).insert(group_id.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a client from the registry and from storage.
    fn remove_client(&self, group_id: &str) -> Option<Arc<InterpreterClient>> {
        let removed = lock(&self.clients).remove(group_id);
        self.forget_registration(group_id);
        removed
    }

    /// Drop the client when `result` says its process is gone.
    fn check_transport<T>(&self, group_id: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport_failure() {
                tracing::warn!("Lost interpreter process {}: {}", group_id, e);
                self.remove_client(group_id);
            }
        }
        result
    }

    /// Run a paragraph in `group_id`, launching its process if needed.
    #[allow(clippy::too_many_arguments)]
    pub async fn interpret(
        &self,
        group_id: &str,
        session_id: &str,
        class_name: &str,
        properties: HashMap<String, String>,
        user_name: &str,
        script: &str,
        context: RemoteContext,
    ) -> Result<InterpreterResult> {
        let client = self.get_or_launch(group_id).await?;
        let created = client
            .create_interpreter(session_id, class_name, properties, user_name)
            .await;
        self.check_transport(group_id, created)?;

        let result = client.interpret(session_id, class_name, script, context).await;
        let result = self.check_transport(group_id, result)?;
        if let Err(e) = self.storage.touch(group_id, Utc::now()) {
            tracing::debug!("Failed to touch registration of {}: {}", group_id, e);
        }
        Ok(result)
    }

    pub async fn cancel(
        &self,
        group_id: &str,
        session_id: &str,
        class_name: &str,
        context: RemoteContext,
    ) -> Result<()> {
        let client = self.require(group_id)?;
        let result = client.cancel(session_id, class_name, context).await;
        self.check_transport(group_id, result)
    }

    pub async fn get_status(&self, group_id: &str, session_id: &str, job_id: &str) -> Result<String> {
        let client = self.require(group_id)?;
        let result = client.get_status(session_id, job_id).await;
        self.check_transport(group_id, result)
    }

    fn require(&self, group_id: &str) -> Result<Arc<InterpreterClient>> {
        self.get(group_id)
            .ok_or_else(|| AtelierError::ProcessNotRunning(group_id.to_string()))
    }

    /// Stop one process and forget it.
    pub async fn stop_process(&self, group_id: &str) {
        if let Some(client) = self.remove_client(group_id) {
            client.stop().await;
        }
    }

    /// Stop the event server. With `stop_processes` every process is shut
    /// down too; otherwise they keep running for the next controller to
    /// restore.
    pub async fn shutdown(&self, stop_processes: bool) {
        if stop_processes {
            let clients: Vec<Arc<InterpreterClient>> = lock(&self.clients).drain().map(|(_, c)| c).collect();
            for client in clients {
                client.stop().await;
                self.forget_registration(client.group_id());
            }
        }
        self.stop.cancel();
    }

    fn others(&self, group_id: &str) -> Vec<Arc<InterpreterClient>> {
        lock(&self.clients)
            .iter()
            .filter(|(id, _)| id.as_str() != group_id)
            .map(|(_, client)| client.clone())
            .collect()
    }

    /// Every resource the other groups hold
    async fn broker_get_all(&self, requester: &str) -> Vec<ResourceInfo> {
        let mut all = Vec::new();
        for client in self.others(requester) {
            match client.resource_pool_get_all().await {
                Ok(resources) => all.extend(resources),
                Err(e) => tracing::warn!("Resource listing from {} failed: {}", client.group_id(), e),
            }
        }
        all
    }

    /// First non-empty answer from another group
    async fn broker_get(&self, requester: &str, id: &ResourceId) -> Vec<u8> {
        for client in self.others(requester) {
            match client
                .resource_get(id.note_id.as_deref(), id.paragraph_id.as_deref(), &id.name)
                .await
            {
                Ok(data) if !data.is_empty() => return data,
                Ok(_) => {}
                Err(e) => tracing::warn!("Resource get from {} failed: {}", client.group_id(), e),
            }
        }
        Vec::new()
    }

    async fn broker_invoke(&self, requester: &str, id: &ResourceId, invocation: &MethodInvocation) -> Vec<u8> {
        for client in self.others(requester) {
            match client
                .resource_invoke_method(
                    id.note_id.as_deref(),
                    id.paragraph_id.as_deref(),
                    &id.name,
                    invocation.clone(),
                )
                .await
            {
                Ok(data) if !data.is_empty() => return data,
                Ok(_) => {}
                Err(e) => tracing::debug!("Invoke on {} failed: {}", client.group_id(), e),
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl RpcHandler for ProcessManager {
    type Request = EventRequest;
    type Reply = EventReply;

    async fn handle(&self, request: EventRequest) -> EventReply {
        let EventRequest { group_id, event } = request;
        match event {
            InterpreterEvent::RegisterProcess { host, port } => {
                if !self.registrations.complete(&group_id, &host, port) {
                    tracing::warn!("Unexpected registration from {} at {}:{}", group_id, host, port);
                }
                EventReply::Ok
            }
            InterpreterEvent::UnregisterProcess => {
                tracing::info!("Interpreter process {} unregistered", group_id);
                self.remove_client(&group_id);
                self.listener.on_event(&group_id, &InterpreterEvent::UnregisterProcess);
                EventReply::Ok
            }
            InterpreterEvent::ResourcePoolGetAll => EventReply::Resources {
                resources: self.broker_get_all(&group_id).await,
            },
            InterpreterEvent::ResourceGet { id } => EventReply::Bytes {
                data: self.broker_get(&group_id, &id).await,
            },
            InterpreterEvent::ResourceInvokeMethod { id, invocation } => EventReply::Bytes {
                data: self.broker_invoke(&group_id, &id, &invocation).await,
            },
            other => {
                self.listener.on_event(&group_id, &other);
                EventReply::Ok
            }
        }
    }

    fn malformed(&self, error: String) -> EventReply {
        EventReply::Error { message: error }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::InterpreterFactory;
    use crate::lifecycle::ShutdownTarget;
    use crate::recovery::{NullRecoveryStorage, ProcessRegistration, SqliteRecoveryStorage};
    use crate::server::InterpreterServer;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<(String, InterpreterEvent)>>);

    impl ProcessEventListener for Collecting {
        fn on_event(&self, group_id: &str, event: &InterpreterEvent) {
            self.0.lock().unwrap().push((group_id.to_string(), event.clone()));
        }
    }

    #[tokio::test]
    async fn restore_keeps_live_processes_and_purges_dead_ones() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteRecoveryStorage::open(dir.path()).unwrap());

        let live = InterpreterServer::new("live", InterpreterFactory::with_defaults());
        let handle = live.start("127.0.0.1", 0, None).await.unwrap();
        storage
            .on_client_start(&ProcessRegistration::new("live", "127.0.0.1", handle.addr.port()))
            .unwrap();

        let closed_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        storage
            .on_client_start(&ProcessRegistration::new("dead", "127.0.0.1", closed_port))
            .unwrap();

        let manager = ProcessManager::new(AtelierConfig::default(), storage.clone(), None);
        manager.start(0).await.unwrap();
        let restored = manager.restore().await;

        assert_eq!(restored, vec!["live".to_string()]);
        assert_eq!(manager.group_ids(), vec!["live".to_string()]);
        let remaining: Vec<String> = storage.load_all().unwrap().into_iter().map(|r| r.group_id).collect();
        assert_eq!(remaining, vec!["live".to_string()]);

        live.shutdown().await.unwrap();
        handle.wait().await;
        manager.shutdown(false).await;
    }

    #[tokio::test]
    async fn events_reach_listener_and_unregister_drops_client() {
        let collecting = Arc::new(Collecting::default());
        let manager = ProcessManager::new(
            AtelierConfig::default(),
            Arc::new(NullRecoveryStorage),
            Some(collecting.clone() as Arc<dyn ProcessEventListener>),
        );

        let reply = manager
            .handle(EventRequest {
                group_id: "g1".to_string(),
                event: InterpreterEvent::OutputClear {
                    note_id: "n".to_string(),
                    paragraph_id: "p".to_string(),
                },
            })
            .await;
        assert!(matches!(reply, EventReply::Ok));

        let reply = manager
            .handle(EventRequest {
                group_id: "g1".to_string(),
                event: InterpreterEvent::ResourceGet {
                    id: ResourceId::new("g1", None, None, "x"),
                },
            })
            .await;
        assert!(matches!(reply, EventReply::Bytes { data } if data.is_empty()));

        let events = collecting.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "g1");
    }

    #[tokio::test]
    async fn brokers_resources_between_groups() {
        let holder = InterpreterServer::new("holder", InterpreterFactory::with_defaults());
        holder
            .create_interpreter("holder", "note1", "sh", &HashMap::new(), "alice")
            .unwrap();
        holder
            .group()
            .unwrap()
            .resource_pool()
            .put(Some("note1"), Some("p1"), "x", "hello");
        let handle = holder.start("127.0.0.1", 0, None).await.unwrap();

        let manager = ProcessManager::new(AtelierConfig::default(), Arc::new(NullRecoveryStorage), None);
        let client = InterpreterClient::connect("holder", "127.0.0.1", handle.addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        lock(&manager.clients).insert("holder".to_string(), Arc::new(client));

        let reply = manager
            .handle(EventRequest {
                group_id: "asker".to_string(),
                event: InterpreterEvent::ResourceGet {
                    id: ResourceId::new("asker", Some("note1"), Some("p1"), "x"),
                },
            })
            .await;
        match reply {
            EventReply::Bytes { data } => {
                assert_eq!(serde_json::from_slice::<serde_json::Value>(&data).unwrap(), "hello")
            }
            other => panic!("unexpected reply {:?}", other),
        }

        // The holder is never asked for its own resources
        let reply = manager
            .handle(EventRequest {
                group_id: "holder".to_string(),
                event: InterpreterEvent::ResourcePoolGetAll,
            })
            .await;
        assert!(matches!(reply, EventReply::Resources { resources } if resources.is_empty()));

        holder.shutdown().await.unwrap();
        handle.wait().await;
    }
}
