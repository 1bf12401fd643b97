//! Interpreter server - the RPC controller inside an interpreter process
//!
//! Answers every [`InterpreterRequest`] against the process's single
//! [`InterpreterGroup`], which is created by the first `create_interpreter`.
//!
//! # Architecture
//!
//! ```text
//!  controller ──InterpreterRequest──► InterpreterServer ──► InterpreterGroup
//!      ▲                                   │                 │ session → interpreters
//!      │                                   │                 │ resource pool
//!      └────────InterpreterEvent───────────┘                 │ angular registry
//!           (output, progress, register)                     └ hooks
//! ```
//!
//! `interpret` turns into a [`Job`] on the target interpreter's scheduler;
//! the calling task only waits for the job's terminal status.

mod interpret_job;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::angular::RegistrySnapshot;
use crate::config::AtelierConfig;
use crate::group::InterpreterGroup;
use crate::interpreter::output::EventOutputListener;
use crate::interpreter::{
    Completion, FormType, InterpreterContext, InterpreterFactory, InterpreterOutput,
    InterpreterResult, ManagedInterpreter, ProgressMap, RemoteContext,
};
use crate::lifecycle::{LifecycleManager, NullLifecycleManager, ShutdownTarget, create_lifecycle_manager};
use crate::resource::{MethodInvocation, ResourceInfo};
use crate::rpc::event::{EventRelay, RemoteEventClient};
use crate::rpc::protocol::{EventReply, InterpreterEvent, InterpreterReply, InterpreterRequest};
use crate::rpc::transport::{RpcHandler, RpcServer};
use crate::scheduler::{Job, UNKNOWN_STATUS};
use crate::{AtelierError, Result};

use interpret_job::InterpretJob;

/// Message returned when a recover request finds no cached job
pub const JOB_NOT_RECOVERABLE: &str = "Job is finished, unable to recover it";

/// A started server: where it listens and the serve loop's task
pub struct ServerHandle {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the serve loop to end (after `shutdown`).
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            tracing::error!("Serve loop ended abnormally: {}", e);
        }
    }
}

pub struct InterpreterServer {
    /// Group id this process was launched for
    process_group_id: String,
    factory: InterpreterFactory,
    config: RwLock<AtelierConfig>,
    events: Arc<EventRelay>,
    event_connected: AtomicBool,
    /// Controller event endpoint, once known
    controller: Mutex<Option<(String, u16)>>,
    /// This server's advertised endpoint, once bound
    endpoint: Mutex<Option<(String, u16)>>,
    group: OnceLock<Arc<InterpreterGroup>>,
    progress: ProgressMap,
    /// Paragraph id → latest job, kept for recovery and status lookups
    recent_jobs: Arc<Mutex<HashMap<String, Arc<Job>>>>,
    lifecycle: RwLock<Arc<dyn LifecycleManager>>,
    shutting_down: AtomicBool,
    stop: CancellationToken,
    this: Weak<InterpreterServer>,
}

impl InterpreterServer {
    pub fn new(process_group_id: impl Into<String>, factory: InterpreterFactory) -> Arc<Self> {
        Self::with_config(process_group_id, factory, AtelierConfig::default())
    }

    pub fn with_config(
        process_group_id: impl Into<String>,
        factory: InterpreterFactory,
        config: AtelierConfig,
    ) -> Arc<Self> {
        let process_group_id = process_group_id.into();
        Arc::new_cyclic(|this| Self {
            process_group_id,
            factory,
            config: RwLock::new(config),
            events: Arc::new(EventRelay::detached()),
            event_connected: AtomicBool::new(false),
            controller: Mutex::new(None),
            endpoint: Mutex::new(None),
            group: OnceLock::new(),
            progress: ProgressMap::default(),
            recent_jobs: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: RwLock::new(Arc::new(NullLifecycleManager)),
            shutting_down: AtomicBool::new(false),
            stop: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn process_group_id(&self) -> &str {
        &self.process_group_id
    }

    pub fn group(&self) -> Option<&Arc<InterpreterGroup>> {
        self.group.get()
    }

    pub fn events(&self) -> &Arc<EventRelay> {
        &self.events
    }

    pub fn config(&self) -> AtelierConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Bind the RPC endpoint and start serving. With a controller endpoint
    /// the event channel is connected and the process registers itself; if
    /// that fails the server is shut down again and the error returned.
    pub async fn start(
        &self,
        host: &str,
        port: u16,
        controller: Option<(String, u16)>,
    ) -> Result<ServerHandle> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| AtelierError::Launch("server dropped during start".to_string()))?;

        let rpc = RpcServer::bind(host, port).await?;
        let addr = rpc.local_addr()?;
        *lock(&self.endpoint) = Some((host.to_string(), addr.port()));
        let task = tokio::spawn(rpc.serve(this, self.stop.clone()));
        tracing::info!("Interpreter process {} serving on {}", self.process_group_id, addr);

        if let Some((event_host, event_port)) = controller {
            *lock(&self.controller) = Some((event_host, event_port));
            if let Err(e) = self.register().await {
                tracing::error!("Failed to register with controller: {}", e);
                if let Err(stop_err) = self.shutdown().await {
                    tracing::warn!("Shutdown after failed registration: {}", stop_err);
                }
                return Err(AtelierError::Launch(format!("registration failed: {}", e)));
            }
        }

        Ok(ServerHandle { addr, task })
    }

    /// Connect the event channel (if needed) and announce our endpoint.
    async fn register(&self) -> Result<()> {
        self.connect_events().await?;
        let (host, port) = lock(&self.endpoint)
            .clone()
            .ok_or_else(|| AtelierError::Launch("server not bound".to_string()))?;
        match self
            .events
            .request(InterpreterEvent::RegisterProcess { host, port })
            .await?
        {
            EventReply::Error { message } => Err(AtelierError::Rpc(message)),
            _ => Ok(()),
        }
    }

    async fn connect_events(&self) -> Result<()> {
        if self.event_connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some((host, port)) = lock(&self.controller).clone() else {
            tracing::debug!("No controller endpoint known, events stay local");
            return Ok(());
        };
        let timeout = self.config().connect_timeout;
        let client = RemoteEventClient::connect(&host, port, self.process_group_id.clone(), timeout).await?;
        self.events.replace(Arc::new(client));
        self.event_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn lifecycle(&self) -> Arc<dyn LifecycleManager> {
        match self.lifecycle.read() {
            Ok(manager) => manager.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn touch(&self) {
        self.lifecycle().on_process_used(&self.process_group_id);
    }

    /// One-time setup: adopt the controller's configuration and start the
    /// lifecycle manager it asks for.
    pub async fn init(&self, properties: &HashMap<String, String>) -> Result<()> {
        let config = AtelierConfig::from_properties(properties)?;
        let target: Weak<dyn ShutdownTarget> = self.this.clone();
        let manager = create_lifecycle_manager(&config, target);
        manager.on_process_started(&self.process_group_id);

        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        let previous = match self.lifecycle.write() {
            Ok(mut current) => std::mem::replace(&mut *current, manager),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), manager),
        };
        previous.stop();

        self.connect_events().await?;
        tracing::info!("Interpreter process {} initialized", self.process_group_id);
        Ok(())
    }

    fn group_or_create(&self, group_id: &str) -> Result<Arc<InterpreterGroup>> {
        let group = self.group.get_or_init(|| {
            tracing::info!("Creating interpreter group {}", group_id);
            Arc::new(InterpreterGroup::new(group_id, self.events.clone()))
        });
        if group.id() != group_id {
            return Err(AtelierError::Config(format!(
                "process hosts group {}, not {}",
                group.id(),
                group_id
            )));
        }
        Ok(group.clone())
    }

    fn require_group(&self) -> Result<Arc<InterpreterGroup>> {
        self.group
            .get()
            .cloned()
            .ok_or_else(|| AtelierError::Interpreter("no interpreter has been created yet".to_string()))
    }

    fn interpreter(&self, session_id: &str, class_name: &str) -> Result<Arc<ManagedInterpreter>> {
        self.require_group()?.get_interpreter(session_id, class_name)
    }

    pub fn create_interpreter(
        &self,
        group_id: &str,
        session_id: &str,
        class_name: &str,
        properties: &HashMap<String, String>,
        user_name: &str,
    ) -> Result<()> {
        let group = self.group_or_create(group_id)?;
        if group.get_interpreter(session_id, class_name).is_ok() {
            tracing::debug!("Interpreter {} already exists in session {}", class_name, session_id);
            return Ok(());
        }

        let inner = self.factory.create(class_name, properties)?;
        let managed = ManagedInterpreter::new(inner, session_id, user_name, self.config().parallel_max);
        group.add_interpreter_to_session(Arc::new(managed), session_id);
        Ok(())
    }

    pub async fn open(&self, session_id: &str, class_name: &str) -> Result<()> {
        self.interpreter(session_id, class_name)?.open().await
    }

    /// Close one interpreter and unbind it from its session.
    pub async fn close(&self, session_id: &str, class_name: &str) -> Result<()> {
        let Some(group) = self.group.get() else {
            return Ok(());
        };
        match group.remove_interpreter(session_id, class_name) {
            Some(interpreter) => interpreter.close().await,
            None => {
                tracing::debug!("Nothing to close for {} in session {}", class_name, session_id);
                Ok(())
            }
        }
    }

    fn context(&self, group: &InterpreterGroup, remote: RemoteContext) -> InterpreterContext {
        let listener = Arc::new(EventOutputListener::new(
            remote.note_id.clone(),
            remote.paragraph_id.clone(),
            self.events.clone(),
        ));
        let out = InterpreterOutput::new(self.config().output_limit, Some(listener));
        InterpreterContext::new(
            remote,
            out,
            group.resource_pool().clone(),
            group.angular().clone(),
            self.progress.clone(),
        )
        .with_events(self.events.clone())
    }

    /// Run `script` and wait for the job to finish.
    ///
    /// With the recover flag set, attach to the paragraph's existing job
    /// instead of starting a new one.
    pub async fn interpret(
        &self,
        session_id: &str,
        class_name: &str,
        script: &str,
        remote: RemoteContext,
    ) -> Result<InterpreterResult> {
        self.touch();
        let group = self.require_group()?;
        let interpreter = group.get_interpreter(session_id, class_name)?;
        let paragraph_id = remote.paragraph_id.clone();

        let context = self.context(&group, remote);
        let job = if context.is_recover() {
            match lock(&self.recent_jobs).get(&paragraph_id).cloned() {
                Some(job) => {
                    tracing::info!(paragraph = %paragraph_id, "Recovering job in {}", job.status());
                    job
                }
                None => return Ok(InterpreterResult::error(JOB_NOT_RECOVERABLE)),
            }
        } else {
            let body = InterpretJob::new(interpreter.clone(), group.hooks().clone(), script, context);
            let job = Arc::new(Job::new(
                paragraph_id.clone(),
                format!("{}-{}", class_name, paragraph_id),
                Arc::new(body),
            ));
            interpreter.scheduler().submit(job.clone())?;
            lock(&self.recent_jobs).insert(paragraph_id.clone(), job.clone());
            job
        };

        let status = job.wait_terminated().await;
        tracing::debug!(paragraph = %paragraph_id, "Job ended in {}", status);
        self.progress.clear(&paragraph_id);
        self.evict_later(job.clone());

        Ok(job.result().unwrap_or_else(InterpreterResult::keep_previous))
    }

    /// Drop a terminal job from the recent index once the result cache
    /// window has passed, unless a newer job took its place.
    fn evict_later(&self, job: Arc<Job>) {
        let window = self.config().result_cache;
        let recent = self.recent_jobs.clone();
        let evict = move || {
            let mut jobs = lock(&recent);
            if jobs.get(job.id()).is_some_and(|current| Arc::ptr_eq(current, &job)) {
                jobs.remove(job.id());
            }
        };
        if window.is_zero() {
            evict();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                evict();
            });
        }
    }

    /// Abort a pending job; otherwise ask the interpreter to stop.
    pub async fn cancel(&self, session_id: &str, class_name: &str, remote: RemoteContext) -> Result<()> {
        let group = self.require_group()?;
        let interpreter = group.get_interpreter(session_id, class_name)?;

        if let Some(job) = interpreter.scheduler().get_job(&remote.paragraph_id) {
            tracing::info!(paragraph = %remote.paragraph_id, "Cancelling job in {}", job.status());
            job.abort();
            return Ok(());
        }

        let context = self.context(&group, remote);
        tokio::spawn(async move {
            if let Err(e) = interpreter.interpreter().cancel(&context).await {
                tracing::warn!("Cancel of {} failed: {}", interpreter.class_name(), e);
            }
        });
        Ok(())
    }

    pub async fn get_progress(&self, session_id: &str, class_name: &str, remote: RemoteContext) -> Result<u8> {
        self.touch();
        if let Some(progress) = self.progress.get(&remote.paragraph_id) {
            return Ok(progress);
        }
        let group = self.require_group()?;
        let interpreter = group.get_interpreter(session_id, class_name)?;
        let context = self.context(&group, remote);
        Ok(interpreter.interpreter().progress(&context).await?.min(100))
    }

    /// Status name of a job, `UNKNOWN` when nobody knows it
    pub fn get_status(&self, session_id: &str, job_id: &str) -> String {
        self.touch();
        let Some(group) = self.group.get() else {
            return UNKNOWN_STATUS.to_string();
        };
        if group.session(session_id).is_none() {
            return UNKNOWN_STATUS.to_string();
        }
        if let Some(job) = group.find_job(session_id, job_id) {
            return job.status().to_string();
        }
        lock(&self.recent_jobs)
            .get(job_id)
            .map(|job| job.status().to_string())
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string())
    }

    pub fn get_form_type(&self, session_id: &str, class_name: &str) -> Result<FormType> {
        Ok(self.interpreter(session_id, class_name)?.interpreter().form_type())
    }

    pub async fn completion(
        &self,
        session_id: &str,
        class_name: &str,
        buffer: &str,
        cursor: usize,
        remote: RemoteContext,
    ) -> Result<Vec<Completion>> {
        let group = self.require_group()?;
        let interpreter = group.get_interpreter(session_id, class_name)?;
        let context = self.context(&group, remote);
        interpreter.interpreter().completion(buffer, cursor, &context).await
    }

    /// Everything this process holds
    pub async fn resource_pool_get_all(&self) -> Result<Vec<ResourceInfo>> {
        match self.group.get() {
            Some(group) => group.resource_pool().get_all(true).await,
            None => Ok(Vec::new()),
        }
    }

    /// Serialized local value; empty when absent or not serializable
    pub fn resource_get(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> Vec<u8> {
        self.group
            .get()
            .map(|group| group.resource_pool().serve(note_id, paragraph_id, name))
            .unwrap_or_default()
    }

    pub fn resource_remove(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> bool {
        self.group
            .get()
            .and_then(|group| group.resource_pool().remove(note_id, paragraph_id, name))
            .is_some()
    }

    pub fn resource_invoke_method(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        invocation: &MethodInvocation,
    ) -> Result<Vec<u8>> {
        let Some(group) = self.group.get() else {
            return Ok(Vec::new());
        };
        Ok(group
            .resource_pool()
            .invoke_local(note_id, paragraph_id, name, invocation)?
            .unwrap_or_default())
    }

    // Angular mutations from the controller are applied without echoing
    // them back.

    pub fn angular_object_add(&self, name: &str, note_id: Option<&str>, paragraph_id: Option<&str>, value: Value) {
        if let Some(group) = self.group.get() {
            group.angular().add(name, note_id, paragraph_id, value, false);
        }
    }

    pub fn angular_object_update(&self, name: &str, note_id: Option<&str>, paragraph_id: Option<&str>, value: Value) {
        let updated = self
            .group
            .get()
            .and_then(|group| group.angular().update(name, note_id, paragraph_id, value, false));
        if updated.is_none() {
            tracing::debug!("Ignoring update of unknown angular object {}", name);
        }
    }

    pub fn angular_object_remove(&self, name: &str, note_id: Option<&str>, paragraph_id: Option<&str>) {
        if let Some(group) = self.group.get() {
            group.angular().remove(name, note_id, paragraph_id, false);
        }
    }

    pub fn angular_registry_push(&self, registry: RegistrySnapshot) {
        if let Some(group) = self.group.get() {
            group.angular().set_registry(registry);
        }
    }

    /// Point the event channel at a (possibly restarted) controller.
    pub async fn reconnect(&self, host: &str, port: u16) -> Result<()> {
        tracing::info!("Reconnecting event channel to {}:{}", host, port);
        *lock(&self.controller) = Some((host.to_string(), port));
        self.event_connected.store(false, Ordering::SeqCst);
        self.connect_events().await
    }

    /// Group id answered to liveness probes
    pub fn ping(&self) -> String {
        self.group
            .get()
            .map(|group| group.id().to_string())
            .unwrap_or_else(|| self.process_group_id.clone())
    }

    async fn dispatch(&self, request: InterpreterRequest) -> Result<InterpreterReply> {
        Ok(match request {
            InterpreterRequest::Init { properties } => {
                self.init(&properties).await?;
                InterpreterReply::Ok
            }
            InterpreterRequest::CreateInterpreter {
                group_id,
                session_id,
                class_name,
                properties,
                user_name,
            } => {
                self.create_interpreter(&group_id, &session_id, &class_name, &properties, &user_name)?;
                InterpreterReply::Ok
            }
            InterpreterRequest::Open {
                session_id,
                class_name,
            } => {
                self.open(&session_id, &class_name).await?;
                InterpreterReply::Ok
            }
            InterpreterRequest::Close {
                session_id,
                class_name,
            } => {
                self.close(&session_id, &class_name).await?;
                InterpreterReply::Ok
            }
            InterpreterRequest::Interpret {
                session_id,
                class_name,
                script,
                context,
            } => InterpreterReply::Result {
                result: self.interpret(&session_id, &class_name, &script, context).await?,
            },
            InterpreterRequest::Cancel {
                session_id,
                class_name,
                context,
            } => {
                self.cancel(&session_id, &class_name, context).await?;
                InterpreterReply::Ok
            }
            InterpreterRequest::GetProgress {
                session_id,
                class_name,
                context,
            } => InterpreterReply::Progress {
                progress: self.get_progress(&session_id, &class_name, context).await?,
            },
            InterpreterRequest::GetStatus { session_id, job_id } => InterpreterReply::Status {
                status: self.get_status(&session_id, &job_id),
            },
            InterpreterRequest::GetFormType {
                session_id,
                class_name,
            } => InterpreterReply::FormType {
                form_type: self.get_form_type(&session_id, &class_name)?,
            },
            InterpreterRequest::Completion {
                session_id,
                class_name,
                buffer,
                cursor,
                context,
            } => InterpreterReply::Completions {
                completions: self
                    .completion(&session_id, &class_name, &buffer, cursor, context)
                    .await?,
            },
            InterpreterRequest::ResourcePoolGetAll => InterpreterReply::Resources {
                resources: self.resource_pool_get_all().await?,
            },
            InterpreterRequest::ResourceGet {
                note_id,
                paragraph_id,
                name,
            } => InterpreterReply::Bytes {
                data: self.resource_get(note_id.as_deref(), paragraph_id.as_deref(), &name),
            },
            InterpreterRequest::ResourceRemove {
                note_id,
                paragraph_id,
                name,
            } => InterpreterReply::Removed {
                removed: self.resource_remove(note_id.as_deref(), paragraph_id.as_deref(), &name),
            },
            InterpreterRequest::ResourceInvokeMethod {
                note_id,
                paragraph_id,
                name,
                invocation,
            } => InterpreterReply::Bytes {
                data: self.resource_invoke_method(
                    note_id.as_deref(),
                    paragraph_id.as_deref(),
                    &name,
                    &invocation,
                )?,
            },
            InterpreterRequest::AngularObjectAdd {
                name,
                note_id,
                paragraph_id,
                value,
            } => {
                self.angular_object_add(&name, note_id.as_deref(), paragraph_id.as_deref(), value);
                InterpreterReply::Ok
            }
            InterpreterRequest::AngularObjectUpdate {
                name,
                note_id,
                paragraph_id,
                value,
            } => {
                self.angular_object_update(&name, note_id.as_deref(), paragraph_id.as_deref(), value);
                InterpreterReply::Ok
            }
            InterpreterRequest::AngularObjectRemove {
                name,
                note_id,
                paragraph_id,
            } => {
                self.angular_object_remove(&name, note_id.as_deref(), paragraph_id.as_deref());
                InterpreterReply::Ok
            }
            InterpreterRequest::AngularRegistryPush { registry } => {
                self.angular_registry_push(registry);
                InterpreterReply::Ok
            }
            InterpreterRequest::Reconnect { host, port } => {
                self.reconnect(&host, port).await?;
                InterpreterReply::Ok
            }
            InterpreterRequest::Ping => InterpreterReply::Pong {
                group_id: Some(self.ping()),
            },
            InterpreterRequest::Shutdown => {
                // Reply first; the serve loop drains it before stopping
                if let Some(this) = self.this.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = this.shutdown().await {
                            tracing::warn!("Shutdown failed: {}", e);
                        }
                    });
                }
                InterpreterReply::Ok
            }
        })
    }
}

#[async_trait]
impl ShutdownTarget for InterpreterServer {
    /// Unregister, close every interpreter, stop serving. Safe to call more
    /// than once; only the first call does anything.
    async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already in progress");
            return Ok(());
        }
        tracing::info!("Shutting down interpreter process {}", self.process_group_id);
        self.lifecycle().stop();
        let grace = self.config().shutdown_grace;

        match tokio::time::timeout(grace, self.events.request(InterpreterEvent::UnregisterProcess)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to unregister: {}", e),
            Err(_) => tracing::warn!("Unregister timed out after {:?}", grace),
        }

        let mut outcome = Ok(());
        if let Some(group) = self.group.get() {
            if tokio::time::timeout(grace, group.close_all()).await.is_err() {
                tracing::warn!("Interpreters did not close within {:?}, stopping anyway", grace);
                outcome = Err(AtelierError::ShutdownTimeout(format!(
                    "interpreters still closing after {:?}",
                    grace
                )));
            }
        }

        self.stop.cancel();
        outcome
    }
}

#[async_trait]
impl RpcHandler for InterpreterServer {
    type Request = InterpreterRequest;
    type Reply = InterpreterReply;

    async fn handle(&self, request: InterpreterRequest) -> InterpreterReply {
        match self.dispatch(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Request failed: {}", e);
                InterpreterReply::Error { message: e.to_string() }
            }
        }
    }

    fn malformed(&self, error: String) -> InterpreterReply {
        InterpreterReply::Error { message: error }
    }
}

/// Serve until stopped: shorthand used by the `interpreter` subcommand.
pub async fn run_interpreter_process(
    group_id: &str,
    host: &str,
    port: u16,
    controller: Option<(String, u16)>,
) -> Result<()> {
    let server = InterpreterServer::new(group_id, InterpreterFactory::with_defaults());
    let handle = server.start(host, port, controller).await?;
    handle.wait().await;
    // Give in-flight replies (the shutdown acknowledgement) a moment to flush
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
