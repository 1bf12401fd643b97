//! Local and distributed resource pools

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{MethodInvocation, Resource, ResourceId, ResourceInfo, ResourceKey, ResourceValue};
use crate::rpc::event::EventRelay;
use crate::{AtelierError, Result};

/// The values this process holds
pub struct LocalResourcePool {
    id: String,
    entries: Mutex<HashMap<ResourceKey, Resource>>,
}

impl LocalResourcePool {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn put(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        value: ResourceValue,
    ) -> ResourceId {
        let id = ResourceId::new(&self.id, note_id, paragraph_id, name);
        self.lock()
            .insert(id.key(), Resource::local(id.clone(), value));
        id
    }

    pub fn get(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> Option<Resource> {
        self.lock().get(&key(note_id, paragraph_id, name)).cloned()
    }

    pub fn get_all(&self) -> Vec<Resource> {
        self.lock().values().cloned().collect()
    }

    pub fn remove(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> Option<Resource> {
        self.lock().remove(&key(note_id, paragraph_id, name))
    }

    /// Drop everything scoped to one paragraph.
    pub fn remove_all(&self, note_id: &str, paragraph_id: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(note, para, _), _| {
            !(note.as_deref() == Some(note_id) && para.as_deref() == Some(paragraph_id))
        });
        before - entries.len()
    }

    /// Serialized value for a remote reader, marking the entry shared.
    /// Empty when absent or not serializable.
    pub fn serve(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> Vec<u8> {
        let mut entries = self.lock();
        let Some(resource) = entries.get_mut(&key(note_id, paragraph_id, name)) else {
            return Vec::new();
        };
        match resource.value().to_bytes() {
            Some(bytes) => {
                resource.mark_shared();
                bytes
            }
            None => Vec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Resource>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key(note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> ResourceKey {
    (
        note_id.map(str::to_string),
        paragraph_id.map(str::to_string),
        name.to_string(),
    )
}

/// A process group's pool, falling back to the rest of the cluster
///
/// Remote lookups go through the event channel and never hold the local
/// lock while waiting.
pub struct DistributedResourcePool {
    local: LocalResourcePool,
    events: Arc<EventRelay>,
}

impl DistributedResourcePool {
    pub fn new(id: impl Into<String>, events: Arc<EventRelay>) -> Self {
        Self {
            local: LocalResourcePool::new(id),
            events,
        }
    }

    pub fn id(&self) -> &str {
        self.local.id()
    }

    pub fn local(&self) -> &LocalResourcePool {
        &self.local
    }

    pub fn put(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        value: impl Into<ResourceValue>,
    ) -> ResourceId {
        self.local.put(note_id, paragraph_id, name, value.into())
    }

    /// Look a resource up, locally first. With `local_only` unset a miss is
    /// forwarded to the controller; the answer comes back as a remote copy.
    pub async fn get(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        local_only: bool,
    ) -> Result<Option<Resource>> {
        if let Some(resource) = self.local.get(note_id, paragraph_id, name) {
            return Ok(Some(resource));
        }
        if local_only {
            return Ok(None);
        }

        let id = ResourceId::new(self.id(), note_id, paragraph_id, name);
        match self.events.fetch_resource(&id).await {
            Ok(Some(bytes)) => {
                let value = ResourceValue::from_bytes(&bytes)?;
                Ok(Some(Resource::remote(id, value)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!("Remote lookup of {} failed: {}", id, e);
                Ok(None)
            }
        }
    }

    /// Every resource visible from here: ours plus, unless `local_only`,
    /// what the other groups hold.
    pub async fn get_all(&self, local_only: bool) -> Result<Vec<ResourceInfo>> {
        let mut all: Vec<ResourceInfo> = self.local.get_all().iter().map(Resource::info).collect();
        if local_only {
            return Ok(all);
        }

        let remote = match self.events.fetch_all_resources().await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Remote resource listing for pool {} failed: {}", self.id(), e);
                return Ok(all);
            }
        };
        all.extend(
            remote
                .into_iter()
                .filter(|info| info.id.pool_id != self.id())
                .map(|mut info| {
                    info.remote = true;
                    info
                }),
        );
        Ok(all)
    }

    /// Remove locally. Copies other processes fetched are unaffected.
    pub fn remove(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
    ) -> Option<Resource> {
        self.local.remove(note_id, paragraph_id, name)
    }

    pub fn remove_all(&self, note_id: &str, paragraph_id: &str) -> usize {
        self.local.remove_all(note_id, paragraph_id)
    }

    /// Serialized local value for a remote reader (empty marker otherwise).
    pub fn serve(&self, note_id: Option<&str>, paragraph_id: Option<&str>, name: &str) -> Vec<u8> {
        self.local.serve(note_id, paragraph_id, name)
    }

    /// Invoke a method on a locally held value.
    ///
    /// Without a return name the serialized return value comes back (empty
    /// when it cannot be serialized). With one, the return value is stored
    /// under that name in the same scope and the new entry's
    /// [`ResourceInfo`] comes back serialized instead.
    pub fn invoke_local(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        invocation: &MethodInvocation,
    ) -> Result<Option<Vec<u8>>> {
        let Some(resource) = self.local.get(note_id, paragraph_id, name) else {
            return Ok(None);
        };
        let returned = resource
            .value()
            .invoke(&invocation.method, &invocation.params)?;

        match &invocation.return_resource_name {
            Some(target) => {
                let serializable = returned.is_serializable();
                let class_name = returned.class_name();
                let id = self.local.put(note_id, paragraph_id, target, returned);
                let info = ResourceInfo {
                    id,
                    class_name,
                    serializable,
                    remote: false,
                };
                Ok(Some(serde_json::to_vec(&info)?))
            }
            None => Ok(returned.to_bytes()),
        }
    }

    /// Invoke locally, or through the controller when the value lives in
    /// another process and `local_only` is unset.
    pub async fn invoke_method(
        &self,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: &str,
        invocation: &MethodInvocation,
        local_only: bool,
    ) -> Result<Option<Vec<u8>>> {
        if self.local.get(note_id, paragraph_id, name).is_some() {
            return self.invoke_local(note_id, paragraph_id, name, invocation);
        }
        if local_only {
            return Err(AtelierError::Resource(format!(
                "{} not found in pool {}",
                name,
                self.id()
            )));
        }
        let id = ResourceId::new(self.id(), note_id, paragraph_id, name);
        self.events.invoke_remote(&id, invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::event::EventChannel;
    use crate::rpc::protocol::{EventReply, InterpreterEvent};
    use async_trait::async_trait;
    use serde_json::json;

    /// Pretends another group holds `remote_name` = "from elsewhere"
    struct Broker;

    #[async_trait]
    impl EventChannel for Broker {
        fn emit(&self, _event: InterpreterEvent) {}

        async fn request(&self, event: InterpreterEvent) -> Result<EventReply> {
            Ok(match event {
                InterpreterEvent::ResourceGet { id } if id.name == "remote_name" => {
                    EventReply::Bytes {
                        data: b"\"from elsewhere\"".to_vec(),
                    }
                }
                InterpreterEvent::ResourceGet { .. } => EventReply::Bytes { data: Vec::new() },
                InterpreterEvent::ResourcePoolGetAll => EventReply::Resources {
                    resources: vec![
                        ResourceInfo {
                            id: ResourceId::new("g2", None, None, "remote_name"),
                            class_name: "string".to_string(),
                            serializable: true,
                            remote: false,
                        },
                        // The broker may echo our own entries back; they must not duplicate
                        ResourceInfo {
                            id: ResourceId::new("g1", None, None, "x"),
                            class_name: "string".to_string(),
                            serializable: true,
                            remote: false,
                        },
                    ],
                },
                _ => EventReply::Ok,
            })
        }
    }

    /// A controller that has gone away
    struct Unreachable;

    #[async_trait]
    impl EventChannel for Unreachable {
        fn emit(&self, _event: InterpreterEvent) {}

        async fn request(&self, _event: InterpreterEvent) -> Result<EventReply> {
            Err(AtelierError::ProcessNotRunning("127.0.0.1:1".to_string()))
        }
    }

    fn pool() -> DistributedResourcePool {
        DistributedResourcePool::new("g1", Arc::new(EventRelay::new(Arc::new(Broker))))
    }

    #[tokio::test]
    async fn put_then_get_is_local() {
        let pool = pool();
        pool.put(None, None, "x", "hello");
        let res = pool.get(None, None, "x", false).await.unwrap().unwrap();
        assert!(!res.is_remote());
        assert!(!res.is_shared());
        assert_eq!(res.value().as_json(), Some(json!("hello")));
    }

    #[tokio::test]
    async fn miss_goes_remote_unless_local_only() {
        let pool = pool();
        assert!(pool.get(None, None, "remote_name", true).await.unwrap().is_none());

        let res = pool.get(None, None, "remote_name", false).await.unwrap().unwrap();
        assert!(res.is_remote());
        assert_eq!(res.value().as_json(), Some(json!("from elsewhere")));

        assert!(pool.get(None, None, "nowhere", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_all_merges_remote_entries() {
        let pool = pool();
        pool.put(None, None, "x", "local");
        let all = pool.get_all(false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|i| i.id.pool_id == "g2" && i.remote));
        assert_eq!(pool.get_all(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_controller_reads_as_absent() {
        let pool = DistributedResourcePool::new("g1", Arc::new(EventRelay::new(Arc::new(Unreachable))));
        pool.put(None, None, "x", "local");

        assert!(pool.get(None, None, "unknown", false).await.unwrap().is_none());
        let all = pool.get_all(false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.name, "x");
    }

    #[test]
    fn remove_reports_existence() {
        let pool = pool();
        pool.put(Some("n1"), Some("p1"), "x", "v");
        assert!(pool.remove(Some("n1"), Some("p1"), "x").is_some());
        assert!(pool.remove(Some("n1"), Some("p1"), "x").is_none());
    }

    #[test]
    fn remove_all_is_paragraph_scoped() {
        let pool = pool();
        pool.put(Some("n1"), Some("p1"), "a", "1");
        pool.put(Some("n1"), Some("p1"), "b", "2");
        pool.put(Some("n1"), Some("p2"), "a", "3");
        pool.put(None, None, "a", "4");
        assert_eq!(pool.remove_all("n1", "p1"), 2);
        assert_eq!(pool.local().get_all().len(), 2);
    }

    #[test]
    fn serve_marks_shared_and_returns_empty_marker() {
        struct Opaque;
        impl crate::resource::ResourceObject for Opaque {
            fn class_name(&self) -> &str {
                "Opaque"
            }
            fn invoke(&self, _m: &str, _p: &[serde_json::Value]) -> Result<ResourceValue> {
                Ok(ResourceValue::Json(json!(null)))
            }
        }

        let pool = pool();
        pool.put(None, None, "x", "v");
        pool.put(None, None, "obj", ResourceValue::Object(Arc::new(Opaque)));

        assert_eq!(pool.serve(None, None, "x"), b"\"v\"");
        assert!(pool.local().get(None, None, "x").unwrap().is_shared());
        assert!(pool.serve(None, None, "obj").is_empty());
        assert!(!pool.local().get(None, None, "obj").unwrap().is_shared());
        assert!(pool.serve(None, None, "missing").is_empty());
    }

    #[test]
    fn invoke_can_republish_return_value() {
        let pool = pool();
        pool.put(Some("n1"), None, "list", json!([1, 2, 3]));

        let bytes = pool
            .invoke_local(Some("n1"), None, "list", &MethodInvocation::new("length", vec![]))
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"3");

        let bytes = pool
            .invoke_local(
                Some("n1"),
                None,
                "list",
                &MethodInvocation::new("get", vec![json!(0)]).returning("first"),
            )
            .unwrap()
            .unwrap();
        let info: ResourceInfo = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(info.id.name, "first");
        assert_eq!(
            pool.local().get(Some("n1"), None, "first").unwrap().value().as_json(),
            Some(json!(1))
        );
    }
}
