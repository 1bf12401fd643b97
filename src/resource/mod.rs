//! Resource pool - named values shared across interpreter processes
//!
//! Each process group keeps its own pool keyed by (note, paragraph, name).
//! Lookups that miss locally go through the controller, which asks the
//! other groups.

pub mod pool;
pub mod value;

pub use pool::{DistributedResourcePool, LocalResourcePool};
pub use value::{ResourceObject, ResourceValue};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where a resource lives: owning pool (group id) plus its scope and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub pool_id: String,
    pub note_id: Option<String>,
    pub paragraph_id: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        pool_id: impl Into<String>,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            note_id: note_id.map(str::to_string),
            paragraph_id: paragraph_id.map(str::to_string),
            name: name.into(),
        }
    }

    pub(crate) fn key(&self) -> ResourceKey {
        (
            self.note_id.clone(),
            self.paragraph_id.clone(),
            self.name.clone(),
        )
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.pool_id,
            self.note_id.as_deref().unwrap_or("-"),
            self.paragraph_id.as_deref().unwrap_or("-"),
            self.name
        )
    }
}

/// (note id, paragraph id, name) inside one pool
pub(crate) type ResourceKey = (Option<String>, Option<String>, String);

/// Description of a resource without its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub class_name: String,
    pub serializable: bool,
    /// Held by another process
    #[serde(default)]
    pub remote: bool,
}

/// A named method call against a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInvocation {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Store the return value under this name instead of returning it
    #[serde(default)]
    pub return_resource_name: Option<String>,
}

impl MethodInvocation {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            return_resource_name: None,
        }
    }

    pub fn returning(mut self, name: impl Into<String>) -> Self {
        self.return_resource_name = Some(name.into());
        self
    }
}

/// One pool entry
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    value: ResourceValue,
    remote: bool,
    shared: bool,
}

impl Resource {
    pub fn local(id: ResourceId, value: ResourceValue) -> Self {
        Self {
            id,
            value,
            remote: false,
            shared: false,
        }
    }

    pub fn remote(id: ResourceId, value: ResourceValue) -> Self {
        Self {
            id,
            value,
            remote: true,
            shared: true,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn value(&self) -> &ResourceValue {
        &self.value
    }

    pub fn into_value(self) -> ResourceValue {
        self.value
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Whether the value has been served to another process
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_serializable(&self) -> bool {
        self.value.is_serializable()
    }

    pub(crate) fn mark_shared(&mut self) {
        self.shared = true;
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id.clone(),
            class_name: self.value.class_name(),
            serializable: self.value.is_serializable(),
            remote: self.remote,
        }
    }
}
