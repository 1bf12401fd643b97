//! Angular object registry
//!
//! Front-end bound variables shared between the controller and an
//! interpreter process. Every mutation takes an `emit` flag: local changes
//! are broadcast to the controller, changes that arrived from the controller
//! are applied silently so they are not echoed back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::rpc::event::EventRelay;
use crate::rpc::protocol::InterpreterEvent;

/// A bound variable. No note id means global; a note id without a paragraph
/// id means note-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngularObject {
    pub name: String,
    #[serde(default)]
    pub note_id: Option<String>,
    #[serde(default)]
    pub paragraph_id: Option<String>,
    pub value: Value,
}

/// Whole-registry form pushed by the controller
pub type RegistrySnapshot = Vec<AngularObject>;

type ScopeKey = (Option<String>, Option<String>, String);

fn scope_key(name: &str, note_id: Option<&str>, paragraph_id: Option<&str>) -> ScopeKey {
    (
        note_id.map(str::to_string),
        paragraph_id.map(str::to_string),
        name.to_string(),
    )
}

pub struct AngularObjectRegistry {
    group_id: String,
    objects: Mutex<HashMap<ScopeKey, AngularObject>>,
    events: Arc<EventRelay>,
}

impl AngularObjectRegistry {
    pub fn new(group_id: impl Into<String>, events: Arc<EventRelay>) -> Self {
        Self {
            group_id: group_id.into(),
            objects: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Add an object, or update it when one already exists in that scope.
    pub fn add(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        value: Value,
        emit: bool,
    ) -> AngularObject {
        let object = AngularObject {
            name: name.to_string(),
            note_id: note_id.map(str::to_string),
            paragraph_id: paragraph_id.map(str::to_string),
            value,
        };
        let existed = self
            .lock()
            .insert(scope_key(name, note_id, paragraph_id), object.clone())
            .is_some();

        if emit {
            let event = if existed {
                InterpreterEvent::AngularObjectUpdate {
                    object: object.clone(),
                }
            } else {
                InterpreterEvent::AngularObjectAdd {
                    object: object.clone(),
                }
            };
            self.events.emit(event);
        }
        object
    }

    /// Replace the value of an existing object. Unknown objects are ignored.
    pub fn update(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        value: Value,
        emit: bool,
    ) -> Option<AngularObject> {
        let updated = {
            let mut objects = self.lock();
            let object = objects.get_mut(&scope_key(name, note_id, paragraph_id))?;
            object.value = value;
            object.clone()
        };
        if emit {
            self.events.emit(InterpreterEvent::AngularObjectUpdate {
                object: updated.clone(),
            });
        }
        Some(updated)
    }

    pub fn remove(
        &self,
        name: &str,
        note_id: Option<&str>,
        paragraph_id: Option<&str>,
        emit: bool,
    ) -> Option<AngularObject> {
        let removed = self.lock().remove(&scope_key(name, note_id, paragraph_id))?;
        if emit {
            self.events.emit(InterpreterEvent::AngularObjectRemove {
                name: removed.name.clone(),
                note_id: removed.note_id.clone(),
                paragraph_id: removed.paragraph_id.clone(),
            });
        }
        Some(removed)
    }

    /// Exact-scope lookup
    pub fn get(&self, name: &str, note_id: Option<&str>, paragraph_id: Option<&str>) -> Option<AngularObject> {
        self.lock()
            .get(&scope_key(name, note_id, paragraph_id))
            .cloned()
    }

    /// Objects in exactly one scope
    pub fn get_all(&self, note_id: Option<&str>, paragraph_id: Option<&str>) -> Vec<AngularObject> {
        self.lock()
            .values()
            .filter(|o| o.note_id.as_deref() == note_id && o.paragraph_id.as_deref() == paragraph_id)
            .cloned()
            .collect()
    }

    /// Drop every object in one scope, silently.
    pub fn remove_all(&self, note_id: Option<&str>, paragraph_id: Option<&str>) -> usize {
        let mut objects = self.lock();
        let before = objects.len();
        objects.retain(|(note, para, _), _| {
            !(note.as_deref() == note_id && para.as_deref() == paragraph_id)
        });
        before - objects.len()
    }

    /// Everything, for pushing to a peer
    pub fn registry(&self) -> RegistrySnapshot {
        self.lock().values().cloned().collect()
    }

    /// Replace the whole registry with the controller's copy, silently.
    pub fn set_registry(&self, snapshot: RegistrySnapshot) {
        let mut objects = self.lock();
        objects.clear();
        for object in snapshot {
            let key = scope_key(
                &object.name,
                object.note_id.as_deref(),
                object.paragraph_id.as_deref(),
            );
            objects.insert(key, object);
        }
        tracing::debug!("Angular registry for {} replaced ({} objects)", self.group_id, objects.len());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScopeKey, AngularObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
