//! Interpreter group - everything one interpreter process holds
//!
//! Sessions (typically one per note) map to the interpreter instances bound
//! to them. All sessions share the group's resource pool, Angular registry
//! and hook registry.
//!
//! The session map is only touched under the group lock. Interpreters are
//! opened and closed outside of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::angular::AngularObjectRegistry;
use crate::interpreter::{InterpreterHookRegistry, ManagedInterpreter};
use crate::resource::DistributedResourcePool;
use crate::rpc::event::EventRelay;
use crate::scheduler::Job;
use crate::{AtelierError, Result};

/// Summary of a session for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub class_names: Vec<String>,
}

pub struct InterpreterGroup {
    id: String,
    /// Session id → interpreter instances, in creation order
    sessions: Mutex<HashMap<String, Vec<Arc<ManagedInterpreter>>>>,
    angular: Arc<AngularObjectRegistry>,
    resource_pool: Arc<DistributedResourcePool>,
    hooks: Arc<InterpreterHookRegistry>,
}

impl InterpreterGroup {
    pub fn new(id: impl Into<String>, events: Arc<EventRelay>) -> Self {
        let id = id.into();
        Self {
            angular: Arc::new(AngularObjectRegistry::new(id.clone(), events.clone())),
            resource_pool: Arc::new(DistributedResourcePool::new(id.clone(), events)),
            hooks: Arc::new(InterpreterHookRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn angular(&self) -> &Arc<AngularObjectRegistry> {
        &self.angular
    }

    pub fn resource_pool(&self) -> &Arc<DistributedResourcePool> {
        &self.resource_pool
    }

    pub fn hooks(&self) -> &Arc<InterpreterHookRegistry> {
        &self.hooks
    }

    /// Bind an interpreter to a session, creating the session on first use.
    ///
    /// A session holds one instance per class; if one already exists it is
    /// kept and returned instead.
    pub fn add_interpreter_to_session(
        &self,
        interpreter: Arc<ManagedInterpreter>,
        session_id: &str,
    ) -> Arc<ManagedInterpreter> {
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.to_string()).or_default();
        if let Some(existing) = session
            .iter()
            .find(|i| i.class_name() == interpreter.class_name())
        {
            tracing::debug!(
                "Interpreter {} already bound to session {}",
                existing.class_name(),
                session_id
            );
            return existing.clone();
        }
        tracing::info!(
            "Bound interpreter {} to session {} in group {}",
            interpreter.class_name(),
            session_id,
            self.id
        );
        session.push(interpreter.clone());
        interpreter
    }

    pub fn get_interpreter(&self, session_id: &str, class_name: &str) -> Result<Arc<ManagedInterpreter>> {
        self.lock()
            .get(session_id)
            .and_then(|session| session.iter().find(|i| i.class_name() == class_name))
            .cloned()
            .ok_or_else(|| AtelierError::InterpreterNotFound {
                session_id: session_id.to_string(),
                class_name: class_name.to_string(),
            })
    }

    /// Interpreters bound to a session
    pub fn session(&self, session_id: &str) -> Option<Vec<Arc<ManagedInterpreter>>> {
        self.lock().get(session_id).cloned()
    }

    /// Unbind one interpreter; the session goes away with its last one.
    pub fn remove_interpreter(&self, session_id: &str, class_name: &str) -> Option<Arc<ManagedInterpreter>> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(session_id)?;
        let at = session.iter().position(|i| i.class_name() == class_name)?;
        let removed = session.remove(at);
        if session.is_empty() {
            sessions.remove(session_id);
        }
        Some(removed)
    }

    /// Find a job by id in any scheduler of the session
    pub fn find_job(&self, session_id: &str, job_id: &str) -> Option<Arc<Job>> {
        let interpreters = self.session(session_id)?;
        interpreters
            .iter()
            .find_map(|i| i.scheduler().get_job(job_id))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .lock()
            .iter()
            .map(|(id, interpreters)| SessionInfo {
                session_id: id.clone(),
                class_names: interpreters.iter().map(|i| i.class_name().to_string()).collect(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Remove every session and close every interpreter.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<ManagedInterpreter>> = {
            let mut sessions = self.lock();
            sessions.drain().flat_map(|(_, interpreters)| interpreters).collect()
        };
        for interpreter in drained {
            if let Err(e) = interpreter.close().await {
                tracing::warn!(
                    "Failed to close interpreter {} of session {}: {}",
                    interpreter.class_name(),
                    interpreter.session_id(),
                    e
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<ManagedInterpreter>>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::ShellInterpreter;

    fn managed(session: &str) -> Arc<ManagedInterpreter> {
        Arc::new(ManagedInterpreter::new(
            Arc::new(ShellInterpreter::new(&HashMap::new())),
            session,
            "user",
            4,
        ))
    }

    #[tokio::test]
    async fn sessions_are_created_on_first_use_and_removed_with_last_interpreter() {
        let group = InterpreterGroup::new("g1", Arc::new(EventRelay::detached()));
        assert_eq!(group.session_count(), 0);

        let first = group.add_interpreter_to_session(managed("note1"), "note1");
        let again = group.add_interpreter_to_session(managed("note1"), "note1");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(group.session_count(), 1);
        assert_eq!(
            group.list(),
            vec![SessionInfo {
                session_id: "note1".to_string(),
                class_names: vec!["sh".to_string()],
            }]
        );

        assert!(group.get_interpreter("note1", "sh").is_ok());
        assert!(matches!(
            group.get_interpreter("note1", "python"),
            Err(AtelierError::InterpreterNotFound { .. })
        ));

        assert!(group.remove_interpreter("note1", "sh").is_some());
        assert!(group.remove_interpreter("note1", "sh").is_none());
        assert_eq!(group.session_count(), 0);
    }

    #[tokio::test]
    async fn close_all_empties_the_group() {
        let group = InterpreterGroup::new("g1", Arc::new(EventRelay::detached()));
        group.add_interpreter_to_session(managed("a"), "a");
        group.add_interpreter_to_session(managed("b"), "b");
        group.close_all().await;
        assert_eq!(group.session_count(), 0);
        assert!(group.find_job("a", "p1").is_none());
    }
}
