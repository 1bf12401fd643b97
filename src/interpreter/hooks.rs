//! Interpreter hooks - code run around every paragraph
//!
//! Hooks are registered per interpreter class, either globally or for one
//! note, and are spliced into the script before it is interpreted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::AtelierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreExec,
    PreExecDev,
    PostExec,
    PostExecDev,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::PreExec => "pre_exec",
            HookEvent::PreExecDev => "pre_exec_dev",
            HookEvent::PostExec => "post_exec",
            HookEvent::PostExecDev => "post_exec_dev",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = AtelierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_exec" => Ok(HookEvent::PreExec),
            "pre_exec_dev" => Ok(HookEvent::PreExecDev),
            "post_exec" => Ok(HookEvent::PostExec),
            "post_exec_dev" => Ok(HookEvent::PostExecDev),
            other => Err(AtelierError::Interpreter(format!("unknown hook event '{}'", other))),
        }
    }
}

/// note id (None = global) → class name → event → code
type HookTable = HashMap<Option<String>, HashMap<String, HashMap<HookEvent, String>>>;

#[derive(Default)]
pub struct InterpreterHookRegistry {
    hooks: Mutex<HookTable>,
}

impl InterpreterHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, note_id: Option<&str>, class_name: &str, event: HookEvent, code: &str) {
        self.lock()
            .entry(note_id.map(str::to_string))
            .or_default()
            .entry(class_name.to_string())
            .or_default()
            .insert(event, code.to_string());
    }

    pub fn unregister(&self, note_id: Option<&str>, class_name: &str, event: HookEvent) {
        if let Some(classes) = self.lock().get_mut(&note_id.map(str::to_string)) {
            if let Some(events) = classes.get_mut(class_name) {
                events.remove(&event);
            }
        }
    }

    pub fn get(&self, note_id: Option<&str>, class_name: &str, event: HookEvent) -> Option<String> {
        self.lock()
            .get(&note_id.map(str::to_string))
            .and_then(|classes| classes.get(class_name))
            .and_then(|events| events.get(&event))
            .cloned()
    }

    /// Wrap `script` in the hooks that apply to it: global before note on
    /// the way in, note before global on the way out.
    pub fn apply(&self, note_id: &str, class_name: &str, script: &str) -> String {
        let scopes = [None, Some(note_id)];
        let mut parts: Vec<String> = Vec::new();

        for scope in scopes {
            for event in [HookEvent::PreExec, HookEvent::PreExecDev] {
                parts.extend(self.get(scope, class_name, event));
            }
        }
        parts.push(script.to_string());
        for scope in scopes.iter().rev() {
            for event in [HookEvent::PostExecDev, HookEvent::PostExec] {
                parts.extend(self.get(*scope, class_name, event));
            }
        }

        parts.join("\n")
    }

    fn lock(&self) -> MutexGuard<'_, HookTable> {
        self.hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_hooks_leaves_script_alone() {
        let hooks = InterpreterHookRegistry::new();
        assert_eq!(hooks.apply("n1", "sh", "echo hi"), "echo hi");
    }

    #[test]
    fn hooks_wrap_in_scope_order() {
        let hooks = InterpreterHookRegistry::new();
        hooks.register(None, "sh", HookEvent::PreExec, "G_PRE");
        hooks.register(None, "sh", HookEvent::PreExecDev, "G_PRE_DEV");
        hooks.register(None, "sh", HookEvent::PostExec, "G_POST");
        hooks.register(None, "sh", HookEvent::PostExecDev, "G_POST_DEV");
        hooks.register(Some("n1"), "sh", HookEvent::PreExec, "N_PRE");
        hooks.register(Some("n1"), "sh", HookEvent::PostExec, "N_POST");
        hooks.register(Some("n2"), "sh", HookEvent::PreExec, "OTHER_NOTE");
        hooks.register(None, "python", HookEvent::PreExec, "OTHER_CLASS");

        assert_eq!(
            hooks.apply("n1", "sh", "SCRIPT"),
            "G_PRE\nG_PRE_DEV\nN_PRE\nSCRIPT\nN_POST\nG_POST_DEV\nG_POST"
        );
    }

    #[test]
    fn unregister_removes_one_event() {
        let hooks = InterpreterHookRegistry::new();
        hooks.register(Some("n1"), "sh", HookEvent::PreExec, "a");
        hooks.register(Some("n1"), "sh", HookEvent::PostExec, "b");
        hooks.unregister(Some("n1"), "sh", HookEvent::PreExec);
        assert!(hooks.get(Some("n1"), "sh", HookEvent::PreExec).is_none());
        assert_eq!(hooks.apply("n1", "sh", "x"), "x\nb");
    }

    #[test]
    fn event_names_parse() {
        assert_eq!("post_exec_dev".parse::<HookEvent>().unwrap(), HookEvent::PostExecDev);
        assert!("later".parse::<HookEvent>().is_err());
    }
}
