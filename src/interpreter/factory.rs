//! Interpreter factory - constructs interpreters by class name

use std::collections::HashMap;
use std::sync::Arc;

use super::{Interpreter, ShellInterpreter};
use crate::{AtelierError, Result};

/// Builds an interpreter from its creation properties
pub type InterpreterConstructor =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn Interpreter>> + Send + Sync>;

/// Registry of interpreter constructors, populated at startup
#[derive(Clone, Default)]
pub struct InterpreterFactory {
    constructors: HashMap<String, InterpreterConstructor>,
}

impl InterpreterFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in interpreters registered
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register_defaults();
        factory
    }

    fn register_defaults(&mut self) {
        // Shell
        self.register(ShellInterpreter::CLASS_NAME, |props| {
            Ok(Arc::new(ShellInterpreter::new(props)) as Arc<dyn Interpreter>)
        });
    }

    /// Register (or replace) the constructor for `class_name`.
    pub fn register<F>(&mut self, class_name: impl Into<String>, constructor: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<Arc<dyn Interpreter>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(class_name.into(), Arc::new(constructor));
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Known class names, sorted
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        class_name: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn Interpreter>> {
        let constructor = self
            .constructors
            .get(class_name)
            .ok_or_else(|| AtelierError::UnknownInterpreterClass(class_name.to_string()))?;
        constructor(properties)
    }
}
