//! Method registry: method name to handler.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A locally exposed method.
///
/// Receives the decoded argument payload and returns the result payload.
/// Errors are sent back to the caller as the reply's `err` string.
pub type Handler = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static>;

/// Maps method names to handlers. Last registration for a name wins.
///
/// Lookups hand out a cloned `Arc`, so a handler runs without the registry
/// lock held and may itself register methods or issue calls.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `method`, returning the handler it replaced.
    pub fn register(&self, method: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), handler)
    }

    pub fn unregister(&self, method: &str) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
    }

    pub fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = handlers.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &names)
            .finish()
    }
}
