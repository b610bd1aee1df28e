//! Shared runtime variables.
//!
//! A mutex-guarded key-value store passed by reference to exactly the
//! components that need it: extensions (which run before any thread starts),
//! the engine, and auxiliary registration (which may read it from the
//! reactor thread immediately after its readiness handshake). There is no
//! ambient global; every reader holds a clone of the same [`RuntimeVars`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Cloneable handle to the shared variable store.
#[derive(Debug, Clone, Default)]
pub struct RuntimeVars {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl RuntimeVars {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Returns the value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Copies the current contents, for diagnostics and tests.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
