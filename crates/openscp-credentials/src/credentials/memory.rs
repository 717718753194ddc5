//! Process-local backend, for tests and front-ends that never persist.

use super::backend::{BackendFailure, SecretBackend};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| BackendFailure::backend("memory store poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure> {
        let map = self
            .entries
            .lock()
            .map_err(|_| BackendFailure::backend("memory store poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, BackendFailure> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| BackendFailure::backend("memory store poisoned"))?;
        Ok(map.remove(key).is_some())
    }
}
