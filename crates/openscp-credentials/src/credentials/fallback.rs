//! Plaintext key/value file used when no native vault is reachable and the
//! user explicitly opted in. Compiled only with `insecure-fallback`.

use super::backend::{BackendFailure, SecretBackend};
use openscp_core::atomic::write_atomic;
use openscp_core::paths::user_config_dir;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct PlaintextBackend {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl PlaintextBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<config_dir>/openscp/credentials.insecure.json`
    pub fn default_path() -> PathBuf {
        user_config_dir().join("credentials.insecure.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, BackendFailure> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| BackendFailure::backend(format!("corrupt fallback store: {}", e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn store(&self, map: &BTreeMap<String, String>) -> Result<(), BackendFailure> {
        let json = serde_json::to_vec_pretty(map)
            .map_err(|e| BackendFailure::backend(e.to_string()))?;
        write_atomic(&self.path, &json).map_err(|e| {
            if e.source.kind() == io::ErrorKind::PermissionDenied {
                BackendFailure::denied(e.to_string())
            } else {
                BackendFailure::backend(e.to_string())
            }
        })
    }
}

fn io_failure(e: io::Error) -> BackendFailure {
    if e.kind() == io::ErrorKind::PermissionDenied {
        BackendFailure::denied(e.to_string())
    } else {
        BackendFailure::backend(e.to_string())
    }
}

impl SecretBackend for PlaintextBackend {
    fn name(&self) -> &'static str {
        "plaintext-fallback"
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| BackendFailure::backend("fallback lock poisoned"))?;
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        warn!(path = %self.path.display(), "secret written to plaintext fallback store");
        self.store(&map)
    }

    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| BackendFailure::backend("fallback lock poisoned"))?;
        Ok(self.load()?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, BackendFailure> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| BackendFailure::backend("fallback lock poisoned"))?;
        let mut map = self.load()?;
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.store(&map)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        let a = PlaintextBackend::new(&path);
        a.set("site-id:1:password", "hunter2").unwrap();

        let b = PlaintextBackend::new(&path);
        assert_eq!(b.get("site-id:1:password").unwrap().as_deref(), Some("hunter2"));
        assert!(b.remove("site-id:1:password").unwrap());
        assert!(!b.remove("site-id:1:password").unwrap());
        assert_eq!(a.get("site-id:1:password").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        PlaintextBackend::new(&path).set("k", "v").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn corrupt_file_is_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, "[1, 2").unwrap();
        let err = PlaintextBackend::new(&path).get("k").unwrap_err();
        assert_eq!(err.kind, openscp_core::CredentialFailure::BackendError);
    }
}
