// ── CredentialStore ─────────────────────────────────────────────────────────
//
// Stateless front over a native vault plus the optional plaintext fallback.
// All state lives in the backends.

use super::backend::{BackendFailure, SecretBackend};
use super::keys::{legacy_site_key, site_key, SecretKind};
use openscp_core::{CoreConfig, CredentialFailure, OpenScpError, OpenScpResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistStatus {
    Stored,
    /// No secure backend and no enabled fallback.
    Unavailable,
    PermissionDenied,
    BackendError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistResult {
    pub status: PersistStatus,
    pub detail: Option<String>,
}

impl PersistResult {
    pub fn stored() -> Self {
        Self {
            status: PersistStatus::Stored,
            detail: None,
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            status: PersistStatus::Unavailable,
            detail: Some(detail.into()),
        }
    }

    pub fn is_stored(&self) -> bool {
        self.status == PersistStatus::Stored
    }

    /// `Err(CredentialStore)` unless stored.
    pub fn into_result(self) -> OpenScpResult<()> {
        let status = match self.status {
            PersistStatus::Stored => return Ok(()),
            PersistStatus::Unavailable => CredentialFailure::Unavailable,
            PersistStatus::PermissionDenied => CredentialFailure::PermissionDenied,
            PersistStatus::BackendError => CredentialFailure::BackendError,
        };
        Err(OpenScpError::CredentialStore {
            status,
            detail: self.detail.unwrap_or_default(),
        })
    }
}

impl From<BackendFailure> for PersistResult {
    fn from(f: BackendFailure) -> Self {
        let status = match f.kind {
            CredentialFailure::Unavailable => PersistStatus::Unavailable,
            CredentialFailure::PermissionDenied => PersistStatus::PermissionDenied,
            CredentialFailure::BackendError => PersistStatus::BackendError,
        };
        PersistResult {
            status,
            detail: Some(f.detail),
        }
    }
}

fn failure_to_error(f: BackendFailure) -> OpenScpError {
    OpenScpError::CredentialStore {
        status: f.kind,
        detail: f.detail,
    }
}

pub struct CredentialStore {
    primary: Option<Box<dyn SecretBackend>>,
    fallback: Option<Box<dyn SecretBackend>>,
}

impl CredentialStore {
    /// Store backed by `primary` only.
    pub fn new(primary: Option<Box<dyn SecretBackend>>) -> Self {
        Self {
            primary,
            fallback: None,
        }
    }

    /// Native vault of this platform, no fallback.
    pub fn platform() -> Self {
        Self::new(super::platform_backend())
    }

    /// Native vault plus the plaintext fallback when the configuration (or
    /// `OPEN_SCP_ENABLE_INSECURE_FALLBACK=1`, already layered into `config`)
    /// asks for it and the build includes it.
    pub fn from_config(config: &CoreConfig) -> Self {
        let store = Self::platform();
        if !config.insecure_credential_fallback {
            return store;
        }
        #[cfg(feature = "insecure-fallback")]
        {
            let path = super::fallback::PlaintextBackend::default_path();
            warn!(path = %path.display(), "insecure credential fallback enabled");
            store.with_fallback(Box::new(super::fallback::PlaintextBackend::new(path)))
        }
        #[cfg(not(feature = "insecure-fallback"))]
        {
            warn!("insecure credential fallback requested but not compiled in");
            store
        }
    }

    /// Attach the plaintext fallback. Only exists in builds that carry it.
    #[cfg(feature = "insecure-fallback")]
    pub fn with_fallback(mut self, fallback: Box<dyn SecretBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn insecure_fallback_active(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.primary.as_ref().map(|b| b.name())
    }

    pub fn set(&self, key: &str, value: &str) -> PersistResult {
        let mut last = PersistResult::unavailable("no secure credential backend");
        if let Some(ref primary) = self.primary {
            match primary.set(key, value) {
                Ok(()) => {
                    debug!(backend = primary.name(), "secret stored");
                    return PersistResult::stored();
                }
                Err(f) => {
                    warn!(backend = primary.name(), error = %f, "secret store failed");
                    // Only an absent vault may fall through to plaintext.
                    if f.kind != CredentialFailure::Unavailable {
                        return f.into();
                    }
                    last = f.into();
                }
            }
        }
        match self.fallback {
            Some(ref fb) => match fb.set(key, value) {
                Ok(()) => PersistResult::stored(),
                Err(f) => f.into(),
            },
            None => last,
        }
    }

    /// Look the key up in the native vault, then in the fallback.
    pub fn get(&self, key: &str) -> OpenScpResult<Option<String>> {
        let mut primary_err = None;
        if let Some(ref primary) = self.primary {
            match primary.get(key) {
                Ok(Some(v)) => return Ok(Some(v)),
                Ok(None) => {}
                Err(f) if f.kind == CredentialFailure::Unavailable => {
                    debug!(backend = primary.name(), error = %f, "vault unavailable");
                }
                Err(f) => primary_err = Some(f),
            }
        }
        if let Some(ref fb) = self.fallback {
            if let Some(v) = fb.get(key).map_err(failure_to_error)? {
                return Ok(Some(v));
            }
        }
        match primary_err {
            Some(f) => Err(failure_to_error(f)),
            None => Ok(None),
        }
    }

    /// Remove from every backend. `Stored` means the key is gone everywhere.
    pub fn remove(&self, key: &str) -> PersistResult {
        let backends = self.primary.iter().chain(self.fallback.iter());
        let mut any = false;
        for backend in backends {
            any = true;
            if let Err(f) = backend.remove(key) {
                if f.kind != CredentialFailure::Unavailable {
                    return f.into();
                }
            }
        }
        if any {
            PersistResult::stored()
        } else {
            PersistResult::unavailable("no secure credential backend")
        }
    }

    // ── Site helpers ─────────────────────────────────────────────

    /// Fetch a site secret by stable id, migrating a legacy name-keyed entry
    /// on first read.
    pub fn get_site_secret(
        &self,
        site_id: &Uuid,
        legacy_name: Option<&str>,
        kind: SecretKind,
    ) -> OpenScpResult<Option<String>> {
        let key = site_key(site_id, kind);
        if let Some(v) = self.get(&key)? {
            return Ok(Some(v));
        }
        let Some(name) = legacy_name else {
            return Ok(None);
        };
        let legacy = legacy_site_key(name, kind);
        let Some(value) = self.get(&legacy)? else {
            return Ok(None);
        };

        let result = self.set(&key, &value);
        if result.is_stored() {
            let removed = self.remove(&legacy);
            if !removed.is_stored() {
                warn!(status = ?removed.status, "legacy secret left in place after migration");
            }
            info!(site = %site_id, "migrated legacy site secret");
        } else {
            warn!(status = ?result.status, "could not migrate legacy site secret");
        }
        Ok(Some(value))
    }

    pub fn set_site_secret(&self, site_id: &Uuid, kind: SecretKind, value: &str) -> PersistResult {
        self.set(&site_key(site_id, kind), value)
    }

    pub fn remove_site_secrets(&self, site_id: &Uuid) -> PersistResult {
        let pw = self.remove(&site_key(site_id, SecretKind::Password));
        if !pw.is_stored() {
            return pw;
        }
        self.remove(&site_key(site_id, SecretKind::KeyPassphrase))
    }
}
