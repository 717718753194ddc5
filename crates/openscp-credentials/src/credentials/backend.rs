//! Backend seam between the store and a concrete secret vault.

use openscp_core::CredentialFailure;

/// Categorised backend failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct BackendFailure {
    pub kind: CredentialFailure,
    pub detail: String,
}

impl BackendFailure {
    pub fn new(kind: CredentialFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(CredentialFailure::Unavailable, detail)
    }

    pub fn denied(detail: impl Into<String>) -> Self {
        Self::new(CredentialFailure::PermissionDenied, detail)
    }

    pub fn backend(detail: impl Into<String>) -> Self {
        Self::new(CredentialFailure::BackendError, detail)
    }
}

/// A place secrets can be stored. Implementations are blocking and must be
/// called from the caller's thread, never from transfer workers.
pub trait SecretBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn set(&self, key: &str, value: &str) -> Result<(), BackendFailure>;

    /// `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>, BackendFailure>;

    /// `Ok(false)` when there was nothing to remove.
    fn remove(&self, key: &str) -> Result<bool, BackendFailure>;
}
