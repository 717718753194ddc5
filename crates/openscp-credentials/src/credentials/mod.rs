// ── openscp-credentials / credentials module ────────────────────────────────
//
//   • SecretBackend trait with native implementations per platform
//   • CredentialStore front with typed PersistResult outcomes
//   • Stable site keys and migration of legacy name-keyed secrets
//   • Opt-in plaintext fallback (feature `insecure-fallback`)

pub mod backend;
pub mod keys;
pub mod memory;
pub mod store;

#[cfg(feature = "insecure-fallback")]
pub mod fallback;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

pub use backend::{BackendFailure, SecretBackend};
pub use keys::*;
pub use memory::MemoryBackend;
pub use store::{CredentialStore, PersistResult, PersistStatus};

/// Service / target prefix under which every secret is filed.
pub const SERVICE_NAME: &str = "OpenSCP";

/// Native backend for the current platform, if one is compiled in.
pub fn platform_backend() -> Option<Box<dyn SecretBackend>> {
    #[cfg(target_os = "macos")]
    {
        return Some(Box::new(macos::KeychainBackend::new(SERVICE_NAME)));
    }
    #[cfg(target_os = "windows")]
    {
        return Some(Box::new(windows::CredManagerBackend::new(SERVICE_NAME)));
    }
    #[cfg(target_os = "linux")]
    {
        return Some(Box::new(linux::SecretServiceBackend::new(SERVICE_NAME)));
    }
    #[allow(unreachable_code)]
    None
}
