//! Error taxonomy shared by every OpenSCP crate.
//!
//! Each variant carries the payload a front-end needs to explain the failure;
//! [`ErrorKind`] is the payload-free mirror stored in scheduler snapshots.

use crate::config::IntegrityPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

pub type OpenScpResult<T> = Result<T, OpenScpError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OpenScpError {
    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    #[error("host key for {host}:{port} is not known ({algorithm} {fingerprint})")]
    HostKeyUnknown {
        host: String,
        port: u16,
        algorithm: String,
        fingerprint: String,
    },

    #[error("host key for {host}:{port} does not match the stored key ({algorithm} {fingerprint})")]
    HostKeyMismatch {
        host: String,
        port: u16,
        algorithm: String,
        fingerprint: String,
    },

    #[error("host key for {host}:{port} rejected: {reason}")]
    HostKeyRejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("session is not connected")]
    NotConnected,

    #[error("remote error ({code}): {message}")]
    Remote { code: i32, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("integrity check failed for {path} after {bytes_done} bytes: {detail}")]
    IntegrityFailed {
        path: String,
        bytes_done: u64,
        detail: String,
    },

    #[error("resume rejected: {0}")]
    ResumeInvalid(String),

    #[error("operation canceled")]
    Canceled,

    #[error("credential store {status}: {detail}")]
    CredentialStore {
        status: CredentialFailure,
        detail: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Structured authentication failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFailure {
    pub username: String,
    /// Methods the server advertised, if it was queried.
    pub server_methods: Vec<String>,
    /// Methods the client tried, in order.
    pub attempted: Vec<String>,
    pub last_error: Option<String>,
    pub code: Option<i32>,
    /// The server closed the connection during authentication.
    pub disconnected: bool,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user '{}'", self.username)?;
        if self.attempted.is_empty() {
            write!(f, ", no usable method")?;
        } else {
            write!(f, ", tried [{}]", self.attempted.join(", "))?;
        }
        if !self.server_methods.is_empty() {
            write!(f, ", server offers [{}]", self.server_methods.join(", "))?;
        }
        if self.disconnected {
            write!(f, ", server closed the connection")?;
        }
        if let Some(ref e) = self.last_error {
            write!(f, ", last error: {}", e)?;
        }
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

/// Credential backend failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialFailure {
    Unavailable,
    PermissionDenied,
    BackendError,
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialFailure::Unavailable => "unavailable",
            CredentialFailure::PermissionDenied => "permission denied",
            CredentialFailure::BackendError => "backend error",
        })
    }
}

/// Payload-free classification of [`OpenScpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Connect,
    Auth,
    HostKeyUnknown,
    HostKeyMismatch,
    HostKeyRejected,
    NotConnected,
    Remote,
    Io,
    IntegrityFailed,
    ResumeInvalid,
    Canceled,
    CredentialStore,
    Config,
}

impl OpenScpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpenScpError::Connect { .. } => ErrorKind::Connect,
            OpenScpError::Auth(_) => ErrorKind::Auth,
            OpenScpError::HostKeyUnknown { .. } => ErrorKind::HostKeyUnknown,
            OpenScpError::HostKeyMismatch { .. } => ErrorKind::HostKeyMismatch,
            OpenScpError::HostKeyRejected { .. } => ErrorKind::HostKeyRejected,
            OpenScpError::NotConnected => ErrorKind::NotConnected,
            OpenScpError::Remote { .. } => ErrorKind::Remote,
            OpenScpError::Io { .. } => ErrorKind::Io,
            OpenScpError::IntegrityFailed { .. } => ErrorKind::IntegrityFailed,
            OpenScpError::ResumeInvalid(_) => ErrorKind::ResumeInvalid,
            OpenScpError::Canceled => ErrorKind::Canceled,
            OpenScpError::CredentialStore { .. } => ErrorKind::CredentialStore,
            OpenScpError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the scheduler may re-queue a task that failed with this error.
    ///
    /// Cancellation is never retried. Integrity failures are retried only
    /// when the policy is not `Required`; under `Required` the caller must
    /// intervene. Authentication and host-key failures need new input from
    /// the user, so retrying them unattended is pointless.
    pub fn is_retryable(&self, integrity: IntegrityPolicy) -> bool {
        match self {
            OpenScpError::Canceled => false,
            OpenScpError::IntegrityFailed { .. } | OpenScpError::ResumeInvalid(_) => {
                integrity != IntegrityPolicy::Required
            }
            OpenScpError::Auth(_)
            | OpenScpError::HostKeyUnknown { .. }
            | OpenScpError::HostKeyMismatch { .. }
            | OpenScpError::HostKeyRejected { .. }
            | OpenScpError::CredentialStore { .. }
            | OpenScpError::Config(_) => false,
            OpenScpError::Connect { .. }
            | OpenScpError::NotConnected
            | OpenScpError::Remote { .. }
            | OpenScpError::Io { .. } => true,
        }
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        OpenScpError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        OpenScpError::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn connect(host: &str, port: u16, reason: impl Into<String>) -> Self {
        OpenScpError::Connect {
            host: host.to_string(),
            port,
            reason: reason.into(),
        }
    }

    pub fn integrity(path: impl Into<String>, bytes_done: u64, detail: impl Into<String>) -> Self {
        OpenScpError::IntegrityFailed {
            path: path.into(),
            bytes_done,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connect => "ConnectError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::HostKeyUnknown => "HostKeyUnknown",
            ErrorKind::HostKeyMismatch => "HostKeyMismatch",
            ErrorKind::HostKeyRejected => "HostKeyRejected",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::Remote => "RemoteError",
            ErrorKind::Io => "IOError",
            ErrorKind::IntegrityFailed => "IntegrityFailed",
            ErrorKind::ResumeInvalid => "ResumeInvalid",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::CredentialStore => "CredentialStoreError",
            ErrorKind::Config => "ConfigError",
        };
        f.write_str(s)
    }
}
