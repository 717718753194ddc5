// ── Types ─────────────────────────────────────────────────────────────────────

use crate::sftp::callbacks::{RejectUnknownHosts, SessionCallbacks};
use chrono::{DateTime, Utc};
use openscp_core::{CoreConfig, ErrorKind, IntegrityPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_sftp_port() -> u16 {
    22
}
fn default_true() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}

// ── Connection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Unknown or changed keys are refused.
    Strict,
    /// Unknown or changed keys are confirmed by the user and pinned.
    #[default]
    AcceptNew,
    /// The store is not consulted. Requires a recorded risk acknowledgement.
    Off,
}

/// Immutable input to one connect attempt.
#[derive(Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: Option<PathBuf>,
    pub private_key_passphrase: Option<String>,
    pub password: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to `~/.config/openscp/known_hosts` when unset.
    pub known_hosts_path: Option<PathBuf>,
    pub hash_known_hosts: bool,
    pub fingerprint_hex: bool,
    pub integrity: IntegrityPolicy,
    pub audit_log_path: Option<PathBuf>,
    /// The caller recorded that the user accepted connecting without
    /// host-key verification. Mandatory for `HostKeyPolicy::Off`.
    pub insecure_risk_acknowledged: bool,
    pub callbacks: Arc<dyn SessionCallbacks>,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        SessionOptions {
            host: host.into(),
            port: default_sftp_port(),
            username: username.into(),
            private_key_path: None,
            private_key_passphrase: None,
            password: None,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            hash_known_hosts: true,
            fingerprint_hex: false,
            integrity: IntegrityPolicy::default(),
            audit_log_path: None,
            insecure_risk_acknowledged: false,
            callbacks: Arc::new(RejectUnknownHosts),
        }
    }

    /// Copy store locations and display preferences from the core config.
    pub fn with_config(mut self, config: &CoreConfig) -> Self {
        self.known_hosts_path = Some(config.known_hosts_path.clone());
        self.hash_known_hosts = config.hash_known_hosts;
        self.fingerprint_hex = config.fingerprint_hex;
        self.integrity = config.integrity;
        self.audit_log_path = Some(config.audit_log_path.clone());
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn SessionCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key_path", &self.private_key_path)
            .field("has_passphrase", &self.private_key_passphrase.is_some())
            .field("has_password", &self.password.is_some())
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("hash_known_hosts", &self.hash_known_hosts)
            .field("fingerprint_hex", &self.fingerprint_hex)
            .field("integrity", &self.integrity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    SftpReady,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    PublicKey,
    Password,
    KeyboardInteractive,
    Agent { identity: String },
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey => f.write_str("publickey"),
            AuthMethod::Password => f.write_str("password"),
            AuthMethod::KeyboardInteractive => f.write_str("keyboard-interactive"),
            AuthMethod::Agent { identity } => write!(f, "agent({})", identity),
        }
    }
}

/// Summary of a connected session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub server_banner: Option<String>,
    pub remote_home: Option<String>,
    pub host_key_algorithm: String,
    pub host_key_fingerprint: String,
    pub connected_at: DateTime<Utc>,
}

// ── Remote filesystem ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub is_dir: bool,
    #[serde(default)]
    pub is_symlink: bool,
    /// `None` when the server did not report a size.
    pub size: Option<u64>,
    /// Seconds since the Unix epoch.
    pub mtime: Option<u64>,
    /// Full mode bits including the file type.
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileInfo {
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferKind {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Done,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Canceled)
    }
}

/// Scheduler-owned record of one transfer. Observers only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub kind: TransferKind,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: TaskStatus,
    /// 0–100; 100 only once `Done`.
    pub progress: u8,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// KB/s, 0 inherits the global limit.
    #[serde(default)]
    pub speed_limit_kbps: u64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    /// Whether the next run should resume from the `.part` file.
    #[serde(default = "default_true")]
    pub resume: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_debug_hides_secrets() {
        let mut opts = SessionOptions::new("example.org", "deploy");
        opts.password = Some("hunter2".into());
        opts.private_key_passphrase = Some("p4ss".into());
        let text = format!("{:?}", opts);
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("p4ss"));
        assert!(text.contains("has_password: true"));
        assert_eq!(opts.port, 22);
        assert_eq!(opts.endpoint(), "example.org:22");
    }

    #[test]
    fn options_take_config_values() {
        let cfg = CoreConfig {
            hash_known_hosts: false,
            integrity: IntegrityPolicy::Required,
            ..CoreConfig::default()
        };
        let opts = SessionOptions::new("h", "u").with_config(&cfg);
        assert!(!opts.hash_known_hosts);
        assert_eq!(opts.integrity, IntegrityPolicy::Required);
        assert_eq!(opts.known_hosts_path.as_ref(), Some(&cfg.known_hosts_path));
    }

    #[test]
    fn status_serializes_camel_case() {
        assert_eq!(serde_json::to_string(&TaskStatus::Canceled).unwrap(), "\"canceled\"");
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }
}
