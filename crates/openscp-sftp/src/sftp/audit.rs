//! Append-only audit trail of host-key decisions (`openscp.auth`).

use chrono::Utc;
use openscp_core::atomic::ensure_private_dir;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Match,
    Saved,
    Skipped,
    Rejected,
    SaveFailed,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditStatus::Match => "match",
            AuditStatus::Saved => "saved",
            AuditStatus::Skipped => "skipped",
            AuditStatus::Rejected => "rejected",
            AuditStatus::SaveFailed => "save_failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

/// Quotes inside values would break the line format.
fn clean(value: &str) -> String {
    value.replace(['"', '\n', '\r'], "_")
}

pub fn format_line(
    ts: i64,
    host: &str,
    port: u16,
    algorithm: &str,
    fingerprint: &str,
    status: AuditStatus,
) -> String {
    format!(
        "ts={} host={} port={} alg=\"{}\" fp=\"{}\" status={}\n",
        ts,
        clean(host).replace(' ', "_"),
        port,
        clean(algorithm),
        clean(fingerprint),
        status
    )
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<state_dir>/openscp/openscp.auth`
    pub fn default_location() -> Self {
        Self::new(openscp_core::paths::user_state_dir().join("openscp.auth"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Append one event. Audit failures are logged, never fatal.
    pub fn record(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        fingerprint: &str,
        status: AuditStatus,
    ) {
        let line = format_line(Utc::now().timestamp(), host, port, algorithm, fingerprint, status);
        if let Err(e) = self.append(&line) {
            warn!(path = %self.path.display(), error = %e, "audit log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn line_format() {
        let line = format_line(
            1_700_000_000,
            "example.org",
            22,
            "ED25519 (256-bit)",
            "SHA256:abc",
            AuditStatus::SaveFailed,
        );
        assert_eq!(
            line,
            "ts=1700000000 host=example.org port=22 alg=\"ED25519 (256-bit)\" fp=\"SHA256:abc\" status=save_failed\n"
        );
    }

    #[test]
    fn appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("state").join("openscp.auth"));
        log.record("h", 22, "ED25519", "SHA256:x", AuditStatus::Saved);
        log.record("h", 22, "ED25519", "SHA256:x", AuditStatus::Match);
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().ends_with("status=saved"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(log.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
