// ── Host-key policy ─────────────────────────────────────────────────────────
//
// Pure decision logic for the server key presented during the handshake.
// It never touches the SSH transport, so every policy path is testable with
// a raw key blob.

use crate::sftp::audit::{AuditLog, AuditStatus};
use crate::sftp::callbacks::{HostKeyPrompt, SessionCallbacks};
use crate::sftp::known_hosts::{HostKeyCheck, KnownHosts};
use crate::sftp::types::{HostKeyPolicy, SessionOptions};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use openscp_core::paths::user_config_dir;
use openscp_core::{OpenScpError, OpenScpResult, RuntimeEnv};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

// ── Key blob inspection ──────────────────────────────────────────────────────

/// Algorithm facts read from an SSH wire-format public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    /// Wire name, e.g. `ssh-ed25519`, as used in known_hosts.
    pub algorithm: String,
    /// Short family label, e.g. `ED25519`.
    pub family: &'static str,
    pub bits: Option<u32>,
}

impl KeyDescription {
    /// `ED25519 (256-bit)`
    pub fn display(&self) -> String {
        match self.bits {
            Some(b) => format!("{} ({}-bit)", self.family, b),
            None => self.family.to_string(),
        }
    }

    pub fn is_dsa(&self) -> bool {
        self.algorithm == "ssh-dss"
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn string(&mut self) -> Option<&'a [u8]> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let rest = &self.buf[4..];
        if rest.len() < len {
            return None;
        }
        let (head, tail) = rest.split_at(len);
        self.buf = tail;
        Some(head)
    }
}

/// Significant bits of an SSH mpint.
fn mpint_bits(raw: &[u8]) -> u32 {
    let trimmed: &[u8] = match raw.iter().position(|&b| b != 0) {
        Some(i) => &raw[i..],
        None => return 0,
    };
    (trimmed.len() as u32 - 1) * 8 + (8 - trimmed[0].leading_zeros())
}

pub fn describe_key(blob: &[u8]) -> Option<KeyDescription> {
    let mut r = Reader { buf: blob };
    let name = std::str::from_utf8(r.string()?).ok()?.to_string();
    let (family, bits) = match name.as_str() {
        "ssh-ed25519" => ("ED25519", Some(256)),
        "ecdsa-sha2-nistp256" => ("ECDSA", Some(256)),
        "ecdsa-sha2-nistp384" => ("ECDSA", Some(384)),
        "ecdsa-sha2-nistp521" => ("ECDSA", Some(521)),
        "ssh-rsa" => {
            let _e = r.string()?;
            ("RSA", Some(mpint_bits(r.string()?)))
        }
        "ssh-dss" => ("DSA", r.string().map(mpint_bits)),
        _ => ("UNKNOWN", None),
    };
    Some(KeyDescription {
        algorithm: name,
        family,
        bits,
    })
}

/// `SHA256:<unpadded base64>` as printed by `ssh-keygen -l`.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// Colon-separated lowercase hex of the SHA-256 digest.
pub fn fingerprint_hex(blob: &[u8]) -> String {
    Sha256::digest(blob)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn fingerprint(blob: &[u8], hex: bool) -> String {
    if hex {
        fingerprint_hex(blob)
    } else {
        fingerprint_sha256(blob)
    }
}

// ── Verifier ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Matched the store (or the key pinned by the primary session).
    Trusted,
    /// Accepted by the user and pinned.
    Saved,
    /// Accepted by the user for this session only.
    AcceptedUnsaved,
    /// Verification disabled with a recorded risk acknowledgement.
    Unverified,
}

pub struct HostKeyVerifier {
    pub policy: HostKeyPolicy,
    pub known_hosts_path: PathBuf,
    pub hash_names: bool,
    pub fingerprint_hex: bool,
    pub risk_acknowledged: bool,
    /// Key already accepted by a sibling session with identical options.
    pub pinned: Option<Vec<u8>>,
    pub audit: AuditLog,
    pub callbacks: Arc<dyn SessionCallbacks>,
}

impl HostKeyVerifier {
    pub fn from_options(opts: &SessionOptions, env: &RuntimeEnv) -> Self {
        HostKeyVerifier {
            policy: opts.host_key_policy,
            known_hosts_path: opts
                .known_hosts_path
                .clone()
                .unwrap_or_else(|| user_config_dir().join("known_hosts")),
            hash_names: opts.hash_known_hosts && !env.known_hosts_plain,
            fingerprint_hex: opts.fingerprint_hex || env.fingerprint_hex_only,
            risk_acknowledged: opts.insecure_risk_acknowledged,
            pinned: None,
            audit: opts
                .audit_log_path
                .clone()
                .map(AuditLog::new)
                .unwrap_or_else(AuditLog::default_location),
            callbacks: opts.callbacks.clone(),
        }
    }

    fn rejected(host: &str, port: u16, reason: impl Into<String>) -> OpenScpError {
        OpenScpError::HostKeyRejected {
            host: host.to_string(),
            port,
            reason: reason.into(),
        }
    }

    pub fn verify(&self, host: &str, port: u16, blob: &[u8]) -> OpenScpResult<HostKeyDecision> {
        let desc = describe_key(blob)
            .ok_or_else(|| Self::rejected(host, port, "malformed host key"))?;
        let alg_display = desc.display();
        let fp = fingerprint(blob, self.fingerprint_hex);
        let audit = |status| self.audit.record(host, port, &alg_display, &fp, status);

        if desc.is_dsa() {
            audit(AuditStatus::Rejected);
            self.callbacks.hostkey_status("DSA host keys are not supported");
            return Err(Self::rejected(host, port, "DSA host keys are not supported"));
        }

        if self.pinned.as_deref() == Some(blob) {
            return Ok(HostKeyDecision::Trusted);
        }

        match self.policy {
            HostKeyPolicy::Off => {
                if !self.risk_acknowledged {
                    return Err(Self::rejected(
                        host,
                        port,
                        "host-key verification is off but the risk was not acknowledged",
                    ));
                }
                warn!(host, port, "host-key verification disabled for this session");
                self.callbacks
                    .hostkey_status("Host-key verification is disabled for this session");
                Ok(HostKeyDecision::Unverified)
            }
            HostKeyPolicy::Strict => {
                let store = KnownHosts::load(&self.known_hosts_path)?;
                match store.check(host, port, blob, &desc.algorithm) {
                    HostKeyCheck::Match => {
                        audit(AuditStatus::Match);
                        Ok(HostKeyDecision::Trusted)
                    }
                    HostKeyCheck::NotFound => {
                        audit(AuditStatus::Rejected);
                        Err(OpenScpError::HostKeyUnknown {
                            host: host.to_string(),
                            port,
                            algorithm: alg_display.clone(),
                            fingerprint: fp.clone(),
                        })
                    }
                    HostKeyCheck::Mismatch => {
                        audit(AuditStatus::Rejected);
                        Err(OpenScpError::HostKeyMismatch {
                            host: host.to_string(),
                            port,
                            algorithm: alg_display.clone(),
                            fingerprint: fp.clone(),
                        })
                    }
                }
            }
            HostKeyPolicy::AcceptNew => self.trust_on_first_use(host, port, blob, &desc, &alg_display, &fp),
        }
    }

    fn trust_on_first_use(
        &self,
        host: &str,
        port: u16,
        blob: &[u8],
        desc: &KeyDescription,
        alg_display: &str,
        fp: &str,
    ) -> OpenScpResult<HostKeyDecision> {
        let audit = |status| self.audit.record(host, port, alg_display, fp, status);

        // An unreadable store still allows a one-off acceptance.
        let store = match KnownHosts::load(&self.known_hosts_path) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "known_hosts unreadable; keys cannot be saved");
                self.callbacks
                    .hostkey_status("known_hosts could not be read; the key cannot be saved");
                None
            }
        };
        let check = store
            .as_ref()
            .map(|s| s.check(host, port, blob, &desc.algorithm))
            .unwrap_or(HostKeyCheck::NotFound);
        if check == HostKeyCheck::Match {
            audit(AuditStatus::Match);
            return Ok(HostKeyDecision::Trusted);
        }

        let mut prompt = HostKeyPrompt {
            host: host.to_string(),
            port,
            algorithm_display: alg_display.to_string(),
            fingerprint: fp.to_string(),
            can_save: store.is_some(),
            mismatch: check == HostKeyCheck::Mismatch,
        };
        if !self.callbacks.confirm_host_key(&prompt) {
            audit(AuditStatus::Rejected);
            return Err(Self::rejected(host, port, "host key not accepted"));
        }

        let Some(mut store) = store else {
            audit(AuditStatus::Skipped);
            return Ok(HostKeyDecision::AcceptedUnsaved);
        };

        store.add(host, port, blob, &desc.algorithm, self.hash_names);
        match store.persist() {
            Ok(()) => {
                audit(AuditStatus::Saved);
                info!(host, port, fingerprint = fp, "host key saved");
                self.callbacks.hostkey_status("Host key saved to known_hosts");
                Ok(HostKeyDecision::Saved)
            }
            Err(e) => {
                audit(AuditStatus::SaveFailed);
                warn!(error = %e, "saving host key failed");
                self.callbacks
                    .hostkey_status(&format!("Could not save host key: {}", e));
                prompt.can_save = false;
                if self.callbacks.confirm_host_key(&prompt) {
                    audit(AuditStatus::Skipped);
                    Ok(HostKeyDecision::AcceptedUnsaved)
                } else {
                    audit(AuditStatus::Rejected);
                    Err(Self::rejected(host, port, "host key could not be saved and was not accepted"))
                }
            }
        }
    }
}
