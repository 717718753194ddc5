// ── Core configuration ──────────────────────────────────────────────────────

use crate::atomic::write_atomic;
use crate::env::{self, RuntimeEnv};
use crate::error::{OpenScpError, OpenScpResult};
use crate::paths::{user_config_dir, user_state_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 8;

/// How strictly transfers are verified by hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    /// No hashing.
    Off,
    /// Hash; on failure warn and restart or continue.
    #[default]
    Optional,
    /// Hash; any failure aborts the transfer.
    Required,
}

impl IntegrityPolicy {
    /// The environment override when set, otherwise `self`.
    ///
    /// Called once per transfer so the override is never cached across
    /// transfers.
    pub fn effective(self) -> IntegrityPolicy {
        env::integrity_override().unwrap_or(self)
    }
}

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_max_concurrent() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_known_hosts_path() -> PathBuf {
    user_config_dir().join("known_hosts")
}
fn default_audit_log_path() -> PathBuf {
    user_state_dir().join("openscp.auth")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// KB/s across all workers; 0 means unlimited.
    #[serde(default)]
    pub global_speed_limit_kbps: u64,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,
    #[serde(default = "default_true")]
    pub hash_known_hosts: bool,
    #[serde(default)]
    pub fingerprint_hex: bool,
    #[serde(default)]
    pub integrity: IntegrityPolicy,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    #[serde(default)]
    pub insecure_credential_fallback: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_concurrent: default_max_concurrent(),
            global_speed_limit_kbps: 0,
            default_max_attempts: default_max_attempts(),
            known_hosts_path: default_known_hosts_path(),
            hash_known_hosts: true,
            fingerprint_hex: false,
            integrity: IntegrityPolicy::default(),
            audit_log_path: default_audit_log_path(),
            insecure_credential_fallback: false,
        }
    }
}

pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
}

impl CoreConfig {
    /// `<config_dir>/openscp/config.json`
    pub fn default_path() -> PathBuf {
        user_config_dir().join("config.json")
    }

    /// Load from JSON. A missing file yields defaults.
    pub fn load(path: &Path) -> OpenScpResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(OpenScpError::io(format!("read {}", path.display()), e)),
        };
        let mut cfg: CoreConfig = serde_json::from_str(&text)
            .map_err(|e| OpenScpError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.max_concurrent = clamp_concurrency(cfg.max_concurrent);
        if cfg.default_max_attempts == 0 {
            cfg.default_max_attempts = 1;
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> OpenScpResult<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| OpenScpError::Config(e.to_string()))?;
        write_atomic(path, &json)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Layer environment switches over the file values.
    pub fn apply_env(&mut self, env: &RuntimeEnv) {
        if env.known_hosts_plain {
            self.hash_known_hosts = false;
        }
        if env.fingerprint_hex_only {
            self.fingerprint_hex = true;
        }
        if let Some(policy) = env.integrity_override {
            self.integrity = policy;
        }
        if env.insecure_fallback {
            self.insecure_credential_fallback = true;
        }
    }

    /// `load` followed by `apply_env` with the live process environment.
    pub fn load_with_env(path: &Path) -> OpenScpResult<Self> {
        let mut cfg = Self::load(path)?;
        cfg.apply_env(&RuntimeEnv::capture());
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.max_concurrent, 2);
        assert_eq!(cfg.default_max_attempts, 3);
        assert!(cfg.hash_known_hosts);
        assert_eq!(cfg.integrity, IntegrityPolicy::Optional);
        assert!(cfg.audit_log_path.ends_with("openscp.auth"));
    }

    #[test]
    fn partial_json_and_clamping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "maxConcurrent": 40, "integrity": "required" }"#).unwrap();
        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.max_concurrent, MAX_CONCURRENT);
        assert_eq!(cfg.integrity, IntegrityPolicy::Required);
        assert_eq!(cfg.global_speed_limit_kbps, 0);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = CoreConfig::load(&path).unwrap_err();
        assert!(matches!(err, OpenScpError::Config(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = CoreConfig {
            max_concurrent: 4,
            global_speed_limit_kbps: 512,
            ..CoreConfig::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(CoreConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn env_layer_overrides() {
        let mut cfg = CoreConfig::default();
        let env = RuntimeEnv {
            known_hosts_plain: true,
            fingerprint_hex_only: true,
            integrity_override: Some(IntegrityPolicy::Off),
            ..RuntimeEnv::default()
        };
        cfg.apply_env(&env);
        assert!(!cfg.hash_known_hosts);
        assert!(cfg.fingerprint_hex);
        assert_eq!(cfg.integrity, IntegrityPolicy::Off);
        assert!(!cfg.insecure_credential_fallback);
    }

    #[test]
    #[serial]
    fn effective_policy_reads_env_each_time() {
        std::env::remove_var(env::ENV_TRANSFER_INTEGRITY);
        assert_eq!(IntegrityPolicy::Optional.effective(), IntegrityPolicy::Optional);

        std::env::set_var(env::ENV_TRANSFER_INTEGRITY, "required");
        assert_eq!(IntegrityPolicy::Optional.effective(), IntegrityPolicy::Required);

        std::env::remove_var(env::ENV_TRANSFER_INTEGRITY);
        assert_eq!(IntegrityPolicy::Off.effective(), IntegrityPolicy::Off);
    }
}
