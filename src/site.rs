// ── Site profiles ───────────────────────────────────────────────────────────

use openscp_core::CoreConfig;
use openscp_sftp::sftp::{HostKeyPolicy, SessionOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

fn default_port() -> u16 {
    22
}

/// A saved server. Secrets are never part of the profile; they live in the
/// credential store under keys derived from `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

impl SiteProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        SiteProfile {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            private_key_path: None,
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    /// Session options without secrets.
    pub fn session_options(&self, config: &CoreConfig) -> SessionOptions {
        let mut opts = SessionOptions::new(&self.host, &self.username).with_config(config);
        opts.port = self.port;
        opts.private_key_path = self.private_key_path.clone();
        opts.host_key_policy = self.host_key_policy;
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "id": "6f1c1f44-8a4f-4d2b-9a57-1f6a3f9d2c11",
            "name": "build box",
            "host": "build.example.net",
            "username": "ci"
        }"#;
        let site: SiteProfile = serde_json::from_str(json).unwrap();
        assert_eq!(site.port, 22);
        assert_eq!(site.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(site.private_key_path.is_none());
    }

    #[test]
    fn options_carry_profile_and_config() {
        let mut site = SiteProfile::new("db", "db.internal", "ops");
        site.port = 2222;
        site.host_key_policy = HostKeyPolicy::Strict;
        let config = CoreConfig {
            fingerprint_hex: true,
            ..CoreConfig::default()
        };
        let opts = site.session_options(&config);
        assert_eq!(opts.endpoint(), "db.internal:2222");
        assert_eq!(opts.host_key_policy, HostKeyPolicy::Strict);
        assert!(opts.fingerprint_hex);
        assert!(opts.password.is_none());
        assert_eq!(opts.known_hosts_path, Some(config.known_hosts_path.clone()));
    }
}
