// ── Key namespace ────────────────────────────────────────────────────────────

use uuid::Uuid;

/// Which secret of a site a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Password,
    KeyPassphrase,
}

impl SecretKind {
    fn suffix(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::KeyPassphrase => "keypass",
        }
    }
}

/// `site-id:<uuid>:password` / `site-id:<uuid>:keypass`
pub fn site_key(site_id: &Uuid, kind: SecretKind) -> String {
    format!("site-id:{}:{}", site_id, kind.suffix())
}

pub fn site_password_key(site_id: &Uuid) -> String {
    site_key(site_id, SecretKind::Password)
}

pub fn site_keypass_key(site_id: &Uuid) -> String {
    site_key(site_id, SecretKind::KeyPassphrase)
}

/// Key used before sites had stable ids: `<name>:password`.
pub fn legacy_site_key(site_name: &str, kind: SecretKind) -> String {
    format!("{}:{}", site_name, kind.suffix())
}
