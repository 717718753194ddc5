//! Capabilities the front-end supplies to a session.
//!
//! One trait object per session replaces loose function pointers. Every
//! method may block waiting for the user.

use lazy_static::lazy_static;
use regex::Regex;

/// Presented to the user when a host key is unknown or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyPrompt {
    pub host: String,
    pub port: u16,
    /// Algorithm and size, e.g. `ED25519 (256-bit)`.
    pub algorithm_display: String,
    pub fingerprint: String,
    /// Whether accepting will pin the key. `false` on the second prompt after
    /// saving failed.
    pub can_save: bool,
    /// The store already holds a different key for this host.
    pub mismatch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbdIntPrompt {
    pub text: String,
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbdIntResponse {
    /// One answer per prompt, in order.
    Handled(Vec<String>),
    /// Let the session answer what it can (username, password).
    Unhandled,
    /// Abort authentication.
    Cancelled,
}

#[cfg_attr(test, mockall::automock)]
pub trait SessionCallbacks: Send + Sync {
    fn confirm_host_key(&self, prompt: &HostKeyPrompt) -> bool;

    /// Diagnostic status line about host-key handling.
    fn hostkey_status(&self, _message: &str) {}

    fn kbdint_prompts(
        &self,
        _name: &str,
        _instruction: &str,
        _prompts: &[KbdIntPrompt],
    ) -> KbdIntResponse {
        KbdIntResponse::Unhandled
    }
}

/// Non-interactive default: refuses every unknown key.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectUnknownHosts;

impl SessionCallbacks for RejectUnknownHosts {
    fn confirm_host_key(&self, _prompt: &HostKeyPrompt) -> bool {
        false
    }
}

// ── Keyboard-interactive prompt classification ──────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Username,
    Password,
    /// OTP, verification code or anything else only the user can answer.
    Other,
}

lazy_static! {
    static ref PASSWORD_RE: Regex = Regex::new(r"(?i)pass(word|phrase|code)").unwrap();
    static ref OTP_RE: Regex =
        Regex::new(r"(?i)(one[- ]time|otp|verification|token|2fa|two[- ]factor|authenticator)")
            .unwrap();
    static ref USER_RE: Regex = Regex::new(r"(?i)(user|name|login)").unwrap();
}

pub fn classify_prompt(text: &str) -> PromptKind {
    // OTP prompts often say "passcode" too, so they are checked first.
    if OTP_RE.is_match(text) {
        PromptKind::Other
    } else if PASSWORD_RE.is_match(text) {
        PromptKind::Password
    } else if USER_RE.is_match(text) {
        PromptKind::Username
    } else {
        PromptKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_classes() {
        assert_eq!(classify_prompt("Password: "), PromptKind::Password);
        assert_eq!(classify_prompt("Enter passphrase for key"), PromptKind::Password);
        assert_eq!(classify_prompt("Passcode:"), PromptKind::Password);
        assert_eq!(classify_prompt("Username:"), PromptKind::Username);
        assert_eq!(classify_prompt("login as"), PromptKind::Username);
        assert_eq!(classify_prompt("Verification code: "), PromptKind::Other);
        assert_eq!(classify_prompt("One-time password:"), PromptKind::Other);
        assert_eq!(classify_prompt("Favourite colour?"), PromptKind::Other);
    }

    #[test]
    fn default_callbacks_refuse() {
        let cb = RejectUnknownHosts;
        let prompt = HostKeyPrompt {
            host: "h".into(),
            port: 22,
            algorithm_display: "ED25519 (256-bit)".into(),
            fingerprint: "SHA256:x".into(),
            can_save: true,
            mismatch: false,
        };
        assert!(!cb.confirm_host_key(&prompt));
        assert_eq!(cb.kbdint_prompts("", "", &[]), KbdIntResponse::Unhandled);
    }
}
