// ── Runtime environment switches ─────────────────────────────────────────────
//
// Every recognised `OPEN_SCP_*` variable is parsed by a pure function so the
// rules can be tested without touching the process environment. `RuntimeEnv`
// is the snapshot the rest of the workspace reads.

use crate::config::IntegrityPolicy;
use std::env;

pub const ENV_MODE: &str = "OPEN_SCP_ENV";
pub const ENV_LOG_SENSITIVE: &str = "OPEN_SCP_LOG_SENSITIVE";
pub const ENV_LOG_LEVEL: &str = "OPEN_SCP_LOG_LEVEL";
pub const ENV_TRANSFER_INTEGRITY: &str = "OPEN_SCP_TRANSFER_INTEGRITY";
pub const ENV_KNOWNHOSTS_PLAIN: &str = "OPEN_SCP_KNOWNHOSTS_PLAIN";
pub const ENV_FP_HEX_ONLY: &str = "OPEN_SCP_FP_HEX_ONLY";
pub const ENV_ENABLE_INSECURE_FALLBACK: &str = "OPEN_SCP_ENABLE_INSECURE_FALLBACK";

/// Level requested through `OPEN_SCP_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

// ── Pure parsers ─────────────────────────────────────────────────────────────

pub fn parse_dev_mode(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("dev" | "development" | "local" | "debug")
    )
}

/// `1`, `true`, `yes` and `on` (any case) are truthy.
pub fn parse_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Strict `1` switch used by the known-hosts, fingerprint and fallback flags.
pub fn parse_flag_one(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("1")
}

pub fn parse_log_level(value: Option<&str>) -> Option<LogLevel> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("off") => Some(LogLevel::Off),
        Some("info") => Some(LogLevel::Info),
        Some("debug") => Some(LogLevel::Debug),
        _ => None,
    }
}

pub fn parse_integrity(value: Option<&str>) -> Option<IntegrityPolicy> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("off") => Some(IntegrityPolicy::Off),
        Some("optional") => Some(IntegrityPolicy::Optional),
        Some("required") => Some(IntegrityPolicy::Required),
        _ => None,
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub dev_mode: bool,
    pub log_sensitive: bool,
    pub log_level: Option<LogLevel>,
    pub integrity_override: Option<IntegrityPolicy>,
    pub known_hosts_plain: bool,
    pub fingerprint_hex_only: bool,
    pub insecure_fallback: bool,
}

impl RuntimeEnv {
    /// Build a snapshot from an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name);
        let dev_mode = parse_dev_mode(get(ENV_MODE).as_deref());
        RuntimeEnv {
            dev_mode,
            // Sensitive diagnostics are only honoured in developer mode.
            log_sensitive: dev_mode && parse_truthy(get(ENV_LOG_SENSITIVE).as_deref()),
            log_level: parse_log_level(get(ENV_LOG_LEVEL).as_deref()),
            integrity_override: parse_integrity(get(ENV_TRANSFER_INTEGRITY).as_deref()),
            known_hosts_plain: parse_flag_one(get(ENV_KNOWNHOSTS_PLAIN).as_deref()),
            fingerprint_hex_only: parse_flag_one(get(ENV_FP_HEX_ONLY).as_deref()),
            insecure_fallback: parse_flag_one(get(ENV_ENABLE_INSECURE_FALLBACK).as_deref()),
        }
    }

    /// Read the current process environment.
    pub fn capture() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }
}

/// Integrity override as currently set in the process environment.
///
/// Read on every call so a changed variable applies to the next transfer.
pub fn integrity_override() -> Option<IntegrityPolicy> {
    parse_integrity(env::var(ENV_TRANSFER_INTEGRITY).ok().as_deref())
}
