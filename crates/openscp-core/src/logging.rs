//! Process-wide `tracing` subscriber and redaction helpers.

use crate::env::{LogLevel, RuntimeEnv};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub const REDACTED: &str = "<redacted>";

/// Filter directive for the given environment. `RUST_LOG` is handled by the
/// caller and wins over this.
pub fn default_directive(env: &RuntimeEnv) -> &'static str {
    match env.log_level {
        Some(level) => level.as_filter(),
        None if env.dev_mode => LogLevel::Info.as_filter(),
        None => "warn",
    }
}

fn build_filter(env: &RuntimeEnv) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(env)))
}

/// Install the fmt subscriber once. Later calls, or a subscriber installed
/// by the host application, are left alone.
pub fn init() {
    INIT.call_once(|| {
        let env = RuntimeEnv::capture();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(build_filter(&env))
            .with_target(true)
            .try_init();
    });
}

/// `value` when sensitive diagnostics are enabled, otherwise a placeholder.
/// Never pass passwords or passphrases here.
pub fn sensitive<'a>(env: &RuntimeEnv, value: &'a str) -> &'a str {
    if env.dev_mode && env.log_sensitive {
        value
    } else {
        REDACTED
    }
}
