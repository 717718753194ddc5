// ── Authentication ──────────────────────────────────────────────────────────
//
// Order follows what the caller supplied:
//   • private key          → publickey once, nothing else
//   • password             → password, keyboard-interactive, then agent
//   • neither              → agent
// Agent attempts are capped at three identities so servers with a low
// MaxAuthTries do not drop the connection before a usable key is offered.

use crate::sftp::callbacks::{classify_prompt, KbdIntPrompt, KbdIntResponse, PromptKind, SessionCallbacks};
use crate::sftp::types::{AuthMethod, SessionOptions};
use openscp_core::{AuthFailure, OpenScpError, OpenScpResult};
use ssh2::{ErrorCode, KeyboardInteractivePrompt, Prompt};
use tracing::{debug, info, warn};

pub const MAX_AGENT_IDENTITIES: usize = 3;

// libssh2 socket failures: the peer is gone and no further method can run.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

pub fn is_disconnect(code: &ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

fn numeric(code: &ErrorCode) -> i32 {
    match code {
        ErrorCode::Session(c) | ErrorCode::SFTP(c) => *c,
    }
}

/// What was tried so far, for the structured failure.
#[derive(Debug, Default)]
struct AuthTrace {
    attempted: Vec<String>,
    last_error: Option<String>,
    code: Option<i32>,
    disconnected: bool,
}

impl AuthTrace {
    fn note(&mut self, method: &str) {
        if !self.attempted.iter().any(|m| m == method) {
            self.attempted.push(method.to_string());
        }
    }

    fn record(&mut self, err: &ssh2::Error) {
        self.last_error = Some(err.message().to_string());
        self.code = Some(numeric(&err.code()));
        if is_disconnect(&err.code()) {
            self.disconnected = true;
        }
    }

    fn fail(self, username: &str, server_methods: Vec<String>) -> OpenScpError {
        OpenScpError::Auth(AuthFailure {
            username: username.to_string(),
            server_methods,
            attempted: self.attempted,
            last_error: self.last_error,
            code: self.code,
            disconnected: self.disconnected,
        })
    }
}

fn server_methods(ssh: &ssh2::Session, username: &str, trace: &mut AuthTrace) -> Vec<String> {
    match ssh.auth_methods(username) {
        Ok(list) => list
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect(),
        Err(e) => {
            trace.record(&e);
            Vec::new()
        }
    }
}

// ── Keyboard-interactive ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbdIntAnswer {
    Answers(Vec<String>),
    Cancelled,
}

/// Answer a keyboard-interactive round. Username and password prompts are
/// filled in directly; anything else (OTP codes and the like) goes to the
/// caller.
pub fn answer_prompts(
    username: &str,
    password: Option<&str>,
    callbacks: &dyn SessionCallbacks,
    name: &str,
    instruction: &str,
    prompts: &[KbdIntPrompt],
) -> KbdIntAnswer {
    let auto = |p: &KbdIntPrompt| match classify_prompt(&p.text) {
        PromptKind::Username => Some(username.to_string()),
        PromptKind::Password => password.map(str::to_string),
        PromptKind::Other => None,
    };
    let automatic: Vec<Option<String>> = prompts.iter().map(auto).collect();
    if automatic.iter().all(Option::is_some) {
        return KbdIntAnswer::Answers(automatic.into_iter().flatten().collect());
    }

    match callbacks.kbdint_prompts(name, instruction, prompts) {
        KbdIntResponse::Handled(answers) if answers.len() == prompts.len() => {
            KbdIntAnswer::Answers(answers)
        }
        KbdIntResponse::Handled(answers) => {
            warn!(
                expected = prompts.len(),
                got = answers.len(),
                "keyboard-interactive answer count mismatch"
            );
            KbdIntAnswer::Cancelled
        }
        KbdIntResponse::Cancelled => KbdIntAnswer::Cancelled,
        KbdIntResponse::Unhandled => KbdIntAnswer::Answers(
            automatic
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
        ),
    }
}

struct Prompter<'a> {
    username: &'a str,
    password: Option<&'a str>,
    callbacks: &'a dyn SessionCallbacks,
    cancelled: bool,
}

impl KeyboardInteractivePrompt for Prompter<'_> {
    fn prompt<'b>(&mut self, name: &str, instructions: &str, prompts: &[Prompt<'b>]) -> Vec<String> {
        let prompts: Vec<KbdIntPrompt> = prompts
            .iter()
            .map(|p| KbdIntPrompt {
                text: p.text.to_string(),
                echo: p.echo,
            })
            .collect();
        debug!(count = prompts.len(), "keyboard-interactive round");
        match answer_prompts(
            self.username,
            self.password,
            self.callbacks,
            name,
            instructions,
            &prompts,
        ) {
            KbdIntAnswer::Answers(a) => a,
            KbdIntAnswer::Cancelled => {
                self.cancelled = true;
                vec![String::new(); prompts.len()]
            }
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

fn try_agent(ssh: &ssh2::Session, username: &str, trace: &mut AuthTrace) -> Option<AuthMethod> {
    trace.note("agent");
    let mut agent = match ssh.agent() {
        Ok(a) => a,
        Err(e) => {
            trace.record(&e);
            return None;
        }
    };
    if let Err(e) = agent.connect() {
        debug!(error = %e, "ssh agent not reachable");
        trace.record(&e);
        return None;
    }
    let identities = match agent.list_identities().and_then(|_| agent.identities()) {
        Ok(ids) => ids,
        Err(e) => {
            trace.record(&e);
            let _ = agent.disconnect();
            return None;
        }
    };

    let mut result = None;
    for identity in identities.iter().take(MAX_AGENT_IDENTITIES) {
        match agent.userauth(username, identity) {
            Ok(()) if ssh.authenticated() => {
                result = Some(AuthMethod::Agent {
                    identity: identity.comment().to_string(),
                });
                break;
            }
            Ok(()) => {}
            Err(e) => {
                trace.record(&e);
                if trace.disconnected {
                    break;
                }
            }
        }
    }
    let _ = agent.disconnect();
    result
}

/// Run the authentication phase on a handshaken session.
pub fn authenticate(ssh: &ssh2::Session, opts: &SessionOptions) -> OpenScpResult<AuthMethod> {
    let user = opts.username.as_str();
    let mut trace = AuthTrace::default();

    if let Some(ref key) = opts.private_key_path {
        trace.note("publickey");
        match ssh.userauth_pubkey_file(user, None, key, opts.private_key_passphrase.as_deref()) {
            Ok(()) if ssh.authenticated() => {
                info!(user, "authenticated with private key");
                return Ok(AuthMethod::PublicKey);
            }
            Ok(()) => {}
            Err(e) => trace.record(&e),
        }
        let methods = if trace.disconnected {
            Vec::new()
        } else {
            server_methods(ssh, user, &mut trace)
        };
        return Err(trace.fail(user, methods));
    }

    if let Some(ref password) = opts.password {
        trace.note("password");
        match ssh.userauth_password(user, password) {
            Ok(()) if ssh.authenticated() => {
                info!(user, "authenticated with password");
                return Ok(AuthMethod::Password);
            }
            Ok(()) => {}
            Err(e) => trace.record(&e),
        }
        if trace.disconnected {
            return Err(trace.fail(user, Vec::new()));
        }

        let methods = server_methods(ssh, user, &mut trace);
        if methods.iter().any(|m| m == "keyboard-interactive") {
            trace.note("keyboard-interactive");
            let mut prompter = Prompter {
                username: user,
                password: Some(password),
                callbacks: opts.callbacks.as_ref(),
                cancelled: false,
            };
            match ssh.userauth_keyboard_interactive(user, &mut prompter) {
                Ok(()) if ssh.authenticated() => {
                    info!(user, "authenticated with keyboard-interactive");
                    return Ok(AuthMethod::KeyboardInteractive);
                }
                Ok(()) => {}
                Err(e) => trace.record(&e),
            }
            if prompter.cancelled {
                trace.last_error = Some("keyboard-interactive cancelled by user".into());
                return Err(trace.fail(user, methods));
            }
            if trace.disconnected {
                return Err(trace.fail(user, methods));
            }
        }

        let methods = server_methods(ssh, user, &mut trace);
        if methods.iter().any(|m| m == "publickey") {
            if let Some(method) = try_agent(ssh, user, &mut trace) {
                info!(user, method = %method, "authenticated through ssh agent");
                return Ok(method);
            }
        }
        return Err(trace.fail(user, methods));
    }

    if let Some(method) = try_agent(ssh, user, &mut trace) {
        info!(user, method = %method, "authenticated through ssh agent");
        return Ok(method);
    }
    let methods = if trace.disconnected {
        Vec::new()
    } else {
        server_methods(ssh, user, &mut trace)
    };
    Err(trace.fail(user, methods))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::callbacks::MockSessionCallbacks;

    fn prompt(text: &str) -> KbdIntPrompt {
        KbdIntPrompt {
            text: text.into(),
            echo: false,
        }
    }

    #[test]
    fn disconnect_codes() {
        assert!(is_disconnect(&ErrorCode::Session(-13)));
        assert!(is_disconnect(&ErrorCode::Session(-43)));
        assert!(is_disconnect(&ErrorCode::Session(-7)));
        assert!(!is_disconnect(&ErrorCode::Session(-18)));
        assert!(!is_disconnect(&ErrorCode::SFTP(-13)));
    }

    #[test]
    fn password_prompts_answered_without_caller() {
        let mut cb = MockSessionCallbacks::new();
        cb.expect_kbdint_prompts().never();
        let answer = answer_prompts(
            "alice",
            Some("s3cret"),
            &cb,
            "",
            "",
            &[prompt("Username:"), prompt("Password: ")],
        );
        assert_eq!(
            answer,
            KbdIntAnswer::Answers(vec!["alice".into(), "s3cret".into()])
        );
    }

    #[test]
    fn otp_prompt_goes_to_caller() {
        let mut cb = MockSessionCallbacks::new();
        cb.expect_kbdint_prompts()
            .times(1)
            .returning(|_, _, prompts| {
                assert_eq!(prompts.len(), 2);
                KbdIntResponse::Handled(vec!["s3cret".into(), "123456".into()])
            });
        let answer = answer_prompts(
            "alice",
            Some("s3cret"),
            &cb,
            "2FA",
            "",
            &[prompt("Password:"), prompt("Verification code:")],
        );
        assert_eq!(
            answer,
            KbdIntAnswer::Answers(vec!["s3cret".into(), "123456".into()])
        );
    }

    #[test]
    fn unhandled_falls_back_to_known_answers() {
        let mut cb = MockSessionCallbacks::new();
        cb.expect_kbdint_prompts()
            .returning(|_, _, _| KbdIntResponse::Unhandled);
        let answer = answer_prompts(
            "alice",
            Some("pw"),
            &cb,
            "",
            "",
            &[prompt("Password:"), prompt("Token:")],
        );
        assert_eq!(answer, KbdIntAnswer::Answers(vec!["pw".into(), String::new()]));
    }

    #[test]
    fn cancel_and_short_answers_abort() {
        let mut cb = MockSessionCallbacks::new();
        cb.expect_kbdint_prompts()
            .times(1)
            .returning(|_, _, _| KbdIntResponse::Cancelled);
        let answer = answer_prompts("a", None, &cb, "", "", &[prompt("OTP:")]);
        assert_eq!(answer, KbdIntAnswer::Cancelled);

        let mut cb = MockSessionCallbacks::new();
        cb.expect_kbdint_prompts()
            .returning(|_, _, _| KbdIntResponse::Handled(Vec::new()));
        let answer = answer_prompts("a", None, &cb, "", "", &[prompt("OTP:")]);
        assert_eq!(answer, KbdIntAnswer::Cancelled);
    }

    #[test]
    fn trace_builds_structured_failure() {
        let mut trace = AuthTrace::default();
        trace.note("password");
        trace.note("password");
        trace.note("keyboard-interactive");
        trace.last_error = Some("denied".into());
        trace.code = Some(-18);
        match trace.fail("bob", vec!["publickey".into()]) {
            OpenScpError::Auth(f) => {
                assert_eq!(f.attempted, vec!["password", "keyboard-interactive"]);
                assert_eq!(f.server_methods, vec!["publickey"]);
                assert_eq!(f.code, Some(-18));
                assert!(!f.disconnected);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
