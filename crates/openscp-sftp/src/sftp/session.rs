// ── Session lifecycle ───────────────────────────────────────────────────────
//
// Disconnected → Connecting → Authenticated → SftpReady → Disconnecting →
// Disconnected. Everything except `open` and `disconnect` needs SftpReady.

use crate::sftp::auth;
use crate::sftp::host_key::{describe_key, fingerprint, HostKeyDecision, HostKeyVerifier};
use crate::sftp::remote::{RemoteFs, SessionFactory};
use crate::sftp::types::{AuthMethod, SessionInfo, SessionOptions, SessionState};
use chrono::Utc;
use openscp_core::{IntegrityPolicy, OpenScpError, OpenScpResult, RuntimeEnv};
use socket2::{SockRef, TcpKeepalive};
use ssh2::MethodType;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const SESSION_TIMEOUT_MS: u32 = 20_000;
pub const SSH_KEEPALIVE_SECS: u32 = 30;

const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(any(target_os = "linux", target_os = "macos"))]
const TCP_KEEPALIVE_RETRIES: u32 = 3;

const HOSTKEY_PREFS: &str = "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,\
ecdsa-sha2-nistp521,rsa-sha2-512,rsa-sha2-256";
const KEX_PREFS: &str = "curve25519-sha256,curve25519-sha256@libssh.org,\
ecdh-sha2-nistp256,diffie-hellman-group14-sha256";
const CIPHER_PREFS: &str = "chacha20-poly1305@openssh.com,aes256-gcm@openssh.com,\
aes128-gcm@openssh.com,aes256-ctr,aes128-ctr";
const MAC_PREFS: &str = "hmac-sha2-512,hmac-sha2-256";

// ── TCP ──────────────────────────────────────────────────────────────────────

fn configure_keepalive(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_IDLE);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(TCP_KEEPALIVE_INTERVAL);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(TCP_KEEPALIVE_RETRIES);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "could not configure TCP keepalive");
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not set TCP_NODELAY");
    }
}

/// Try every resolved address until one accepts.
pub fn open_tcp(host: &str, port: u16) -> OpenScpResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| OpenScpError::connect(host, port, format!("resolve failed: {}", e)))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                debug!(%addr, "tcp connected");
                configure_keepalive(&stream);
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "tcp connect failed");
                last_error = Some(e);
            }
        }
    }
    Err(OpenScpError::connect(
        host,
        port,
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".into()),
    ))
}

// ── Connect ──────────────────────────────────────────────────────────────────

/// Disconnects a half-built SSH session unless disarmed.
struct Teardown<'a> {
    ssh: &'a ssh2::Session,
    armed: bool,
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("tearing down partially connected session");
            let _ = self.ssh.disconnect(None, "connect aborted", None);
        }
    }
}

pub(crate) struct Connection {
    pub(crate) sftp: ssh2::Sftp,
    pub(crate) ssh: ssh2::Session,
}

struct Established {
    conn: Connection,
    info: SessionInfo,
    host_key: Vec<u8>,
}

fn set_preferences(ssh: &ssh2::Session) {
    let prefs = [
        (MethodType::HostKey, "hostkey", HOSTKEY_PREFS),
        (MethodType::Kex, "kex", KEX_PREFS),
        (MethodType::CryptCs, "cipher c2s", CIPHER_PREFS),
        (MethodType::CryptSc, "cipher s2c", CIPHER_PREFS),
        (MethodType::MacCs, "mac c2s", MAC_PREFS),
        (MethodType::MacSc, "mac s2c", MAC_PREFS),
    ];
    for (kind, label, list) in prefs {
        if let Err(e) = ssh.method_pref(kind, list) {
            warn!(method = label, error = %e, "algorithm preference rejected, using library defaults");
        }
    }
}

/// Host-key check, authentication and SFTP channel on a handshaken session.
fn secure_channel(
    ssh: &ssh2::Session,
    opts: &SessionOptions,
    env: &RuntimeEnv,
    pinned: Option<&[u8]>,
    state: &mut SessionState,
) -> OpenScpResult<(ssh2::Sftp, SessionInfo, Vec<u8>)> {
    let (host, port) = (opts.host.as_str(), opts.port);

    let blob = match ssh.host_key() {
        Some((blob, _)) => blob.to_vec(),
        None => {
            return Err(OpenScpError::HostKeyRejected {
                host: host.to_string(),
                port,
                reason: "server presented no host key".into(),
            })
        }
    };
    let mut verifier = HostKeyVerifier::from_options(opts, env);
    verifier.pinned = pinned.map(<[u8]>::to_vec);
    if verifier.verify(host, port, &blob)? == HostKeyDecision::Unverified {
        warn!(host, port, "continuing without host-key verification");
    }

    let method: AuthMethod = auth::authenticate(ssh, opts)?;
    *state = SessionState::Authenticated;

    let sftp = ssh.sftp().map_err(|e| {
        OpenScpError::connect(host, port, format!("SFTP subsystem unavailable: {}", e))
    })?;
    ssh.set_keepalive(false, SSH_KEEPALIVE_SECS);

    let remote_home = sftp
        .realpath(Path::new("."))
        .ok()
        .map(|p| p.to_string_lossy().into_owned());
    let info = SessionInfo {
        host: host.to_string(),
        port,
        username: opts.username.clone(),
        auth_method: method,
        server_banner: ssh.banner().map(str::to_string),
        remote_home,
        host_key_algorithm: describe_key(&blob)
            .map(|d| d.display())
            .unwrap_or_else(|| "unknown".into()),
        host_key_fingerprint: fingerprint(&blob, opts.fingerprint_hex || env.fingerprint_hex_only),
        connected_at: Utc::now(),
    };
    Ok((sftp, info, blob))
}

fn establish(
    opts: &SessionOptions,
    pinned: Option<&[u8]>,
    state: &mut SessionState,
) -> OpenScpResult<Established> {
    let (host, port) = (opts.host.as_str(), opts.port);
    let env = RuntimeEnv::capture();

    let tcp = open_tcp(host, port)?;
    let mut ssh = ssh2::Session::new()
        .map_err(|e| OpenScpError::connect(host, port, format!("session init: {}", e)))?;
    set_preferences(&ssh);
    ssh.set_timeout(SESSION_TIMEOUT_MS);
    ssh.set_tcp_stream(tcp);
    ssh.handshake()
        .map_err(|e| OpenScpError::connect(host, port, format!("handshake failed: {}", e)))?;

    let mut guard = Teardown {
        ssh: &ssh,
        armed: true,
    };
    let (sftp, info, host_key) = secure_channel(&ssh, opts, &env, pinned, state)?;
    guard.armed = false;
    drop(guard);

    Ok(Established {
        conn: Connection { sftp, ssh },
        info,
        host_key,
    })
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct Session {
    options: SessionOptions,
    state: SessionState,
    conn: Option<Connection>,
    info: Option<SessionInfo>,
    host_key: Option<Vec<u8>>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        Session {
            options,
            state: SessionState::Disconnected,
            conn: None,
            info: None,
            host_key: None,
        }
    }

    /// Build and connect in one step.
    pub fn connect(options: SessionOptions) -> OpenScpResult<Self> {
        let mut session = Session::new(options);
        session.open()?;
        Ok(session)
    }

    pub fn open(&mut self) -> OpenScpResult<()> {
        self.open_pinned(None)
    }

    fn open_pinned(&mut self, pinned: Option<&[u8]>) -> OpenScpResult<()> {
        if self.state != SessionState::Disconnected {
            self.disconnect();
        }
        self.state = SessionState::Connecting;
        info!(endpoint = %self.options.endpoint(), user = %self.options.username, "connecting");
        match establish(&self.options, pinned, &mut self.state) {
            Ok(est) => {
                info!(
                    endpoint = %self.options.endpoint(),
                    method = %est.info.auth_method,
                    "sftp session ready"
                );
                self.conn = Some(est.conn);
                self.info = Some(est.info);
                self.host_key = Some(est.host_key);
                self.state = SessionState::SftpReady;
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.options.endpoint(), error = %e, "connect failed");
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected && self.conn.is_none() {
            return;
        }
        self.state = SessionState::Disconnecting;
        if let Some(conn) = self.conn.take() {
            drop(conn.sftp);
            if let Err(e) = conn.ssh.disconnect(None, "closing", None) {
                debug!(error = %e, "disconnect message not delivered");
            }
            info!(endpoint = %self.options.endpoint(), "disconnected");
        }
        self.info = None;
        self.state = SessionState::Disconnected;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::SftpReady
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    /// Remote home as resolved right after connect.
    pub fn home_dir(&self) -> Option<&str> {
        self.info.as_ref().and_then(|i| i.remote_home.as_deref())
    }

    /// Integrity policy for the next transfer, environment override applied.
    pub fn integrity(&self) -> IntegrityPolicy {
        self.options.integrity.effective()
    }

    pub(crate) fn connection(&self) -> OpenScpResult<&Connection> {
        match (&self.conn, self.state) {
            (Some(conn), SessionState::SftpReady) => Ok(conn),
            _ => Err(OpenScpError::NotConnected),
        }
    }

    /// Send an SSH keepalive. Returns seconds until the next one is due.
    pub fn ping(&self) -> OpenScpResult<u32> {
        let conn = self.connection()?;
        conn.ssh.keepalive_send().map_err(|e| {
            OpenScpError::connect(&self.options.host, self.options.port, format!("keepalive: {}", e))
        })
    }

    /// A second, independent session with the same parameters. The host key
    /// accepted by this session is pinned, so no prompt is repeated.
    pub fn new_connection_like(&self) -> OpenScpResult<Session> {
        self.factory()?.connect_session()
    }

    /// Shareable template for minting worker sessions.
    pub fn factory(&self) -> OpenScpResult<Arc<SessionTemplate>> {
        self.connection()?;
        let host_key = self.host_key.clone().ok_or(OpenScpError::NotConnected)?;
        Ok(Arc::new(SessionTemplate {
            options: self.options.clone(),
            host_key,
        }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Connection parameters of an established session plus its accepted host key.
pub struct SessionTemplate {
    options: SessionOptions,
    host_key: Vec<u8>,
}

impl SessionTemplate {
    pub fn connect_session(&self) -> OpenScpResult<Session> {
        let mut session = Session::new(self.options.clone());
        session.open_pinned(Some(&self.host_key))?;
        Ok(session)
    }
}

impl SessionFactory for SessionTemplate {
    fn new_connection_like(&self) -> OpenScpResult<Box<dyn RemoteFs>> {
        Ok(Box::new(self.connect_session()?))
    }

    fn integrity(&self) -> IntegrityPolicy {
        self.options.integrity
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.options.username, self.options.endpoint())
    }
}
