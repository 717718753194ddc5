// ── Known-hosts store ───────────────────────────────────────────────────────
//
// OpenSSH `known_hosts` format. Every operation loads the file, mutates an
// in-memory copy and writes it back atomically; nothing is cached between
// calls. Comment, blank and marker lines are carried through unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use openscp_core::atomic::write_atomic;
use openscp_core::{OpenScpError, OpenScpResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

const HASH_MAGIC: &str = "|1|";
const SALT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostKeyCheck {
    Match,
    NotFound,
    Mismatch,
}

/// `host` on port 22, `[host]:port` otherwise.
pub fn host_token(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn hmac_host(salt: &[u8], token: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(salt) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(token.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// `|1|<base64 salt>|<base64 HMAC-SHA1(salt, token)>` with a fresh salt.
pub fn hash_host_token(token: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}{}|{}",
        HASH_MAGIC,
        STANDARD.encode(salt),
        STANDARD.encode(hmac_host(&salt, token))
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Comma-separated names from a plain line.
    Plain(Vec<String>),
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostPattern {
    fn parse(field: &str) -> Option<Self> {
        if let Some(rest) = field.strip_prefix(HASH_MAGIC) {
            let (salt, hash) = rest.split_once('|')?;
            return Some(HostPattern::Hashed {
                salt: STANDARD.decode(salt).ok()?,
                hash: STANDARD.decode(hash).ok()?,
            });
        }
        Some(HostPattern::Plain(
            field.split(',').map(str::to_string).collect(),
        ))
    }

    pub fn matches(&self, token: &str) -> bool {
        match self {
            HostPattern::Plain(names) => names.iter().any(|n| n == token),
            HostPattern::Hashed { salt, hash } => {
                let mut mac = match HmacSha1::new_from_slice(salt) {
                    Ok(m) => m,
                    Err(_) => return false,
                };
                mac.update(token.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
        }
    }

    fn render(&self) -> String {
        match self {
            HostPattern::Plain(names) => names.join(","),
            HostPattern::Hashed { salt, hash } => format!(
                "{}{}|{}",
                HASH_MAGIC,
                STANDARD.encode(salt),
                STANDARD.encode(hash)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    pub pattern: HostPattern,
    /// Key type as written in the file, e.g. `ssh-ed25519`.
    pub algorithm: String,
    pub key: Vec<u8>,
    pub comment: Option<String>,
    /// `@revoked` entries never match; they turn a hit into a mismatch.
    pub revoked: bool,
}

impl KnownHostEntry {
    pub fn is_hashed(&self) -> bool {
        matches!(self.pattern, HostPattern::Hashed { .. })
    }

    fn render(&self) -> String {
        let mut line = String::new();
        if self.revoked {
            line.push_str("@revoked ");
        }
        line.push_str(&self.pattern.render());
        line.push(' ');
        line.push_str(&self.algorithm);
        line.push(' ');
        line.push_str(&STANDARD.encode(&self.key));
        if let Some(ref c) = self.comment {
            line.push(' ');
            line.push_str(c);
        }
        line
    }
}

#[derive(Debug, Clone)]
enum Line {
    Entry(KnownHostEntry),
    /// Comments, blanks, `@cert-authority` and anything unparsable.
    Verbatim(String),
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Verbatim(raw.to_string());
    }
    let mut fields = trimmed.split_whitespace();
    let mut first = fields.next();
    let mut revoked = false;
    if let Some(marker) = first.filter(|f| f.starts_with('@')) {
        if marker != "@revoked" {
            return Line::Verbatim(raw.to_string());
        }
        revoked = true;
        first = fields.next();
    }
    let parsed = (|| {
        let pattern = HostPattern::parse(first?)?;
        let algorithm = fields.next()?.to_string();
        let key = STANDARD.decode(fields.next()?).ok()?;
        let rest: Vec<&str> = fields.collect();
        let comment = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };
        Some(KnownHostEntry {
            pattern,
            algorithm,
            key,
            comment,
            revoked,
        })
    })();
    match parsed {
        Some(entry) => Line::Entry(entry),
        None => Line::Verbatim(raw.to_string()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    path: PathBuf,
    lines: Vec<Line>,
}

impl KnownHosts {
    /// Read `path`. A missing file is an empty store; any other read error
    /// is returned.
    pub fn load(path: &Path) -> OpenScpResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(OpenScpError::io(
                    format!("read known_hosts {}", path.display()),
                    e,
                ))
            }
        };
        let lines = text.lines().map(parse_line).collect();
        Ok(KnownHosts {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = &KnownHostEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Verbatim(_) => None,
        })
    }

    /// Compare `key` with stored keys of the same type for `host:port`.
    /// Plain entries are consulted before hashed ones.
    pub fn check(&self, host: &str, port: u16, key: &[u8], algorithm: &str) -> HostKeyCheck {
        let token = host_token(host, port);
        let (plain, hashed): (Vec<_>, Vec<_>) = self
            .entries()
            .filter(|e| e.algorithm == algorithm)
            .partition(|e| !e.is_hashed());

        let mut mismatch = false;
        for entry in plain.into_iter().chain(hashed) {
            if !entry.pattern.matches(&token) {
                continue;
            }
            if entry.revoked {
                if entry.key == key {
                    return HostKeyCheck::Mismatch;
                }
                continue;
            }
            if entry.key == key {
                return HostKeyCheck::Match;
            }
            mismatch = true;
        }
        if mismatch {
            HostKeyCheck::Mismatch
        } else {
            HostKeyCheck::NotFound
        }
    }

    /// Pin `key` for `host:port`. Plain entries are deduplicated; hashed
    /// entries always get a fresh salt. Stale keys of the same type for the
    /// host are dropped. Returns `false` when nothing changed.
    pub fn add(&mut self, host: &str, port: u16, key: &[u8], algorithm: &str, hashed: bool) -> bool {
        let token = host_token(host, port);
        if !hashed
            && self.entries().any(|e| {
                !e.revoked
                    && e.pattern == HostPattern::Plain(vec![token.clone()])
                    && e.algorithm == algorithm
                    && e.key == key
            })
        {
            return false;
        }
        self.remove_matching(&token, Some((algorithm, key)));

        let pattern_field = if hashed {
            hash_host_token(&token)
        } else {
            token.clone()
        };
        let pattern = match HostPattern::parse(&pattern_field) {
            Some(p) => p,
            None => HostPattern::Plain(vec![token]),
        };
        self.lines.push(Line::Entry(KnownHostEntry {
            pattern,
            algorithm: algorithm.to_string(),
            key: key.to_vec(),
            comment: None,
            revoked: false,
        }));
        true
    }

    /// Drop entries for `token`. With `only_stale`, only entries of that key
    /// type whose key differs are dropped. Plain multi-name lines lose just
    /// the matching name. Returns the number of names removed.
    fn remove_matching(&mut self, token: &str, only_stale: Option<(&str, &[u8])>) -> usize {
        let mut removed = 0;
        self.lines.retain_mut(|line| {
            let Line::Entry(entry) = line else {
                return true;
            };
            if entry.revoked || !entry.pattern.matches(token) {
                return true;
            }
            if let Some((alg, key)) = only_stale {
                if entry.algorithm != alg || entry.key == key {
                    return true;
                }
            }
            match entry.pattern {
                HostPattern::Hashed { .. } => {
                    removed += 1;
                    false
                }
                HostPattern::Plain(ref mut names) => {
                    let before = names.len();
                    names.retain(|n| n != token);
                    removed += before - names.len();
                    !names.is_empty()
                }
            }
        });
        removed
    }

    /// Forget every key for `host:port` in memory.
    pub fn remove_host(&mut self, host: &str, port: u16) -> usize {
        self.remove_matching(&host_token(host, port), None)
    }

    /// Load, drop `host:port`, persist. Returns the number of removed names.
    pub fn remove(path: &Path, host: &str, port: u16) -> OpenScpResult<usize> {
        let mut store = Self::load(path)?;
        let removed = store.remove_host(host, port);
        if removed > 0 {
            store.persist()?;
        }
        Ok(removed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(e) => out.push_str(&e.render()),
                Line::Verbatim(s) => out.push_str(s),
            }
            out.push('\n');
        }
        out
    }

    /// Atomically write to the path the store was loaded from.
    pub fn persist(&self) -> OpenScpResult<()> {
        self.persist_to(&self.path)
    }

    pub fn persist_to(&self, path: &Path) -> OpenScpResult<()> {
        write_atomic(path, self.render().as_bytes()).map_err(|e| {
            warn!(error = %e, "known_hosts persist failed");
            OpenScpError::from(e)
        })?;
        debug!(path = %path.display(), entries = self.entries().count(), "known_hosts persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x20AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const KEY_B: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x20BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

    fn empty_store() -> (tempfile::TempDir, KnownHosts) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHosts::load(&dir.path().join("ssh").join("known_hosts")).unwrap();
        (dir, store)
    }

    #[test]
    fn token_format() {
        assert_eq!(host_token("example.org", 22), "example.org");
        assert_eq!(host_token("example.org", 2222), "[example.org]:2222");
    }

    #[test]
    fn hashed_token_matches_only_its_host() {
        let hashed = hash_host_token("example.org");
        assert!(hashed.starts_with("|1|"));
        let pattern = HostPattern::parse(&hashed).unwrap();
        assert!(pattern.matches("example.org"));
        assert!(!pattern.matches("example.com"));
        // fresh salt every time
        assert_ne!(hashed, hash_host_token("example.org"));
    }

    #[test]
    fn add_check_remove_law() {
        let (_dir, mut store) = empty_store();
        assert_eq!(store.check("h", 22, KEY_A, "ssh-ed25519"), HostKeyCheck::NotFound);
        assert!(store.add("h", 22, KEY_A, "ssh-ed25519", true));
        assert_eq!(store.check("h", 22, KEY_A, "ssh-ed25519"), HostKeyCheck::Match);
        assert_eq!(store.check("h", 22, KEY_B, "ssh-ed25519"), HostKeyCheck::Mismatch);
        assert_eq!(store.check("h", 2222, KEY_A, "ssh-ed25519"), HostKeyCheck::NotFound);
        assert_eq!(store.remove_host("h", 22), 1);
        assert_eq!(store.check("h", 22, KEY_A, "ssh-ed25519"), HostKeyCheck::NotFound);
    }

    #[test]
    fn plain_entries_are_deduplicated() {
        let (_dir, mut store) = empty_store();
        assert!(store.add("h", 22, KEY_A, "ssh-ed25519", false));
        assert!(!store.add("h", 22, KEY_A, "ssh-ed25519", false));
        assert_eq!(store.entries().count(), 1);
    }

    #[test]
    fn replacing_a_key_drops_the_stale_one() {
        let (_dir, mut store) = empty_store();
        store.add("h", 22, KEY_A, "ssh-ed25519", false);
        store.add("h", 22, KEY_B, "ssh-ed25519", false);
        assert_eq!(store.entries().count(), 1);
        assert_eq!(store.check("h", 22, KEY_B, "ssh-ed25519"), HostKeyCheck::Match);
    }

    #[test]
    fn other_algorithms_are_not_a_mismatch() {
        let (_dir, mut store) = empty_store();
        store.add("h", 22, KEY_A, "ssh-ed25519", false);
        assert_eq!(
            store.check("h", 22, b"rsa-blob", "ssh-rsa"),
            HostKeyCheck::NotFound
        );
    }

    #[test]
    fn persist_round_trip_keeps_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let encoded = STANDARD.encode(KEY_A);
        fs::write(
            &path,
            format!(
                "# managed by hand\nalpha,beta ssh-ed25519 {} user@box\n@cert-authority *.corp ssh-rsa AAAA\n",
                encoded
            ),
        )
        .unwrap();

        let mut store = KnownHosts::load(&path).unwrap();
        assert_eq!(store.check("beta", 22, KEY_A, "ssh-ed25519"), HostKeyCheck::Match);
        assert_eq!(store.remove_host("alpha", 22), 1);
        store.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# managed by hand\n"));
        assert!(text.contains(&format!("beta ssh-ed25519 {} user@box", encoded)));
        assert!(!text.contains("alpha"));
        assert!(text.contains("@cert-authority *.corp ssh-rsa AAAA"));

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.entries().count(), 1);
    }

    #[test]
    fn revoked_key_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, format!("@revoked h ssh-ed25519 {}\n", STANDARD.encode(KEY_A))).unwrap();
        let store = KnownHosts::load(&path).unwrap();
        assert_eq!(store.check("h", 22, KEY_A, "ssh-ed25519"), HostKeyCheck::Mismatch);
    }

    #[cfg(unix)]
    #[test]
    fn static_remove_persists_with_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, mut store) = empty_store();
        store.add("h", 22, KEY_A, "ssh-ed25519", true);
        store.add("g", 22, KEY_B, "ssh-ed25519", true);
        store.persist().unwrap();

        assert_eq!(KnownHosts::remove(store.path(), "h", 22).unwrap(), 1);
        let reloaded = KnownHosts::load(store.path()).unwrap();
        assert_eq!(reloaded.entries().count(), 1);
        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let parent_mode = fs::metadata(dir.path().join("ssh")).unwrap().permissions().mode() & 0o777;
        assert_eq!(parent_mode, 0o700);
    }
}
