// ── Remote directory model ──────────────────────────────────────────────────
//
// A read-only view of one remote directory plus a bounded recursive walk used
// to stage multi-item transfers.

use crate::sftp::file_ops::status;
use crate::sftp::remote::RemoteFs;
use crate::sftp::types::FileInfo;
use openscp_core::paths::{normalize_remote, remote_join};
use openscp_core::{OpenScpError, OpenScpResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

pub const DEFAULT_MAX_DEPTH: usize = 32;

const S_IFMT: u32 = 0o170000;

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
pub fn permission_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        0o040000 => 'd',
        0o120000 => 'l',
        0o010000 => 'p',
        0o140000 => 's',
        0o060000 => 'b',
        0o020000 => 'c',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    // (read, write, exec, special bit, special char)
    let triads = [
        (0o400, 0o200, 0o100, 0o4000, 's'),
        (0o040, 0o020, 0o010, 0o2000, 's'),
        (0o004, 0o002, 0o001, 0o1000, 't'),
    ];
    for (r, w, x, special, ch) in triads {
        out.push(if mode & r != 0 { 'r' } else { '-' });
        out.push(if mode & w != 0 { 'w' } else { '-' });
        let exec = mode & x != 0;
        out.push(match (mode & special != 0, exec) {
            (true, true) => ch,
            (true, false) => ch.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

/// Directories first, then case-insensitive by name.
pub fn sort_rows(rows: &mut [FileInfo]) {
    rows.sort_by(|a, b| match b.is_dir.cmp(&a.is_dir) {
        Ordering::Equal => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
        other => other,
    });
}

// ── Single directory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RemoteDirModel {
    root: Option<String>,
    entries: Vec<FileInfo>,
    show_hidden: bool,
}

impl RemoteDirModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// List `path` and replace the current rows. On failure the previous
    /// listing is kept.
    pub fn set_root(&mut self, remote: &dyn RemoteFs, path: &str) -> OpenScpResult<()> {
        let path = normalize_remote(path);
        let mut entries = remote.list(&path)?;
        sort_rows(&mut entries);
        debug!(path = %path, count = entries.len(), "directory listed");
        self.root = Some(path);
        self.entries = entries;
        Ok(())
    }

    pub fn refresh(&mut self, remote: &dyn RemoteFs) -> OpenScpResult<()> {
        match self.root.clone() {
            Some(root) => self.set_root(remote, &root),
            None => Ok(()),
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn show_hidden(&self) -> bool {
        self.show_hidden
    }

    pub fn set_show_hidden(&mut self, show: bool) {
        self.show_hidden = show;
    }

    /// Visible rows.
    pub fn rows(&self) -> Vec<&FileInfo> {
        self.entries
            .iter()
            .filter(|e| self.show_hidden || !e.is_hidden())
            .collect()
    }

    pub fn row(&self, index: usize) -> Option<&FileInfo> {
        self.rows().into_iter().nth(index)
    }

    pub fn row_count(&self) -> usize {
        self.rows().len()
    }

    /// Absolute remote path of a row name under the current root.
    pub fn path_of(&self, name: &str) -> Option<String> {
        self.root.as_deref().map(|root| remote_join(root, name))
    }
}

// ── Recursive enumeration ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumerateOptions {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        EnumerateOptions {
            max_depth: DEFAULT_MAX_DEPTH,
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumeratedEntry {
    /// Absolute remote path.
    pub path: String,
    /// Path relative to the enumeration root, `/`-separated.
    pub relative: String,
    pub info: FileInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumerateStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks_skipped: u64,
    /// Subtrees that could not be listed.
    pub denied: u64,
    pub unknown_size: u64,
    /// Directories not descended into because of `max_depth`.
    pub depth_limited: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enumeration {
    pub entries: Vec<EnumeratedEntry>,
    pub stats: EnumerateStats,
}

impl Enumeration {
    pub fn total_known_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.info.is_dir)
            .filter_map(|e| e.info.size)
            .sum()
    }
}

/// Walk `root` depth-first. Unlistable subtrees are counted, not fatal; only
/// an unlistable root or cancellation fails the call.
pub fn enumerate(
    remote: &dyn RemoteFs,
    root: &str,
    opts: &EnumerateOptions,
    cancel: &dyn Fn() -> bool,
) -> OpenScpResult<Enumeration> {
    let root = normalize_remote(root);
    let mut out = Enumeration::default();
    // (absolute, relative, depth)
    let mut stack: Vec<Pending> = Vec::new();

    let mut top = remote.list(&root)?;
    sort_rows(&mut top);
    let mut pending = Vec::new();
    for info in top {
        let path = remote_join(&root, &info.name);
        let relative = info.name.clone();
        pending.extend(visit(remote, opts, &mut out, path, relative, info, 1)?);
    }
    stack.extend(pending.into_iter().rev());

    while let Some((dir, rel, depth)) = stack.pop() {
        if cancel() {
            return Err(OpenScpError::Canceled);
        }
        let mut children = match remote.list(&dir) {
            Ok(c) => c,
            Err(e @ OpenScpError::NotConnected) => return Err(e),
            Err(e) => {
                if !is_permission_denied(&e) {
                    warn!(path = %dir, error = %e, "could not list directory");
                }
                out.stats.denied += 1;
                continue;
            }
        };
        sort_rows(&mut children);
        let mut pending = Vec::new();
        for info in children {
            let path = remote_join(&dir, &info.name);
            let relative = format!("{}/{}", rel, info.name);
            pending.extend(visit(remote, opts, &mut out, path, relative, info, depth + 1)?);
        }
        stack.extend(pending.into_iter().rev());
    }

    debug!(
        root = %root,
        files = out.stats.files,
        directories = out.stats.directories,
        denied = out.stats.denied,
        "enumeration finished"
    );
    Ok(out)
}

type Pending = (String, String, usize);

fn is_permission_denied(e: &OpenScpError) -> bool {
    matches!(e, OpenScpError::Remote { code, .. } if *code == status::PERMISSION_DENIED)
}

/// Record one entry. Returns the directory to descend into, if any.
fn visit(
    remote: &dyn RemoteFs,
    opts: &EnumerateOptions,
    out: &mut Enumeration,
    path: String,
    relative: String,
    mut info: FileInfo,
    depth: usize,
) -> OpenScpResult<Option<Pending>> {
    if info.is_symlink {
        if !opts.follow_symlinks {
            out.stats.symlinks_skipped += 1;
            return Ok(None);
        }
        let target = match remote.stat(&path) {
            Ok(target) => target,
            Err(e @ OpenScpError::NotConnected) => return Err(e),
            Err(e) => {
                if !is_permission_denied(&e) {
                    warn!(path = %path, error = %e, "could not resolve symlink");
                }
                out.stats.denied += 1;
                return Ok(None);
            }
        };
        match target {
            Some(target) => {
                info = FileInfo {
                    name: info.name,
                    is_symlink: true,
                    ..target
                };
            }
            None => {
                out.stats.symlinks_skipped += 1;
                return Ok(None);
            }
        }
    }

    let mut descend = None;
    if info.is_dir {
        out.stats.directories += 1;
        if depth < opts.max_depth {
            descend = Some((path.clone(), relative.clone(), depth));
        } else {
            out.stats.depth_limited += 1;
        }
    } else {
        out.stats.files += 1;
        if info.size.is_none() {
            out.stats.unknown_size += 1;
        }
    }
    out.entries.push(EnumeratedEntry {
        path,
        relative,
        info,
    });
    Ok(descend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testing::LoopbackRemote;
    use std::fs;

    fn row(name: &str, is_dir: bool) -> FileInfo {
        FileInfo {
            name: name.into(),
            is_dir,
            ..FileInfo::default()
        }
    }

    #[test]
    fn permission_strings() {
        assert_eq!(permission_string(0o040755), "drwxr-xr-x");
        assert_eq!(permission_string(0o100644), "-rw-r--r--");
        assert_eq!(permission_string(0o120777), "lrwxrwxrwx");
        assert_eq!(permission_string(0o104755), "-rwsr-xr-x");
        assert_eq!(permission_string(0o041777), "drwxrwxrwt");
        assert_eq!(permission_string(0o102640), "-rw-r-S---");
    }

    #[test]
    fn sorts_directories_first_ignoring_case() {
        let mut rows = vec![
            row("b.txt", false),
            row("Zeta", true),
            row("A.txt", false),
            row("alpha", true),
        ];
        sort_rows(&mut rows);
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Zeta", "A.txt", "b.txt"]);
    }

    #[test]
    fn hidden_toggle() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home/sub")).unwrap();
        fs::write(dir.path().join("home/.profile"), b"x").unwrap();
        fs::write(dir.path().join("home/notes.txt"), b"x").unwrap();
        let remote = LoopbackRemote::new(dir.path());

        let mut model = RemoteDirModel::new();
        model.set_root(&remote, "/home/").unwrap();
        assert_eq!(model.root(), Some("/home"));
        assert_eq!(model.row_count(), 2);
        assert_eq!(model.row(0).unwrap().name, "sub");
        assert_eq!(model.path_of("notes.txt").as_deref(), Some("/home/notes.txt"));

        model.set_show_hidden(true);
        assert_eq!(model.row_count(), 3);
        assert_eq!(model.row(1).unwrap().name, ".profile");
    }

    #[test]
    fn failed_listing_keeps_previous_rows() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        fs::write(dir.path().join("home/a"), b"x").unwrap();
        let remote = LoopbackRemote::new(dir.path());

        let mut model = RemoteDirModel::new();
        model.set_root(&remote, "/home").unwrap();
        assert!(model.set_root(&remote, "/missing").is_err());
        assert_eq!(model.root(), Some("/home"));
        assert_eq!(model.row_count(), 1);
    }

    #[test]
    fn enumerates_tree_with_depth_bound() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        fs::create_dir_all(base.join("a/b/c")).unwrap();
        fs::write(base.join("top.txt"), b"12345").unwrap();
        fs::write(base.join("a/one.txt"), b"1").unwrap();
        fs::write(base.join("a/b/c/deep.txt"), b"22").unwrap();
        let remote = LoopbackRemote::new(dir.path());

        let all = enumerate(&remote, "/data", &EnumerateOptions::default(), &|| false).unwrap();
        assert_eq!(all.stats.files, 3);
        assert_eq!(all.stats.directories, 3);
        assert_eq!(all.total_known_bytes(), 8);
        let rels: Vec<_> = all.entries.iter().map(|e| e.relative.as_str()).collect();
        assert!(rels.contains(&"a/b/c/deep.txt"));
        assert_eq!(rels[0], "a");

        let shallow = enumerate(
            &remote,
            "/data",
            &EnumerateOptions {
                max_depth: 2,
                follow_symlinks: false,
            },
            &|| false,
        )
        .unwrap();
        assert_eq!(shallow.stats.files, 2);
        assert_eq!(shallow.stats.directories, 2);
        assert_eq!(shallow.stats.depth_limited, 1);
    }

    #[cfg(unix)]
    #[test]
    fn skips_symlinks_unless_followed() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        fs::create_dir_all(base.join("real")).unwrap();
        fs::write(base.join("real/f.txt"), b"abc").unwrap();
        std::os::unix::fs::symlink(base.join("real"), base.join("link")).unwrap();
        let remote = LoopbackRemote::new(dir.path());

        let skipped = enumerate(&remote, "/data", &EnumerateOptions::default(), &|| false).unwrap();
        assert_eq!(skipped.stats.symlinks_skipped, 1);
        assert_eq!(skipped.stats.files, 1);

        let followed = enumerate(
            &remote,
            "/data",
            &EnumerateOptions {
                follow_symlinks: true,
                ..EnumerateOptions::default()
            },
            &|| false,
        )
        .unwrap();
        assert_eq!(followed.stats.symlinks_skipped, 0);
        assert_eq!(followed.stats.files, 2);
        assert!(followed.entries.iter().any(|e| e.relative == "link/f.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn unresolvable_symlink_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("a.txt"), b"abc").unwrap();
        // Resolving a self-referencing link fails with ELOOP.
        std::os::unix::fs::symlink("loop", base.join("loop")).unwrap();
        let remote = LoopbackRemote::new(dir.path());

        let out = enumerate(
            &remote,
            "/data",
            &EnumerateOptions {
                follow_symlinks: true,
                ..EnumerateOptions::default()
            },
            &|| false,
        )
        .unwrap();
        assert_eq!(out.stats.files, 1);
        assert_eq!(out.stats.denied, 1);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].relative, "a.txt");
    }

    #[test]
    fn missing_root_fails_and_cancel_stops() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data/a")).unwrap();
        let remote = LoopbackRemote::new(dir.path());
        assert!(enumerate(&remote, "/nope", &EnumerateOptions::default(), &|| false).is_err());
        let err = enumerate(&remote, "/data", &EnumerateOptions::default(), &|| true).unwrap_err();
        assert!(matches!(err, OpenScpError::Canceled));
    }
}
