// ── Remote filesystem seam ──────────────────────────────────────────────────
//
// The transfer engine, hasher, directory model and scheduler talk to the
// server only through these traits. `Session` implements them over SFTP.

use crate::sftp::types::FileInfo;
use openscp_core::paths::remote_parent;
use openscp_core::{IntegrityPolicy, OpenScpResult};
use std::io::{Read, Write};

/// Where a remote write begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStart {
    /// Create or truncate.
    Truncate,
    /// Keep existing content and continue at this offset.
    At(u64),
}

pub trait RemoteWrite: Write {
    /// Ask the server to flush the file to stable storage. Servers without
    /// fsync support succeed silently.
    fn sync_all(&mut self) -> OpenScpResult<()>;
}

pub trait RemoteFs: Send {
    /// `Ok(None)` when the path does not exist.
    fn stat(&self, path: &str) -> OpenScpResult<Option<FileInfo>>;

    /// Entries of a directory without `.` and `..`. Symlinks are reported
    /// as such, not followed.
    fn list(&self, path: &str) -> OpenScpResult<Vec<FileInfo>>;

    fn mkdir(&self, path: &str, mode: u32) -> OpenScpResult<()>;

    fn remove_file(&self, path: &str) -> OpenScpResult<()>;

    fn remove_dir(&self, path: &str) -> OpenScpResult<()>;

    fn rename(&self, from: &str, to: &str, overwrite: bool) -> OpenScpResult<()>;

    fn chmod(&self, path: &str, mode: u32) -> OpenScpResult<()>;

    fn chown(&self, path: &str, uid: u32, gid: u32) -> OpenScpResult<()>;

    /// Seconds since the Unix epoch.
    fn set_times(&self, path: &str, atime: u64, mtime: u64) -> OpenScpResult<()>;

    fn realpath(&self, path: &str) -> OpenScpResult<String>;

    /// Read-only handle positioned at `offset`.
    fn open_read(&self, path: &str, offset: u64) -> OpenScpResult<Box<dyn Read + '_>>;

    fn open_write(&self, path: &str, start: WriteStart) -> OpenScpResult<Box<dyn RemoteWrite + '_>>;

    /// `(exists, is_dir)`
    fn exists(&self, path: &str) -> OpenScpResult<(bool, bool)> {
        Ok(match self.stat(path)? {
            Some(info) => (true, info.is_dir),
            None => (false, false),
        })
    }

    /// Create `path` and any missing parents.
    fn mkdir_p(&self, path: &str, mode: u32) -> OpenScpResult<()> {
        if path.is_empty() || path == "/" {
            return Ok(());
        }
        match self.stat(path)? {
            Some(info) if info.is_dir => return Ok(()),
            Some(_) => {
                return Err(openscp_core::OpenScpError::remote(
                    4,
                    format!("{} exists and is not a directory", path),
                ))
            }
            None => {}
        }
        let parent = remote_parent(path);
        if parent != path {
            self.mkdir_p(&parent, mode)?;
        }
        self.mkdir(path, mode)
    }
}

/// Mints independent, authenticated remote sessions. The scheduler calls
/// this from inside each worker thread, so no session crosses threads.
pub trait SessionFactory: Send + Sync {
    fn new_connection_like(&self) -> OpenScpResult<Box<dyn RemoteFs>>;

    /// Integrity policy configured for sessions from this factory, before
    /// the environment override.
    fn integrity(&self) -> IntegrityPolicy;

    /// `user@host:port` style label for logs.
    fn describe(&self) -> String;
}
