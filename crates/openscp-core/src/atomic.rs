// ── Atomic file persistence ─────────────────────────────────────────────────
//
// Single implementation of the temp-file → fsync → rename → fsync-parent
// sequence. Used by the known-hosts store, the configuration file, the
// plaintext credential fallback and the `.part` finalisation of downloads.

use crate::error::OpenScpError;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Step of the atomic sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AtomicStage {
    CreateParent,
    CreateTemp,
    Write,
    Sync,
    Rename,
    SyncParent,
}

impl fmt::Display for AtomicStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AtomicStage::CreateParent => "create parent directory",
            AtomicStage::CreateTemp => "create temporary file",
            AtomicStage::Write => "write",
            AtomicStage::Sync => "sync",
            AtomicStage::Rename => "rename",
            AtomicStage::SyncParent => "sync parent directory",
        })
    }
}

/// Failure of an atomic write. The target is untouched unless `stage` is
/// `SyncParent`, in which case the new content is in place but its directory
/// entry may not be durable yet.
#[derive(Debug, thiserror::Error)]
#[error("atomic write of {} failed ({stage}): {source}", .path.display())]
#[non_exhaustive]
pub struct AtomicWriteError {
    pub stage: AtomicStage,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl AtomicWriteError {
    fn new(stage: AtomicStage, path: &Path, source: io::Error) -> Self {
        AtomicWriteError {
            stage,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<AtomicWriteError> for OpenScpError {
    fn from(e: AtomicWriteError) -> Self {
        OpenScpError::Io {
            context: format!("{} ({})", e.path.display(), e.stage),
            source: e.source,
        }
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Create `dir` (and missing ancestors) with owner-only permissions.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Flush the directory entry of `path` to disk. No-op where directories
/// cannot be opened as files.
pub fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::File::open(parent_of(path))?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a mix. The result has mode 0600 on Unix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AtomicWriteError> {
    let parent = parent_of(path);
    ensure_private_dir(&parent)
        .map_err(|e| AtomicWriteError::new(AtomicStage::CreateParent, path, e))?;

    // NamedTempFile is created 0600 and removed on drop if we bail out early.
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp")
        .rand_bytes(6)
        .tempfile_in(&parent)
        .map_err(|e| AtomicWriteError::new(AtomicStage::CreateTemp, path, e))?;

    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|e| AtomicWriteError::new(AtomicStage::Write, path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| AtomicWriteError::new(AtomicStage::Sync, path, e))?;

    tmp.persist(path)
        .map_err(|e| AtomicWriteError::new(AtomicStage::Rename, path, e.error))?;
    fsync_parent_dir(path).map_err(|e| AtomicWriteError::new(AtomicStage::SyncParent, path, e))?;

    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

/// Move a fully written and synced `part` file over `dst`.
pub fn finalize_rename(part: &Path, dst: &Path) -> Result<(), AtomicWriteError> {
    fs::rename(part, dst).map_err(|e| AtomicWriteError::new(AtomicStage::Rename, dst, e))?;
    fsync_parent_dir(dst).map_err(|e| AtomicWriteError::new(AtomicStage::SyncParent, dst, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_and_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("known_hosts");

        write_atomic(&target, b"first\n").unwrap();
        write_atomic(&target, b"second\n").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second\n");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("state");
        let target = parent.join("file");
        write_atomic(&target, b"x").unwrap();

        let file_mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        let dir_mode = fs::metadata(&parent).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn failed_write_leaves_prior_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cfg.json");
        fs::write(&target, b"old").unwrap();

        // A directory in the way of the rename makes the final step fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("inner"), b"keep").unwrap();
        let err = write_atomic(&blocked, b"new").unwrap_err();
        assert_eq!(err.stage, AtomicStage::Rename);

        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert_eq!(fs::read(blocked.join("inner")).unwrap(), b"keep");
    }

    #[test]
    fn finalize_moves_part_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("out.txt.part");
        let dst = dir.path().join("out.txt");
        fs::write(&part, b"payload").unwrap();

        finalize_rename(&part, &dst).unwrap();
        assert!(!part.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }
}
