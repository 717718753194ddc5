// ── Loopback remote ─────────────────────────────────────────────────────────
//
// A `RemoteFs` rooted in a local directory. Remote `/srv/a.txt` maps to
// `<root>/srv/a.txt`. Error codes mirror SFTP status codes so the transfer
// engine and scheduler see the same failures they would from a server.

use crate::sftp::remote::{RemoteFs, RemoteWrite, SessionFactory, WriteStart};
use crate::sftp::types::FileInfo;
use openscp_core::paths::normalize_remote;
use openscp_core::{IntegrityPolicy, OpenScpError, OpenScpResult};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_FAILURE: i32 = 4;
const SSH_FX_FILE_ALREADY_EXISTS: i32 = 11;

fn map_io(path: &str, e: io::Error) -> OpenScpError {
    let code = match e.kind() {
        io::ErrorKind::NotFound => SSH_FX_NO_SUCH_FILE,
        io::ErrorKind::PermissionDenied => SSH_FX_PERMISSION_DENIED,
        io::ErrorKind::AlreadyExists => SSH_FX_FILE_ALREADY_EXISTS,
        _ => SSH_FX_FAILURE,
    };
    OpenScpError::remote(code, format!("{}: {}", path, e))
}

fn info_from_metadata(name: String, meta: &fs::Metadata) -> FileInfo {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    #[cfg(unix)]
    let (permissions, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (Some(meta.mode()), Some(meta.uid()), Some(meta.gid()))
    };
    #[cfg(not(unix))]
    let (permissions, uid, gid) = (None, None, None);
    FileInfo {
        name,
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
        size: Some(meta.len()),
        mtime,
        permissions,
        uid,
        gid,
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackRemote {
    root: PathBuf,
    chunk_delay: Option<Duration>,
}

impl LoopbackRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_delay: None,
        }
    }

    /// Sleep before every read and write call, to keep transfers in flight.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local location backing a remote path.
    pub fn local_path(&self, remote: &str) -> PathBuf {
        normalize_remote(remote)
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

struct Delayed<T> {
    inner: T,
    delay: Option<Duration>,
}

impl<T> Delayed<T> {
    fn pause(&self) {
        if let Some(d) = self.delay {
            thread::sleep(d);
        }
    }
}

impl<T: Read> Read for Delayed<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pause();
        self.inner.read(buf)
    }
}

impl Write for Delayed<File> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pause();
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl RemoteWrite for Delayed<File> {
    fn sync_all(&mut self) -> OpenScpResult<()> {
        self.inner
            .sync_all()
            .map_err(|e| OpenScpError::remote(SSH_FX_FAILURE, format!("fsync: {}", e)))
    }
}

impl RemoteFs for LoopbackRemote {
    fn stat(&self, path: &str) -> OpenScpResult<Option<FileInfo>> {
        let local = self.local_path(path);
        match fs::metadata(&local) {
            Ok(meta) => {
                let name = openscp_core::paths::remote_file_name(path).to_string();
                let mut info = info_from_metadata(name, &meta);
                info.is_symlink = fs::symlink_metadata(&local)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false);
                Ok(Some(info))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(path, e)),
        }
    }

    fn list(&self, path: &str) -> OpenScpResult<Vec<FileInfo>> {
        let rd = fs::read_dir(self.local_path(path)).map_err(|e| map_io(path, e))?;
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| map_io(path, e))?;
            let meta = fs::symlink_metadata(entry.path()).map_err(|e| map_io(path, e))?;
            out.push(info_from_metadata(
                entry.file_name().to_string_lossy().into_owned(),
                &meta,
            ));
        }
        Ok(out)
    }

    fn mkdir(&self, path: &str, mode: u32) -> OpenScpResult<()> {
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        builder
            .create(self.local_path(path))
            .map_err(|e| map_io(path, e))
    }

    fn remove_file(&self, path: &str) -> OpenScpResult<()> {
        fs::remove_file(self.local_path(path)).map_err(|e| map_io(path, e))
    }

    fn remove_dir(&self, path: &str) -> OpenScpResult<()> {
        fs::remove_dir(self.local_path(path)).map_err(|e| map_io(path, e))
    }

    fn rename(&self, from: &str, to: &str, overwrite: bool) -> OpenScpResult<()> {
        let dst = self.local_path(to);
        if !overwrite && fs::symlink_metadata(&dst).is_ok() {
            return Err(OpenScpError::remote(
                SSH_FX_FILE_ALREADY_EXISTS,
                format!("{} already exists", to),
            ));
        }
        fs::rename(self.local_path(from), dst).map_err(|e| map_io(from, e))
    }

    fn chmod(&self, path: &str, mode: u32) -> OpenScpResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.local_path(path), fs::Permissions::from_mode(mode))
                .map_err(|e| map_io(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            self.stat(path)?
                .map(|_| ())
                .ok_or_else(|| OpenScpError::remote(SSH_FX_NO_SUCH_FILE, path.to_string()))
        }
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> OpenScpResult<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::chown(self.local_path(path), Some(uid), Some(gid))
                .map_err(|e| map_io(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (uid, gid);
            Err(OpenScpError::remote(SSH_FX_FAILURE, "chown unsupported"))
        }
    }

    fn set_times(&self, path: &str, atime: u64, mtime: u64) -> OpenScpResult<()> {
        filetime::set_file_times(
            self.local_path(path),
            filetime::FileTime::from_unix_time(atime as i64, 0),
            filetime::FileTime::from_unix_time(mtime as i64, 0),
        )
        .map_err(|e| map_io(path, e))
    }

    fn realpath(&self, path: &str) -> OpenScpResult<String> {
        let normalized = if path.starts_with('/') {
            normalize_remote(path)
        } else {
            normalize_remote(&format!("/{}", path))
        };
        match self.stat(&normalized)? {
            Some(_) => Ok(normalized),
            None => Err(OpenScpError::remote(SSH_FX_NO_SUCH_FILE, path.to_string())),
        }
    }

    fn open_read(&self, path: &str, offset: u64) -> OpenScpResult<Box<dyn Read + '_>> {
        let mut file = File::open(self.local_path(path)).map_err(|e| map_io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| map_io(path, e))?;
        }
        Ok(Box::new(Delayed {
            inner: file,
            delay: self.chunk_delay,
        }))
    }

    fn open_write(&self, path: &str, start: WriteStart) -> OpenScpResult<Box<dyn RemoteWrite + '_>> {
        let local = self.local_path(path);
        let file = match start {
            WriteStart::Truncate => File::create(&local).map_err(|e| map_io(path, e))?,
            WriteStart::At(offset) => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&local)
                    .map_err(|e| map_io(path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| map_io(path, e))?;
                file
            }
        };
        Ok(Box::new(Delayed {
            inner: file,
            delay: self.chunk_delay,
        }))
    }
}

// ── Loopback factory ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LoopbackFactory {
    template: LoopbackRemote,
    integrity: IntegrityPolicy,
    connections: AtomicUsize,
    failures: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new(remote: LoopbackRemote, integrity: IntegrityPolicy) -> Self {
        Self {
            template: remote,
            integrity,
            connections: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of sessions minted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Make the next `n` connection attempts fail with a connect error.
    pub fn fail_next_connections(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl SessionFactory for LoopbackFactory {
    fn new_connection_like(&self) -> OpenScpResult<Box<dyn RemoteFs>> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(OpenScpError::connect("loopback", 22, "injected failure"));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.template.clone()))
    }

    fn integrity(&self) -> IntegrityPolicy {
        self.integrity
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.template.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_paths_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LoopbackRemote::new(dir.path());
        assert_eq!(remote.local_path("/srv/../a//b.txt"), dir.path().join("a").join("b.txt"));

        remote.mkdir_p("/srv/data", 0o755).unwrap();
        assert_eq!(remote.exists("/srv/data").unwrap(), (true, true));
        assert_eq!(remote.exists("/srv/nope").unwrap(), (false, false));
        assert_eq!(remote.realpath("srv/./data").unwrap(), "/srv/data");
    }

    #[test]
    fn rename_without_overwrite_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LoopbackRemote::new(dir.path());
        fs::write(dir.path().join("a"), b"a").unwrap();
        fs::write(dir.path().join("b"), b"b").unwrap();

        let err = remote.rename("/a", "/b", false).unwrap_err();
        assert!(matches!(err, OpenScpError::Remote { code: 11, .. }));
        remote.rename("/a", "/b", true).unwrap();
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"a");
    }

    #[test]
    fn factory_injects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let factory = LoopbackFactory::new(LoopbackRemote::new(dir.path()), IntegrityPolicy::Off);
        factory.fail_next_connections(1);
        assert!(factory.new_connection_like().is_err());
        assert!(factory.new_connection_like().is_ok());
        assert_eq!(factory.connections(), 1);
    }
}
