// ── File operations over SFTP ───────────────────────────────────────────────

use crate::sftp::auth::is_disconnect;
use crate::sftp::remote::{RemoteFs, RemoteWrite, WriteStart};
use crate::sftp::session::Session;
use crate::sftp::transfer::{self, TransferControl, TransferOptions, TransferOutcome};
use crate::sftp::types::FileInfo;
use openscp_core::paths::remote_file_name;
use openscp_core::{OpenScpError, OpenScpResult};
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, RenameFlags};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, error, warn};

/// SSH_FX_* status codes (SFTP v3).
pub mod status {
    pub const NO_SUCH_FILE: i32 = 2;
    pub const PERMISSION_DENIED: i32 = 3;
    pub const FAILURE: i32 = 4;
    pub const OP_UNSUPPORTED: i32 = 8;
    pub const FILE_ALREADY_EXISTS: i32 = 11;
}

const DEFAULT_FILE_MODE: i32 = 0o644;

pub(crate) fn map_ssh_error(context: &str, e: ssh2::Error) -> OpenScpError {
    let code = e.code();
    if is_disconnect(&code) {
        debug!(context, error = %e, "connection lost");
        return OpenScpError::NotConnected;
    }
    let n = match code {
        ErrorCode::SFTP(c) | ErrorCode::Session(c) => c,
    };
    OpenScpError::remote(n, format!("{}: {}", context, e.message()))
}

fn is_no_such_file(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(status::NO_SUCH_FILE))
}

pub(crate) fn file_info(name: String, stat: &FileStat) -> FileInfo {
    FileInfo {
        name,
        is_dir: stat.is_dir(),
        is_symlink: stat.file_type().is_symlink(),
        size: stat.size,
        mtime: stat.mtime,
        permissions: stat.perm,
        uid: stat.uid,
        gid: stat.gid,
    }
}

fn empty_stat() -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: None,
        atime: None,
        mtime: None,
    }
}

/// Replace `to` with `from` when the server will not rename over an existing
/// file. The old target is moved to `backup` and put back if the final rename
/// fails.
fn replace_via_backup(
    from: &str,
    to: &str,
    backup: &str,
    rename: &dyn Fn(&str, &str) -> OpenScpResult<()>,
    unlink: &dyn Fn(&str) -> OpenScpResult<()>,
) -> OpenScpResult<()> {
    rename(to, backup)?;
    if let Err(e) = rename(from, to) {
        if let Err(restore) = rename(backup, to) {
            error!(path = to, backup, error = %restore, "could not restore replaced file");
        }
        return Err(e);
    }
    if let Err(e) = unlink(backup) {
        warn!(path = backup, error = %e, "could not remove replaced file");
    }
    Ok(())
}

struct SftpWriter(ssh2::File);

impl Write for SftpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl RemoteWrite for SftpWriter {
    fn sync_all(&mut self) -> OpenScpResult<()> {
        match self.0.fsync() {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(status::OP_UNSUPPORTED)) => {
                debug!("server has no fsync extension");
                Ok(())
            }
            Err(e) => Err(map_ssh_error("fsync", e)),
        }
    }
}

impl RemoteFs for Session {
    fn stat(&self, path: &str) -> OpenScpResult<Option<FileInfo>> {
        let sftp = &self.connection()?.sftp;
        let name = remote_file_name(path).to_string();
        let lstat = match sftp.lstat(Path::new(path)) {
            Ok(s) => s,
            Err(e) if is_no_such_file(&e) => return Ok(None),
            Err(e) => return Err(map_ssh_error(&format!("lstat {}", path), e)),
        };
        if !lstat.file_type().is_symlink() {
            return Ok(Some(file_info(name, &lstat)));
        }
        match sftp.stat(Path::new(path)) {
            Ok(target) => {
                let mut info = file_info(name, &target);
                info.is_symlink = true;
                Ok(Some(info))
            }
            // Dangling link.
            Err(e) if is_no_such_file(&e) => Ok(Some(file_info(name, &lstat))),
            Err(e) => Err(map_ssh_error(&format!("stat {}", path), e)),
        }
    }

    fn list(&self, path: &str) -> OpenScpResult<Vec<FileInfo>> {
        let sftp = &self.connection()?.sftp;
        let entries = sftp
            .readdir(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("list {}", path), e))?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, stat)| {
                let name = p.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(file_info(name, &stat))
            })
            .collect())
    }

    fn mkdir(&self, path: &str, mode: u32) -> OpenScpResult<()> {
        self.connection()?
            .sftp
            .mkdir(Path::new(path), mode as i32)
            .map_err(|e| map_ssh_error(&format!("mkdir {}", path), e))
    }

    fn remove_file(&self, path: &str) -> OpenScpResult<()> {
        self.connection()?
            .sftp
            .unlink(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("remove {}", path), e))
    }

    fn remove_dir(&self, path: &str) -> OpenScpResult<()> {
        self.connection()?
            .sftp
            .rmdir(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("rmdir {}", path), e))
    }

    fn rename(&self, from: &str, to: &str, overwrite: bool) -> OpenScpResult<()> {
        let sftp = &self.connection()?.sftp;
        let (src, dst) = (Path::new(from), Path::new(to));
        let context = format!("rename {} -> {}", from, to);

        if !overwrite {
            if self.stat(to)?.is_some() {
                return Err(OpenScpError::remote(
                    status::FILE_ALREADY_EXISTS,
                    format!("{}: target exists", context),
                ));
            }
            return sftp
                .rename(src, dst, Some(RenameFlags::ATOMIC | RenameFlags::NATIVE))
                .map_err(|e| map_ssh_error(&context, e));
        }

        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        match sftp.rename(src, dst, Some(flags)) {
            Ok(()) => Ok(()),
            Err(first) => {
                // SFTP v3 servers refuse to replace an existing target.
                if self.stat(to)?.is_none() {
                    return Err(map_ssh_error(&context, first));
                }
                warn!(path = to, "server refused overwriting rename, moving target aside");
                let backup = format!("{}.openscp-old-{:08x}", to, rand::random::<u32>());
                replace_via_backup(
                    from,
                    to,
                    &backup,
                    &|a, b| {
                        sftp.rename(Path::new(a), Path::new(b), None)
                            .map_err(|e| map_ssh_error(&format!("rename {} -> {}", a, b), e))
                    },
                    &|p| {
                        sftp.unlink(Path::new(p))
                            .map_err(|e| map_ssh_error(&format!("remove {}", p), e))
                    },
                )
            }
        }
    }

    fn chmod(&self, path: &str, mode: u32) -> OpenScpResult<()> {
        let stat = FileStat {
            perm: Some(mode),
            ..empty_stat()
        };
        self.connection()?
            .sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| map_ssh_error(&format!("chmod {}", path), e))
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> OpenScpResult<()> {
        let stat = FileStat {
            uid: Some(uid),
            gid: Some(gid),
            ..empty_stat()
        };
        self.connection()?
            .sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| map_ssh_error(&format!("chown {}", path), e))
    }

    fn set_times(&self, path: &str, atime: u64, mtime: u64) -> OpenScpResult<()> {
        let stat = FileStat {
            atime: Some(atime),
            mtime: Some(mtime),
            ..empty_stat()
        };
        self.connection()?
            .sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| map_ssh_error(&format!("set times {}", path), e))
    }

    fn realpath(&self, path: &str) -> OpenScpResult<String> {
        self.connection()?
            .sftp
            .realpath(Path::new(path))
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| map_ssh_error(&format!("realpath {}", path), e))
    }

    fn open_read(&self, path: &str, offset: u64) -> OpenScpResult<Box<dyn Read + '_>> {
        let mut file = self
            .connection()?
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_ssh_error(&format!("open {}", path), e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| OpenScpError::io(format!("seek {}", path), e))?;
        }
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str, start: WriteStart) -> OpenScpResult<Box<dyn RemoteWrite + '_>> {
        let sftp = &self.connection()?.sftp;
        let flags = match start {
            WriteStart::Truncate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            WriteStart::At(_) => OpenFlags::WRITE | OpenFlags::CREATE,
        };
        let mut file = sftp
            .open_mode(Path::new(path), flags, DEFAULT_FILE_MODE, OpenType::File)
            .map_err(|e| map_ssh_error(&format!("open {}", path), e))?;
        if let WriteStart::At(offset) = start {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| OpenScpError::io(format!("seek {}", path), e))?;
        }
        Ok(Box::new(SftpWriter(file)))
    }
}

// ── Transfers ────────────────────────────────────────────────────────────────

impl Session {
    /// Download `remote_path` to `local` through `<local>.part`.
    pub fn get(
        &self,
        remote_path: &str,
        local: &Path,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &dyn Fn() -> bool,
        resume: bool,
    ) -> OpenScpResult<TransferOutcome> {
        self.connection()?;
        let opts = TransferOptions::new(resume, self.integrity());
        let mut ctl = TransferControl::new(cancel, progress);
        transfer::download(self, remote_path, local, &opts, &mut ctl)
    }

    /// Upload `local` to `remote_path` through `<remote_path>.part`.
    pub fn put(
        &self,
        local: &Path,
        remote_path: &str,
        progress: &mut dyn FnMut(u64, u64),
        cancel: &dyn Fn() -> bool,
        resume: bool,
    ) -> OpenScpResult<TransferOutcome> {
        self.connection()?;
        let opts = TransferOptions::new(resume, self.integrity());
        let mut ctl = TransferControl::new(cancel, progress);
        transfer::upload(self, local, remote_path, &opts, &mut ctl)
    }
}
