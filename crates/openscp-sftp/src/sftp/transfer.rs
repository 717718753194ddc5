// ── Transfer engine – chunked, resumable, verified ──────────────────────────
//
// Both directions write to a `.part` sibling and only rename it over the
// destination after the content is synced and, unless the policy is Off,
// verified by a full SHA-256 comparison.

use crate::sftp::hasher::{self, HashDigest};
use crate::sftp::rate_limit::Throttle;
use crate::sftp::remote::{RemoteFs, WriteStart};
use crate::sftp::CHUNK_SIZE;
use filetime::FileTime;
use openscp_core::atomic::finalize_rename;
use openscp_core::paths::{local_part_path, remote_part_path};
use openscp_core::{IntegrityPolicy, OpenScpError, OpenScpResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub resume: bool,
    /// Already resolved against the environment override.
    pub integrity: IntegrityPolicy,
}

impl TransferOptions {
    pub fn new(resume: bool, integrity: IntegrityPolicy) -> Self {
        Self { resume, integrity }
    }
}

/// Caller hooks polled by the chunk loop.
pub struct TransferControl<'a> {
    pub cancel: &'a dyn Fn() -> bool,
    /// `(bytes_done, bytes_total)`; total is 0 when unknown.
    pub progress: &'a mut dyn FnMut(u64, u64),
    pub throttle: Option<&'a dyn Throttle>,
}

impl<'a> TransferControl<'a> {
    pub fn new(cancel: &'a dyn Fn() -> bool, progress: &'a mut dyn FnMut(u64, u64)) -> Self {
        Self {
            cancel,
            progress,
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: &'a dyn Throttle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    fn cancelled(&self) -> bool {
        (self.cancel)()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// Bytes moved by this attempt, excluding the resumed prefix.
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub resumed_from: u64,
    /// Hex SHA-256 of the verified content, when verification ran.
    pub digest: Option<String>,
}

// ── Shared steps ─────────────────────────────────────────────────────────────

/// Validate a `.part` offset against the source size. Returns the offset to
/// continue from, 0 meaning a fresh start.
fn validate_resume(
    offset: u64,
    total: Option<u64>,
    policy: IntegrityPolicy,
    label: &str,
    window_matches: impl FnOnce(u64, u64) -> OpenScpResult<bool>,
) -> OpenScpResult<u64> {
    if offset == 0 {
        return Ok(0);
    }
    let total = match total {
        Some(t) => t,
        None => {
            debug!(path = label, "source size unknown, restarting transfer");
            return Ok(0);
        }
    };
    if offset > total {
        if policy == IntegrityPolicy::Required {
            return Err(OpenScpError::ResumeInvalid(format!(
                "{}: partial file ({} bytes) is larger than the source ({} bytes)",
                label, offset, total
            )));
        }
        warn!(path = label, offset, total, "partial file larger than source, restarting");
        return Ok(0);
    }
    if offset == total || policy == IntegrityPolicy::Off {
        return Ok(offset);
    }

    let window = offset.min(CHUNK_SIZE as u64);
    let start = offset - window;
    let agrees = match window_matches(start, window) {
        Ok(same) => same,
        Err(OpenScpError::Canceled) => return Err(OpenScpError::Canceled),
        Err(e) if policy == IntegrityPolicy::Required => return Err(e),
        Err(e) => {
            warn!(path = label, error = %e, "resume window could not be hashed, restarting");
            false
        }
    };
    if agrees {
        info!(path = label, offset, "resuming transfer");
        return Ok(offset);
    }
    if policy == IntegrityPolicy::Required {
        return Err(OpenScpError::integrity(
            label,
            offset,
            format!("resume prefix mismatch in bytes {}..{}", start, offset),
        ));
    }
    warn!(path = label, offset, "resume prefix mismatch, restarting");
    Ok(0)
}

/// Full-content comparison after the data is synced.
fn verify_full(
    policy: IntegrityPolicy,
    label: &str,
    bytes_done: u64,
    local: impl FnOnce() -> OpenScpResult<HashDigest>,
    remote: impl FnOnce() -> OpenScpResult<HashDigest>,
) -> OpenScpResult<Option<String>> {
    if policy == IntegrityPolicy::Off {
        return Ok(None);
    }
    let pair = local().and_then(|l| remote().map(|r| (l, r)));
    match pair {
        Ok((l, r)) if l == r => Ok(Some(hasher::to_hex(&l))),
        Ok((l, r)) => Err(OpenScpError::integrity(
            label,
            bytes_done,
            format!(
                "checksum mismatch: local {} remote {}",
                hasher::to_hex(&l),
                hasher::to_hex(&r)
            ),
        )),
        Err(OpenScpError::Canceled) => Err(OpenScpError::Canceled),
        Err(e) if policy == IntegrityPolicy::Required => Err(OpenScpError::integrity(
            label,
            bytes_done,
            format!("checksum unavailable: {}", e),
        )),
        Err(e) => {
            warn!(path = label, error = %e, "checksum unavailable, keeping unverified file");
            Ok(None)
        }
    }
}

/// The chunk loop. Returns the final byte count including `offset`.
fn pump(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    offset: u64,
    total: u64,
    ctl: &mut TransferControl<'_>,
    read_ctx: &str,
    write_ctx: &str,
) -> OpenScpResult<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = offset;
    loop {
        if ctl.cancelled() {
            return Err(OpenScpError::Canceled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(OpenScpError::io(read_ctx.to_string(), e)),
        };
        // Charged for what was actually read.
        if let Some(throttle) = ctl.throttle {
            throttle.admit(n, ctl.cancel)?;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| OpenScpError::io(write_ctx.to_string(), e))?;
        done += n as u64;
        (ctl.progress)(done, total);
        if ctl.cancelled() {
            return Err(OpenScpError::Canceled);
        }
    }
    Ok(done)
}

// ── Download ─────────────────────────────────────────────────────────────────

pub fn download(
    remote: &dyn RemoteFs,
    remote_path: &str,
    local: &Path,
    opts: &TransferOptions,
    ctl: &mut TransferControl<'_>,
) -> OpenScpResult<TransferOutcome> {
    let info = remote
        .stat(remote_path)?
        .ok_or_else(|| OpenScpError::remote(2, format!("{}: no such file", remote_path)))?;
    if info.is_dir {
        return Err(OpenScpError::remote(4, format!("{} is a directory", remote_path)));
    }
    let total = info.size;
    let part = local_part_path(local);
    let label = local.display().to_string();

    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| OpenScpError::io(format!("create {}", parent.display()), e))?;
    }

    let existing = if opts.resume {
        fs::metadata(&part).map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };
    let offset = validate_resume(existing, total, opts.integrity, &label, |start, len| {
        let l = hasher::hash_local_range(&part, start, len, ctl.cancel)?;
        let r = hasher::hash_remote_range(remote, remote_path, start, len, ctl.cancel)?;
        Ok(l == r)
    })?;

    let part_ctx = format!("write {}", part.display());
    let mut file = if offset > 0 {
        let mut f = OpenOptions::new()
            .write(true)
            .open(&part)
            .map_err(|e| OpenScpError::io(part_ctx.clone(), e))?;
        f.set_len(offset)
            .and_then(|_| f.seek(SeekFrom::Start(offset)))
            .map_err(|e| OpenScpError::io(part_ctx.clone(), e))?;
        f
    } else {
        File::create(&part).map_err(|e| OpenScpError::io(part_ctx.clone(), e))?
    };

    debug!(remote = remote_path, local = %local.display(), offset, "download started");
    let total_or_zero = total.unwrap_or(0);
    if offset > 0 {
        (ctl.progress)(offset, total_or_zero);
    }
    let done = {
        let mut reader = remote.open_read(remote_path, offset)?;
        pump(
            &mut *reader,
            &mut file,
            offset,
            total_or_zero,
            ctl,
            &format!("read {}", remote_path),
            &part_ctx,
        )?
    };

    file.flush()
        .and_then(|_| file.sync_all())
        .map_err(|e| OpenScpError::io(format!("sync {}", part.display()), e))?;
    drop(file);

    let digest = verify_full(
        opts.integrity,
        &label,
        done,
        || hasher::hash_local_full(&part, ctl.cancel),
        || hasher::hash_remote_full(remote, remote_path, ctl.cancel),
    )?;

    if let Some(mtime) = info.mtime {
        if let Err(e) = filetime::set_file_mtime(&part, FileTime::from_unix_time(mtime as i64, 0)) {
            warn!(path = %part.display(), error = %e, "could not preserve modification time");
        }
    }
    finalize_rename(&part, local)?;

    info!(remote = remote_path, local = %local.display(), bytes = done, "download complete");
    Ok(TransferOutcome {
        bytes_transferred: done - offset,
        total_bytes: done,
        resumed_from: offset,
        digest,
    })
}

// ── Upload ───────────────────────────────────────────────────────────────────

pub fn upload(
    remote: &dyn RemoteFs,
    local: &Path,
    remote_path: &str,
    opts: &TransferOptions,
    ctl: &mut TransferControl<'_>,
) -> OpenScpResult<TransferOutcome> {
    let local_ctx = format!("read {}", local.display());
    let meta = fs::metadata(local).map_err(|e| OpenScpError::io(local_ctx.clone(), e))?;
    if meta.is_dir() {
        return Err(OpenScpError::io(
            local_ctx,
            io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
        ));
    }
    let total = meta.len();
    let part = remote_part_path(remote_path);

    let existing = if opts.resume {
        remote.stat(&part)?.and_then(|i| i.size).unwrap_or(0)
    } else {
        0
    };
    let offset = validate_resume(existing, Some(total), opts.integrity, remote_path, |start, len| {
        let l = hasher::hash_local_range(local, start, len, ctl.cancel)?;
        let r = hasher::hash_remote_range(remote, &part, start, len, ctl.cancel)?;
        Ok(l == r)
    })?;

    let mut file = File::open(local).map_err(|e| OpenScpError::io(local_ctx.clone(), e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| OpenScpError::io(local_ctx.clone(), e))?;
        (ctl.progress)(offset, total);
    }

    debug!(local = %local.display(), remote = remote_path, offset, "upload started");
    let start = if offset > 0 {
        WriteStart::At(offset)
    } else {
        WriteStart::Truncate
    };
    let done = {
        let mut writer = remote.open_write(&part, start)?;
        let done = pump(
            &mut file,
            &mut *writer,
            offset,
            total,
            ctl,
            &local_ctx,
            &format!("write {}", part),
        )?;
        writer
            .flush()
            .map_err(|e| OpenScpError::io(format!("flush {}", part), e))?;
        writer.sync_all()?;
        done
    };

    let digest = verify_full(
        opts.integrity,
        remote_path,
        done,
        || hasher::hash_local_full(local, ctl.cancel),
        || hasher::hash_remote_full(remote, &part, ctl.cancel),
    )?;

    if let Some(mtime) = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    {
        let atime = meta
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or(mtime);
        if let Err(e) = remote.set_times(&part, atime.as_secs(), mtime.as_secs()) {
            warn!(path = %part, error = %e, "could not preserve modification time");
        }
    }
    remote.rename(&part, remote_path, true)?;

    info!(local = %local.display(), remote = remote_path, bytes = done, "upload complete");
    Ok(TransferOutcome {
        bytes_transferred: done - offset,
        total_bytes: done,
        resumed_from: offset,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testing::LoopbackRemote;
    use std::cell::Cell;

    const PAYLOAD: &[u8] = b"OpenSCP integration payload\nline-2\n";

    fn never() -> bool {
        false
    }

    fn fixture() -> (tempfile::TempDir, LoopbackRemote, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let remote = LoopbackRemote::new(dir.path().join("server"));
        fs::create_dir_all(dir.path().join("server/srv/data")).unwrap();
        fs::write(dir.path().join("server/srv/data/payload.txt"), PAYLOAD).unwrap();
        let local = dir.path().join("client").join("out.txt");
        (dir, remote, local)
    }

    #[test]
    fn download_verified() {
        let (_dir, remote, local) = fixture();
        let mut calls = Vec::new();
        let mut progress = |d: u64, t: u64| calls.push((d, t));
        let mut ctl = TransferControl::new(&never, &mut progress);
        let out = download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(false, IntegrityPolicy::Required),
            &mut ctl,
        )
        .unwrap();

        assert_eq!(fs::read(&local).unwrap(), PAYLOAD);
        assert!(!local_part_path(&local).exists());
        assert_eq!(out.total_bytes, PAYLOAD.len() as u64);
        assert_eq!(out.resumed_from, 0);
        assert!(out.digest.is_some());
        assert_eq!(calls.last(), Some(&(PAYLOAD.len() as u64, PAYLOAD.len() as u64)));
    }

    #[test]
    fn download_missing_source_is_remote_error() {
        let (_dir, remote, local) = fixture();
        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        let err = download(
            &remote,
            "/srv/data/absent",
            &local,
            &TransferOptions::new(false, IntegrityPolicy::Optional),
            &mut ctl,
        )
        .unwrap_err();
        assert!(matches!(err, OpenScpError::Remote { code: 2, .. }));
    }

    #[test]
    fn oversized_part_restarts_unless_required() {
        let (_dir, remote, local) = fixture();
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        let part = local_part_path(&local);
        fs::write(&part, vec![b'x'; PAYLOAD.len() + 5]).unwrap();

        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        let err = download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(true, IntegrityPolicy::Required),
            &mut ctl,
        )
        .unwrap_err();
        assert!(matches!(err, OpenScpError::ResumeInvalid(_)));

        let out = download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(true, IntegrityPolicy::Optional),
            &mut ctl,
        )
        .unwrap();
        assert_eq!(out.resumed_from, 0);
        assert_eq!(fs::read(&local).unwrap(), PAYLOAD);
    }

    #[test]
    fn prefix_mismatch_restarts_under_optional() {
        let (_dir, remote, local) = fixture();
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(local_part_path(&local), b"DIFFERENT PREFIX....").unwrap();

        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        let out = download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(true, IntegrityPolicy::Optional),
            &mut ctl,
        )
        .unwrap();
        assert_eq!(out.resumed_from, 0);
        assert_eq!(fs::read(&local).unwrap(), PAYLOAD);
    }

    #[test]
    fn off_policy_skips_verification() {
        let (_dir, remote, local) = fixture();
        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        let out = download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(false, IntegrityPolicy::Off),
            &mut ctl,
        )
        .unwrap();
        assert!(out.digest.is_none());
        assert_eq!(fs::read(&local).unwrap(), PAYLOAD);
    }

    #[test]
    fn download_preserves_mtime() {
        let (dir, remote, local) = fixture();
        filetime::set_file_mtime(
            dir.path().join("server/srv/data/payload.txt"),
            FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();
        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        download(
            &remote,
            "/srv/data/payload.txt",
            &local,
            &TransferOptions::new(false, IntegrityPolicy::Optional),
            &mut ctl,
        )
        .unwrap();
        let meta = fs::metadata(&local).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn upload_cancel_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LoopbackRemote::new(dir.path().join("server"));
        fs::create_dir_all(dir.path().join("server/up")).unwrap();
        let local = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(3 * CHUNK_SIZE + 100)).map(|i| (i % 253) as u8).collect();
        fs::write(&local, &data).unwrap();

        let chunks = Cell::new(0u32);
        let cancel = || chunks.get() >= 1;
        let mut progress = |_: u64, _: u64| chunks.set(chunks.get() + 1);
        let mut ctl = TransferControl::new(&cancel, &mut progress);
        let err = upload(
            &remote,
            &local,
            "/up/big.bin",
            &TransferOptions::new(false, IntegrityPolicy::Required),
            &mut ctl,
        )
        .unwrap_err();
        assert!(matches!(err, OpenScpError::Canceled));
        let part = dir.path().join("server/up/big.bin.part");
        assert_eq!(fs::metadata(&part).unwrap().len(), CHUNK_SIZE as u64);
        assert!(!dir.path().join("server/up/big.bin").exists());

        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        let out = upload(
            &remote,
            &local,
            "/up/big.bin",
            &TransferOptions::new(true, IntegrityPolicy::Required),
            &mut ctl,
        )
        .unwrap();
        assert_eq!(out.resumed_from, CHUNK_SIZE as u64);
        assert_eq!(fs::read(dir.path().join("server/up/big.bin")).unwrap(), data);
        assert!(!part.exists());
    }

    #[test]
    fn upload_replaces_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LoopbackRemote::new(dir.path());
        fs::write(dir.path().join("target.txt"), b"old").unwrap();
        let local = dir.path().join("src.txt");
        fs::write(&local, b"new contents").unwrap();

        let mut progress = |_: u64, _: u64| {};
        let mut ctl = TransferControl::new(&never, &mut progress);
        upload(
            &remote,
            &local,
            "/target.txt",
            &TransferOptions::new(false, IntegrityPolicy::Optional),
            &mut ctl,
        )
        .unwrap();
        assert_eq!(fs::read(dir.path().join("target.txt")).unwrap(), b"new contents");
    }

    #[test]
    fn throttle_is_charged_for_bytes_read() {
        struct Counting(std::sync::atomic::AtomicUsize);
        impl Throttle for Counting {
            fn admit(&self, bytes: usize, _: &dyn Fn() -> bool) -> OpenScpResult<()> {
                self.0.fetch_add(bytes, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }
        let (dir, remote, local) = fixture();
        let size = CHUNK_SIZE + 100;
        fs::write(dir.path().join("server/srv/data/big.bin"), vec![5u8; size]).unwrap();

        for (path, expected) in [
            ("/srv/data/payload.txt", PAYLOAD.len()),
            ("/srv/data/big.bin", size),
        ] {
            let counting = Counting(Default::default());
            let mut progress = |_: u64, _: u64| {};
            let mut ctl = TransferControl::new(&never, &mut progress).with_throttle(&counting);
            download(
                &remote,
                path,
                &local,
                &TransferOptions::new(false, IntegrityPolicy::Off),
                &mut ctl,
            )
            .unwrap();
            assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), expected);
        }
    }
}
