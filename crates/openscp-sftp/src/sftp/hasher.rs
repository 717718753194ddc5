//! Streaming SHA-256 over local files and remote files.

use crate::sftp::remote::RemoteFs;
use crate::sftp::CHUNK_SIZE;
use openscp_core::{OpenScpError, OpenScpResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

pub type HashDigest = [u8; 32];

pub fn to_hex(digest: &HashDigest) -> String {
    hex::encode(digest)
}

/// Hash `reader` until EOF, or exactly `limit` bytes. Hitting EOF before
/// `limit` is a short read.
pub fn hash_reader<R: Read + ?Sized>(
    reader: &mut R,
    limit: Option<u64>,
    cancel: &dyn Fn() -> bool,
    context: &str,
) -> OpenScpResult<HashDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = limit;
    loop {
        if cancel() {
            return Err(OpenScpError::Canceled);
        }
        let want = match remaining {
            Some(0) => break,
            Some(r) => r.min(CHUNK_SIZE as u64) as usize,
            None => CHUNK_SIZE,
        };
        let n = match reader.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(OpenScpError::io(context.to_string(), e)),
        };
        if n == 0 {
            if let Some(r) = remaining {
                return Err(OpenScpError::io(
                    context.to_string(),
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read: {} bytes missing", r),
                    ),
                ));
            }
            break;
        }
        hasher.update(&buf[..n]);
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
    }
    Ok(hasher.finalize().into())
}

pub fn hash_local_range(
    path: &Path,
    offset: u64,
    len: u64,
    cancel: &dyn Fn() -> bool,
) -> OpenScpResult<HashDigest> {
    let context = format!("hash {}", path.display());
    let mut file = File::open(path).map_err(|e| OpenScpError::io(context.clone(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| OpenScpError::io(context.clone(), e))?;
    hash_reader(&mut file, Some(len), cancel, &context)
}

pub fn hash_local_full(path: &Path, cancel: &dyn Fn() -> bool) -> OpenScpResult<HashDigest> {
    let context = format!("hash {}", path.display());
    let mut file = File::open(path).map_err(|e| OpenScpError::io(context.clone(), e))?;
    hash_reader(&mut file, None, cancel, &context)
}

pub fn hash_remote_range(
    remote: &dyn RemoteFs,
    path: &str,
    offset: u64,
    len: u64,
    cancel: &dyn Fn() -> bool,
) -> OpenScpResult<HashDigest> {
    let mut reader = remote.open_read(path, offset)?;
    hash_reader(&mut *reader, Some(len), cancel, &format!("hash remote {}", path))
}

pub fn hash_remote_full(
    remote: &dyn RemoteFs,
    path: &str,
    cancel: &dyn Fn() -> bool,
) -> OpenScpResult<HashDigest> {
    let mut reader = remote.open_read(path, 0)?;
    hash_reader(&mut *reader, None, cancel, &format!("hash remote {}", path))
}
