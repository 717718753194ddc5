use openscp::core::paths::{local_part_path, remote_part_path};
use openscp::core::{IntegrityPolicy, OpenScpError};
use openscp::sftp::testing::LoopbackRemote;
use openscp::sftp::transfer::{download, upload};
use openscp::sftp::{RemoteFs, TransferControl, TransferOptions};
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::fs;
use std::path::Path;

const PAYLOAD: &[u8] = b"OpenSCP integration payload\nline-2\n";
const REMOTE: &str = "/srv/data/payload.txt";

fn server(root: &Path) -> LoopbackRemote {
    fs::create_dir_all(root.join("srv/data")).unwrap();
    fs::write(root.join("srv/data/payload.txt"), PAYLOAD).unwrap();
    LoopbackRemote::new(root)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[test]
fn vanilla_download() {
    let dir = tempfile::tempdir().unwrap();
    let remote = server(&dir.path().join("server"));
    let out = dir.path().join("out.txt");

    let mut progress = |_: u64, _: u64| {};
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    let opts = TransferOptions::new(false, IntegrityPolicy::Required);
    let outcome = download(&remote, REMOTE, &out, &opts, &mut ctl).unwrap();

    let data = fs::read(&out).unwrap();
    assert_eq!(data, PAYLOAD);
    assert_eq!(outcome.total_bytes, PAYLOAD.len() as u64);
    assert!(!local_part_path(&out).exists());
    assert_eq!(outcome.digest.as_deref(), Some(sha256_hex(PAYLOAD).as_str()));
}

#[test]
fn resumed_download_with_matching_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let remote = server(&dir.path().join("server"));
    let out = dir.path().join("out.txt");
    fs::write(local_part_path(&out), &PAYLOAD[..20]).unwrap();

    let max_done = Cell::new(0u64);
    let mut progress = |done: u64, _: u64| max_done.set(max_done.get().max(done));
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    let opts = TransferOptions::new(true, IntegrityPolicy::Required);
    let outcome = download(&remote, REMOTE, &out, &opts, &mut ctl).unwrap();

    assert_eq!(outcome.resumed_from, 20);
    assert_eq!(outcome.bytes_transferred, PAYLOAD.len() as u64 - 20);
    assert!(max_done.get() > 20);
    assert_eq!(fs::read(&out).unwrap(), PAYLOAD);
    assert!(!local_part_path(&out).exists());
}

#[test]
fn resumed_download_with_mismatched_prefix_fails_under_required() {
    let dir = tempfile::tempdir().unwrap();
    let remote = server(&dir.path().join("server"));
    let out = dir.path().join("out.txt");
    let part = local_part_path(&out);
    let stale = b"DIFFERENT PREFIX....";
    fs::write(&part, stale).unwrap();

    let mut progress = |_: u64, _: u64| {};
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    let opts = TransferOptions::new(true, IntegrityPolicy::Required);
    let err = download(&remote, REMOTE, &out, &opts, &mut ctl).unwrap_err();

    assert!(matches!(err, OpenScpError::IntegrityFailed { .. }), "{err}");
    assert!(!out.exists());
    assert_eq!(fs::read(&part).unwrap(), stale);
}

#[test]
fn canceled_upload_leaves_part_and_resumes() {
    const SIZE: usize = 10 * 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("server");
    fs::create_dir_all(root.join("up")).unwrap();
    let remote = LoopbackRemote::new(&root);
    let local = dir.path().join("big.bin");
    let data: Vec<u8> = (0..SIZE).map(|i| (i * 7 % 253) as u8).collect();
    fs::write(&local, &data).unwrap();
    let target = "/up/big.bin";

    let chunks = Cell::new(0u32);
    let mut progress = |_: u64, _: u64| chunks.set(chunks.get() + 1);
    let cancel = || chunks.get() >= 1;
    let mut ctl = TransferControl::new(&cancel, &mut progress);
    let opts = TransferOptions::new(false, IntegrityPolicy::Required);
    let err = upload(&remote, &local, target, &opts, &mut ctl).unwrap_err();

    assert!(matches!(err, OpenScpError::Canceled));
    assert!(remote.stat(&remote_part_path(target)).unwrap().is_some());
    assert!(remote.stat(target).unwrap().is_none());

    let mut progress = |_: u64, _: u64| {};
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    let opts = TransferOptions::new(true, IntegrityPolicy::Required);
    let outcome = upload(&remote, &local, target, &opts, &mut ctl).unwrap();

    assert!(outcome.resumed_from > 0);
    let info = remote.stat(target).unwrap().unwrap();
    assert_eq!(info.size, Some(SIZE as u64));
    assert!(remote.stat(&remote_part_path(target)).unwrap().is_none());
    assert_eq!(fs::read(remote.local_path(target)).unwrap(), data);
}

#[test]
fn put_then_get_round_trip_under_required() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("server");
    fs::create_dir_all(root.join("home")).unwrap();
    let remote = LoopbackRemote::new(&root);
    let src = dir.path().join("src.bin");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
    fs::write(&src, &data).unwrap();
    let opts = TransferOptions::new(false, IntegrityPolicy::Required);

    let mut progress = |_: u64, _: u64| {};
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    upload(&remote, &src, "/home/copy.bin", &opts, &mut ctl).unwrap();

    let back = dir.path().join("back.bin");
    let mut progress = |_: u64, _: u64| {};
    let mut ctl = TransferControl::new(&|| false, &mut progress);
    download(&remote, "/home/copy.bin", &back, &opts, &mut ctl).unwrap();

    assert_eq!(fs::read(&back).unwrap(), data);
}
