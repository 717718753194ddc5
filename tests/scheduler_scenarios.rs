use openscp::core::{CoreConfig, IntegrityPolicy};
use openscp::credentials::{CredentialStore, MemoryBackend};
use openscp::sftp::testing::{LoopbackFactory, LoopbackRemote};
use openscp::sftp::{SchedulerConfig, TaskStatus, TransferScheduler, CHUNK_SIZE};
use openscp::OpenScp;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn seed(root: &Path, files: usize, chunks: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..chunks * CHUNK_SIZE).map(|i| (i % 239) as u8).collect();
    fs::create_dir_all(root.join("srv")).unwrap();
    for i in 0..files {
        fs::write(root.join("srv").join(format!("file{}.bin", i)), &data).unwrap();
    }
    data
}

fn slow_factory(root: &Path) -> Arc<LoopbackFactory> {
    let remote = LoopbackRemote::new(root).with_chunk_delay(Duration::from_millis(15));
    Arc::new(LoopbackFactory::new(remote, IntegrityPolicy::Optional))
}

#[test]
fn concurrency_cap_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("server");
    let data = seed(&root, 5, 30);
    let sched = TransferScheduler::new(SchedulerConfig {
        max_concurrent: 2,
        ..SchedulerConfig::default()
    })
    .unwrap();
    for i in 0..5 {
        sched.enqueue_download(
            format!("/srv/file{}.bin", i),
            dir.path().join("local").join(format!("file{}.bin", i)),
        );
    }
    sched.set_client(slow_factory(&root));

    assert!(wait_until(Duration::from_secs(10), || {
        sched.snapshot().count(TaskStatus::Running) == 2
    }));
    let snap = sched.snapshot();
    assert_eq!(snap.count(TaskStatus::Queued), 3);
    let running_id = snap
        .tasks
        .iter()
        .find(|t| t.status == TaskStatus::Running)
        .map(|t| t.id)
        .unwrap();

    assert!(sched.cancel_task(running_id));
    let mut max_running = 0;
    let replaced = wait_until(Duration::from_secs(10), || {
        let snap = sched.snapshot();
        max_running = max_running.max(snap.count(TaskStatus::Running));
        snap.get(running_id).unwrap().status == TaskStatus::Canceled
            && snap.count(TaskStatus::Queued) < 3
    });
    assert!(replaced, "{:?}", sched.snapshot());

    let finished = wait_until(Duration::from_secs(30), || {
        let snap = sched.snapshot();
        max_running = max_running.max(snap.count(TaskStatus::Running));
        snap.count(TaskStatus::Done) == 4
    });
    assert!(finished, "{:?}", sched.snapshot());
    assert!(max_running <= 2);

    let snap = sched.snapshot();
    assert_eq!(snap.get(running_id).unwrap().status, TaskStatus::Canceled);
    for task in snap.tasks.iter().filter(|t| t.status == TaskStatus::Done) {
        assert_eq!(task.progress, 100);
        assert_eq!(fs::read(&task.local_path).unwrap(), data);
    }
    let canceled = snap.get(running_id).unwrap();
    assert!(canceled.progress < 100);
    assert!(!canceled.local_path.exists());
}

#[test]
fn facade_runs_queued_uploads_once_attached() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("server");
    fs::create_dir_all(root.join("incoming")).unwrap();
    let local = dir.path().join("report.csv");
    fs::write(&local, b"id,value\n1,42\n").unwrap();

    let store = CredentialStore::new(Some(Box::new(MemoryBackend::new())));
    let mut app = OpenScp::new(CoreConfig::default(), store).unwrap();
    let id = app.scheduler().enqueue_upload(&local, "/incoming/report.csv");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(app.scheduler().task(id).unwrap().status, TaskStatus::Queued);

    let remote = LoopbackRemote::new(&root);
    app.attach_factory(Arc::new(LoopbackFactory::new(remote, IntegrityPolicy::Required)));
    assert!(app.is_connected());
    assert!(wait_until(Duration::from_secs(10), || {
        app.scheduler().task(id).unwrap().status == TaskStatus::Done
    }));
    assert_eq!(
        fs::read(root.join("incoming/report.csv")).unwrap(),
        b"id,value\n1,42\n"
    );

    app.disconnect();
    assert!(!app.is_connected());
    assert_eq!(app.scheduler().clear_completed(), 1);
}
