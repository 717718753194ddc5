// ── Transfer scheduler ──────────────────────────────────────────────────────
//
// One dispatcher thread picks work under the queue mutex; up to
// `max_concurrent` long-lived worker threads each own a session minted from
// the attached `SessionFactory`. Per-task cancel / pause / detach requests are
// atomics read by the chunk loop without taking the queue mutex. Observers
// get copies: `snapshot()` directly, or coalesced through `subscribe()`.

use crate::sftp::rate_limit::{Chained, TokenBucket};
use crate::sftp::remote::{RemoteFs, SessionFactory};
use crate::sftp::transfer::{self, TransferControl, TransferOptions, TransferOutcome};
use crate::sftp::types::{TaskStatus, TransferKind, TransferTask};
use chrono::Utc;
use openscp_core::config::{clamp_concurrency, MAX_CONCURRENT};
use openscp_core::{CancelToken, CoreConfig, IntegrityPolicy, OpenScpError, OpenScpResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Minimum spacing of published snapshots.
pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(50);
const RETRY_DELAY_STEP: Duration = Duration::from_secs(1);
const RETRY_DELAY_CAP: Duration = Duration::from_secs(5);

/// Fixed retry delay: one second per failed attempt, at most five.
pub fn retry_delay(attempts: u32) -> Duration {
    (RETRY_DELAY_STEP * attempts).min(RETRY_DELAY_CAP)
}

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// KB/s across all workers, 0 = unlimited.
    pub global_speed_limit_kbps: u64,
    pub default_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent: 2,
            global_speed_limit_kbps: 0,
            default_max_attempts: 3,
        }
    }
}

impl From<&CoreConfig> for SchedulerConfig {
    fn from(cfg: &CoreConfig) -> Self {
        SchedulerConfig {
            max_concurrent: cfg.max_concurrent,
            global_speed_limit_kbps: cfg.global_speed_limit_kbps,
            default_max_attempts: cfg.default_max_attempts,
        }
    }
}

/// Consistent copy of the queue at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Increases with every state change.
    pub version: u64,
    /// Ascending by id.
    pub tasks: Vec<TransferTask>,
    pub paused: bool,
    pub max_concurrent: usize,
    pub global_speed_limit_kbps: u64,
}

impl TaskSnapshot {
    pub fn get(&self, id: u64) -> Option<&TransferTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

// ── Internal state ───────────────────────────────────────────────────────────

struct TaskControl {
    /// Child of the scheduler-wide token, so `cancel_all` reaches it too.
    cancel: CancelToken,
    pause: AtomicBool,
    /// The client was detached; the task goes back to Queued.
    detach: AtomicBool,
    bucket: TokenBucket,
}

impl TaskControl {
    fn new(root: &CancelToken, speed_limit_kbps: u64) -> Arc<Self> {
        Arc::new(TaskControl {
            cancel: root.child(),
            pause: AtomicBool::new(false),
            detach: AtomicBool::new(false),
            bucket: TokenBucket::new(speed_limit_kbps),
        })
    }

    fn interrupted(&self) -> bool {
        self.cancel.is_cancelled()
            || self.pause.load(Ordering::SeqCst)
            || self.detach.load(Ordering::SeqCst)
    }
}

struct Entry {
    task: TransferTask,
    control: Arc<TaskControl>,
    /// Retry backoff.
    not_before: Option<Instant>,
    remove_on_finish: bool,
}

struct Job {
    id: u64,
    kind: TransferKind,
    local: PathBuf,
    remote: String,
    resume: bool,
    control: Arc<TaskControl>,
    factory: Arc<dyn SessionFactory>,
    epoch: u64,
}

enum WorkerMsg {
    Run(Box<Job>),
    /// Drop the cached session.
    Reset,
}

struct WorkerSlot {
    id: usize,
    tx: mpsc::Sender<WorkerMsg>,
    busy: bool,
    handle: Option<JoinHandle<()>>,
}

struct QueueState {
    entries: Vec<Entry>,
    next_id: u64,
    paused: bool,
    max_concurrent: usize,
    default_max_attempts: u32,
    /// Parent of every task's cancel token. Replaced after `cancel_all`.
    cancel_root: CancelToken,
    factory: Option<Arc<dyn SessionFactory>>,
    /// Bumped on every attach / detach; sessions from older epochs are stale.
    epoch: u64,
    workers: Vec<WorkerSlot>,
    next_worker_id: usize,
    shutdown: bool,
    version: u64,
    dirty: bool,
    last_publish: Instant,
}

impl QueueState {
    fn running(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.task.status == TaskStatus::Running)
            .count()
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.task.id == id)
    }

    fn pick(&self, now: Instant) -> Option<usize> {
        if self.paused || self.factory.is_none() || self.running() >= self.max_concurrent {
            return None;
        }
        self.entries.iter().position(|e| {
            e.task.status == TaskStatus::Queued && e.not_before.map_or(true, |t| t <= now)
        })
    }

    /// How long the dispatcher may sleep before it has something to do.
    fn next_wake(&self, now: Instant) -> Option<Duration> {
        let flush = self
            .dirty
            .then(|| PUBLISH_INTERVAL.saturating_sub(self.last_publish.elapsed()));
        let backoff = self
            .entries
            .iter()
            .filter(|e| e.task.status == TaskStatus::Queued)
            .filter_map(|e| e.not_before)
            .map(|t| t.saturating_duration_since(now))
            .min();
        match (flush, backoff) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    global: TokenBucket,
    snapshots: watch::Sender<TaskSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn build_snapshot(&self, st: &QueueState) -> TaskSnapshot {
        TaskSnapshot {
            version: st.version,
            tasks: st.entries.iter().map(|e| e.task.clone()).collect(),
            paused: st.paused,
            max_concurrent: st.max_concurrent,
            global_speed_limit_kbps: self.global.rate_kbps(),
        }
    }

    fn publish(&self, st: &mut QueueState) {
        st.dirty = false;
        st.last_publish = Instant::now();
        self.snapshots.send_replace(self.build_snapshot(st));
    }

    /// Record a state change: publish now if the interval allows, otherwise
    /// leave it for the dispatcher to flush.
    fn changed(&self, st: &mut QueueState) {
        st.version += 1;
        if st.last_publish.elapsed() >= PUBLISH_INTERVAL {
            self.publish(st);
        } else {
            st.dirty = true;
        }
        self.wake.notify_all();
    }

    fn progress(&self, id: u64, done: u64, total: u64) {
        let mut st = self.lock();
        let Some(entry) = st.entry_mut(id) else { return };
        if entry.task.status != TaskStatus::Running {
            return;
        }
        entry.task.bytes_done = done;
        if total > 0 {
            entry.task.bytes_total = Some(total);
            entry.task.progress = (done.saturating_mul(100) / total).min(99) as u8;
        }
        self.changed(&mut st);
    }

    fn finish(
        &self,
        worker_id: usize,
        job: &Job,
        result: OpenScpResult<TransferOutcome>,
        integrity: IntegrityPolicy,
    ) {
        let mut st = self.lock();
        if let Some(slot) = st.workers.iter_mut().find(|w| w.id == worker_id) {
            slot.busy = false;
        }
        if let Some(pos) = st.entries.iter().position(|e| e.task.id == job.id) {
            if st.entries[pos].remove_on_finish {
                st.entries.remove(pos);
            } else {
                apply_outcome(&mut st.entries[pos], result, integrity);
            }
        }
        self.changed(&mut st);
    }
}

fn apply_outcome(entry: &mut Entry, result: OpenScpResult<TransferOutcome>, integrity: IntegrityPolicy) {
    let task = &mut entry.task;
    let control = &entry.control;
    let err = match result {
        Ok(outcome) => {
            task.status = TaskStatus::Done;
            task.progress = 100;
            task.bytes_done = outcome.total_bytes;
            task.bytes_total = Some(outcome.total_bytes);
            task.last_error = None;
            task.last_error_kind = None;
            info!(task = task.id, bytes = outcome.total_bytes, "transfer done");
            return;
        }
        Err(e) => e,
    };

    if control.cancel.is_cancelled() {
        task.status = TaskStatus::Canceled;
        info!(task = task.id, "transfer canceled");
    } else if control.detach.swap(false, Ordering::SeqCst) {
        task.status = TaskStatus::Queued;
        task.resume = true;
        debug!(task = task.id, "client detached, task re-queued");
    } else if matches!(err, OpenScpError::Canceled) && control.pause.load(Ordering::SeqCst) {
        task.status = TaskStatus::Paused;
        task.resume = true;
        info!(task = task.id, bytes = task.bytes_done, "transfer paused");
    } else if matches!(err, OpenScpError::Canceled) {
        task.status = TaskStatus::Canceled;
    } else {
        task.attempts += 1;
        task.last_error = Some(err.to_string());
        task.last_error_kind = Some(err.kind());
        if err.is_retryable(integrity) && task.attempts < task.max_attempts {
            let delay = retry_delay(task.attempts);
            warn!(
                task = task.id,
                attempt = task.attempts,
                max = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transfer failed, retrying"
            );
            task.resume = true;
            if control.pause.load(Ordering::SeqCst) {
                task.status = TaskStatus::Paused;
            } else {
                task.status = TaskStatus::Queued;
                entry.not_before = Some(Instant::now() + delay);
            }
        } else {
            error!(task = task.id, attempts = task.attempts, error = %err, "transfer failed");
            task.status = TaskStatus::Error;
        }
    }
}

// ── Threads ──────────────────────────────────────────────────────────────────

type CachedSession = Option<(u64, Box<dyn RemoteFs>)>;

fn run_job(
    shared: &Shared,
    session: &mut CachedSession,
    job: &Job,
    integrity: IntegrityPolicy,
) -> OpenScpResult<TransferOutcome> {
    let control = &job.control;
    if control.interrupted() {
        return Err(OpenScpError::Canceled);
    }
    if !matches!(session, Some((epoch, _)) if *epoch == job.epoch) {
        *session = None;
        debug!(task = job.id, server = %job.factory.describe(), "opening worker session");
        *session = Some((job.epoch, job.factory.new_connection_like()?));
    }
    let Some((_, remote)) = session.as_ref() else {
        return Err(OpenScpError::NotConnected);
    };

    let cancel = || control.interrupted();
    let mut progress = |done: u64, total: u64| shared.progress(job.id, done, total);
    let throttle = Chained {
        task: Some(&control.bucket),
        global: Some(&shared.global),
    };
    let mut ctl = TransferControl::new(&cancel, &mut progress).with_throttle(&throttle);
    let opts = TransferOptions::new(job.resume, integrity);
    match job.kind {
        TransferKind::Download => {
            transfer::download(remote.as_ref(), &job.remote, &job.local, &opts, &mut ctl)
        }
        TransferKind::Upload => {
            transfer::upload(remote.as_ref(), &job.local, &job.remote, &opts, &mut ctl)
        }
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize, rx: mpsc::Receiver<WorkerMsg>) {
    let mut session: CachedSession = None;
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Reset => session = None,
            WorkerMsg::Run(job) => {
                let integrity = job.factory.integrity().effective();
                debug!(worker_id, task = job.id, "worker picked task");
                let result = run_job(&shared, &mut session, &job, integrity);
                if matches!(
                    result,
                    Err(OpenScpError::NotConnected) | Err(OpenScpError::Connect { .. })
                ) {
                    session = None;
                }
                shared.finish(worker_id, &job, result, integrity);
            }
        }
    }
    debug!(worker_id, "worker exiting");
}

fn spawn_worker(shared: &Arc<Shared>, st: &mut QueueState) -> Option<usize> {
    let id = st.next_worker_id;
    let (tx, rx) = mpsc::channel();
    let worker_shared = shared.clone();
    match thread::Builder::new()
        .name(format!("openscp-worker-{}", id))
        .spawn(move || worker_loop(worker_shared, id, rx))
    {
        Ok(handle) => {
            st.next_worker_id += 1;
            st.workers.push(WorkerSlot {
                id,
                tx,
                busy: false,
                handle: Some(handle),
            });
            Some(st.workers.len() - 1)
        }
        Err(e) => {
            error!(error = %e, "could not start transfer worker");
            None
        }
    }
}

/// Hand the entry at `idx` to an idle worker. `false` when no worker could
/// take it.
fn start(shared: &Arc<Shared>, st: &mut QueueState, idx: usize) -> bool {
    let Some(factory) = st.factory.clone() else {
        return false;
    };
    let slot = match st.workers.iter().position(|w| !w.busy) {
        Some(i) => i,
        None if st.workers.len() < MAX_CONCURRENT => match spawn_worker(shared, st) {
            Some(i) => i,
            None => return false,
        },
        None => return false,
    };

    let epoch = st.epoch;
    let entry = &mut st.entries[idx];
    entry.task.status = TaskStatus::Running;
    entry.not_before = None;
    let job = Job {
        id: entry.task.id,
        kind: entry.task.kind,
        local: entry.task.local_path.clone(),
        remote: entry.task.remote_path.clone(),
        resume: entry.task.resume,
        control: entry.control.clone(),
        factory,
        epoch,
    };
    let id = job.id;

    if st.workers[slot].tx.send(WorkerMsg::Run(Box::new(job))).is_err() {
        error!(task = id, "transfer worker gone, task re-queued");
        st.workers.remove(slot);
        st.entries[idx].task.status = TaskStatus::Queued;
        return false;
    }
    st.workers[slot].busy = true;
    debug!(task = id, worker = st.workers[slot].id, "task dispatched");
    shared.changed(st);
    true
}

fn dispatch_loop(shared: Arc<Shared>) {
    let mut st = shared.lock();
    while !st.shutdown {
        let now = Instant::now();
        while let Some(idx) = st.pick(now) {
            if !start(&shared, &mut st, idx) {
                break;
            }
        }
        if st.dirty && st.last_publish.elapsed() >= PUBLISH_INTERVAL {
            shared.publish(&mut st);
        }
        st = match st.next_wake(Instant::now()) {
            Some(timeout) => {
                let timeout = timeout.max(Duration::from_millis(1));
                match shared.wake.wait_timeout(st, timeout) {
                    Ok((guard, _)) => guard,
                    Err(p) => p.into_inner().0,
                }
            }
            None => shared.wake.wait(st).unwrap_or_else(|p| p.into_inner()),
        };
    }
    if st.dirty {
        shared.publish(&mut st);
    }
    debug!("dispatcher exiting");
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct TransferScheduler {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl TransferScheduler {
    pub fn new(config: SchedulerConfig) -> OpenScpResult<Self> {
        let max_concurrent = clamp_concurrency(config.max_concurrent);
        let initial = TaskSnapshot {
            max_concurrent,
            global_speed_limit_kbps: config.global_speed_limit_kbps,
            ..TaskSnapshot::default()
        };
        let (snapshots, _) = watch::channel(initial);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_id: 1,
                paused: false,
                max_concurrent,
                default_max_attempts: config.default_max_attempts.max(1),
                cancel_root: CancelToken::new(),
                factory: None,
                epoch: 0,
                workers: Vec::new(),
                next_worker_id: 0,
                shutdown: false,
                version: 0,
                dirty: false,
                last_publish: Instant::now(),
            }),
            wake: Condvar::new(),
            global: TokenBucket::new(config.global_speed_limit_kbps),
            snapshots,
        });

        let dispatcher_shared = shared.clone();
        let dispatcher = thread::Builder::new()
            .name("openscp-dispatcher".into())
            .spawn(move || dispatch_loop(dispatcher_shared))
            .map_err(|e| OpenScpError::io("start transfer dispatcher", e))?;

        info!(max_concurrent, "transfer scheduler started");
        Ok(TransferScheduler {
            shared,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn from_core_config(cfg: &CoreConfig) -> OpenScpResult<Self> {
        Self::new(SchedulerConfig::from(cfg))
    }

    fn enqueue(&self, kind: TransferKind, local: PathBuf, remote: String) -> u64 {
        let mut st = self.shared.lock();
        let id = st.next_id;
        st.next_id += 1;
        let task = TransferTask {
            id,
            created_at: Utc::now(),
            kind,
            local_path: local,
            remote_path: remote,
            status: TaskStatus::Queued,
            progress: 0,
            bytes_done: 0,
            bytes_total: None,
            attempts: 0,
            max_attempts: st.default_max_attempts,
            speed_limit_kbps: 0,
            last_error: None,
            last_error_kind: None,
            resume: false,
        };
        debug!(task = id, ?kind, remote = %task.remote_path, "task queued");
        let control = TaskControl::new(&st.cancel_root, 0);
        st.entries.push(Entry {
            task,
            control,
            not_before: None,
            remove_on_finish: false,
        });
        self.shared.changed(&mut st);
        id
    }

    pub fn enqueue_upload(&self, local: impl Into<PathBuf>, remote: impl Into<String>) -> u64 {
        self.enqueue(TransferKind::Upload, local.into(), remote.into())
    }

    pub fn enqueue_download(&self, remote: impl Into<String>, local: impl Into<PathBuf>) -> u64 {
        self.enqueue(TransferKind::Download, local.into(), remote.into())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let st = self.shared.lock();
        self.shared.build_snapshot(&st)
    }

    /// Coalesced snapshots, at most one per [`PUBLISH_INTERVAL`].
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn task(&self, id: u64) -> Option<TransferTask> {
        let st = self.shared.lock();
        st.entries
            .iter()
            .find(|e| e.task.id == id)
            .map(|e| e.task.clone())
    }

    pub fn running_count(&self) -> usize {
        self.shared.lock().running()
    }

    // ── Intents ──────────────────────────────────────────────────

    /// Running tasks stop at the next chunk boundary; others are canceled
    /// immediately. Finished tasks are left alone.
    pub fn cancel_task(&self, id: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(entry) = st.entry_mut(id) else {
            return false;
        };
        let hit = cancel_entry(entry);
        if hit {
            self.shared.changed(&mut st);
        }
        hit
    }

    pub fn cancel_all(&self) -> usize {
        let mut st = self.shared.lock();
        // Stops every running transfer at once; later tasks hang off a fresh root.
        st.cancel_root.cancel();
        st.cancel_root = CancelToken::new();
        let n = st.entries.iter_mut().map(cancel_entry).filter(|hit| *hit).count();
        if n > 0 {
            info!(count = n, "canceling all transfers");
            self.shared.changed(&mut st);
        }
        n
    }

    /// Stop dispatching. Running transfers continue.
    pub fn pause_all(&self) {
        let mut st = self.shared.lock();
        st.paused = true;
        self.shared.changed(&mut st);
    }

    /// Resume dispatching and re-queue individually paused tasks.
    pub fn resume_all(&self) -> usize {
        let mut st = self.shared.lock();
        st.paused = false;
        let mut n = 0;
        for entry in st.entries.iter_mut() {
            if resume_entry(entry) {
                n += 1;
            }
        }
        self.shared.changed(&mut st);
        n
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Queued tasks pause immediately; running ones at the next chunk.
    pub fn pause_task(&self, id: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(entry) = st.entry_mut(id) else {
            return false;
        };
        let hit = match entry.task.status {
            TaskStatus::Queued => {
                entry.task.status = TaskStatus::Paused;
                true
            }
            TaskStatus::Running => {
                entry.control.pause.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        };
        if hit {
            self.shared.changed(&mut st);
        }
        hit
    }

    pub fn resume_task(&self, id: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(entry) = st.entry_mut(id) else {
            return false;
        };
        let hit = resume_entry(entry);
        if hit {
            self.shared.changed(&mut st);
        }
        hit
    }

    /// Re-queue every Error and Canceled task with a fresh attempt budget.
    pub fn retry_failed(&self) -> usize {
        let mut st = self.shared.lock();
        let root = st.cancel_root.clone();
        let mut n = 0;
        for entry in st.entries.iter_mut() {
            if matches!(entry.task.status, TaskStatus::Error | TaskStatus::Canceled) {
                entry.task.status = TaskStatus::Queued;
                entry.task.attempts = 0;
                entry.task.last_error = None;
                entry.task.last_error_kind = None;
                entry.task.resume = true;
                entry.control = TaskControl::new(&root, entry.task.speed_limit_kbps);
                entry.not_before = None;
                n += 1;
            }
        }
        if n > 0 {
            info!(count = n, "retrying failed transfers");
            self.shared.changed(&mut st);
        }
        n
    }

    /// Drop Done tasks. Error and Canceled stay visible.
    pub fn clear_completed(&self) -> usize {
        let mut st = self.shared.lock();
        let before = st.entries.len();
        st.entries.retain(|e| e.task.status != TaskStatus::Done);
        let n = before - st.entries.len();
        if n > 0 {
            self.shared.changed(&mut st);
        }
        n
    }

    /// Remove a task; a running one is canceled and removed when its worker
    /// lets go of it.
    pub fn remove_task(&self, id: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(pos) = st.entries.iter().position(|e| e.task.id == id) else {
            return false;
        };
        if st.entries[pos].task.status == TaskStatus::Running {
            let entry = &mut st.entries[pos];
            entry.control.cancel.cancel();
            entry.remove_on_finish = true;
        } else {
            st.entries.remove(pos);
        }
        self.shared.changed(&mut st);
        true
    }

    // ── Client attachment ────────────────────────────────────────

    /// Attach the factory workers mint their sessions from.
    pub fn set_client(&self, factory: Arc<dyn SessionFactory>) {
        let mut st = self.shared.lock();
        info!(server = %factory.describe(), "transfer client attached");
        st.factory = Some(factory);
        st.epoch += 1;
        self.shared.changed(&mut st);
    }

    /// Detach the client. Running transfers stop at the next chunk and go
    /// back to Queued; idle workers drop their sessions.
    pub fn clear_client(&self) {
        let mut st = self.shared.lock();
        if st.factory.take().is_none() {
            return;
        }
        st.epoch += 1;
        for entry in st.entries.iter() {
            if entry.task.status == TaskStatus::Running {
                entry.control.detach.store(true, Ordering::SeqCst);
            }
        }
        for worker in st.workers.iter().filter(|w| !w.busy) {
            let _ = worker.tx.send(WorkerMsg::Reset);
        }
        info!("transfer client detached");
        self.shared.changed(&mut st);
    }

    pub fn has_client(&self) -> bool {
        self.shared.lock().factory.is_some()
    }

    // ── Limits ───────────────────────────────────────────────────

    /// Returns the effective (clamped) value. Running transfers are not
    /// interrupted when the cap is lowered.
    pub fn set_max_concurrent(&self, n: usize) -> usize {
        let mut st = self.shared.lock();
        st.max_concurrent = clamp_concurrency(n);
        let effective = st.max_concurrent;
        self.shared.changed(&mut st);
        effective
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.lock().max_concurrent
    }

    pub fn set_global_speed_limit(&self, kbps: u64) {
        self.shared.global.set_rate_kbps(kbps);
        let mut st = self.shared.lock();
        self.shared.changed(&mut st);
    }

    /// 0 removes the per-task cap; the global cap still applies.
    pub fn set_task_speed_limit(&self, id: u64, kbps: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(entry) = st.entry_mut(id) else {
            return false;
        };
        entry.task.speed_limit_kbps = kbps;
        entry.control.bucket.set_rate_kbps(kbps);
        self.shared.changed(&mut st);
        true
    }

    /// Stop dispatching, interrupt running transfers and join every thread.
    pub fn shutdown(&mut self) {
        let workers = {
            let mut st = self.shared.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            for entry in st.entries.iter() {
                if entry.task.status == TaskStatus::Running {
                    entry.control.detach.store(true, Ordering::SeqCst);
                }
            }
            self.shared.wake.notify_all();
            std::mem::take(&mut st.workers)
        };
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        for mut worker in workers {
            drop(worker.tx);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        debug!("transfer scheduler stopped");
    }
}

impl Drop for TransferScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn cancel_entry(entry: &mut Entry) -> bool {
    match entry.task.status {
        TaskStatus::Queued | TaskStatus::Paused => {
            entry.task.status = TaskStatus::Canceled;
            true
        }
        TaskStatus::Running => {
            entry.control.cancel.cancel();
            true
        }
        _ => false,
    }
}

fn resume_entry(entry: &mut Entry) -> bool {
    match entry.task.status {
        TaskStatus::Paused => {
            entry.control.pause.store(false, Ordering::SeqCst);
            entry.task.status = TaskStatus::Queued;
            true
        }
        // Pause requested but the worker has not reached a chunk boundary.
        TaskStatus::Running => entry.control.pause.swap(false, Ordering::SeqCst),
        _ => false,
    }
}
