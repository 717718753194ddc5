// ── Rate limiting ───────────────────────────────────────────────────────────
//
// Token bucket without burst allowance: a chunk is admitted as soon as the
// balance is non-negative and may drive it negative. Over any window the
// bucket therefore passes at most `rate × window` plus one chunk.

use openscp_core::{OpenScpError, OpenScpResult};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Longest single wait; cancellation and rate changes are noticed at this
/// granularity.
pub const TICK: Duration = Duration::from_millis(100);

pub trait Throttle: Send + Sync {
    /// Block until `bytes` may pass, or fail with `Canceled`.
    fn admit(&self, bytes: usize, cancel: &dyn Fn() -> bool) -> OpenScpResult<()>;
}

#[derive(Debug)]
struct BucketState {
    /// Bytes per second, 0 means unlimited.
    rate: u64,
    balance: f64,
    last: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        // No banking of idle time beyond zero.
        self.balance = (self.balance + elapsed * self.rate as f64).min(0.0);
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    tick: Condvar,
}

impl TokenBucket {
    pub fn new(kbps: u64) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                rate: kbps.saturating_mul(1024),
                balance: 0.0,
                last: Instant::now(),
            }),
            tick: Condvar::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Change the rate. Waiters re-evaluate immediately.
    pub fn set_rate_kbps(&self, kbps: u64) {
        if let Ok(mut st) = self.state.lock() {
            st.refill(Instant::now());
            st.rate = kbps.saturating_mul(1024);
            if st.rate == 0 {
                st.balance = 0.0;
            }
        }
        self.tick.notify_all();
    }

    pub fn rate_kbps(&self) -> u64 {
        self.state.lock().map(|s| s.rate / 1024).unwrap_or(0)
    }
}

impl Throttle for TokenBucket {
    fn admit(&self, bytes: usize, cancel: &dyn Fn() -> bool) -> OpenScpResult<()> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| OpenScpError::Config("rate limiter poisoned".into()))?;
        loop {
            if st.rate == 0 {
                return Ok(());
            }
            st.refill(Instant::now());
            if st.balance >= 0.0 {
                st.balance -= bytes as f64;
                return Ok(());
            }
            if cancel() {
                return Err(OpenScpError::Canceled);
            }
            let needed = Duration::from_secs_f64(-st.balance / st.rate as f64);
            let wait = needed.min(TICK).max(Duration::from_millis(1));
            st = match self.tick.wait_timeout(st, wait) {
                Ok((guard, _)) => guard,
                Err(_) => return Err(OpenScpError::Config("rate limiter poisoned".into())),
            };
        }
    }
}

/// Per-task bucket first, then the global one; both must admit the chunk.
pub struct Chained<'a> {
    pub task: Option<&'a TokenBucket>,
    pub global: Option<&'a TokenBucket>,
}

impl Throttle for Chained<'_> {
    fn admit(&self, bytes: usize, cancel: &dyn Fn() -> bool) -> OpenScpResult<()> {
        if let Some(task) = self.task {
            task.admit(bytes, cancel)?;
        }
        if let Some(global) = self.global {
            global.admit(bytes, cancel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    const CHUNK: usize = 64 * 1024;

    #[test]
    fn unlimited_never_blocks() {
        let bucket = TokenBucket::unlimited();
        let start = Instant::now();
        for _ in 0..1000 {
            bucket.admit(CHUNK, &|| false).unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn rate_bounds_throughput() {
        // 256 KB/s: 4 chunks per second; the first passes immediately.
        let bucket = TokenBucket::new(256);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.admit(CHUNK, &|| false).unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2500), "{:?}", elapsed);
    }

    #[test]
    fn global_cap_shared_across_threads() {
        let bucket = Arc::new(TokenBucket::new(512));
        let passed = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (bucket, passed, stop) = (bucket.clone(), passed.clone(), stop.clone());
            handles.push(thread::spawn(move || {
                let cancel = || stop.load(Ordering::SeqCst);
                while bucket.admit(CHUNK, &cancel).is_ok() {
                    passed.fetch_add(CHUNK as u64, Ordering::SeqCst);
                }
            }));
        }
        thread::sleep(Duration::from_secs(1));
        stop.store(true, Ordering::SeqCst);
        for h in handles {
            h.join().unwrap();
        }
        // One second at 512 KB/s plus the one-chunk grace, and a little slack
        // for the join window.
        let limit = 512 * 1024 + CHUNK as u64 + 2 * CHUNK as u64;
        assert!(passed.load(Ordering::SeqCst) <= limit);
    }

    #[test]
    fn cancel_interrupts_wait() {
        let bucket = TokenBucket::new(1);
        bucket.admit(CHUNK, &|| false).unwrap();
        let start = Instant::now();
        let err = bucket.admit(CHUNK, &|| true).unwrap_err();
        assert!(matches!(err, OpenScpError::Canceled));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn lifting_the_limit_releases_waiters() {
        let bucket = Arc::new(TokenBucket::new(1));
        bucket.admit(CHUNK, &|| false).unwrap();
        let b = bucket.clone();
        let waiter = thread::spawn(move || b.admit(CHUNK, &|| false));
        thread::sleep(Duration::from_millis(150));
        bucket.set_rate_kbps(0);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(bucket.rate_kbps(), 0);
    }
}
