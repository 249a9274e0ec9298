//! Per-merge I/O throttling.
//!
//! Each running merge owns a [`MergeRateLimiter`]. The merge scheduler
//! adjusts its rate while the merge runs: a finite rate throttles writes, a
//! rate of zero stops the merge thread until it is resumed, and aborting the
//! limiter makes the next write fail with [`SluiceError::MergeAborted`].

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SluiceError};
use crate::storage::{Directory, IndexInput, IndexOutput};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Pauses shorter than this are skipped.
const MIN_PAUSE: Duration = Duration::from_millis(2);

/// Longest single sleep; the limiter re-checks rate and abort afterwards.
const MAX_PAUSE: Duration = Duration::from_millis(250);

/// Target interval between two pause checks at the current rate.
const MIN_PAUSE_CHECK_MSEC: f64 = 25.0;

#[derive(Debug)]
struct LimiterState {
    mb_per_sec: f64,
    last: Instant,
}

/// Throttles (and can abort) the writes of one merge.
pub struct MergeRateLimiter {
    state: Mutex<LimiterState>,
    cond: Condvar,
    aborted: AtomicBool,
    min_pause_check_bytes: AtomicU64,
    total_bytes_written: AtomicU64,
    paused_nanos: AtomicU64,
    stopped_nanos: AtomicU64,
}

impl fmt::Debug for MergeRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRateLimiter")
            .field("mb_per_sec", &self.mb_per_sec())
            .field("aborted", &self.is_aborted())
            .field("total_bytes_written", &self.total_bytes_written())
            .finish()
    }
}

impl Default for MergeRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeRateLimiter {
    /// Create an unthrottled limiter.
    pub fn new() -> Self {
        MergeRateLimiter {
            state: Mutex::new(LimiterState {
                mb_per_sec: f64::INFINITY,
                last: Instant::now(),
            }),
            cond: Condvar::new(),
            aborted: AtomicBool::new(false),
            min_pause_check_bytes: AtomicU64::new(min_pause_check_bytes(f64::INFINITY)),
            total_bytes_written: AtomicU64::new(0),
            paused_nanos: AtomicU64::new(0),
            stopped_nanos: AtomicU64::new(0),
        }
    }

    /// Change the rate. `0.0` stops the merge, `f64::INFINITY` disables throttling.
    ///
    /// A thread currently sleeping in [`pause`](Self::pause) wakes up and
    /// re-evaluates against the new rate.
    pub fn set_mb_per_sec(&self, mb_per_sec: f64) -> Result<()> {
        if mb_per_sec.is_nan() || mb_per_sec < 0.0 {
            return Err(SluiceError::invalid_argument(format!(
                "mb_per_sec must be >= 0 (got {mb_per_sec})"
            )));
        }
        self.apply_mb_per_sec(mb_per_sec);
        Ok(())
    }

    /// Install a rate computed by the scheduler, which only produces
    /// non-negative finite rates or infinity.
    pub(crate) fn apply_mb_per_sec(&self, mb_per_sec: f64) {
        debug_assert!(!mb_per_sec.is_nan() && mb_per_sec >= 0.0, "bad rate {mb_per_sec}");
        let mut state = self.state.lock();
        state.mb_per_sec = mb_per_sec;
        self.min_pause_check_bytes
            .store(min_pause_check_bytes(mb_per_sec), Ordering::Relaxed);
        self.cond.notify_all();
    }

    /// Current rate in MB/s.
    pub fn mb_per_sec(&self) -> f64 {
        self.state.lock().mb_per_sec
    }

    /// Number of bytes an output may write between two pause checks.
    pub fn min_pause_check_bytes(&self) -> u64 {
        self.min_pause_check_bytes.load(Ordering::Relaxed)
    }

    /// Signal the merge to abort; any sleeping writer wakes up.
    pub fn abort(&self) {
        let _state = self.state.lock();
        self.aborted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Whether the merge was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fail with `MergeAborted` if the merge was aborted.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(SluiceError::merge_aborted("merge aborted"))
        } else {
            Ok(())
        }
    }

    /// Account for `bytes` just written and sleep as long as the rate demands.
    ///
    /// Returns the time spent paused or stopped.
    pub fn pause(&self, bytes: u64) -> Result<Duration> {
        self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
        let start = Instant::now();
        let mut state = self.state.lock();

        loop {
            self.check_aborted()?;

            let rate = state.mb_per_sec;
            let now = Instant::now();
            if rate.is_infinite() {
                state.last = now;
                break;
            }

            if rate == 0.0 {
                self.cond.wait_for(&mut state, MAX_PAUSE);
                self.stopped_nanos
                    .fetch_add(nanos(now.elapsed()), Ordering::Relaxed);
                continue;
            }

            let seconds = (bytes as f64 / BYTES_PER_MB) / rate;
            let target = state.last + Duration::from_secs_f64(seconds);
            let wait = target.saturating_duration_since(now);
            if wait <= MIN_PAUSE {
                // Instantaneous rate: the next pause is measured from now.
                state.last = now;
                break;
            }

            self.cond.wait_for(&mut state, wait.min(MAX_PAUSE));
            self.paused_nanos
                .fetch_add(nanos(now.elapsed()), Ordering::Relaxed);
        }

        Ok(start.elapsed())
    }

    /// Total bytes reported through [`pause`](Self::pause).
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Relaxed)
    }

    /// Total time spent throttled at a positive rate.
    pub fn total_paused(&self) -> Duration {
        Duration::from_nanos(self.paused_nanos.load(Ordering::Relaxed))
    }

    /// Total time spent stopped at rate zero.
    pub fn total_stopped(&self) -> Duration {
        Duration::from_nanos(self.stopped_nanos.load(Ordering::Relaxed))
    }
}

fn min_pause_check_bytes(mb_per_sec: f64) -> u64 {
    let bytes = (MIN_PAUSE_CHECK_MSEC / 1000.0) * mb_per_sec * BYTES_PER_MB;
    bytes.min(BYTES_PER_MB) as u64
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A directory whose outputs are throttled by one merge's rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitedDirectory {
    inner: Arc<dyn Directory>,
    limiter: Arc<MergeRateLimiter>,
}

impl RateLimitedDirectory {
    /// Wrap a directory.
    pub fn new(inner: Arc<dyn Directory>, limiter: Arc<MergeRateLimiter>) -> Self {
        RateLimitedDirectory { inner, limiter }
    }

    /// The limiter applied to outputs.
    pub fn limiter(&self) -> &Arc<MergeRateLimiter> {
        &self.limiter
    }
}

impl Directory for RateLimitedDirectory {
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.limiter.check_aborted()?;
        Ok(Box::new(RateLimitedOutput {
            inner: self.inner.create_output(name)?,
            limiter: Arc::clone(&self.limiter),
            bytes_since_pause: 0,
        }))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        self.inner.open_input(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.inner.file_length(name)
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.list_all()
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        self.inner.rename(source, dest)
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.inner.sync(names)
    }

    fn is_spinning(&self) -> bool {
        self.inner.is_spinning()
    }
}

/// Output that reports written bytes to a [`MergeRateLimiter`].
#[derive(Debug)]
pub struct RateLimitedOutput {
    inner: Box<dyn IndexOutput>,
    limiter: Arc<MergeRateLimiter>,
    bytes_since_pause: u64,
}

impl Write for RateLimitedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes_since_pause += written as u64;
        if self.bytes_since_pause >= self.limiter.min_pause_check_bytes() {
            self.limiter.pause(self.bytes_since_pause)?;
            self.bytes_since_pause = 0;
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl IndexOutput for RateLimitedOutput {
    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
