//! A merge scheduler running each merge on its own thread.
//!
//! Two limits shape the scheduler:
//!
//! - `max_merge_count`: merges running or waiting inside the scheduler. Once
//!   reached, the indexing thread that asks for more merges is stalled until
//!   one finishes. Merge threads themselves are never stalled.
//! - `max_thread_count`: merges actually writing at once. Beyond it, the
//!   largest merges are paused (rate 0) so the small ones finish first.
//!
//! With auto I/O throttling on, merges of at least [`MIN_BIG_MERGE_MB`] are
//! rate limited to a shared target that rises by 20% whenever a new big merge
//! finds a similarly sized merge already running for more than three seconds,
//! and decays by 10% otherwise.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::info_stream::{InfoStream, NoOutputInfoStream};
use crate::merge::executor::{IntraMergeExecutor, MergeExecutor, SameThreadExecutor, ThreadBudget};
use crate::merge::policy::{MergeTrigger, OneMerge, bytes_to_mb, mb_to_bytes};
use crate::merge::scheduler::{
    DefaultMergeExceptionHandler, MergeErrorAction, MergeExceptionHandler, MergeScheduler,
    MergeSource,
};
use crate::storage::Directory;

const COMPONENT: &str = "MS";

/// Sentinel for [`ConcurrentMergeScheduler::set_max_merges_and_threads`]: pick
/// both limits from the hardware.
pub const AUTO_DETECT_MERGES_AND_THREADS: usize = usize::MAX;

/// Floor for the auto-throttled rate.
pub const MIN_MERGE_MB_PER_SEC: f64 = 5.0;

/// Ceiling for the auto-throttled rate.
pub const MAX_MERGE_MB_PER_SEC: f64 = 10240.0;

/// Initial auto-throttled rate.
pub const START_MB_PER_SEC: f64 = 20.0;

/// Merges smaller than this are never throttled.
pub const MIN_BIG_MERGE_MB: f64 = 50.0;

const STALL_CHECK_INTERVAL: Duration = Duration::from_millis(250);
const BACKLOG_MIN_RUNNING_TIME: Duration = Duration::from_secs(3);

/// Serialisable settings of a [`ConcurrentMergeScheduler`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentMergeSchedulerConfig {
    /// `None` (together with `max_thread_count`) auto-detects.
    pub max_merge_count: Option<usize>,
    pub max_thread_count: Option<usize>,
    pub auto_io_throttle: bool,
    /// Rate for forced merges; `None` is unlimited.
    pub force_merge_mb_per_sec: Option<f64>,
    /// Merges at least this large may spread their formats over a thread pool.
    pub intra_merge_min_mb: f64,
}

impl Default for ConcurrentMergeSchedulerConfig {
    fn default() -> Self {
        ConcurrentMergeSchedulerConfig {
            max_merge_count: None,
            max_thread_count: None,
            auto_io_throttle: true,
            force_merge_mb_per_sec: None,
            intra_merge_min_mb: MIN_BIG_MERGE_MB,
        }
    }
}

#[derive(Debug)]
struct MergeThreadEntry {
    thread_id: ThreadId,
    name: String,
    merge: Arc<OneMerge>,
}

#[derive(Debug)]
struct SchedulerState {
    threads: Vec<MergeThreadEntry>,
    max_merge_count: usize,
    max_thread_count: usize,
    auto_io_throttle: bool,
    target_mb_per_sec: f64,
    force_merge_mb_per_sec: f64,
    thread_counter: u64,
}

impl SchedulerState {
    fn is_merge_thread(&self, id: ThreadId) -> bool {
        self.threads.iter().any(|t| t.thread_id == id)
    }

    /// Merge threads other than the caller whose merge is not aborted.
    fn merge_thread_count(&self, current: ThreadId) -> usize {
        self.threads
            .iter()
            .filter(|t| t.thread_id != current && !t.merge.is_aborted())
            .count()
    }

    fn set_defaults(&mut self, spins: bool) {
        if spins {
            self.max_thread_count = 1;
            self.max_merge_count = 6;
        } else {
            self.max_thread_count = (num_cpus::get() / 2).clamp(1, 4);
            self.max_merge_count = self.max_thread_count + 5;
        }
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    /// Signalled whenever a merge thread exits or the limits change.
    cond: Condvar,
    info_stream: RwLock<Arc<dyn InfoStream>>,
    handler: Arc<dyn MergeExceptionHandler>,
    budget: Arc<ThreadBudget>,
    intra_merge_min_bytes: u64,
    executor: Mutex<Option<Arc<dyn MergeExecutor>>>,
}

impl SchedulerInner {
    fn verbose(&self) -> bool {
        self.info_stream.read().is_enabled(COMPONENT)
    }

    fn message(&self, message: &str) {
        self.info_stream.read().message(COMPONENT, message);
    }

    fn resolve_defaults(&self, state: &mut SchedulerState) {
        if state.max_thread_count == AUTO_DETECT_MERGES_AND_THREADS {
            state.set_defaults(false);
            self.budget.set_max_threads(state.max_thread_count);
        }
    }

    /// Pause all but the `max_thread_count` smallest merges and set every
    /// other merge's rate.
    fn update_merge_threads(&self, state: &mut SchedulerState) {
        self.budget.set_merge_threads(state.threads.len());

        let mut active: Vec<&MergeThreadEntry> = state.threads.iter().collect();
        active.sort_by(|a, b| {
            b.merge
                .estimated_merge_bytes()
                .cmp(&a.merge.estimated_merge_bytes())
        });

        let to_pause = active.len().saturating_sub(state.max_thread_count);
        let big_merge_bytes = (MIN_BIG_MERGE_MB * 1024.0 * 1024.0) as u64;
        let verbose = self.verbose();
        let mut report = Vec::new();

        for (index, entry) in active.iter().enumerate() {
            let merge = &entry.merge;
            let new_rate = if index < to_pause {
                0.0
            } else if merge.max_num_segments().is_some() {
                state.force_merge_mb_per_sec
            } else if !state.auto_io_throttle
                || merge.estimated_merge_bytes() < big_merge_bytes
            {
                f64::INFINITY
            } else {
                state.target_mb_per_sec
            };

            let limiter = merge.rate_limiter();
            let current = limiter.mb_per_sec();
            if verbose {
                let change = if new_rate == current {
                    String::new()
                } else if new_rate == 0.0 {
                    " now stop".to_string()
                } else if current == 0.0 {
                    format!(" now resume at {new_rate:.1} MB/sec")
                } else {
                    format!(" now change from {current:.1} MB/sec to {new_rate:.1} MB/sec")
                };
                report.push(format!(
                    "  {} [{}] est={:.1} MB{}",
                    entry.name,
                    merge.seg_string(),
                    bytes_to_mb(merge.estimated_merge_bytes()),
                    change
                ));
            }
            limiter.apply_mb_per_sec(new_rate);
        }

        if verbose && !report.is_empty() {
            self.message(&format!(
                "updateMergeThreads ioThrottle={} targetMBPerSec={:.1} MB/sec\n{}",
                state.auto_io_throttle,
                state.target_mb_per_sec,
                report.join("\n")
            ));
        }
    }

    /// Whether another similarly sized big merge has been running for a while.
    fn is_backlog(state: &SchedulerState, merge: &OneMerge) -> bool {
        let big_merge_bytes = (MIN_BIG_MERGE_MB * 1024.0 * 1024.0) as u64;
        let merge_mb = bytes_to_mb(merge.estimated_merge_bytes());
        state.threads.iter().any(|entry| {
            let other = &entry.merge;
            if other.id() == merge.id() || other.estimated_merge_bytes() < big_merge_bytes {
                return false;
            }
            let running_long = other
                .running_time()
                .is_some_and(|t| t > BACKLOG_MIN_RUNNING_TIME);
            let ratio = bytes_to_mb(other.estimated_merge_bytes()) / merge_mb;
            running_long && ratio > 0.3 && ratio < 3.0
        })
    }

    /// Feedback control of the shared target rate when a new merge starts.
    fn update_io_throttle(&self, state: &mut SchedulerState, merge: &OneMerge) {
        if !state.auto_io_throttle {
            return;
        }
        let merge_mb = bytes_to_mb(merge.estimated_merge_bytes());
        if merge_mb < MIN_BIG_MERGE_MB {
            // Only non-trivial merges move the target.
            return;
        }

        let view: &SchedulerState = state;
        let new_backlog = Self::is_backlog(view, merge);
        let current_backlog = !new_backlog
            && (view.threads.len() > view.max_thread_count
                || view
                    .threads
                    .iter()
                    .any(|entry| Self::is_backlog(view, &entry.merge)));

        let previous = state.target_mb_per_sec;
        if new_backlog {
            state.target_mb_per_sec = (state.target_mb_per_sec * 1.20).min(MAX_MERGE_MB_PER_SEC);
            if self.verbose() {
                self.message(&format!(
                    "io throttle: new merge backlog; increase IO rate from {previous:.1} to {:.1} MB/sec",
                    state.target_mb_per_sec
                ));
            }
        } else if current_backlog {
            if self.verbose() {
                self.message(&format!(
                    "io throttle: current merge backlog; leave IO rate at {previous:.1} MB/sec"
                ));
            }
        } else {
            state.target_mb_per_sec = (state.target_mb_per_sec / 1.10).max(MIN_MERGE_MB_PER_SEC);
            if self.verbose() {
                self.message(&format!(
                    "io throttle: no merge backlog; decrease IO rate from {previous:.1} to {:.1} MB/sec",
                    state.target_mb_per_sec
                ));
            }
        }

        let rate = if merge.max_num_segments().is_some() {
            state.force_merge_mb_per_sec
        } else {
            state.target_mb_per_sec
        };
        merge.rate_limiter().apply_mb_per_sec(rate);
    }

    /// Block the producing thread while too many merges are in flight.
    ///
    /// Returns false when called from a merge thread that would have to stall.
    fn maybe_stall(&self, state: &mut MutexGuard<'_, SchedulerState>, source: &dyn MergeSource) -> bool {
        let current = thread::current().id();
        let mut stall_start: Option<Instant> = None;
        while source.has_pending_merges()
            && state.merge_thread_count(current) >= state.max_merge_count
        {
            if state.is_merge_thread(current) {
                // Blocking a merge thread would keep it from finishing.
                return false;
            }
            if stall_start.is_none() {
                stall_start = Some(Instant::now());
                if self.verbose() {
                    self.message("    too many merges; stalling...");
                }
            }
            self.cond.wait_for(state, STALL_CHECK_INTERVAL);
        }
        if let Some(start) = stall_start {
            if self.verbose() {
                self.message(&format!("  stalled for {} ms", start.elapsed().as_millis()));
            }
        }
        true
    }

    fn merge(self: &Arc<Self>, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        let mut state = self.state.lock();
        self.resolve_defaults(&mut state);

        if trigger == MergeTrigger::Closing {
            // No throttling while closing.
            state.target_mb_per_sec = MAX_MERGE_MB_PER_SEC;
            self.update_merge_threads(&mut state);
        }

        if self.verbose() {
            self.message(&format!(
                "merge trigger={trigger:?} threads={} maxMergeCount={} maxThreadCount={}",
                state.threads.len(),
                state.max_merge_count,
                state.max_thread_count
            ));
        }

        loop {
            if !self.maybe_stall(&mut state, source.as_ref()) {
                return Ok(());
            }

            let Some(merge) = source.next_merge() else {
                if self.verbose() {
                    self.message("  no more merges pending; now return");
                }
                return Ok(());
            };

            state.thread_counter += 1;
            let name = format!("sluice-merge-{}", state.thread_counter);
            let spawned = {
                let inner = Arc::clone(self);
                let source = Arc::clone(&source);
                let merge = Arc::clone(&merge);
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || inner.run_merge_thread(source, merge))
            };
            let handle = match spawned {
                Ok(handle) => handle,
                Err(error) => {
                    source.on_merge_finished(&merge);
                    return Err(error.into());
                }
            };

            state.threads.push(MergeThreadEntry {
                thread_id: handle.thread().id(),
                name: name.clone(),
                merge: Arc::clone(&merge),
            });
            self.update_io_throttle(&mut state, &merge);
            if self.verbose() {
                self.message(&format!("    launch new thread [{name}] for {}", merge.seg_string()));
            }
            self.update_merge_threads(&mut state);
        }
    }

    fn run_merge_thread(self: Arc<Self>, source: Arc<dyn MergeSource>, merge: Arc<OneMerge>) {
        let _exit = ThreadExitGuard {
            inner: Arc::clone(&self),
            thread_id: thread::current().id(),
        };

        if self.verbose() {
            self.message(&format!("  merge thread: start {}", merge.seg_string()));
        }
        let result = source.merge(&merge);
        source.on_merge_finished(&merge);

        match result {
            Ok(()) => {
                if self.verbose() {
                    self.message(&format!("  merge thread: done {}", merge.seg_string()));
                }
            }
            Err(error) => match self.handler.handle(&merge, &error) {
                MergeErrorAction::Ignore => {
                    if self.verbose() {
                        self.message(&format!(
                            "  merge thread: {} ended with {error}",
                            merge.seg_string()
                        ));
                    }
                }
                MergeErrorAction::Fatal => {
                    self.message(&format!(
                        "  merge thread: {} hit fatal error: {error}",
                        merge.seg_string()
                    ));
                    source.on_fatal_merge_error(error);
                }
            },
        }

        // Start merges that were registered while this one ran.
        if let Err(error) = self.merge(source, MergeTrigger::MergeFinished) {
            if !error.is_recoverable_merge_error() {
                self.message(&format!("  merge thread: cascading merges failed: {error}"));
            }
        }
    }
}

/// Removes a merge thread from the scheduler when it exits, even by panic.
struct ThreadExitGuard {
    inner: Arc<SchedulerInner>,
    thread_id: ThreadId,
}

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.threads.retain(|t| t.thread_id != self.thread_id);
        self.inner.update_merge_threads(&mut state);
        // Wakes stalled producers and `sync` callers.
        self.inner.cond.notify_all();
    }
}

/// Runs each merge in a dedicated thread.
#[derive(Clone)]
pub struct ConcurrentMergeScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConcurrentMergeScheduler")
            .field("max_merge_count", &state.max_merge_count)
            .field("max_thread_count", &state.max_thread_count)
            .field("merge_threads", &state.threads.len())
            .field("auto_io_throttle", &state.auto_io_throttle)
            .field("target_mb_per_sec", &state.target_mb_per_sec)
            .finish()
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentMergeScheduler {
    pub fn new() -> Self {
        Self::build(
            Arc::new(DefaultMergeExceptionHandler),
            (MIN_BIG_MERGE_MB * 1024.0 * 1024.0) as u64,
        )
    }

    fn build(handler: Arc<dyn MergeExceptionHandler>, intra_merge_min_bytes: u64) -> Self {
        ConcurrentMergeScheduler {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    threads: Vec::new(),
                    max_merge_count: AUTO_DETECT_MERGES_AND_THREADS,
                    max_thread_count: AUTO_DETECT_MERGES_AND_THREADS,
                    auto_io_throttle: true,
                    target_mb_per_sec: START_MB_PER_SEC,
                    force_merge_mb_per_sec: f64::INFINITY,
                    thread_counter: 0,
                }),
                cond: Condvar::new(),
                info_stream: RwLock::new(Arc::new(NoOutputInfoStream)),
                handler,
                budget: Arc::new(ThreadBudget::new(1)),
                intra_merge_min_bytes,
                executor: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &ConcurrentMergeSchedulerConfig) -> Result<Self> {
        let scheduler = Self::build(
            Arc::new(DefaultMergeExceptionHandler),
            mb_to_bytes("intra_merge_min_mb", config.intra_merge_min_mb)?,
        );
        scheduler.set_max_merges_and_threads(
            config.max_merge_count.unwrap_or(AUTO_DETECT_MERGES_AND_THREADS),
            config.max_thread_count.unwrap_or(AUTO_DETECT_MERGES_AND_THREADS),
        )?;
        if !config.auto_io_throttle {
            scheduler.disable_auto_io_throttle();
        }
        scheduler.set_force_merge_mb_per_sec(config.force_merge_mb_per_sec.unwrap_or(f64::INFINITY))?;
        Ok(scheduler)
    }

    /// Replace the failure classifier; only before the scheduler is shared.
    pub fn with_exception_handler(self, handler: Arc<dyn MergeExceptionHandler>) -> Self {
        let intra_merge_min_bytes = self.inner.intra_merge_min_bytes;
        let (max_merge_count, max_thread_count, auto_io_throttle, force_rate) = {
            let state = self.inner.state.lock();
            (
                state.max_merge_count,
                state.max_thread_count,
                state.auto_io_throttle,
                state.force_merge_mb_per_sec,
            )
        };
        let scheduler = Self::build(handler, intra_merge_min_bytes);
        {
            let mut state = scheduler.inner.state.lock();
            state.max_merge_count = max_merge_count;
            state.max_thread_count = max_thread_count;
            state.auto_io_throttle = auto_io_throttle;
            state.force_merge_mb_per_sec = force_rate;
        }
        if max_thread_count != AUTO_DETECT_MERGES_AND_THREADS {
            scheduler.inner.budget.set_max_threads(max_thread_count);
        }
        scheduler
    }

    /// Set both limits, or pass [`AUTO_DETECT_MERGES_AND_THREADS`] for both.
    ///
    /// Stalled producers are woken and paused merges re-evaluated.
    pub fn set_max_merges_and_threads(
        &self,
        max_merge_count: usize,
        max_thread_count: usize,
    ) -> Result<()> {
        let auto = AUTO_DETECT_MERGES_AND_THREADS;
        let mut state = self.inner.state.lock();
        match (max_merge_count == auto, max_thread_count == auto) {
            (true, true) => {
                state.max_merge_count = auto;
                state.max_thread_count = auto;
            }
            (true, false) => {
                return Err(SluiceError::invalid_argument(
                    "both max_merge_count and max_thread_count must be AUTO_DETECT_MERGES_AND_THREADS",
                ));
            }
            (false, true) => {
                return Err(SluiceError::invalid_argument(
                    "max_thread_count may only be AUTO_DETECT_MERGES_AND_THREADS when max_merge_count is too",
                ));
            }
            (false, false) => {
                if max_thread_count < 1 {
                    return Err(SluiceError::invalid_argument(
                        "max_thread_count should be at least 1",
                    ));
                }
                if max_merge_count < max_thread_count {
                    return Err(SluiceError::invalid_argument(format!(
                        "max_thread_count should be <= max_merge_count (= {max_merge_count})"
                    )));
                }
                state.max_merge_count = max_merge_count;
                state.max_thread_count = max_thread_count;
                self.inner.budget.set_max_threads(max_thread_count);
            }
        }
        self.inner.update_merge_threads(&mut state);
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Limits used for spinning or solid-state storage.
    pub fn set_default_max_merges_and_threads(&self, spins: bool) {
        let mut state = self.inner.state.lock();
        state.set_defaults(spins);
        self.inner.budget.set_max_threads(state.max_thread_count);
        self.inner.update_merge_threads(&mut state);
        self.inner.cond.notify_all();
    }

    /// [`AUTO_DETECT_MERGES_AND_THREADS`] until resolved.
    pub fn max_merge_count(&self) -> usize {
        self.inner.state.lock().max_merge_count
    }

    pub fn max_thread_count(&self) -> usize {
        self.inner.state.lock().max_thread_count
    }

    pub fn enable_auto_io_throttle(&self) {
        let mut state = self.inner.state.lock();
        state.auto_io_throttle = true;
        state.target_mb_per_sec = START_MB_PER_SEC;
        self.inner.update_merge_threads(&mut state);
    }

    pub fn disable_auto_io_throttle(&self) {
        let mut state = self.inner.state.lock();
        state.auto_io_throttle = false;
        self.inner.update_merge_threads(&mut state);
    }

    pub fn auto_io_throttle(&self) -> bool {
        self.inner.state.lock().auto_io_throttle
    }

    /// Rate for merges of a forced merge; `f64::INFINITY` is unlimited.
    pub fn set_force_merge_mb_per_sec(&self, mb_per_sec: f64) -> Result<()> {
        if mb_per_sec.is_nan() || mb_per_sec < 0.0 {
            return Err(SluiceError::invalid_argument(format!(
                "force_merge_mb_per_sec must be >= 0 (got {mb_per_sec})"
            )));
        }
        let mut state = self.inner.state.lock();
        state.force_merge_mb_per_sec = mb_per_sec;
        self.inner.update_merge_threads(&mut state);
        Ok(())
    }

    pub fn force_merge_mb_per_sec(&self) -> f64 {
        self.inner.state.lock().force_merge_mb_per_sec
    }

    /// Current target rate, or infinity when auto throttling is off.
    pub fn io_rate_limit_mb_per_sec(&self) -> f64 {
        let state = self.inner.state.lock();
        if state.auto_io_throttle {
            state.target_mb_per_sec
        } else {
            f64::INFINITY
        }
    }

    /// Merge threads other than the caller that are still running a live merge.
    pub fn merge_thread_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .merge_thread_count(thread::current().id())
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn initialize(&self, info_stream: Arc<dyn InfoStream>, directory: &dyn Directory) {
        *self.inner.info_stream.write() = info_stream;
        let mut state = self.inner.state.lock();
        if state.max_thread_count == AUTO_DETECT_MERGES_AND_THREADS {
            let spins = directory.is_spinning();
            state.set_defaults(spins);
            self.inner.budget.set_max_threads(state.max_thread_count);
            if self.inner.verbose() {
                self.inner.message(&format!(
                    "initDynamicDefaults spins={spins} maxThreadCount={} maxMergeCount={}",
                    state.max_thread_count, state.max_merge_count
                ));
            }
        }
    }

    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()> {
        self.inner.merge(source, trigger)
    }

    fn sync(&self) {
        let current = thread::current().id();
        let mut state = self.inner.state.lock();
        // A merge thread calling sync must not wait for itself.
        while state.threads.iter().any(|t| t.thread_id != current) {
            self.inner.cond.wait(&mut state);
        }
    }

    fn close(&self) -> Result<()> {
        self.sync();
        self.inner.executor.lock().take();
        Ok(())
    }

    fn intra_merge_executor(&self, _merge: &OneMerge) -> Arc<dyn MergeExecutor> {
        let mut executor = self.inner.executor.lock();
        if let Some(executor) = executor.as_ref() {
            return Arc::clone(executor);
        }
        let created: Arc<dyn MergeExecutor> = match IntraMergeExecutor::new(
            num_cpus::get(),
            self.inner.intra_merge_min_bytes,
            Arc::clone(&self.inner.budget),
        ) {
            Ok(pool) => Arc::new(pool),
            Err(error) => {
                self.inner
                    .message(&format!("intra-merge pool unavailable, merging inline: {error}"));
                Arc::new(SameThreadExecutor)
            }
        };
        *executor = Some(Arc::clone(&created));
        created
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::index::segment::test_segment;
    use crate::info_stream::RecordingInfoStream;
    use crate::merge::scheduler::tests::QueueSource;
    use crate::storage::memory::RamDirectory;

    /// Merges block until the gate opens; tracks how many run at once.
    struct GatedSource {
        pending: Mutex<VecDeque<Arc<OneMerge>>>,
        open: Mutex<bool>,
        gate: Condvar,
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl GatedSource {
        fn new(sizes_mb: &[u64]) -> Self {
            let pending = sizes_mb
                .iter()
                .enumerate()
                .map(|(i, mb)| {
                    let merge = OneMerge::new(vec![Arc::new(test_segment(
                        &format!("_{i}"),
                        10,
                        0,
                        mb * 1024 * 1024,
                    ))])
                    .unwrap();
                    merge.set_estimated_merge_bytes(mb * 1024 * 1024);
                    Arc::new(merge)
                })
                .collect();
            GatedSource {
                pending: Mutex::new(pending),
                open: Mutex::new(false),
                gate: Condvar::new(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.gate.notify_all();
        }
    }

    impl MergeSource for GatedSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            let merge = self.pending.lock().pop_front()?;
            merge.mark_running().ok()?;
            Some(merge)
        }

        fn on_merge_finished(&self, _merge: &Arc<OneMerge>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn has_pending_merges(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.gate.wait(&mut open);
            }
            drop(open);
            self.running.fetch_sub(1, Ordering::SeqCst);
            merge.mark_done(None)
        }

        fn on_fatal_merge_error(&self, _error: SluiceError) {}
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_set_max_merges_and_threads_rules() {
        let cms = ConcurrentMergeScheduler::new();
        let auto = AUTO_DETECT_MERGES_AND_THREADS;
        assert!(cms.set_max_merges_and_threads(auto, 3).is_err());
        assert!(cms.set_max_merges_and_threads(3, auto).is_err());
        assert!(cms.set_max_merges_and_threads(2, 0).is_err());
        assert!(cms.set_max_merges_and_threads(1, 2).is_err());

        cms.set_max_merges_and_threads(6, 2).unwrap();
        assert_eq!((cms.max_merge_count(), cms.max_thread_count()), (6, 2));
        cms.set_max_merges_and_threads(auto, auto).unwrap();
        assert_eq!(cms.max_thread_count(), auto);
    }

    #[test]
    fn test_auto_detected_defaults() {
        let cms = ConcurrentMergeScheduler::new();
        cms.set_default_max_merges_and_threads(true);
        assert_eq!((cms.max_thread_count(), cms.max_merge_count()), (1, 6));

        cms.set_default_max_merges_and_threads(false);
        let threads = cms.max_thread_count();
        assert!((1..=4).contains(&threads));
        assert_eq!(cms.max_merge_count(), threads + 5);

        let spinning = ConcurrentMergeScheduler::new();
        spinning.initialize(Arc::new(NoOutputInfoStream), &RamDirectory::spinning());
        assert_eq!((spinning.max_thread_count(), spinning.max_merge_count()), (1, 6));
    }

    #[test]
    fn test_runs_every_merge() {
        let source = Arc::new(QueueSource::new(10));
        let cms = ConcurrentMergeScheduler::new();
        cms.set_max_merges_and_threads(3, 2).unwrap();
        cms.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        wait_until(|| source.finished.lock().len() == 10);
        cms.close().unwrap();

        assert_eq!(source.merged.load(Ordering::SeqCst), 10);
        assert_eq!(cms.merge_thread_count(), 0);
    }

    #[test]
    fn test_fatal_errors_reach_the_source() {
        let mut source = QueueSource::new(2);
        source.fail = Box::new(|merge| {
            merge
                .contains("_1")
                .then(|| SluiceError::other("disk full"))
        });
        let source = Arc::new(source);
        let cms = ConcurrentMergeScheduler::new();
        cms.merge(source.clone(), MergeTrigger::Explicit).unwrap();
        wait_until(|| source.finished.lock().len() == 2);
        cms.sync();

        assert_eq!(source.fatal.lock().len(), 1);
        assert_eq!(source.merged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_producer_stalls_at_max_merge_count() {
        let source = Arc::new(GatedSource::new(&[1, 1, 1, 1]));
        let stream = Arc::new(RecordingInfoStream::new());
        let cms = ConcurrentMergeScheduler::new();
        cms.initialize(stream.clone(), &RamDirectory::new());
        cms.set_max_merges_and_threads(2, 1).unwrap();

        let producer = {
            let cms = cms.clone();
            let source = Arc::clone(&source);
            thread::spawn(move || cms.merge(source, MergeTrigger::SegmentFlush))
        };
        wait_until(|| stream.contains("MS", "too many merges; stalling"));
        assert_eq!(source.running.load(Ordering::SeqCst), 2);
        assert!(!producer.is_finished());

        source.open();
        producer.join().unwrap().unwrap();
        wait_until(|| source.finished.load(Ordering::SeqCst) == 4);
        cms.close().unwrap();
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_largest_merges_are_paused() {
        let source = Arc::new(GatedSource::new(&[100, 10, 200]));
        let cms = ConcurrentMergeScheduler::new();
        cms.set_max_merges_and_threads(3, 1).unwrap();
        let merges: Vec<Arc<OneMerge>> = source.pending.lock().iter().cloned().collect();

        cms.merge(source.clone(), MergeTrigger::SegmentFlush).unwrap();
        wait_until(|| source.running.load(Ordering::SeqCst) == 3);

        // Only the smallest keeps going, unthrottled because it is small.
        assert_eq!(merges[0].rate_limiter().mb_per_sec(), 0.0);
        assert_eq!(merges[1].rate_limiter().mb_per_sec(), f64::INFINITY);
        assert_eq!(merges[2].rate_limiter().mb_per_sec(), 0.0);

        // Raising the thread limit resumes the paused ones at the target rate.
        cms.set_max_merges_and_threads(3, 3).unwrap();
        assert_eq!(merges[0].rate_limiter().mb_per_sec(), START_MB_PER_SEC / 1.10);
        assert!(merges[2].rate_limiter().mb_per_sec() > 0.0);

        cms.disable_auto_io_throttle();
        assert_eq!(merges[0].rate_limiter().mb_per_sec(), f64::INFINITY);
        assert_eq!(cms.io_rate_limit_mb_per_sec(), f64::INFINITY);

        source.open();
        cms.close().unwrap();
        assert_eq!(source.finished.load(Ordering::SeqCst), 3);
    }

    fn sized_merge(name: &str, mb: u64) -> Arc<OneMerge> {
        let merge =
            OneMerge::new(vec![Arc::new(test_segment(name, 10, 0, mb * 1024 * 1024))]).unwrap();
        merge.set_estimated_merge_bytes(mb * 1024 * 1024);
        Arc::new(merge)
    }

    /// A merge that has been running for five seconds.
    fn long_running_merge(name: &str, mb: u64) -> Arc<OneMerge> {
        let merge = sized_merge(name, mb);
        merge.mark_running().unwrap();
        merge.backdate_start(Duration::from_secs(5));
        merge
    }

    /// Register `running` as merge threads, then start `merge` the way `merge` does.
    fn start_with(
        cms: &ConcurrentMergeScheduler,
        target_mb_per_sec: f64,
        running: &[Arc<OneMerge>],
        merge: &Arc<OneMerge>,
    ) -> f64 {
        let mut state = cms.inner.state.lock();
        state.target_mb_per_sec = target_mb_per_sec;
        for (i, other) in running.iter().chain(std::iter::once(merge)).enumerate() {
            state.threads.push(MergeThreadEntry {
                thread_id: thread::current().id(),
                name: format!("test-{i}"),
                merge: Arc::clone(other),
            });
        }
        cms.inner.update_io_throttle(&mut state, merge);
        state.threads.clear();
        state.target_mb_per_sec
    }

    #[test]
    fn test_io_throttle_rises_on_new_backlog() {
        let cms = ConcurrentMergeScheduler::new();
        let running = [long_running_merge("_0", 200)];
        let merge = sized_merge("_1", 300);

        let target = start_with(&cms, START_MB_PER_SEC, &running, &merge);
        assert!((target - START_MB_PER_SEC * 1.20).abs() < 1e-9);
        assert_eq!(merge.rate_limiter().mb_per_sec(), target);
    }

    #[test]
    fn test_io_throttle_ignores_dissimilar_or_young_merges() {
        let cms = ConcurrentMergeScheduler::new();

        // Ten times larger than the running merge: no backlog, the rate decays.
        let running = [long_running_merge("_0", 100)];
        let target = start_with(&cms, START_MB_PER_SEC, &running, &sized_merge("_1", 1000));
        assert!((target - START_MB_PER_SEC / 1.10).abs() < 1e-9);

        // Similar size but only just started.
        let young = sized_merge("_2", 200);
        young.mark_running().unwrap();
        let target = start_with(&cms, START_MB_PER_SEC, &[young], &sized_merge("_3", 200));
        assert!((target - START_MB_PER_SEC / 1.10).abs() < 1e-9);
    }

    #[test]
    fn test_io_throttle_holds_rate_during_existing_backlog() {
        let cms = ConcurrentMergeScheduler::new();
        // The two running merges form a backlog between themselves; the new
        // merge is too large to be part of it.
        let running = [long_running_merge("_0", 200), long_running_merge("_1", 250)];
        let merge = sized_merge("_2", 2000);

        let target = start_with(&cms, 42.0, &running, &merge);
        assert_eq!(target, 42.0);
        assert_eq!(merge.rate_limiter().mb_per_sec(), 42.0);
    }

    #[test]
    fn test_io_throttle_stays_within_bounds() {
        let cms = ConcurrentMergeScheduler::new();

        let running = [long_running_merge("_0", 200)];
        let target = start_with(&cms, 10_000.0, &running, &sized_merge("_1", 200));
        assert_eq!(target, MAX_MERGE_MB_PER_SEC);
        let target = start_with(&cms, target, &running, &sized_merge("_2", 200));
        assert_eq!(target, MAX_MERGE_MB_PER_SEC);

        let target = start_with(&cms, 5.2, &[], &sized_merge("_3", 200));
        assert_eq!(target, MIN_MERGE_MB_PER_SEC);
        let target = start_with(&cms, target, &[], &sized_merge("_4", 200));
        assert_eq!(target, MIN_MERGE_MB_PER_SEC);
    }

    #[test]
    fn test_io_throttle_skips_small_merges() {
        let cms = ConcurrentMergeScheduler::new();
        let merge = sized_merge("_0", 10);
        let target = start_with(&cms, 33.0, &[], &merge);
        assert_eq!(target, 33.0);
        assert_eq!(merge.rate_limiter().mb_per_sec(), f64::INFINITY);
    }

    #[test]
    fn test_forced_merges_use_force_merge_rate() {
        let cms = ConcurrentMergeScheduler::new();
        cms.set_force_merge_mb_per_sec(7.5).unwrap();
        let merge = sized_merge("_0", 500);
        merge.set_max_num_segments(Some(1));

        let target = start_with(&cms, START_MB_PER_SEC, &[], &merge);
        assert!((target - START_MB_PER_SEC / 1.10).abs() < 1e-9);
        assert_eq!(merge.rate_limiter().mb_per_sec(), 7.5);

        // Thread pausing hands out the same rate.
        let mut state = cms.inner.state.lock();
        state.max_thread_count = 4;
        state.threads.push(MergeThreadEntry {
            thread_id: thread::current().id(),
            name: "test-forced".to_string(),
            merge: Arc::clone(&merge),
        });
        merge.rate_limiter().apply_mb_per_sec(f64::INFINITY);
        cms.inner.update_merge_threads(&mut state);
        state.threads.clear();
        drop(state);
        assert_eq!(merge.rate_limiter().mb_per_sec(), 7.5);
    }

    #[test]
    fn test_config_validation() {
        let config = ConcurrentMergeSchedulerConfig {
            max_merge_count: Some(4),
            max_thread_count: None,
            ..Default::default()
        };
        assert!(ConcurrentMergeScheduler::from_config(&config).is_err());

        let config = ConcurrentMergeSchedulerConfig {
            max_merge_count: Some(4),
            max_thread_count: Some(2),
            auto_io_throttle: false,
            ..Default::default()
        };
        let cms = ConcurrentMergeScheduler::from_config(&config).unwrap();
        assert_eq!(cms.max_merge_count(), 4);
        assert!(!cms.auto_io_throttle());
        assert!(cms.set_force_merge_mb_per_sec(-1.0).is_err());
    }
}
