//! The merge scheduler contract, the source it pulls merges from, and the
//! two trivial schedulers.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SluiceError};
use crate::info_stream::{InfoStream, NoOutputInfoStream};
use crate::merge::executor::{MergeExecutor, SameThreadExecutor};
use crate::merge::policy::{MergeTrigger, OneMerge};
use crate::storage::Directory;

/// The writer as seen by a merge scheduler.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge, marking it running. `None` when idle.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Called exactly once for every merge handed out by [`next_merge`](Self::next_merge),
    /// whether it succeeded, failed or was aborted.
    fn on_merge_finished(&self, merge: &Arc<OneMerge>);

    fn has_pending_merges(&self) -> bool;

    /// Run one merge to completion on the calling thread.
    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()>;

    /// A merge failed in a way the writer cannot recover from.
    fn on_fatal_merge_error(&self, error: SluiceError);
}

/// What a scheduler does with a failed merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeErrorAction {
    /// Log and carry on.
    Ignore,
    /// Hand the error to [`MergeSource::on_fatal_merge_error`].
    Fatal,
}

/// Classifies merge failures.
pub trait MergeExceptionHandler: Send + Sync + Debug {
    fn handle(&self, merge: &OneMerge, error: &SluiceError) -> MergeErrorAction;
}

/// Ignores aborts and failures caused by a closed writer; everything else is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMergeExceptionHandler;

impl MergeExceptionHandler for DefaultMergeExceptionHandler {
    fn handle(&self, _merge: &OneMerge, error: &SluiceError) -> MergeErrorAction {
        if error.is_recoverable_merge_error() {
            MergeErrorAction::Ignore
        } else {
            MergeErrorAction::Fatal
        }
    }
}

/// Runs the merges a writer registers.
pub trait MergeScheduler: Send + Sync + Debug {
    /// Called once by the writer before the first merge.
    fn initialize(&self, _info_stream: Arc<dyn InfoStream>, _directory: &dyn Directory) {}

    /// Run (or dispatch) pending merges of `source`.
    fn merge(&self, source: Arc<dyn MergeSource>, trigger: MergeTrigger) -> Result<()>;

    /// Wait until every merge started by this scheduler is terminal.
    fn sync(&self) {}

    /// Wait for running merges and release resources.
    fn close(&self) -> Result<()>;

    /// Executor for the per-format work inside one merge.
    fn intra_merge_executor(&self, _merge: &OneMerge) -> Arc<dyn MergeExecutor> {
        Arc::new(SameThreadExecutor)
    }
}

/// Drain `source` on the calling thread, one merge at a time.
///
/// Returns the first fatal error after reporting it to the source.
pub(crate) fn run_pending_merges(
    source: &dyn MergeSource,
    handler: &dyn MergeExceptionHandler,
    info_stream: &dyn InfoStream,
) -> Result<()> {
    while let Some(merge) = source.next_merge() {
        let result = source.merge(&merge);
        source.on_merge_finished(&merge);
        if let Err(error) = result {
            match handler.handle(&merge, &error) {
                MergeErrorAction::Ignore => {
                    if info_stream.is_enabled("MS") {
                        info_stream.message(
                            "MS",
                            &format!("merge {} ignored error: {error}", merge.seg_string()),
                        );
                    }
                }
                MergeErrorAction::Fatal => {
                    source.on_fatal_merge_error(error.clone());
                    return Err(error);
                }
            }
        }
    }
    Ok(())
}

/// Runs merges synchronously on the thread that triggered them.
///
/// Only one thread merges at a time; others block until it is done.
#[derive(Debug)]
pub struct SerialMergeScheduler {
    lock: Mutex<()>,
    handler: Arc<dyn MergeExceptionHandler>,
    info_stream: Mutex<Arc<dyn InfoStream>>,
}

impl Default for SerialMergeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        SerialMergeScheduler {
            lock: Mutex::new(()),
            handler: Arc::new(DefaultMergeExceptionHandler),
            info_stream: Mutex::new(Arc::new(NoOutputInfoStream)),
        }
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn MergeExceptionHandler>) -> Self {
        self.handler = handler;
        self
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn initialize(&self, info_stream: Arc<dyn InfoStream>, _directory: &dyn Directory) {
        *self.info_stream.lock() = info_stream;
    }

    fn merge(&self, source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        let _serial = self.lock.lock();
        let info_stream = self.info_stream.lock().clone();
        run_pending_merges(source.as_ref(), self.handler.as_ref(), info_stream.as_ref())
    }

    fn sync(&self) {
        // Merges run inside `merge`; holding the lock means none is running.
        drop(self.lock.lock());
    }

    fn close(&self) -> Result<()> {
        self.sync();
        Ok(())
    }
}

/// Never runs merges; registered merges stay pending until the writer aborts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergeScheduler;

impl MergeScheduler for NoMergeScheduler {
    fn merge(&self, _source: Arc<dyn MergeSource>, _trigger: MergeTrigger) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::index::segment::test_segment;

    /// A merge source backed by a queue; `fail` decides which merges fail and how.
    pub(crate) struct QueueSource {
        pub pending: Mutex<VecDeque<Arc<OneMerge>>>,
        pub finished: Mutex<Vec<u64>>,
        pub fatal: Mutex<Vec<SluiceError>>,
        pub merged: AtomicUsize,
        pub fail: Box<dyn Fn(&OneMerge) -> Option<SluiceError> + Send + Sync>,
    }

    impl QueueSource {
        pub(crate) fn new(merges: usize) -> Self {
            let pending = (0..merges)
                .map(|i| {
                    Arc::new(
                        OneMerge::new(vec![Arc::new(test_segment(&format!("_{i}"), 10, 1, 100))])
                            .unwrap(),
                    )
                })
                .collect();
            QueueSource {
                pending: Mutex::new(pending),
                finished: Mutex::new(Vec::new()),
                fatal: Mutex::new(Vec::new()),
                merged: AtomicUsize::new(0),
                fail: Box::new(|_| None),
            }
        }
    }

    impl MergeSource for QueueSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            let merge = self.pending.lock().pop_front()?;
            merge.mark_running().ok()?;
            Some(merge)
        }

        fn on_merge_finished(&self, merge: &Arc<OneMerge>) {
            self.finished.lock().push(merge.id());
        }

        fn has_pending_merges(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
            if let Some(error) = (self.fail)(merge) {
                merge.mark_failed(error.clone());
                return Err(error);
            }
            self.merged.fetch_add(1, Ordering::SeqCst);
            merge.mark_done(None)
        }

        fn on_fatal_merge_error(&self, error: SluiceError) {
            self.fatal.lock().push(error);
        }
    }

    #[test]
    fn test_serial_scheduler_drains_source() {
        let source = Arc::new(QueueSource::new(3));
        let scheduler = SerialMergeScheduler::new();
        scheduler
            .merge(source.clone(), MergeTrigger::Explicit)
            .unwrap();

        assert_eq!(source.merged.load(Ordering::SeqCst), 3);
        assert_eq!(source.finished.lock().len(), 3);
        assert!(!source.has_pending_merges());
        scheduler.close().unwrap();
    }

    #[test]
    fn test_serial_scheduler_ignores_aborts_and_reports_fatal() {
        let mut source = QueueSource::new(3);
        source.fail = Box::new(|merge| {
            if merge.contains("_0") {
                Some(SluiceError::merge_aborted("rollback"))
            } else if merge.contains("_1") {
                Some(SluiceError::corruption("bad checksum"))
            } else {
                None
            }
        });
        let source = Arc::new(source);

        let result = SerialMergeScheduler::new().merge(source.clone(), MergeTrigger::Explicit);
        assert!(matches!(result, Err(SluiceError::Corruption(_))));
        assert_eq!(source.fatal.lock().len(), 1);
        // Both failed merges were still finished; the third is left pending.
        assert_eq!(source.finished.lock().len(), 2);
        assert!(source.has_pending_merges());
    }

    #[test]
    fn test_no_merge_scheduler_leaves_merges_pending() {
        let source = Arc::new(QueueSource::new(2));
        NoMergeScheduler
            .merge(source.clone(), MergeTrigger::SegmentFlush)
            .unwrap();
        assert_eq!(source.pending.lock().len(), 2);
    }

    #[test]
    fn test_default_handler_classification() {
        let merge = OneMerge::new(vec![Arc::new(test_segment("_0", 1, 0, 1))]).unwrap();
        let handler = DefaultMergeExceptionHandler;
        assert_eq!(
            handler.handle(&merge, &SluiceError::already_closed("closed")),
            MergeErrorAction::Ignore
        );
        assert_eq!(
            handler.handle(&merge, &SluiceError::other("disk full")),
            MergeErrorAction::Fatal
        );
    }
}
