//! The merge policy contract and the merge request types it produces.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, SluiceError};
use crate::index::catalog::SegmentCatalog;
use crate::index::segment::SegmentCommitInfo;
use crate::info_stream::{InfoStream, NoOutputInfoStream};
use crate::storage::rate_limit::MergeRateLimiter;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Convert an MB setting to bytes, clamping huge (or infinite) values to `i64::MAX`.
pub fn mb_to_bytes(name: &str, mb: f64) -> Result<u64> {
    if mb.is_nan() || mb < 0.0 {
        return Err(SluiceError::invalid_argument(format!(
            "{name} must be >= 0 (got {mb})"
        )));
    }
    let bytes = mb * BYTES_PER_MB;
    if bytes >= i64::MAX as f64 {
        Ok(i64::MAX as u64)
    } else {
        Ok(bytes as u64)
    }
}

/// Inverse of [`mb_to_bytes`] for getters and log lines.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Why the merge policy is being consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeTrigger {
    /// A buffer was flushed into a new segment.
    SegmentFlush,
    /// All buffers were flushed (explicit flush or commit).
    FullFlush,
    /// The application asked for merges (`maybe_merge`, forced merges).
    Explicit,
    /// A merge finished; cascading merges may now be possible.
    MergeFinished,
    /// The writer is closing.
    Closing,
    /// A commit is about to be written.
    Commit,
}

/// Read-only view of writer state handed to merge policies.
pub trait MergeContext {
    /// Names of segments taking part in a pending or running merge.
    fn merging_segments(&self) -> &HashSet<String>;

    /// Deletes a merge of `info` would reclaim, including unwritten ones.
    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32;

    fn info_stream(&self) -> &dyn InfoStream;
}

/// A [`MergeContext`] assembled by hand; used outside a writer.
#[derive(Debug)]
pub struct SimpleMergeContext {
    merging: HashSet<String>,
    pending_deletes: HashMap<String, u32>,
    info_stream: Arc<dyn InfoStream>,
}

impl Default for SimpleMergeContext {
    fn default() -> Self {
        SimpleMergeContext {
            merging: HashSet::new(),
            pending_deletes: HashMap::new(),
            info_stream: Arc::new(NoOutputInfoStream),
        }
    }
}

impl SimpleMergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_info_stream(mut self, info_stream: Arc<dyn InfoStream>) -> Self {
        self.info_stream = info_stream;
        self
    }

    /// Mark a segment as taking part in an in-flight merge.
    pub fn add_merging(&mut self, name: &str) {
        self.merging.insert(name.to_string());
    }

    pub fn remove_merging(&mut self, name: &str) {
        self.merging.remove(name);
    }

    /// Record deletes not yet reflected in the segment's delete count.
    pub fn set_pending_deletes(&mut self, name: &str, count: u32) {
        self.pending_deletes.insert(name.to_string(), count);
    }
}

impl MergeContext for SimpleMergeContext {
    fn merging_segments(&self) -> &HashSet<String> {
        &self.merging
    }

    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32 {
        let pending = self.pending_deletes.get(info.name()).copied().unwrap_or(0);
        (info.del_count() + pending).min(info.max_doc())
    }

    fn info_stream(&self) -> &dyn InfoStream {
        self.info_stream.as_ref()
    }
}

/// Lifecycle of a [`OneMerge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStatus {
    Pending,
    Running,
    Done,
    Failed,
    Aborted,
}

impl MergeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MergeStatus::Done | MergeStatus::Failed | MergeStatus::Aborted
        )
    }
}

#[derive(Debug)]
struct OneMergeState {
    status: MergeStatus,
    max_num_segments: Option<usize>,
    estimated_merge_bytes: u64,
    total_merge_bytes: u64,
    merged: Option<Arc<SegmentCommitInfo>>,
    error: Option<SluiceError>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

static NEXT_MERGE_ID: AtomicU64 = AtomicU64::new(1);

/// A request to merge a set of segments into one new segment.
pub struct OneMerge {
    id: u64,
    segments: Vec<Arc<SegmentCommitInfo>>,
    total_max_doc: u64,
    rate_limiter: Arc<MergeRateLimiter>,
    state: Mutex<OneMergeState>,
}

impl fmt::Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneMerge")
            .field("id", &self.id)
            .field("segments", &self.seg_string())
            .field("status", &self.status())
            .finish()
    }
}

impl OneMerge {
    /// Create a pending merge; `segments` must not be empty.
    pub fn new(segments: Vec<Arc<SegmentCommitInfo>>) -> Result<Self> {
        if segments.is_empty() {
            return Err(SluiceError::invalid_argument(
                "a merge needs at least one segment",
            ));
        }
        let total_max_doc = segments.iter().map(|s| s.max_doc() as u64).sum();
        let total_merge_bytes = segments.iter().map(|s| s.size_in_bytes()).sum();
        Ok(OneMerge {
            id: NEXT_MERGE_ID.fetch_add(1, Ordering::Relaxed),
            segments,
            total_max_doc,
            rate_limiter: Arc::new(MergeRateLimiter::new()),
            state: Mutex::new(OneMergeState {
                status: MergeStatus::Pending,
                max_num_segments: None,
                estimated_merge_bytes: 0,
                total_merge_bytes,
                merged: None,
                error: None,
                started: None,
                finished: None,
            }),
        })
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segments(&self) -> &[Arc<SegmentCommitInfo>] {
        &self.segments
    }

    pub fn contains(&self, name: &str) -> bool {
        self.segments.iter().any(|s| s.name() == name)
    }

    pub fn total_max_doc(&self) -> u64 {
        self.total_max_doc
    }

    /// Raw byte size of the inputs.
    pub fn total_merge_bytes(&self) -> u64 {
        self.state.lock().total_merge_bytes
    }

    /// Size of the merged segment estimated at registration (deletes excluded).
    pub fn estimated_merge_bytes(&self) -> u64 {
        self.state.lock().estimated_merge_bytes
    }

    pub fn set_estimated_merge_bytes(&self, bytes: u64) {
        self.state.lock().estimated_merge_bytes = bytes;
    }

    /// Target segment count when this merge is part of a forced merge.
    pub fn max_num_segments(&self) -> Option<usize> {
        self.state.lock().max_num_segments
    }

    pub fn set_max_num_segments(&self, max_num_segments: Option<usize>) {
        self.state.lock().max_num_segments = max_num_segments;
    }

    pub fn rate_limiter(&self) -> &Arc<MergeRateLimiter> {
        &self.rate_limiter
    }

    pub fn status(&self) -> MergeStatus {
        self.state.lock().status
    }

    /// `Pending → Running`.
    pub fn mark_running(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != MergeStatus::Pending {
            return Err(SluiceError::illegal_state(format!(
                "merge {} cannot start from {:?}",
                self.id, state.status
            )));
        }
        self.rate_limiter.check_aborted()?;
        state.status = MergeStatus::Running;
        state.started = Some(Instant::now());
        Ok(())
    }

    /// `Running → Done`, remembering the committed segment (if it kept any docs).
    pub fn mark_done(&self, merged: Option<Arc<SegmentCommitInfo>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != MergeStatus::Running {
            return Err(SluiceError::illegal_state(format!(
                "merge {} cannot finish from {:?}",
                self.id, state.status
            )));
        }
        state.status = MergeStatus::Done;
        state.merged = merged;
        state.finished = Some(Instant::now());
        Ok(())
    }

    /// Record a failure. Aborts are recorded as [`MergeStatus::Aborted`].
    pub fn mark_failed(&self, error: SluiceError) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = if matches!(error, SluiceError::MergeAborted(_)) {
            MergeStatus::Aborted
        } else {
            MergeStatus::Failed
        };
        state.error = Some(error);
        state.finished = Some(Instant::now());
    }

    /// Ask the merge to stop; a running merge fails at its next write.
    pub fn abort(&self) {
        self.rate_limiter.abort();
        let mut state = self.state.lock();
        if state.status == MergeStatus::Pending {
            state.status = MergeStatus::Aborted;
            state.finished = Some(Instant::now());
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.rate_limiter.is_aborted()
    }

    pub fn check_aborted(&self) -> Result<()> {
        self.rate_limiter.check_aborted()
    }

    pub fn merged_segment(&self) -> Option<Arc<SegmentCommitInfo>> {
        self.state.lock().merged.clone()
    }

    pub fn error(&self) -> Option<SluiceError> {
        self.state.lock().error.clone()
    }

    /// Time since the merge started running.
    pub fn running_time(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .started
            .map(|started| state.finished.unwrap_or_else(Instant::now) - started)
    }

    /// Pretend the merge started `by` earlier than it did.
    #[cfg(test)]
    pub(crate) fn backdate_start(&self, by: Duration) {
        let mut state = self.state.lock();
        state.started = state.started.and_then(|started| started.checked_sub(by));
    }

    /// Segment list as `_0(10) _1(5)/2`.
    pub fn seg_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Independent merges returned by one policy decision.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    /// `None` when empty, so policies can end with `Ok(spec.into_option())`.
    pub fn into_option(self) -> Option<Self> {
        if self.merges.is_empty() { None } else { Some(self) }
    }

    pub fn seg_string(&self) -> String {
        self.merges
            .iter()
            .enumerate()
            .map(|(i, merge)| format!("{}: {}", i + 1, merge.seg_string()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Decides which segments to merge.
///
/// Implementations must never return a merge that includes a segment listed
/// in [`MergeContext::merging_segments`]. Returning `Ok(None)` means no merge
/// is worth doing right now.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Natural merges after a flush, merge or explicit request.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges towards at most `max_segment_count` segments.
    ///
    /// `segments_to_merge` maps the segments present when the forced merge
    /// started to `true`, and segments produced by it to `false`.
    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &HashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Merges that reclaim deletes.
    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Cheap merges of freshly flushed segments, run before a commit is written.
    fn find_full_flush_merges(
        &self,
        _trigger: MergeTrigger,
        _catalog: &SegmentCatalog,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    /// Byte size pro-rated by the fraction of live documents.
    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        let bytes = info.size_in_bytes();
        let max_doc = info.max_doc();
        if max_doc == 0 {
            return bytes;
        }
        let del_ratio = ctx.num_deletes_to_merge(info) as f64 / max_doc as f64;
        (bytes as f64 * (1.0 - del_ratio)) as u64
    }

    /// Whether a segment needs no further forced merging on its own.
    fn is_merged(
        &self,
        _catalog: &SegmentCatalog,
        info: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        ctx.num_deletes_to_merge(info) == 0
    }
}

/// Keep only the merges of `spec` whose every input is smaller than `max_size`.
///
/// Policies use this to derive cheap full-flush merges from their natural ones.
pub fn keep_merges_below<P: MergePolicy + ?Sized>(
    policy: &P,
    spec: Option<MergeSpecification>,
    max_size: u64,
    ctx: &dyn MergeContext,
) -> Option<MergeSpecification> {
    let spec = spec?;
    let mut small = MergeSpecification::new();
    for merge in spec.merges {
        if merge
            .segments()
            .iter()
            .all(|info| policy.size(info, ctx) < max_size)
        {
            small.add(merge);
        }
    }
    small.into_option()
}

/// A policy that never merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn name(&self) -> &str {
        "no_merge"
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _catalog: &SegmentCatalog,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_merges(
        &self,
        _catalog: &SegmentCatalog,
        _max_segment_count: usize,
        _segments_to_merge: &HashMap<String, bool>,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_deletes_merges(
        &self,
        _catalog: &SegmentCatalog,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn size(&self, _info: &SegmentCommitInfo, _ctx: &dyn MergeContext) -> u64 {
        0
    }
}

/// Which policy entry point produced a specification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyCall {
    Natural(MergeTrigger),
    Forced(usize),
    ForcedDeletes,
    FullFlush(MergeTrigger),
}

type SpecObserver = Arc<dyn Fn(PolicyCall, &MergeSpecification) + Send + Sync>;

/// Decorator forwarding every call to an inner policy.
///
/// An optional observer sees every non-empty specification before it is
/// returned.
#[derive(Clone)]
pub struct FilterMergePolicy {
    inner: Arc<dyn MergePolicy>,
    observer: Option<SpecObserver>,
}

impl fmt::Debug for FilterMergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterMergePolicy")
            .field("inner", &self.inner)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl FilterMergePolicy {
    pub fn new(inner: Arc<dyn MergePolicy>) -> Self {
        FilterMergePolicy {
            inner,
            observer: None,
        }
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(PolicyCall, &MergeSpecification) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn inner(&self) -> &Arc<dyn MergePolicy> {
        &self.inner
    }

    fn observe(
        &self,
        call: PolicyCall,
        spec: Result<Option<MergeSpecification>>,
    ) -> Result<Option<MergeSpecification>> {
        if let (Some(observer), Ok(Some(spec))) = (&self.observer, &spec) {
            observer(call, spec);
        }
        spec
    }
}

impl MergePolicy for FilterMergePolicy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        self.observe(
            PolicyCall::Natural(trigger),
            self.inner.find_merges(trigger, catalog, ctx),
        )
    }

    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &HashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        self.observe(
            PolicyCall::Forced(max_segment_count),
            self.inner
                .find_forced_merges(catalog, max_segment_count, segments_to_merge, ctx),
        )
    }

    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        self.observe(
            PolicyCall::ForcedDeletes,
            self.inner.find_forced_deletes_merges(catalog, ctx),
        )
    }

    fn find_full_flush_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        self.observe(
            PolicyCall::FullFlush(trigger),
            self.inner.find_full_flush_merges(trigger, catalog, ctx),
        )
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        self.inner.size(info, ctx)
    }

    fn is_merged(
        &self,
        catalog: &SegmentCatalog,
        info: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        self.inner.is_merged(catalog, info, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::test_segment;

    #[test]
    fn test_mb_to_bytes_clamps() {
        assert_eq!(mb_to_bytes("x", 1.0).unwrap(), 1024 * 1024);
        assert_eq!(mb_to_bytes("x", f64::INFINITY).unwrap(), i64::MAX as u64);
        assert_eq!(mb_to_bytes("x", 1e300).unwrap(), i64::MAX as u64);
        assert!(mb_to_bytes("x", -1.0).is_err());
        assert!(mb_to_bytes("x", f64::NAN).is_err());
    }

    #[test]
    fn test_one_merge_rejects_empty() {
        assert!(OneMerge::new(Vec::new()).is_err());
    }

    #[test]
    fn test_one_merge_state_machine() {
        let merge = OneMerge::new(vec![
            Arc::new(test_segment("_0", 10, 0, 100)),
            Arc::new(test_segment("_1", 5, 0, 50)),
        ])
        .unwrap();
        assert_eq!(merge.total_max_doc(), 15);
        assert_eq!(merge.total_merge_bytes(), 150);
        assert_eq!(merge.status(), MergeStatus::Pending);
        assert!(merge.mark_done(None).is_err());

        merge.mark_running().unwrap();
        assert!(merge.mark_running().is_err());
        merge.mark_done(None).unwrap();
        assert_eq!(merge.status(), MergeStatus::Done);

        // Terminal states are sticky.
        merge.mark_failed(SluiceError::other("late"));
        assert_eq!(merge.status(), MergeStatus::Done);
        assert!(merge.error().is_none());
    }

    #[test]
    fn test_abort_pending_and_running() {
        let pending = OneMerge::new(vec![Arc::new(test_segment("_0", 1, 0, 1))]).unwrap();
        pending.abort();
        assert_eq!(pending.status(), MergeStatus::Aborted);
        assert!(pending.mark_running().is_err());

        let running = OneMerge::new(vec![Arc::new(test_segment("_1", 1, 0, 1))]).unwrap();
        running.mark_running().unwrap();
        running.abort();
        assert_eq!(running.status(), MergeStatus::Running);
        assert!(running.check_aborted().is_err());
        running.mark_failed(SluiceError::merge_aborted("closing"));
        assert_eq!(running.status(), MergeStatus::Aborted);
    }

    #[test]
    fn test_default_size_is_prorated_by_deletes() {
        let policy = NoMergePolicy;
        let ctx = SimpleMergeContext::new();
        let info = test_segment("_0", 100, 25, 1000);
        let filter = FilterMergePolicy::new(Arc::new(crate::merge::tiered::TieredMergePolicy::new()));
        assert_eq!(filter.size(&info, &ctx), 750);
        assert_eq!(policy.size(&info, &ctx), 0);

        let mut ctx = SimpleMergeContext::new();
        ctx.set_pending_deletes("_0", 25);
        assert_eq!(filter.size(&info, &ctx), 500);
        assert!(!filter.is_merged(&SegmentCatalog::new(), &info, &ctx));
    }

    #[test]
    fn test_filter_observes_specs() {
        use std::sync::atomic::AtomicUsize;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let policy = FilterMergePolicy::new(Arc::new(crate::merge::log::LogMergePolicy::doc()))
            .with_observer(move |call, spec| {
                assert_eq!(call, PolicyCall::Natural(MergeTrigger::Explicit));
                counter.fetch_add(spec.len(), Ordering::SeqCst);
            });

        let mut catalog = SegmentCatalog::new();
        for i in 0..10 {
            let name = catalog.new_segment_name();
            catalog
                .add(Arc::new(test_segment(&name, 1000 + i, 0, 1000)))
                .unwrap();
        }
        let spec = policy
            .find_merges(MergeTrigger::Explicit, &catalog, &SimpleMergeContext::new())
            .unwrap();
        assert!(spec.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(policy.name(), "log_doc");
    }
}
