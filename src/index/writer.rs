//! The index writer.
//!
//! Documents are buffered per indexing thread and flushed as new segments
//! when [`FlushControl`] says so. Deletes are numbered with the documents
//! and applied to flushed segments through the [`ReaderPool`]. After every
//! flush the merge policy is asked for merges, which are registered here and
//! run by the configured [`MergeScheduler`]; the writer is the
//! [`MergeSource`] the scheduler pulls them from.
//!
//! Lock order: scheduler lock, then the writer state lock, then the flush
//! control and reader pool locks. The writer never calls into the scheduler
//! while holding its state lock.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::codec::{Codec, CodecRegistry, MergeReader, MergeState, default_codecs};
use crate::document::{Document, Term};
use crate::error::{Result, SluiceError};
use crate::index::catalog::{PENDING_SEGMENTS_PREFIX, SEGMENTS_PREFIX, SegmentCatalog};
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::delete_queue::DeleteQueue;
use crate::index::dwpt::{DocumentsBuffer, FlushedSegment};
use crate::index::flush::{FlushByRamOrCountsPolicy, FlushPolicy};
use crate::index::flush_control::FlushControl;
use crate::index::reader_pool::ReaderPool;
use crate::index::segment::{SegmentCommitInfo, SegmentDiagnostics, SegmentInfo};
use crate::info_stream::{InfoStream, LoggingInfoStream};
use crate::merge::concurrent::ConcurrentMergeScheduler;
use crate::merge::{MergePolicyRegistry, default_merge_policies};
use crate::merge::executor::MergeTask;
use crate::merge::policy::{MergeContext, MergePolicy, MergeTrigger, OneMerge};
use crate::merge::scheduler::{MergeScheduler, MergeSource};
use crate::storage::rate_limit::RateLimitedDirectory;
use crate::storage::{Directory, total_file_length};

const COMPONENT: &str = "IW";

/// How often blocked waiters re-check writer state.
const WAIT_INTERVAL: Duration = Duration::from_millis(1000);

/// How often a full flush re-checks for buffers flushed by other threads.
const FULL_FLUSH_POLL: Duration = Duration::from_millis(100);

/// Document counts of a writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocStats {
    /// Documents in segments and buffers, deleted or not.
    pub max_doc: u64,
    /// Documents not deleted.
    pub num_docs: u64,
}

/// Segment name of an index file: `_3` for `_3.sfd` and `_3_2.liv`.
fn segment_name_of(file: &str) -> Option<&str> {
    let rest = file.strip_prefix('_')?;
    let end = rest.find(['.', '_']).map_or(file.len(), |i| i + 1);
    Some(&file[..end])
}

struct WriterState {
    catalog: SegmentCatalog,
    /// Files of the latest commit point; never deleted until superseded.
    last_commit_files: BTreeSet<String>,
    merge_policy: Arc<dyn MergePolicy>,
    /// Segments that are inputs of a registered merge.
    merging: HashSet<String>,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: HashMap<u64, Arc<OneMerge>>,
    segments_to_merge: HashMap<String, bool>,
    /// Failed forced merges, reported to the thread waiting on the forced merge.
    merge_exceptions: Vec<Arc<OneMerge>>,
    /// Segments being written by flushes and merges.
    in_flight: HashSet<String>,
    stop_merges: bool,
    closing: bool,
    closed: bool,
    tragedy: Option<SluiceError>,
}

impl WriterState {
    fn max_num_segments_merges_pending(&self) -> bool {
        self.pending_merges
            .iter()
            .chain(self.running_merges.values())
            .any(|merge| merge.max_num_segments().is_some())
    }

    fn release_merge(&mut self, merge: &OneMerge) {
        for segment in merge.segments() {
            self.merging.remove(segment.name());
        }
        self.running_merges.remove(&merge.id());
    }
}

/// The view of the writer handed to merge policies.
struct WriterMergeContext<'a> {
    merging: &'a HashSet<String>,
    reader_pool: &'a ReaderPool,
    info_stream: &'a dyn InfoStream,
}

impl MergeContext for WriterMergeContext<'_> {
    fn merging_segments(&self) -> &HashSet<String> {
        self.merging
    }

    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32 {
        (info.del_count() + self.reader_pool.pending_deletes(info.name())).min(info.max_doc())
    }

    fn info_stream(&self) -> &dyn InfoStream {
        self.info_stream
    }
}

struct WriterInner {
    directory: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    config: IndexWriterConfig,
    scheduler: Arc<dyn MergeScheduler>,
    info_stream: Arc<dyn InfoStream>,
    state: Mutex<WriterState>,
    /// Signalled when a merge finishes and when the writer closes.
    merge_cond: Condvar,
    flush_control: FlushControl,
    delete_queue: DeleteQueue,
    reader_pool: ReaderPool,
    full_flush_lock: Mutex<()>,
    commit_lock: Mutex<()>,
    this: Weak<WriterInner>,
}

/// Builds an [`IndexWriter`] with non-default components.
pub struct IndexWriterBuilder {
    directory: Arc<dyn Directory>,
    config: IndexWriterConfig,
    merge_policy: Option<Arc<dyn MergePolicy>>,
    merge_scheduler: Option<Arc<dyn MergeScheduler>>,
    flush_policy: Option<Arc<dyn FlushPolicy>>,
    info_stream: Option<Arc<dyn InfoStream>>,
    codecs: CodecRegistry,
    merge_policies: MergePolicyRegistry,
}

impl IndexWriterBuilder {
    pub fn new(directory: Arc<dyn Directory>, config: IndexWriterConfig) -> Self {
        IndexWriterBuilder {
            directory,
            config,
            merge_policy: None,
            merge_scheduler: None,
            flush_policy: None,
            info_stream: None,
            codecs: default_codecs(),
            merge_policies: default_merge_policies(),
        }
    }

    /// Use this policy instead of looking up `config.merge_policy`.
    pub fn merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    pub fn merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = Some(scheduler);
        self
    }

    pub fn flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.flush_policy = Some(policy);
        self
    }

    pub fn info_stream(mut self, info_stream: Arc<dyn InfoStream>) -> Self {
        self.info_stream = Some(info_stream);
        self
    }

    /// Registry `config.codec` is looked up in.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Registry `config.merge_policy` is looked up in.
    pub fn merge_policies(mut self, policies: MergePolicyRegistry) -> Self {
        self.merge_policies = policies;
        self
    }

    pub fn open(self) -> Result<IndexWriter> {
        self.config.validate()?;
        let codec = self.codecs.lookup(&self.config.codec)?;
        let merge_policy = match self.merge_policy {
            Some(policy) => policy,
            None => self.merge_policies.lookup(&self.config.merge_policy)?,
        };
        let scheduler = self
            .merge_scheduler
            .unwrap_or_else(|| Arc::new(ConcurrentMergeScheduler::new()));
        let info_stream = self
            .info_stream
            .unwrap_or_else(|| Arc::new(LoggingInfoStream));
        let flush_policy = self
            .flush_policy
            .unwrap_or_else(|| Arc::new(FlushByRamOrCountsPolicy));
        let directory = self.directory;

        let latest = SegmentCatalog::read_latest(directory.as_ref())?;
        let (catalog, last_commit_files) = match (self.config.open_mode, latest) {
            (OpenMode::Append, None) => {
                return Err(SluiceError::illegal_state(format!(
                    "no commit found in {directory:?}"
                )));
            }
            (OpenMode::Create, Some(mut catalog)) => {
                // The old commit stays on disk until the first commit replaces it.
                let files = catalog.files(true);
                catalog.clear();
                (catalog, files)
            }
            (_, Some(catalog)) => {
                let files = catalog.files(true);
                (catalog, files)
            }
            (_, None) => (SegmentCatalog::new(), BTreeSet::new()),
        };

        if info_stream.is_enabled(COMPONENT) {
            info_stream.message(
                COMPONENT,
                &format!(
                    "open {:?}: mode={:?} segments={} policy={} scheduler={scheduler:?}",
                    directory,
                    self.config.open_mode,
                    catalog.describe(),
                    merge_policy.name(),
                ),
            );
        }

        let flush_control = FlushControl::new(&self.config, flush_policy, Arc::clone(&info_stream));
        let reader_pool = ReaderPool::new(Arc::clone(&directory), Arc::clone(&codec));
        let inner = Arc::new_cyclic(|this| WriterInner {
            directory,
            codec,
            config: self.config,
            scheduler,
            info_stream,
            state: Mutex::new(WriterState {
                catalog,
                last_commit_files,
                merge_policy,
                merging: HashSet::new(),
                pending_merges: VecDeque::new(),
                running_merges: HashMap::new(),
                segments_to_merge: HashMap::new(),
                merge_exceptions: Vec::new(),
                in_flight: HashSet::new(),
                stop_merges: false,
                closing: false,
                closed: false,
                tragedy: None,
            }),
            merge_cond: Condvar::new(),
            flush_control,
            delete_queue: DeleteQueue::new(),
            reader_pool,
            full_flush_lock: Mutex::new(()),
            commit_lock: Mutex::new(()),
            this: this.clone(),
        });

        inner.delete_unreferenced_files(&inner.state.lock());
        inner
            .scheduler
            .initialize(Arc::clone(&inner.info_stream), inner.directory.as_ref());
        Ok(IndexWriter { inner })
    }
}

/// Adds, updates and deletes documents, and keeps the index merged.
///
/// All methods take `&self`; share the writer between indexing threads with
/// an `Arc`.
///
/// ```
/// use std::sync::Arc;
/// use sluice::document::{Document, Term};
/// use sluice::index::config::IndexWriterConfig;
/// use sluice::index::writer::IndexWriter;
/// use sluice::storage::memory::RamDirectory;
///
/// let writer = IndexWriter::open(Arc::new(RamDirectory::new()), IndexWriterConfig::default()).unwrap();
/// writer.add_document(Document::builder().add_text("id", "1").build()).unwrap();
/// writer.delete_documents(Term::new("id", "1")).unwrap();
/// writer.commit().unwrap();
/// assert_eq!(writer.doc_stats().num_docs, 0);
/// writer.close().unwrap();
/// ```
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

impl fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriter")
            .field("directory", &self.inner.directory)
            .field("segments", &self.inner.state.lock().catalog.describe())
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer with the default components.
    pub fn open(directory: Arc<dyn Directory>, config: IndexWriterConfig) -> Result<Self> {
        IndexWriterBuilder::new(directory, config).open()
    }

    pub fn builder(directory: Arc<dyn Directory>, config: IndexWriterConfig) -> IndexWriterBuilder {
        IndexWriterBuilder::new(directory, config)
    }

    /// Buffer a document; returns its sequence number.
    pub fn add_document(&self, doc: Document) -> Result<u64> {
        self.inner.update_document(None, doc)
    }

    /// Atomically delete the documents matching `term` and add `doc`.
    pub fn update_document(&self, term: Term, doc: Document) -> Result<u64> {
        self.inner.update_document(Some(term), doc)
    }

    /// Delete every document matching `term` added before this call.
    pub fn delete_documents(&self, term: Term) -> Result<u64> {
        self.inner.delete_documents(term)
    }

    /// Flush every buffered document to a segment without committing.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if self.inner.flush_all_buffers()? {
            self.inner.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(())
    }

    /// Write a new commit point; returns its generation.
    pub fn commit(&self) -> Result<u64> {
        self.inner.commit()
    }

    /// Merge down to at most `max_num_segments` segments.
    ///
    /// With `wait` the call returns once every merge the request needs is done
    /// and surfaces the first one that failed.
    pub fn force_merge(&self, max_num_segments: usize, wait: bool) -> Result<()> {
        self.inner.force_merge(max_num_segments, wait)
    }

    /// Merge away segments whose deleted documents pass the policy's threshold.
    pub fn force_merge_deletes(&self, wait: bool) -> Result<()> {
        self.inner.force_merge_deletes(wait)
    }

    /// Ask the merge policy for merges and hand them to the scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.maybe_merge(MergeTrigger::Explicit)
    }

    /// Block until no merge is pending or running.
    pub fn wait_for_merges(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.wait_for_merges(MergeTrigger::Explicit)
    }

    /// Discard everything since the last commit and close.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    /// Commit (or roll back, per `commit_on_close`), wait for merges and close.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn doc_stats(&self) -> DocStats {
        self.inner.doc_stats()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().catalog.len()
    }

    /// Segments of the current in-memory catalog.
    pub fn segments(&self) -> Vec<Arc<SegmentCommitInfo>> {
        self.inner.state.lock().catalog.segments().to_vec()
    }

    /// Human-readable segment list.
    pub fn segments_description(&self) -> String {
        self.inner.state.lock().catalog.describe()
    }

    pub fn pending_merge_count(&self) -> usize {
        self.inner.state.lock().pending_merges.len()
    }

    pub fn running_merge_count(&self) -> usize {
        self.inner.state.lock().running_merges.len()
    }

    pub fn merge_policy(&self) -> Arc<dyn MergePolicy> {
        Arc::clone(&self.inner.state.lock().merge_policy)
    }

    /// Replace the merge policy; merges already registered are unaffected.
    pub fn set_merge_policy(&self, policy: Arc<dyn MergePolicy>) {
        let mut state = self.inner.state.lock();
        self.inner.message(|| format!("set merge policy {}", policy.name()));
        state.merge_policy = policy;
    }

    pub fn merge_scheduler(&self) -> &Arc<dyn MergeScheduler> {
        &self.inner.scheduler
    }

    pub fn set_ram_buffer_size_mb(&self, mb: Option<f64>) -> Result<()> {
        self.inner.flush_control.set_ram_buffer_size_mb(mb)
    }

    pub fn set_max_buffered_docs(&self, docs: Option<usize>) -> Result<()> {
        self.inner.flush_control.set_max_buffered_docs(docs)
    }

    pub fn flush_control(&self) -> &FlushControl {
        &self.inner.flush_control
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.directory
    }

    /// RAM held by buffered documents and deletes.
    pub fn ram_bytes_used(&self) -> usize {
        let control = &self.inner.flush_control;
        control.active_bytes() + control.flush_bytes() + control.delete_bytes()
    }

    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.closed || state.tragedy.is_some()
    }

    /// The error that forced the writer closed, if any.
    pub fn tragic_exception(&self) -> Option<SluiceError> {
        self.inner.state.lock().tragedy.clone()
    }
}

impl WriterInner {
    fn message<F: FnOnce() -> String>(&self, message: F) {
        if self.info_stream.is_enabled(COMPONENT) {
            self.info_stream.message(COMPONENT, &message());
        }
    }

    fn source(&self) -> Result<Arc<dyn MergeSource>> {
        self.this
            .upgrade()
            .map(|inner| inner as Arc<dyn MergeSource>)
            .ok_or_else(|| SluiceError::already_closed("writer dropped"))
    }

    fn check_open(state: &WriterState) -> Result<()> {
        if let Some(tragedy) = &state.tragedy {
            return Err(SluiceError::closed_by_tragedy(tragedy));
        }
        if state.closed || state.closing {
            return Err(SluiceError::already_closed("this writer is closed"));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        Self::check_open(&self.state.lock())
    }

    // ---- documents and deletes ----

    fn update_document(&self, delete: Option<Term>, doc: Document) -> Result<u64> {
        self.ensure_open()?;
        let mut flushed = self.pre_update()?;
        let is_update = delete.is_some();
        if let Some(term) = delete {
            self.buffer_delete(term)?;
        }

        let mut buffer = self.flush_control.obtain_buffer(self.delete_queue.peek_seq_no());
        let seq_no = self.delete_queue.next_seq_no();
        buffer.add(doc, seq_no);
        let to_flush = self.flush_control.after_document(buffer, is_update);

        flushed |= self.post_update(to_flush)?;
        if flushed {
            self.maybe_merge(MergeTrigger::SegmentFlush)?;
        }
        Ok(seq_no)
    }

    fn delete_documents(&self, term: Term) -> Result<u64> {
        self.ensure_open()?;
        let mut flushed = self.pre_update()?;
        let seq_no = self.buffer_delete(term)?;
        flushed |= self.post_update(None)?;
        if flushed {
            self.maybe_merge(MergeTrigger::SegmentFlush)?;
        }
        Ok(seq_no)
    }

    /// Help flush queued buffers, then wait while indexing is stalled.
    fn pre_update(&self) -> Result<bool> {
        let mut flushed = false;
        while self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes() > 0 {
            match self.flush_control.next_pending_flush() {
                Some(buffer) => {
                    self.do_flush(buffer)?;
                    flushed = true;
                }
                None => {
                    self.flush_control.wait_if_stalled();
                    break;
                }
            }
        }
        Ok(flushed)
    }

    fn post_update(&self, to_flush: Option<DocumentsBuffer>) -> Result<bool> {
        let mut flushed = false;
        if let Some(buffer) = to_flush {
            self.do_flush(buffer)?;
            flushed = true;
        }
        while let Some(buffer) = self.flush_control.next_pending_flush() {
            self.do_flush(buffer)?;
            flushed = true;
        }
        if self.flush_control.get_and_reset_apply_all_deletes() {
            self.message(|| "apply all deletes: flushing every buffer".to_string());
            flushed |= self.flush_all_buffers()?;
        }
        Ok(flushed)
    }

    /// Queue a delete and apply it to every flushed segment.
    fn buffer_delete(&self, term: Term) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let (seq_no, bytes) = self.delete_queue.add(term.clone());
        let mut deleted = 0;
        for info in state.catalog.iter() {
            deleted += self.reader_pool.delete_term(info, &term)?;
        }
        if deleted > 0 {
            state.catalog.changed();
        }
        drop(state);

        self.flush_control.on_delete(bytes);
        self.message(|| format!("delete {term:?} seq={seq_no}: {deleted} flushed docs deleted"));
        Ok(seq_no)
    }

    fn prune_deletes(&self) {
        let floor = self
            .flush_control
            .min_outstanding_seq_no()
            .unwrap_or_else(|| self.delete_queue.peek_seq_no());
        let bytes = self.delete_queue.prune_before(floor);
        self.flush_control.set_delete_bytes(bytes);
    }

    // ---- flushing ----

    fn do_flush(&self, buffer: DocumentsBuffer) -> Result<()> {
        let buffer_id = buffer.id();
        let result = self.flush_buffer(buffer);
        if result.is_err() {
            self.flush_control.after_flush(buffer_id);
        }
        self.prune_deletes();
        result
    }

    fn flush_buffer(&self, buffer: DocumentsBuffer) -> Result<()> {
        if buffer.num_docs() == 0 {
            self.flush_control.after_flush(buffer.id());
            return Ok(());
        }
        let name = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            let name = state.catalog.new_segment_name();
            state.in_flight.insert(name.clone());
            name
        };
        let num_docs = buffer.num_docs();
        let started = Instant::now();
        match buffer.flush(name.clone(), self.directory.as_ref(), &self.codec) {
            Ok(flushed) => {
                self.message(|| {
                    format!(
                        "flushed {name}: {num_docs} docs, {} bytes in {:?}",
                        flushed.size_in_bytes,
                        started.elapsed()
                    )
                });
                self.publish_flushed_segment(flushed)
            }
            Err(error) => {
                self.state.lock().in_flight.remove(&name);
                self.message(|| format!("flush of {name} failed: {error}"));
                Err(error)
            }
        }
    }

    fn publish_flushed_segment(&self, flushed: FlushedSegment) -> Result<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&flushed.name);

        if let Err(error) = Self::check_open(&state) {
            self.flush_control.after_flush(flushed.buffer_id);
            self.delete_unreferenced_files(&state);
            return Err(error);
        }

        // The buffer keeps holding back delete pruning until its deletes are resolved.
        let deleted = self.delete_queue.resolve(&flushed.docs, &flushed.seq_nos);
        self.flush_control.after_flush(flushed.buffer_id);
        let max_doc = flushed.docs.len() as u32;
        if deleted.len() as u32 == max_doc {
            self.message(|| format!("dropping flushed segment {}: every document was deleted", flushed.name));
            self.delete_unreferenced_files(&state);
            return Ok(());
        }

        let info = Arc::new(SegmentCommitInfo::new(
            SegmentInfo {
                name: flushed.name,
                max_doc,
                codec: self.codec.name().to_string(),
                files: flushed.files,
                diagnostics: SegmentDiagnostics::flush(),
            },
            0,
            flushed.size_in_bytes,
        ));
        self.reader_pool.register(&info, flushed.postings);
        if !deleted.is_empty() {
            self.reader_pool.delete_docs(&info, deleted)?;
        }
        state.catalog.add(Arc::clone(&info))?;
        self.message(|| format!("publish flushed segment {info}"));
        Ok(())
    }

    /// Flush every buffer, including ones other threads are filling.
    ///
    /// Returns whether any segment was written.
    fn flush_all_buffers(&self) -> Result<bool> {
        let _full_flush = self.full_flush_lock.lock();
        let segments_before = self.state.lock().catalog.counter();
        let mut first_error = None;

        for buffer in self.flush_control.mark_for_full_flush() {
            if let Err(error) = self.do_flush(buffer) {
                first_error.get_or_insert(error);
            }
        }
        loop {
            while let Some(buffer) = self.flush_control.next_pending_flush() {
                if let Err(error) = self.do_flush(buffer) {
                    first_error.get_or_insert(error);
                }
            }
            if self.flush_control.wait_for_flush(FULL_FLUSH_POLL) {
                break;
            }
            let state = self.state.lock();
            if state.tragedy.is_some() || state.closed {
                break;
            }
        }
        self.flush_control.finish_full_flush();
        self.prune_deletes();

        let flushed = self.state.lock().catalog.counter() != segments_before;
        match first_error {
            Some(error) => Err(error),
            None => Ok(flushed),
        }
    }

    // ---- merge registration ----

    fn maybe_merge(&self, trigger: MergeTrigger) -> Result<()> {
        self.update_pending_merges(trigger, None)?;
        self.scheduler.merge(self.source()?, trigger)
    }

    /// Ask the policy for merges and register them.
    fn update_pending_merges(
        &self,
        trigger: MergeTrigger,
        max_num_segments: Option<usize>,
    ) -> Result<Vec<Arc<OneMerge>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stop_merges || state.tragedy.is_some() {
            return Ok(Vec::new());
        }
        let policy = Arc::clone(&state.merge_policy);
        let spec = {
            let ctx = WriterMergeContext {
                merging: &state.merging,
                reader_pool: &self.reader_pool,
                info_stream: self.info_stream.as_ref(),
            };
            match max_num_segments {
                Some(max) => {
                    policy.find_forced_merges(&state.catalog, max, &state.segments_to_merge, &ctx)?
                }
                None => policy.find_merges(trigger, &state.catalog, &ctx)?,
            }
        };
        let mut registered = Vec::new();
        if let Some(spec) = spec {
            self.message(|| format!("{trigger:?}: policy found {}", spec.seg_string()));
            for merge in spec.merges {
                if max_num_segments.is_some() {
                    merge.set_max_num_segments(max_num_segments);
                }
                registered.push(self.register_merge(state, merge)?);
            }
        }
        Ok(registered)
    }

    fn register_merge(&self, state: &mut WriterState, merge: OneMerge) -> Result<Arc<OneMerge>> {
        for segment in merge.segments() {
            if !state.catalog.contains(segment.name()) {
                return Err(SluiceError::illegal_state(format!(
                    "merge {} references segment {} which is not in the index",
                    merge.seg_string(),
                    segment.name()
                )));
            }
            if state.merging.contains(segment.name()) {
                debug_assert!(false, "segment {} registered in two merges", segment.name());
                return Err(SluiceError::illegal_state(format!(
                    "segment {} is already being merged",
                    segment.name()
                )));
            }
        }

        let estimated: u64 = merge
            .segments()
            .iter()
            .map(|segment| {
                let max_doc = segment.max_doc();
                if max_doc == 0 {
                    return segment.size_in_bytes();
                }
                let deletes = (segment.del_count() + self.reader_pool.pending_deletes(segment.name()))
                    .min(max_doc);
                let live_ratio = 1.0 - deletes as f64 / max_doc as f64;
                (segment.size_in_bytes() as f64 * live_ratio) as u64
            })
            .sum();
        merge.set_estimated_merge_bytes(estimated);

        for segment in merge.segments() {
            state.merging.insert(segment.name().to_string());
        }
        let merge = Arc::new(merge);
        state.pending_merges.push_back(Arc::clone(&merge));
        self.message(|| {
            format!(
                "registered merge {} ({} estimated bytes, max segments {:?})",
                merge.seg_string(),
                estimated,
                merge.max_num_segments()
            )
        });
        Ok(merge)
    }

    // ---- running merges ----

    fn run_merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        let result = match self.merge_init(merge) {
            Ok(name) => {
                let result = self.merge_segments(merge, &name);
                self.state.lock().in_flight.remove(&name);
                result
            }
            Err(error) => Err(error),
        };

        if let Err(error) = result {
            merge.mark_failed(error.clone());
            let mut state = self.state.lock();
            if merge.max_num_segments().is_some() && !merge.is_aborted() {
                state.merge_exceptions.push(Arc::clone(merge));
            }
            self.delete_unreferenced_files(&state);
            self.merge_cond.notify_all();
            drop(state);
            self.message(|| format!("merge {} failed: {error}", merge.seg_string()));
            return Err(error);
        }

        let cascade = {
            let state = self.state.lock();
            !state.closing && !state.closed
        };
        if cascade || merge.max_num_segments().is_some() {
            if let Err(error) = self.update_pending_merges(MergeTrigger::MergeFinished, merge.max_num_segments()) {
                self.message(|| format!("finding merges after {} failed: {error}", merge.seg_string()));
            }
        }
        Ok(())
    }

    /// Check the merge may start and allocate the merged segment's name.
    fn merge_init(&self, merge: &OneMerge) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(tragedy) = &state.tragedy {
            return Err(SluiceError::closed_by_tragedy(tragedy));
        }
        if state.stop_merges {
            merge.abort();
        }
        merge.check_aborted()?;
        for segment in merge.segments() {
            if !state.catalog.contains(segment.name()) {
                return Err(SluiceError::illegal_state(format!(
                    "merge input {} left the index",
                    segment.name()
                )));
            }
        }
        let name = state.catalog.new_segment_name();
        state.in_flight.insert(name.clone());
        Ok(name)
    }

    fn merge_segments(&self, merge: &Arc<OneMerge>, name: &str) -> Result<()> {
        let started = Instant::now();
        let readers = {
            let _state = self.state.lock();
            let mut readers = Vec::with_capacity(merge.segments().len());
            for segment in merge.segments() {
                let (postings, live_docs) = self.reader_pool.snapshot(segment)?;
                readers.push(MergeReader::new(
                    Arc::clone(segment),
                    live_docs,
                    postings,
                    Arc::clone(&self.codec),
                    Arc::clone(&self.directory),
                ));
            }
            readers
        };
        self.message(|| format!("merging {} into {name}", merge.seg_string()));

        let directory: Arc<dyn Directory> = Arc::new(RateLimitedDirectory::new(
            Arc::clone(&self.directory),
            Arc::clone(merge.rate_limiter()),
        ));
        let merge_state = MergeState::new(name.to_string(), readers, directory);
        let files = {
            let codec = &self.codec;
            let ms = &merge_state;
            let tasks: Vec<MergeTask<'_>> = vec![
                Box::new(move || codec.stored_fields().merge(ms)),
                Box::new(move || codec.postings().merge(ms)),
            ];
            self.scheduler.intra_merge_executor(merge).execute(merge, tasks)?
        };
        merge.check_aborted()?;
        let size = total_file_length(self.directory.as_ref(), &files)?;
        self.commit_merge(merge, merge_state, files, size)?;
        self.message(|| {
            format!(
                "merged {} into {name} in {:?} ({} bytes)",
                merge.seg_string(),
                started.elapsed(),
                size
            )
        });
        Ok(())
    }

    /// Swap the merged segment in, carrying over deletes made while merging.
    fn commit_merge(
        &self,
        merge: &OneMerge,
        merge_state: MergeState,
        files: Vec<String>,
        size: u64,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(tragedy) = &state.tragedy {
            return Err(SluiceError::closed_by_tragedy(tragedy));
        }
        if state.stop_merges {
            merge.abort();
        }
        merge.check_aborted()?;

        let mut carried = Vec::new();
        for (reader, doc_map) in merge_state.readers.iter().zip(&merge_state.doc_maps) {
            let Some(current) = self.reader_pool.live_docs(reader.segment.name()) else {
                continue;
            };
            for doc in 0..reader.segment.max_doc() {
                let was_live = reader
                    .live_docs
                    .as_ref()
                    .is_none_or(|bits| bits.get(doc as usize).unwrap_or(false));
                if was_live && !current.get(doc as usize).unwrap_or(false) {
                    carried.extend(doc_map.get(doc));
                }
            }
        }

        let name = merge_state.segment_name;
        let max_doc = merge_state.max_doc;
        let merged = if carried.len() as u32 == max_doc {
            self.message(|| format!("dropping merged segment {name}: every document was deleted"));
            None
        } else {
            Some(Arc::new(SegmentCommitInfo::new(
                SegmentInfo {
                    name: name.clone(),
                    max_doc,
                    codec: self.codec.name().to_string(),
                    files: files.into_iter().collect(),
                    diagnostics: SegmentDiagnostics::merge(merge.max_num_segments()),
                },
                0,
                size,
            )))
        };

        state.catalog.apply_merge_changes(merge.segments(), merged.clone())?;
        for segment in merge.segments() {
            self.reader_pool.drop_segment(segment.name());
            state.segments_to_merge.remove(segment.name());
        }
        if let Some(info) = &merged {
            if !carried.is_empty() {
                self.message(|| format!("carry over {} deletes into {name}", carried.len()));
                self.reader_pool.delete_docs(info, carried)?;
            }
            if merge.max_num_segments().is_some() {
                state.segments_to_merge.insert(name.clone(), false);
            }
        }
        merge.mark_done(merged)?;
        self.delete_unreferenced_files(state);
        Ok(())
    }

    fn abort_merges(&self, state: &mut WriterState) {
        while let Some(merge) = state.pending_merges.pop_front() {
            merge.abort();
            state.release_merge(&merge);
        }
        for merge in state.running_merges.values() {
            merge.abort();
        }
        self.merge_cond.notify_all();
    }

    /// Hand pending merges to the scheduler and wait until none is left.
    fn wait_for_merges(&self, trigger: MergeTrigger) -> Result<()> {
        let mut previous_pending: Option<Vec<u64>> = None;
        loop {
            self.scheduler.merge(self.source()?, trigger)?;
            let mut state = self.state.lock();
            if state.pending_merges.is_empty() && state.running_merges.is_empty() {
                return Ok(());
            }
            if state.tragedy.is_some() {
                return Ok(());
            }
            if state.running_merges.is_empty() {
                // Nothing runs the pending merges; give up once the scheduler ignores them twice.
                let pending: Vec<u64> = state.pending_merges.iter().map(|m| m.id()).collect();
                if previous_pending.as_ref() == Some(&pending) {
                    self.message(|| format!("scheduler left {} merges pending", pending.len()));
                    return Ok(());
                }
                previous_pending = Some(pending);
                continue;
            }
            previous_pending = None;
            self.merge_cond.wait_for(&mut state, WAIT_INTERVAL);
        }
    }

    // ---- forced merges ----

    fn force_merge(&self, max_num_segments: usize, wait: bool) -> Result<()> {
        if max_num_segments < 1 {
            return Err(SluiceError::invalid_argument(format!(
                "max_num_segments must be >= 1, got {max_num_segments}"
            )));
        }
        self.ensure_open()?;
        self.message(|| format!("force merge to {max_num_segments} segments"));
        self.flush_all_buffers()?;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            Self::check_open(state)?;
            state.merge_exceptions.clear();
            state.segments_to_merge = state
                .catalog
                .iter()
                .map(|segment| (segment.name().to_string(), true))
                .collect();
            for merge in state.pending_merges.iter().chain(state.running_merges.values()) {
                merge.set_max_num_segments(Some(max_num_segments));
            }
        }
        self.update_pending_merges(MergeTrigger::Explicit, Some(max_num_segments))?;
        self.scheduler.merge(self.source()?, MergeTrigger::Explicit)?;

        if wait {
            let mut state = self.state.lock();
            loop {
                if let Some(tragedy) = &state.tragedy {
                    return Err(SluiceError::closed_by_tragedy(tragedy));
                }
                if let Some(failed) = state.merge_exceptions.first() {
                    let cause = failed
                        .error()
                        .unwrap_or_else(|| SluiceError::other("merge failed"));
                    return Err(SluiceError::merge_failed(failed.seg_string(), cause));
                }
                if !state.max_num_segments_merges_pending() {
                    break;
                }
                if state.closed {
                    return Err(SluiceError::already_closed("writer closed during force merge"));
                }
                self.merge_cond.wait_for(&mut state, WAIT_INTERVAL);
            }
        }
        Ok(())
    }

    fn force_merge_deletes(&self, wait: bool) -> Result<()> {
        self.ensure_open()?;
        self.flush_all_buffers()?;
        let merges = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            Self::check_open(state)?;
            let policy = Arc::clone(&state.merge_policy);
            let spec = {
                let ctx = WriterMergeContext {
                    merging: &state.merging,
                    reader_pool: &self.reader_pool,
                    info_stream: self.info_stream.as_ref(),
                };
                policy.find_forced_deletes_merges(&state.catalog, &ctx)?
            };
            let mut merges = Vec::new();
            if let Some(spec) = spec {
                self.message(|| format!("force merge deletes: {}", spec.seg_string()));
                for merge in spec.merges {
                    merges.push(self.register_merge(state, merge)?);
                }
            }
            merges
        };
        self.scheduler.merge(self.source()?, MergeTrigger::Explicit)?;

        if wait {
            let mut state = self.state.lock();
            loop {
                if let Some(tragedy) = &state.tragedy {
                    return Err(SluiceError::closed_by_tragedy(tragedy));
                }
                if let Some(failed) = merges.iter().find(|m| m.error().is_some() && !m.is_aborted()) {
                    let cause = failed
                        .error()
                        .unwrap_or_else(|| SluiceError::other("merge failed"));
                    return Err(SluiceError::merge_failed(failed.seg_string(), cause));
                }
                let outstanding = merges.iter().any(|merge| {
                    !merge.status().is_terminal()
                        || state.running_merges.contains_key(&merge.id())
                });
                if !outstanding {
                    break;
                }
                if state.closed {
                    return Err(SluiceError::already_closed("writer closed during force merge deletes"));
                }
                self.merge_cond.wait_for(&mut state, WAIT_INTERVAL);
            }
        }
        Ok(())
    }

    // ---- commit, rollback, close ----

    fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let _commit = self.commit_lock.lock();
        let flushed = self.flush_all_buffers()?;
        self.merge_on_commit()?;
        let generation = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            self.write_commit(&mut state)?
        };
        if flushed {
            self.maybe_merge(MergeTrigger::FullFlush)?;
        }
        Ok(generation)
    }

    fn write_commit(&self, state: &mut WriterState) -> Result<u64> {
        let replaced = self.reader_pool.write_all_live_docs()?;
        if !replaced.is_empty() {
            state.catalog.changed();
        }
        let file = state.catalog.commit(self.directory.as_ref())?;
        state.last_commit_files = state.catalog.files(true);
        self.delete_unreferenced_files(state);
        self.message(|| format!("commit: wrote {file} [{}]", state.catalog.describe()));
        Ok(state.catalog.generation())
    }

    /// Give cheap merges of freshly flushed segments a bounded chance to
    /// finish before the commit point is written.
    fn merge_on_commit(&self) -> Result<()> {
        let wait_millis = self.config.max_full_flush_merge_wait_millis;
        if wait_millis == 0 {
            return Ok(());
        }
        let merges = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stop_merges || state.tragedy.is_some() {
                return Ok(());
            }
            let policy = Arc::clone(&state.merge_policy);
            let spec = {
                let ctx = WriterMergeContext {
                    merging: &state.merging,
                    reader_pool: &self.reader_pool,
                    info_stream: self.info_stream.as_ref(),
                };
                policy.find_full_flush_merges(MergeTrigger::Commit, &state.catalog, &ctx)?
            };
            let mut merges = Vec::new();
            if let Some(spec) = spec {
                for merge in spec.merges {
                    merges.push(self.register_merge(state, merge)?);
                }
            }
            merges
        };
        if merges.is_empty() {
            return Ok(());
        }

        self.message(|| format!("commit waits up to {wait_millis} ms for {} merges", merges.len()));
        self.scheduler.merge(self.source()?, MergeTrigger::Commit)?;
        let deadline = Instant::now() + Duration::from_millis(wait_millis);
        let mut state = self.state.lock();
        while merges.iter().any(|merge| !merge.status().is_terminal()) {
            if self.merge_cond.wait_until(&mut state, deadline).timed_out() {
                self.message(|| "commit stopped waiting for merges".to_string());
                break;
            }
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closing = true;
        }
        self.message(|| "rollback".to_string());
        self.rollback_internal()
    }

    fn rollback_internal(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.stop_merges = true;
            self.abort_merges(&mut state);
        }
        let scheduler_result = self.scheduler.close();
        {
            let mut state = self.state.lock();
            while !state.running_merges.is_empty() {
                self.merge_cond.wait_for(&mut state, WAIT_INTERVAL);
            }
        }

        let discarded = self.flush_control.abort_all();
        self.flush_control.close();
        self.delete_queue.clear();
        self.reader_pool.clear();

        let mut state = self.state.lock();
        let reloaded = SegmentCatalog::read_latest(self.directory.as_ref()).map(|catalog| {
            state.catalog = catalog.unwrap_or_default();
        });
        state.segments_to_merge.clear();
        state.closed = true;
        state.closing = false;
        if reloaded.is_ok() {
            self.delete_unreferenced_files(&state);
        }
        self.merge_cond.notify_all();
        drop(state);
        self.message(|| format!("rollback done: discarded {discarded} buffered docs"));
        reloaded.and(scheduler_result)
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if state.tragedy.is_some() {
                state.closing = true;
                drop(state);
                return self.rollback_internal();
            }
        }
        if !self.config.commit_on_close {
            return self.rollback();
        }
        self.ensure_open()?;
        self.message(|| "close: flushing, waiting for merges and committing".to_string());

        let committed = self
            .flush_all_buffers()
            .and_then(|_| self.wait_for_merges(MergeTrigger::Closing))
            .and_then(|_| self.commit().map(|_| ()));
        if let Err(error) = committed {
            self.message(|| format!("close failed, rolling back: {error}"));
            self.state.lock().closing = true;
            if let Err(rollback_error) = self.rollback_internal() {
                self.message(|| format!("rollback after failed close also failed: {rollback_error}"));
            }
            return Err(error);
        }

        {
            let mut state = self.state.lock();
            state.closing = true;
            state.stop_merges = true;
            self.abort_merges(&mut state);
        }
        let scheduler_result = self.scheduler.close();
        self.flush_control.close();
        let mut state = self.state.lock();
        state.closed = true;
        state.closing = false;
        self.merge_cond.notify_all();
        drop(state);
        self.message(|| "closed".to_string());
        scheduler_result
    }

    fn tragic_event(&self, error: SluiceError, location: &str) {
        {
            let mut state = self.state.lock();
            if state.tragedy.is_none() {
                state.tragedy = Some(error.clone());
            }
            state.stop_merges = true;
            self.abort_merges(&mut state);
        }
        self.flush_control.close();
        self.message(|| format!("hit tragic error in {location}: {error}"));
    }

    // ---- bookkeeping ----

    fn doc_stats(&self) -> DocStats {
        let state = self.state.lock();
        let mut max_doc = 0;
        let mut num_docs = 0;
        for segment in state.catalog.iter() {
            max_doc += segment.max_doc() as u64;
            let deletes = (segment.del_count() + self.reader_pool.pending_deletes(segment.name()))
                .min(segment.max_doc());
            num_docs += (segment.max_doc() - deletes) as u64;
        }
        let buffered = self.flush_control.num_buffered_docs() as u64;
        DocStats {
            max_doc: max_doc + buffered,
            num_docs: num_docs + buffered,
        }
    }

    /// Delete index files neither the catalog nor the last commit references.
    fn delete_unreferenced_files(&self, state: &WriterState) {
        let files = match self.directory.list_all() {
            Ok(files) => files,
            Err(error) => {
                self.message(|| format!("cannot list index files: {error}"));
                return;
            }
        };
        let referenced = state.catalog.files(false);
        for file in files {
            if referenced.contains(&file) || state.last_commit_files.contains(&file) {
                continue;
            }
            let ours = file.starts_with(SEGMENTS_PREFIX)
                || file.starts_with(PENDING_SEGMENTS_PREFIX)
                || file.starts_with('_');
            if !ours {
                continue;
            }
            if segment_name_of(&file).is_some_and(|name| state.in_flight.contains(name)) {
                continue;
            }
            match self.directory.delete_file(&file) {
                Ok(()) => self.message(|| format!("delete unreferenced file {file}")),
                Err(error) => self.message(|| format!("cannot delete {file}: {error}")),
            }
        }
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock();
        while let Some(merge) = state.pending_merges.pop_front() {
            match merge.mark_running() {
                Ok(()) => {
                    state.running_merges.insert(merge.id(), Arc::clone(&merge));
                    return Some(merge);
                }
                Err(_) => {
                    state.release_merge(&merge);
                    self.merge_cond.notify_all();
                }
            }
        }
        None
    }

    fn on_merge_finished(&self, merge: &Arc<OneMerge>) {
        let mut state = self.state.lock();
        state.release_merge(merge);
        self.merge_cond.notify_all();
    }

    fn has_pending_merges(&self) -> bool {
        !self.state.lock().pending_merges.is_empty()
    }

    fn merge(&self, merge: &Arc<OneMerge>) -> Result<()> {
        self.run_merge(merge)
    }

    fn on_fatal_merge_error(&self, error: SluiceError) {
        self.tragic_event(error, "merge");
    }
}
