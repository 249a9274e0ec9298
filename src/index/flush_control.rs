//! Bookkeeping of buffered RAM and of buffers on their way to disk.
//!
//! Every buffer is in one phase: idle (waiting for a thread), checked out
//! (a thread is adding to it), queued (pending, waiting for a flusher) or
//! flushing. Bytes of pending buffers count as flush bytes, all others as
//! active bytes. When active plus flush bytes exceed twice the RAM buffer
//! while active bytes alone do not, indexing threads are stalled until
//! flushes catch up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::index::config::{IndexWriterConfig, validate_flush_triggers};
use crate::index::dwpt::DocumentsBuffer;
use crate::index::flush::FlushPolicy;
use crate::index::stall::StallControl;
use crate::info_stream::InfoStream;

const COMPONENT: &str = "DWFC";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    CheckedOut,
    Queued,
    Flushing,
}

#[derive(Clone, Copy, Debug)]
struct BufferStats {
    phase: Phase,
    pending: bool,
    bytes: usize,
    num_docs: usize,
    first_seq_no: Option<u64>,
    /// Lower bound for sequence numbers a checked-out buffer may still receive.
    floor_seq_no: u64,
}

/// Flush control state, handed to the flush policy while locked.
#[derive(Debug)]
pub struct FlushControlState {
    buffers: HashMap<u64, BufferStats>,
    idle: Vec<DocumentsBuffer>,
    flush_queue: VecDeque<DocumentsBuffer>,
    active_bytes: usize,
    flush_bytes: usize,
    delete_bytes: usize,
    peak_active_bytes: usize,
    peak_flush_bytes: usize,
    peak_delete_bytes: usize,
    peak_net_bytes: usize,
    ram_buffer_bytes: Option<usize>,
    max_buffered_docs: Option<usize>,
    hard_limit_bytes: usize,
    full_flush: bool,
    apply_all_deletes: bool,
    closed: bool,
    next_buffer_id: u64,
    info_stream: Arc<dyn InfoStream>,
}

fn mb_to_usize(mb: f64) -> usize {
    (mb * BYTES_PER_MB) as usize
}

impl FlushControlState {
    pub fn ram_buffer_bytes(&self) -> Option<usize> {
        self.ram_buffer_bytes
    }

    pub fn max_buffered_docs(&self) -> Option<usize> {
        self.max_buffered_docs
    }

    pub fn active_bytes(&self) -> usize {
        self.active_bytes
    }

    pub fn flush_bytes(&self) -> usize {
        self.flush_bytes
    }

    pub fn delete_bytes(&self) -> usize {
        self.delete_bytes
    }

    pub fn buffer_bytes(&self, buffer_id: u64) -> usize {
        self.buffers.get(&buffer_id).map_or(0, |s| s.bytes)
    }

    pub fn buffer_num_docs(&self, buffer_id: u64) -> usize {
        self.buffers.get(&buffer_id).map_or(0, |s| s.num_docs)
    }

    pub fn is_flush_pending(&self, buffer_id: u64) -> bool {
        self.buffers.get(&buffer_id).is_some_and(|s| s.pending)
    }

    /// The buffer using the most RAM that is not already pending.
    pub fn largest_non_pending_buffer(&self) -> Option<u64> {
        self.buffers
            .iter()
            .filter(|(_, s)| !s.pending && s.num_docs > 0)
            .max_by_key(|(id, s)| (s.bytes, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id)
    }

    /// Mark a buffer pending. Buffers without documents are never flushed.
    pub fn set_flush_pending(&mut self, buffer_id: u64) {
        let Some(stats) = self.buffers.get_mut(&buffer_id) else {
            return;
        };
        if stats.pending || stats.num_docs == 0 {
            return;
        }
        stats.pending = true;
        let bytes = stats.bytes;
        let idle = stats.phase == Phase::Idle;
        if idle {
            stats.phase = Phase::Queued;
        }
        self.active_bytes -= bytes;
        self.flush_bytes += bytes;
        self.update_peaks();

        if idle {
            if let Some(position) = self.idle.iter().position(|b| b.id() == buffer_id) {
                let buffer = self.idle.swap_remove(position);
                self.flush_queue.push_back(buffer);
            }
        }
        if self.is_verbose(COMPONENT) {
            self.message(
                COMPONENT,
                &format!("buffer {buffer_id} pending flush ({bytes} bytes)"),
            );
        }
    }

    /// Ask the writer to apply all buffered deletes.
    pub fn set_apply_all_deletes(&mut self) {
        self.apply_all_deletes = true;
    }

    pub fn is_verbose(&self, component: &str) -> bool {
        self.info_stream.is_enabled(component)
    }

    pub fn message(&self, component: &str, message: &str) {
        self.info_stream.message(component, message);
    }

    fn update_peaks(&mut self) {
        self.peak_active_bytes = self.peak_active_bytes.max(self.active_bytes);
        self.peak_flush_bytes = self.peak_flush_bytes.max(self.flush_bytes);
        self.peak_delete_bytes = self.peak_delete_bytes.max(self.delete_bytes);
        self.peak_net_bytes = self
            .peak_net_bytes
            .max(self.active_bytes + self.flush_bytes + self.delete_bytes);
    }

    fn should_stall(&self) -> bool {
        match self.ram_buffer_bytes {
            Some(ram) => {
                let limit = ram.saturating_mul(2);
                self.active_bytes + self.flush_bytes > limit
                    && self.active_bytes < limit
                    && !self.closed
            }
            None => false,
        }
    }

    fn num_pending(&self) -> usize {
        self.buffers.values().filter(|s| s.pending).count()
    }

    fn assert_memory(&self) -> bool {
        let active: usize = self
            .buffers
            .values()
            .filter(|s| !s.pending)
            .map(|s| s.bytes)
            .sum();
        let flush: usize = self
            .buffers
            .values()
            .filter(|s| s.pending)
            .map(|s| s.bytes)
            .sum();
        active == self.active_bytes && flush == self.flush_bytes
    }
}

/// Decides when buffers flush and stalls indexing threads when flushing lags.
#[derive(Debug)]
pub struct FlushControl {
    state: Mutex<FlushControlState>,
    /// Signalled whenever a buffer finishes flushing.
    flushed: Condvar,
    policy: Arc<dyn FlushPolicy>,
    stall: StallControl,
}

impl FlushControl {
    pub fn new(
        config: &IndexWriterConfig,
        policy: Arc<dyn FlushPolicy>,
        info_stream: Arc<dyn InfoStream>,
    ) -> Self {
        FlushControl {
            state: Mutex::new(FlushControlState {
                buffers: HashMap::new(),
                idle: Vec::new(),
                flush_queue: VecDeque::new(),
                active_bytes: 0,
                flush_bytes: 0,
                delete_bytes: 0,
                peak_active_bytes: 0,
                peak_flush_bytes: 0,
                peak_delete_bytes: 0,
                peak_net_bytes: 0,
                ram_buffer_bytes: config.ram_buffer_size_mb.map(mb_to_usize),
                max_buffered_docs: config.max_buffered_docs,
                hard_limit_bytes: mb_to_usize(config.ram_per_thread_hard_limit_mb),
                full_flush: false,
                apply_all_deletes: false,
                closed: false,
                next_buffer_id: 0,
                info_stream: Arc::clone(&info_stream),
            }),
            flushed: Condvar::new(),
            policy,
            stall: StallControl::new(info_stream),
        }
    }

    fn update_stall_state(&self, state: &FlushControlState) {
        debug_assert!(state.assert_memory());
        self.stall.update_stalled(state.should_stall());
    }

    /// Check out a buffer for one document.
    ///
    /// `floor_seq_no` bounds the sequence number the document will get.
    pub fn obtain_buffer(&self, floor_seq_no: u64) -> DocumentsBuffer {
        let mut state = self.state.lock();
        let buffer = match state.idle.pop() {
            Some(buffer) => buffer,
            None => {
                let id = state.next_buffer_id;
                state.next_buffer_id += 1;
                state.buffers.insert(
                    id,
                    BufferStats {
                        phase: Phase::Idle,
                        pending: false,
                        bytes: 0,
                        num_docs: 0,
                        first_seq_no: None,
                        floor_seq_no,
                    },
                );
                DocumentsBuffer::new(id)
            }
        };
        if let Some(stats) = state.buffers.get_mut(&buffer.id()) {
            stats.phase = Phase::CheckedOut;
            stats.floor_seq_no = floor_seq_no;
        }
        buffer
    }

    /// Return a buffer after adding a document to it.
    ///
    /// Returns the buffer back if it must be flushed now; the caller owns the flush.
    pub fn after_document(&self, buffer: DocumentsBuffer, is_update: bool) -> Option<DocumentsBuffer> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = buffer.id();
        let Some(stats) = state.buffers.get_mut(&id) else {
            // Flush control was reset by a rollback; the documents are discarded.
            return None;
        };
        let old_bytes = stats.bytes;
        stats.bytes = buffer.bytes_used();
        stats.num_docs = buffer.num_docs();
        stats.first_seq_no = buffer.first_seq_no();
        let pending = stats.pending;
        let new_bytes = stats.bytes;
        if pending {
            state.flush_bytes = state.flush_bytes + new_bytes - old_bytes;
        } else {
            state.active_bytes = state.active_bytes + new_bytes - old_bytes;
            if is_update {
                self.policy.on_update(state, id);
            } else {
                self.policy.on_insert(state, id);
            }
            if !state.is_flush_pending(id) && new_bytes > state.hard_limit_bytes {
                if state.is_verbose(COMPONENT) {
                    state.message(
                        COMPONENT,
                        &format!("buffer {id} reached the per-thread hard limit ({new_bytes} bytes)"),
                    );
                }
                state.set_flush_pending(id);
            }
        }
        state.update_peaks();

        let result = match state.buffers.get_mut(&id) {
            Some(stats) if stats.pending => {
                stats.phase = Phase::Flushing;
                Some(buffer)
            }
            Some(stats) => {
                stats.phase = Phase::Idle;
                state.idle.push(buffer);
                None
            }
            None => None,
        };
        self.update_stall_state(state);
        result
    }

    /// Take a queued buffer to flush.
    pub fn next_pending_flush(&self) -> Option<DocumentsBuffer> {
        let mut state = self.state.lock();
        let buffer = state.flush_queue.pop_front()?;
        if let Some(stats) = state.buffers.get_mut(&buffer.id()) {
            stats.phase = Phase::Flushing;
        }
        Some(buffer)
    }

    /// A buffer taken for flushing was published (or failed).
    pub fn after_flush(&self, buffer_id: u64) {
        let mut state = self.state.lock();
        if let Some(stats) = state.buffers.remove(&buffer_id) {
            if stats.pending {
                state.flush_bytes -= stats.bytes;
            } else {
                state.active_bytes -= stats.bytes;
            }
        }
        self.update_stall_state(&state);
        self.flushed.notify_all();
    }

    /// Record the bytes held by buffered deletes.
    pub fn on_delete(&self, delete_bytes: usize) {
        let mut state = self.state.lock();
        state.delete_bytes = delete_bytes;
        state.update_peaks();
        self.policy.on_delete(&mut state);
        self.update_stall_state(&state);
    }

    /// Update delete bytes after deletes were pruned, without consulting the policy.
    pub fn set_delete_bytes(&self, delete_bytes: usize) {
        let mut state = self.state.lock();
        state.delete_bytes = delete_bytes;
        self.update_stall_state(&state);
    }

    /// Mark every buffer holding documents pending and take the queued ones.
    ///
    /// Checked-out buffers are flushed by their threads when handed back.
    pub fn mark_for_full_flush(&self) -> Vec<DocumentsBuffer> {
        let mut state = self.state.lock();
        state.full_flush = true;
        let ids: Vec<u64> = state
            .buffers
            .iter()
            .filter(|(_, s)| s.num_docs > 0 && !s.pending)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.set_flush_pending(id);
        }
        let buffers: Vec<DocumentsBuffer> = state.flush_queue.drain(..).collect();
        for buffer in &buffers {
            if let Some(stats) = state.buffers.get_mut(&buffer.id()) {
                stats.phase = Phase::Flushing;
            }
        }
        if state.is_verbose(COMPONENT) {
            state.message(
                COMPONENT,
                &format!("full flush: {} buffers to flush", buffers.len()),
            );
        }
        self.update_stall_state(&state);
        buffers
    }

    /// Wait (bounded) until no buffer is pending.
    ///
    /// Returns true once nothing is pending; false if queued buffers need a flusher.
    pub fn wait_for_flush(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.num_pending() > 0 && state.flush_queue.is_empty() {
            self.flushed.wait_for(&mut state, timeout);
        }
        state.num_pending() == 0
    }

    pub fn finish_full_flush(&self) {
        self.state.lock().full_flush = false;
    }

    pub fn is_full_flush(&self) -> bool {
        self.state.lock().full_flush
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        std::mem::take(&mut self.state.lock().apply_all_deletes)
    }

    /// Smallest sequence number a buffered or future document of an open buffer may have.
    pub fn min_outstanding_seq_no(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .buffers
            .values()
            .filter_map(|s| match (s.first_seq_no, s.phase) {
                (Some(first), _) => Some(first),
                (None, Phase::CheckedOut) => Some(s.floor_seq_no),
                (None, _) => None,
            })
            .min()
    }

    /// Documents buffered and not yet published.
    pub fn num_buffered_docs(&self) -> usize {
        self.state.lock().buffers.values().map(|s| s.num_docs).sum()
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.state.lock().flush_queue.len()
    }

    pub fn active_bytes(&self) -> usize {
        self.state.lock().active_bytes
    }

    pub fn flush_bytes(&self) -> usize {
        self.state.lock().flush_bytes
    }

    pub fn delete_bytes(&self) -> usize {
        self.state.lock().delete_bytes
    }

    /// Highest active, flush and net (active + flush + delete) bytes seen.
    pub fn peaks(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.peak_active_bytes,
            state.peak_flush_bytes,
            state.peak_net_bytes,
        )
    }

    pub fn set_ram_buffer_size_mb(&self, mb: Option<f64>) -> Result<()> {
        let mut state = self.state.lock();
        validate_flush_triggers(mb, state.max_buffered_docs)?;
        state.ram_buffer_bytes = mb.map(mb_to_usize);
        self.update_stall_state(&state);
        Ok(())
    }

    pub fn set_max_buffered_docs(&self, docs: Option<usize>) -> Result<()> {
        let mut state = self.state.lock();
        let ram = state.ram_buffer_bytes.map(|b| b as f64 / BYTES_PER_MB);
        validate_flush_triggers(ram, docs)?;
        state.max_buffered_docs = docs;
        Ok(())
    }

    pub fn ram_buffer_size_mb(&self) -> Option<f64> {
        self.state
            .lock()
            .ram_buffer_bytes
            .map(|b| b as f64 / BYTES_PER_MB)
    }

    pub fn max_buffered_docs(&self) -> Option<usize> {
        self.state.lock().max_buffered_docs
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall.any_stalled_threads()
    }

    pub fn wait_if_stalled(&self) {
        self.stall.wait_if_stalled();
    }

    pub fn stall_control(&self) -> &StallControl {
        &self.stall
    }

    /// Drop every idle and queued buffer (rollback). Returns the documents discarded.
    pub fn abort_all(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut discarded = 0;
        let dropped: Vec<DocumentsBuffer> = state
            .idle
            .drain(..)
            .chain(std::mem::take(&mut state.flush_queue))
            .collect();
        for buffer in dropped {
            discarded += buffer.num_docs();
            if let Some(stats) = state.buffers.remove(&buffer.id()) {
                if stats.pending {
                    state.flush_bytes -= stats.bytes;
                } else {
                    state.active_bytes -= stats.bytes;
                }
            }
        }
        state.full_flush = false;
        state.apply_all_deletes = false;
        state.delete_bytes = 0;
        if state.is_verbose(COMPONENT) {
            state.message(
                COMPONENT,
                &format!("abort: discarded {discarded} buffered docs"),
            );
        }
        self.update_stall_state(state);
        self.flushed.notify_all();
        discarded
    }

    /// Stop stalling for good.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.stall.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::index::flush::FlushByRamOrCountsPolicy;
    use crate::info_stream::{NoOutputInfoStream, RecordingInfoStream};

    fn control(config: IndexWriterConfig) -> FlushControl {
        FlushControl::new(
            &config,
            Arc::new(FlushByRamOrCountsPolicy),
            Arc::new(NoOutputInfoStream),
        )
    }

    fn doc(bytes: usize) -> Document {
        Document::builder().add_text("body", "x".repeat(bytes)).build()
    }

    #[test]
    fn test_doc_count_marks_buffer_pending() {
        let control = control(
            IndexWriterConfig::new()
                .with_ram_buffer_size_mb(None)
                .with_max_buffered_docs(Some(3)),
        );
        for seq in 1..=2 {
            let mut buffer = control.obtain_buffer(seq);
            buffer.add(doc(10), seq);
            assert!(control.after_document(buffer, false).is_none());
        }
        let mut buffer = control.obtain_buffer(3);
        buffer.add(doc(10), 3);
        let flushed = control.after_document(buffer, false).unwrap();
        assert_eq!(flushed.num_docs(), 3);
        assert_eq!(control.active_bytes(), 0);
        assert_eq!(control.flush_bytes(), flushed.bytes_used());

        control.after_flush(flushed.id());
        assert_eq!(control.flush_bytes(), 0);
        assert_eq!(control.num_buffered_docs(), 0);
    }

    #[test]
    fn test_ram_limit_marks_largest_buffer() {
        let stream = Arc::new(RecordingInfoStream::new());
        let control = FlushControl::new(
            &IndexWriterConfig::new().with_ram_buffer_size_mb(Some(0.001)),
            Arc::new(FlushByRamOrCountsPolicy),
            stream.clone(),
        );

        // Two buffers checked out at once: a big one left idle, a small one that trips the limit.
        let mut big = control.obtain_buffer(1);
        let mut small = control.obtain_buffer(1);
        big.add(doc(700), 1);
        let big_id = big.id();
        assert!(control.after_document(big, false).is_none());
        small.add(doc(200), 2);
        let returned = control.after_document(small, false);

        // The big idle buffer was queued for whoever flushes next.
        assert!(returned.is_none());
        assert_eq!(control.num_queued_flushes(), 1);
        let queued = control.next_pending_flush().unwrap();
        assert_eq!(queued.id(), big_id);
        assert!(stream.contains("FP", "largest buffer"));
    }

    #[test]
    fn test_full_flush_takes_every_buffer_with_docs() {
        let control = control(IndexWriterConfig::default());
        let mut a = control.obtain_buffer(1);
        let b = control.obtain_buffer(1);
        a.add(doc(10), 1);
        assert!(control.after_document(a, false).is_none());
        // `b` stays checked out and empty.

        let flushing = control.mark_for_full_flush();
        assert_eq!(flushing.len(), 1);
        assert!(control.is_full_flush());
        assert_eq!(control.min_outstanding_seq_no(), Some(1));

        control.after_flush(flushing[0].id());
        assert!(control.wait_for_flush(Duration::from_millis(1)));
        control.finish_full_flush();
        assert!(control.after_document(b, false).is_none());
    }

    #[test]
    fn test_stall_when_flushing_falls_behind() {
        let control = control(
            IndexWriterConfig::new()
                .with_ram_buffer_size_mb(Some(0.001))
                .with_max_buffered_docs(Some(2)),
        );
        // Each pending buffer moves ~1 KB into flush bytes; three exceed 2 KB.
        let mut pending = Vec::new();
        for seq in 0..3u64 {
            let mut buffer = control.obtain_buffer(seq * 2);
            buffer.add(doc(400), seq * 2);
            buffer.add(doc(400), seq * 2 + 1);
            pending.push(control.after_document(buffer, false).unwrap());
        }
        assert!(control.flush_bytes() > 2048);
        assert!(control.any_stalled_threads());

        for buffer in pending {
            control.after_flush(buffer.id());
        }
        assert!(!control.any_stalled_threads());
        let (_, peak_flush, _) = control.peaks();
        assert!(peak_flush > 2048);
    }

    #[test]
    fn test_delete_bytes_request_apply_all() {
        let control = control(IndexWriterConfig::new().with_ram_buffer_size_mb(Some(0.001)));
        control.on_delete(100);
        assert!(!control.get_and_reset_apply_all_deletes());
        control.on_delete(2000);
        assert!(control.get_and_reset_apply_all_deletes());
        assert!(!control.get_and_reset_apply_all_deletes());
    }

    #[test]
    fn test_live_limits_are_validated() {
        let control = control(IndexWriterConfig::default());
        assert!(control.set_ram_buffer_size_mb(None).is_err());
        control.set_max_buffered_docs(Some(10)).unwrap();
        control.set_ram_buffer_size_mb(None).unwrap();
        assert!(control.set_max_buffered_docs(None).is_err());
        assert_eq!(control.max_buffered_docs(), Some(10));
    }

    #[test]
    fn test_abort_discards_idle_buffers() {
        let control = control(IndexWriterConfig::default());
        let mut buffer = control.obtain_buffer(1);
        buffer.add(doc(10), 1);
        buffer.add(doc(10), 2);
        assert!(control.after_document(buffer, false).is_none());
        assert_eq!(control.abort_all(), 2);
        assert_eq!(control.active_bytes(), 0);
        assert_eq!(control.num_buffered_docs(), 0);
    }
}
