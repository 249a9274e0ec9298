//! Sequence numbers and buffered delete terms.
//!
//! Every document and every delete gets a number from one counter. A delete
//! removes exactly the documents numbered below it: the writer applies it to
//! flushed segments straight away and keeps it here until every buffered
//! document older than it has been flushed and checked against it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::document::{Document, Term};

/// Bytes charged per queued delete on top of the term itself.
const DELETE_OVERHEAD_BYTES: usize = 32;

#[derive(Clone, Debug)]
struct BufferedDelete {
    seq_no: u64,
    term: Term,
}

#[derive(Debug, Default)]
struct QueueState {
    deletes: Vec<BufferedDelete>,
    bytes_used: usize,
}

/// Global sequence counter plus the deletes buffered documents may still need.
#[derive(Debug)]
pub struct DeleteQueue {
    next_seq_no: AtomicU64,
    state: Mutex<QueueState>,
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteQueue {
    pub fn new() -> Self {
        DeleteQueue {
            next_seq_no: AtomicU64::new(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Take the next sequence number.
    pub fn next_seq_no(&self) -> u64 {
        self.next_seq_no.fetch_add(1, Ordering::SeqCst)
    }

    /// The number the next operation will get.
    pub fn peek_seq_no(&self) -> u64 {
        self.next_seq_no.load(Ordering::SeqCst)
    }

    /// Queue a delete; returns its sequence number and the bytes now queued.
    pub fn add(&self, term: Term) -> (u64, usize) {
        let mut state = self.state.lock();
        let seq_no = self.next_seq_no();
        state.bytes_used += term.ram_bytes_used() + DELETE_OVERHEAD_BYTES;
        state.deletes.push(BufferedDelete { seq_no, term });
        (seq_no, state.bytes_used)
    }

    /// Doc ids of `docs` removed by a queued delete numbered after them.
    ///
    /// `seq_nos[i]` is the sequence number of `docs[i]`.
    pub fn resolve(&self, docs: &[Document], seq_nos: &[u64]) -> Vec<u32> {
        let state = self.state.lock();
        docs.iter()
            .zip(seq_nos)
            .enumerate()
            .filter(|(_, (doc, seq_no))| {
                state
                    .deletes
                    .iter()
                    .any(|delete| delete.seq_no > **seq_no && doc.matches(&delete.term))
            })
            .map(|(doc_id, _)| doc_id as u32)
            .collect()
    }

    /// Drop deletes numbered below `min_seq_no`; no buffered document can need them.
    ///
    /// Returns the bytes still queued.
    pub fn prune_before(&self, min_seq_no: u64) -> usize {
        let mut state = self.state.lock();
        state.deletes.retain(|delete| delete.seq_no >= min_seq_no);
        state.bytes_used = state
            .deletes
            .iter()
            .map(|delete| delete.term.ram_bytes_used() + DELETE_OVERHEAD_BYTES)
            .sum();
        state.bytes_used
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes_used
    }

    pub fn len(&self) -> usize {
        self.state.lock().deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().deletes.is_empty()
    }

    /// Forget every queued delete (rollback).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.deletes.clear();
        state.bytes_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> Document {
        Document::builder().add_text("id", id).build()
    }

    #[test]
    fn test_deletes_only_hit_older_documents() {
        let queue = DeleteQueue::new();
        let first = queue.next_seq_no();
        let (delete_seq, bytes) = queue.add(Term::new("id", "a"));
        let second = queue.next_seq_no();
        assert!(first < delete_seq && delete_seq < second);
        assert!(bytes > 0);

        let docs = vec![doc("a"), doc("b"), doc("a")];
        assert_eq!(queue.resolve(&docs, &[first, first, second]), vec![0]);
    }

    #[test]
    fn test_prune_releases_bytes() {
        let queue = DeleteQueue::new();
        queue.add(Term::new("id", "a"));
        let (keep, _) = queue.add(Term::new("id", "b"));

        let remaining = queue.prune_before(keep);
        assert_eq!(queue.len(), 1);
        assert_eq!(remaining, queue.bytes_used());
        assert_eq!(queue.prune_before(queue.peek_seq_no()), 0);
        assert!(queue.is_empty());
    }
}
