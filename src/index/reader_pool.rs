//! Per-segment postings and live docs shared by deletes and merges.
//!
//! Deletes against flushed segments are applied here in memory and only
//! written as a new live-docs generation on commit. Until then they count
//! as pending deletes, which merge policies see through
//! [`MergeContext::num_deletes_to_merge`](crate::merge::policy::MergeContext::num_deletes_to_merge).

use std::collections::HashMap;
use std::sync::Arc;

use bit_vec::BitVec;
use parking_lot::Mutex;

use crate::codec::{Codec, Postings};
use crate::document::Term;
use crate::error::{Result, SluiceError};
use crate::index::segment::SegmentCommitInfo;
use crate::storage::{Directory, total_file_length};

#[derive(Debug)]
struct PooledSegment {
    info: Arc<SegmentCommitInfo>,
    postings: Arc<Postings>,
    /// `None` until the segment has a delete.
    live_docs: Option<BitVec>,
    pending_deletes: u32,
}

impl PooledSegment {
    fn delete(&mut self, doc: u32) -> bool {
        let max_doc = self.info.max_doc() as usize;
        let live_docs = self
            .live_docs
            .get_or_insert_with(|| BitVec::from_elem(max_doc, true));
        if live_docs.get(doc as usize) == Some(true) {
            live_docs.set(doc as usize, false);
            self.pending_deletes += 1;
            true
        } else {
            false
        }
    }
}

/// Cache of segment state the writer needs to apply deletes and start merges.
#[derive(Debug)]
pub struct ReaderPool {
    directory: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    segments: Mutex<HashMap<String, PooledSegment>>,
}

impl ReaderPool {
    pub fn new(directory: Arc<dyn Directory>, codec: Arc<dyn Codec>) -> Self {
        ReaderPool {
            directory,
            codec,
            segments: Mutex::new(HashMap::new()),
        }
    }

    fn load<'a>(
        &self,
        segments: &'a mut HashMap<String, PooledSegment>,
        info: &Arc<SegmentCommitInfo>,
    ) -> Result<&'a mut PooledSegment> {
        if !segments.contains_key(info.name()) {
            let postings = self.codec.postings().read(self.directory.as_ref(), info.name())?;
            let live_docs = self.codec.live_docs().read(self.directory.as_ref(), info)?;
            segments.insert(
                info.name().to_string(),
                PooledSegment {
                    info: Arc::clone(info),
                    postings: Arc::new(postings),
                    live_docs,
                    pending_deletes: 0,
                },
            );
        }
        segments
            .get_mut(info.name())
            .ok_or_else(|| SluiceError::illegal_state("segment vanished from pool"))
    }

    /// Register a freshly flushed or merged segment with its in-memory postings.
    pub fn register(&self, info: &Arc<SegmentCommitInfo>, postings: Arc<Postings>) {
        self.segments.lock().insert(
            info.name().to_string(),
            PooledSegment {
                info: Arc::clone(info),
                postings,
                live_docs: None,
                pending_deletes: 0,
            },
        );
    }

    /// Delete every live document of `info` matching `term`; returns how many.
    pub fn delete_term(&self, info: &Arc<SegmentCommitInfo>, term: &Term) -> Result<u32> {
        let mut segments = self.segments.lock();
        let segment = self.load(&mut segments, info)?;
        let docs: Vec<u32> = segment.postings.docs(term).to_vec();
        Ok(docs.into_iter().filter(|&doc| segment.delete(doc)).count() as u32)
    }

    /// Delete the given doc ids of `info`; returns how many were live.
    pub fn delete_docs<I>(&self, info: &Arc<SegmentCommitInfo>, docs: I) -> Result<u32>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut segments = self.segments.lock();
        let segment = self.load(&mut segments, info)?;
        Ok(docs.into_iter().filter(|&doc| segment.delete(doc)).count() as u32)
    }

    /// Postings and current live docs, as a merge sees them when it starts.
    pub fn snapshot(&self, info: &Arc<SegmentCommitInfo>) -> Result<(Arc<Postings>, Option<BitVec>)> {
        let mut segments = self.segments.lock();
        let segment = self.load(&mut segments, info)?;
        Ok((Arc::clone(&segment.postings), segment.live_docs.clone()))
    }

    /// Current live docs of a pooled segment.
    pub fn live_docs(&self, name: &str) -> Option<BitVec> {
        self.segments
            .lock()
            .get(name)
            .and_then(|segment| segment.live_docs.clone())
    }

    /// Deletes applied in memory but not yet written.
    pub fn pending_deletes(&self, name: &str) -> u32 {
        self.segments
            .lock()
            .get(name)
            .map_or(0, |segment| segment.pending_deletes)
    }

    /// Write a new live-docs generation for every segment with pending deletes.
    ///
    /// Returns the live-docs files replaced by newer generations.
    pub fn write_all_live_docs(&self) -> Result<Vec<String>> {
        let mut segments = self.segments.lock();
        let mut replaced = Vec::new();
        for segment in segments.values_mut() {
            if segment.pending_deletes == 0 {
                continue;
            }
            let Some(live_docs) = &segment.live_docs else {
                continue;
            };
            let info = &segment.info;
            let generation = info.next_write_del_gen();
            let previous = info.live_docs_file();
            let file = self
                .codec
                .live_docs()
                .write(self.directory.as_ref(), info, live_docs, generation)?;

            let mut files: Vec<String> = info.info().files.iter().cloned().collect();
            files.push(file);
            let size = total_file_length(self.directory.as_ref(), &files)?;
            info.advance_del_gen(generation, info.del_count() + segment.pending_deletes, size)?;
            segment.pending_deletes = 0;
            replaced.extend(previous);
        }
        Ok(replaced)
    }

    /// Forget a segment that left the catalog.
    pub fn drop_segment(&self, name: &str) {
        self.segments.lock().remove(name);
    }

    /// Forget everything (rollback).
    pub fn clear(&self) {
        self.segments.lock().clear();
    }
}
