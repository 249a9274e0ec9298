//! Codecs: how segment data is written on flush and combined on merge.
//!
//! The write path treats a codec as a bundle of per-category formats. A
//! flush calls each format's `write`; a merge builds a [`MergeState`] and
//! calls each format's `merge`, possibly in parallel through the scheduler's
//! intra-merge executor. Codecs are found by name through a
//! [`Registry`]; the default one is chosen by the writer configuration.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::document::{Document, Term};
use crate::error::Result;
use crate::index::segment::SegmentCommitInfo;
use crate::registry::Registry;
use crate::storage::Directory;

pub mod checksum;
pub mod simple;

pub use simple::SimpleCodec;

/// A named bundle of formats.
pub trait Codec: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn stored_fields(&self) -> &dyn StoredFieldsFormat;

    fn postings(&self) -> &dyn PostingsFormat;

    fn live_docs(&self) -> &dyn LiveDocsFormat;
}

/// Stores whole documents.
pub trait StoredFieldsFormat: Send + Sync + Debug {
    /// Write the documents of a new segment; returns the files created.
    fn write(&self, directory: &dyn Directory, segment: &str, docs: &[Document])
    -> Result<Vec<String>>;

    /// Read back every document of a segment, in doc id order.
    fn read(&self, directory: &dyn Directory, segment: &str) -> Result<Vec<Document>>;

    /// Write the live documents of all merge inputs into the merged segment.
    fn merge(&self, state: &MergeState) -> Result<Vec<String>> {
        let mut merged = Vec::with_capacity(state.max_doc as usize);
        for (reader, doc_map) in state.readers.iter().zip(&state.doc_maps) {
            let documents = reader.documents()?;
            for (old, doc) in documents.iter().enumerate() {
                if doc_map.get(old as u32).is_some() {
                    merged.push(doc.clone());
                }
            }
        }
        self.write(state.directory.as_ref(), &state.segment_name, &merged)
    }
}

/// Maps normalised terms to the documents containing them.
pub trait PostingsFormat: Send + Sync + Debug {
    fn write(&self, directory: &dyn Directory, segment: &str, postings: &Postings)
    -> Result<Vec<String>>;

    fn read(&self, directory: &dyn Directory, segment: &str) -> Result<Postings>;

    /// Remap and concatenate the inputs' postings.
    fn merge(&self, state: &MergeState) -> Result<Vec<String>> {
        let mut merged = Postings::default();
        for (reader, doc_map) in state.readers.iter().zip(&state.doc_maps) {
            merged.append_mapped(&reader.postings, doc_map);
        }
        self.write(state.directory.as_ref(), &state.segment_name, &merged)
    }
}

/// Persists which documents of a segment are still live.
pub trait LiveDocsFormat: Send + Sync + Debug {
    /// Write live docs for `segment` at `generation`; returns the file name.
    fn write(
        &self,
        directory: &dyn Directory,
        segment: &SegmentCommitInfo,
        live_docs: &BitVec,
        generation: u64,
    ) -> Result<String>;

    /// Read the current live docs, `None` if the segment never had deletes.
    fn read(&self, directory: &dyn Directory, segment: &SegmentCommitInfo)
    -> Result<Option<BitVec>>;
}

/// In-memory postings: `field\0text` → ascending doc ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Postings {
    terms: BTreeMap<String, Vec<u32>>,
}

impl Postings {
    fn key(field: &str, text: &str) -> String {
        format!("{field}\u{0}{text}")
    }

    /// Index the documents of a new segment.
    pub fn from_documents(docs: &[Document]) -> Self {
        let mut postings = Postings::default();
        for (doc_id, doc) in docs.iter().enumerate() {
            for (field, text) in doc.index_terms() {
                let docs = postings.terms.entry(Self::key(field, &text)).or_default();
                if docs.last() != Some(&(doc_id as u32)) {
                    docs.push(doc_id as u32);
                }
            }
        }
        postings
    }

    /// Documents containing `term`.
    pub fn docs(&self, term: &Term) -> &[u32] {
        self.terms
            .get(&Self::key(&term.field, &term.normalized_text()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Iterate raw `(key, docs)` entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Rebuild from raw entries.
    pub fn from_entries<I: IntoIterator<Item = (String, Vec<u32>)>>(entries: I) -> Self {
        Postings {
            terms: entries.into_iter().collect(),
        }
    }

    fn append_mapped(&mut self, other: &Postings, doc_map: &DocMap) {
        for (key, docs) in &other.terms {
            let mapped = docs.iter().filter_map(|&doc| doc_map.get(doc));
            let target = self.terms.entry(key.clone()).or_default();
            target.extend(mapped);
            if target.is_empty() {
                self.terms.remove(key);
            }
        }
    }
}

/// Maps doc ids of one merge input to doc ids of the merged segment.
///
/// Deleted documents map to `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct DocMap {
    mapping: Vec<Option<u32>>,
}

impl DocMap {
    /// Build a map assigning consecutive ids starting at `base` to live docs.
    ///
    /// Returns the map and the next free id.
    pub fn build(base: u32, max_doc: u32, live_docs: Option<&BitVec>) -> (DocMap, u32) {
        let mut next = base;
        let mapping = (0..max_doc)
            .map(|doc| {
                let live = live_docs.is_none_or(|bits| bits.get(doc as usize).unwrap_or(false));
                live.then(|| {
                    let id = next;
                    next += 1;
                    id
                })
            })
            .collect();
        (DocMap { mapping }, next)
    }

    pub fn get(&self, doc: u32) -> Option<u32> {
        self.mapping.get(doc as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// One merge input as seen by the codec.
#[derive(Debug)]
pub struct MergeReader {
    pub segment: Arc<SegmentCommitInfo>,
    /// Live docs snapshot taken when the merge started.
    pub live_docs: Option<BitVec>,
    pub postings: Arc<Postings>,
    codec: Arc<dyn Codec>,
    directory: Arc<dyn Directory>,
}

impl MergeReader {
    pub fn new(
        segment: Arc<SegmentCommitInfo>,
        live_docs: Option<BitVec>,
        postings: Arc<Postings>,
        codec: Arc<dyn Codec>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        MergeReader {
            segment,
            live_docs,
            postings,
            codec,
            directory,
        }
    }

    /// Load stored documents; only the stored-fields merge needs them.
    pub fn documents(&self) -> Result<Vec<Document>> {
        self.codec
            .stored_fields()
            .read(self.directory.as_ref(), self.segment.name())
    }

    /// Live document count of the snapshot.
    pub fn num_live_docs(&self) -> u32 {
        match &self.live_docs {
            Some(bits) => bits.iter().filter(|live| *live).count() as u32,
            None => self.segment.max_doc(),
        }
    }
}

/// Everything a format needs to merge N segments into one.
#[derive(Debug)]
pub struct MergeState {
    /// Name of the segment being written.
    pub segment_name: String,
    pub readers: Vec<MergeReader>,
    pub doc_maps: Vec<DocMap>,
    /// Documents in the merged segment.
    pub max_doc: u32,
    /// Rate-limited view of the index directory.
    pub directory: Arc<dyn Directory>,
}

impl MergeState {
    pub fn new(segment_name: String, readers: Vec<MergeReader>, directory: Arc<dyn Directory>) -> Self {
        let mut next = 0;
        let mut doc_maps = Vec::with_capacity(readers.len());
        for reader in &readers {
            let (doc_map, after) =
                DocMap::build(next, reader.segment.max_doc(), reader.live_docs.as_ref());
            doc_maps.push(doc_map);
            next = after;
        }
        MergeState {
            segment_name,
            readers,
            doc_maps,
            max_doc: next,
            directory,
        }
    }
}

pub type CodecRegistry = Registry<dyn Codec>;

/// Registry with every built-in codec.
pub fn default_codecs() -> CodecRegistry {
    Registry::new("codec").with(SimpleCodec::NAME, || Arc::new(SimpleCodec::new()) as Arc<dyn Codec>)
}
