//! Per-thread document buffers.
//!
//! An indexing thread checks a buffer out of flush control, appends a
//! document and hands it back. Once flush control marks the buffer pending,
//! whoever holds it writes it as a new segment; the writer then resolves
//! buffered deletes against it and publishes it.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::{Codec, Postings};
use crate::document::Document;
use crate::error::Result;
use crate::storage::{Directory, total_file_length};

/// Documents buffered in RAM by one indexing thread at a time.
#[derive(Debug)]
pub struct DocumentsBuffer {
    id: u64,
    docs: Vec<Document>,
    seq_nos: Vec<u64>,
    bytes_used: usize,
}

impl DocumentsBuffer {
    pub fn new(id: u64) -> Self {
        DocumentsBuffer {
            id,
            docs: Vec::new(),
            seq_nos: Vec::new(),
            bytes_used: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a document numbered `seq_no`.
    pub fn add(&mut self, doc: Document, seq_no: u64) {
        self.bytes_used += doc.ram_bytes_used() + std::mem::size_of::<u64>();
        self.docs.push(doc);
        self.seq_nos.push(seq_no);
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Sequence number of the oldest buffered document.
    pub fn first_seq_no(&self) -> Option<u64> {
        self.seq_nos.first().copied()
    }

    /// Write the buffered documents as segment `name`.
    ///
    /// On failure the files written so far are removed.
    pub fn flush(
        self,
        name: String,
        directory: &dyn Directory,
        codec: &Arc<dyn Codec>,
    ) -> Result<FlushedSegment> {
        let postings = Postings::from_documents(&self.docs);
        let mut files = BTreeSet::new();
        let written = codec
            .stored_fields()
            .write(directory, &name, &self.docs)
            .and_then(|stored| {
                files.extend(stored);
                codec.postings().write(directory, &name, &postings)
            });
        match written {
            Ok(postings_files) => files.extend(postings_files),
            Err(error) => {
                for file in &files {
                    let _ = directory.delete_if_exists(file);
                }
                return Err(error);
            }
        }

        let file_list: Vec<String> = files.iter().cloned().collect();
        let size_in_bytes = total_file_length(directory, &file_list)?;
        Ok(FlushedSegment {
            buffer_id: self.id,
            name,
            docs: self.docs,
            seq_nos: self.seq_nos,
            postings: Arc::new(postings),
            files,
            size_in_bytes,
        })
    }
}

/// A buffer written to disk but not yet published to the catalog.
#[derive(Debug)]
pub struct FlushedSegment {
    pub buffer_id: u64,
    pub name: String,
    /// Kept to resolve deletes that arrive before publication.
    pub docs: Vec<Document>,
    pub seq_nos: Vec<u64>,
    pub postings: Arc<Postings>,
    pub files: BTreeSet<String>,
    pub size_in_bytes: u64,
}
