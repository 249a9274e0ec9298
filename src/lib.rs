//! # Sluice
//!
//! The write path of a segment-based search index: buffering, flushing,
//! deletes and, above all, merging.
//!
//! ## Features
//!
//! - Per-thread document buffers flushed by RAM use or document count
//! - Indexing stalls when flushing falls behind
//! - Term deletes ordered against adds by sequence number
//! - Tiered and log-structured merge policies
//! - Serial and concurrent merge schedulers with adaptive IO throttling
//! - Commit points with live-docs generations, rollback and reopen
//! - Pluggable codecs and storage backends

pub mod codec;
pub mod document;
pub mod error;
pub mod index;
pub mod info_stream;
pub mod merge;
pub mod registry;
pub mod storage;

pub mod prelude {
    pub use crate::document::{Document, Term};
    pub use crate::error::{Result, SluiceError};
    pub use crate::index::{DocStats, IndexWriter, IndexWriterConfig, OpenMode};
    pub use crate::info_stream::{InfoStream, LoggingInfoStream, NoOutputInfoStream};
    pub use crate::merge::{
        ConcurrentMergeScheduler, LogMergePolicy, MergePolicy, MergeScheduler, NoMergePolicy,
        SerialMergeScheduler, TieredMergePolicy,
    };
    pub use crate::storage::Directory;
    pub use crate::storage::file::FsDirectory;
    pub use crate::storage::memory::RamDirectory;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
