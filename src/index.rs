//! The write path: buffering documents, flushing segments, applying deletes
//! and committing.
//!
//! [`writer::IndexWriter`] is the entry point. The other modules are the
//! pieces it is built from and are public so they can be tested and reused
//! on their own.

pub mod catalog;
pub mod config;
pub mod delete_queue;
pub mod dwpt;
pub mod flush;
pub mod flush_control;
pub mod reader_pool;
pub mod segment;
pub mod stall;
pub mod writer;

pub use catalog::SegmentCatalog;
pub use config::{IndexWriterConfig, OpenMode};
pub use flush::{FlushByRamOrCountsPolicy, FlushPolicy};
pub use flush_control::FlushControl;
pub use segment::{SegmentCommitInfo, SegmentInfo};
pub use stall::StallControl;
pub use writer::{DocStats, IndexWriter, IndexWriterBuilder};
