//! Writer configuration.

use serde::{Deserialize, Serialize};

use crate::codec::SimpleCodec;
use crate::error::{Result, SluiceError};

/// Default RAM buffer before buffered documents are flushed.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-buffer hard limit; a buffer is flushed once it grows past it.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: f64 = 1945.0;

/// How [`IndexWriter::open`](crate::index::writer::IndexWriter::open) treats an existing index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Start empty, discarding any existing commit.
    Create,
    /// Open the latest commit; fail if there is none.
    Append,
    /// Append if a commit exists, create otherwise.
    #[default]
    CreateOrAppend,
}

/// Settings of an [`IndexWriter`](crate::index::writer::IndexWriter).
///
/// `ram_buffer_size_mb` and `max_buffered_docs` may be changed on a live
/// writer; everything else is fixed at open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    pub open_mode: OpenMode,

    /// Flush once buffered documents and deletes use this much RAM. `None` disables.
    pub ram_buffer_size_mb: Option<f64>,

    /// Flush a buffer once it holds this many documents. `None` disables.
    pub max_buffered_docs: Option<usize>,

    /// A single buffer is always flushed past this size.
    pub ram_per_thread_hard_limit_mb: f64,

    /// Commit pending changes on [`close`](crate::index::writer::IndexWriter::close);
    /// otherwise close rolls back.
    pub commit_on_close: bool,

    /// How long a commit waits for merges of freshly flushed segments. `0` disables.
    pub max_full_flush_merge_wait_millis: u64,

    /// Codec new segments are written with.
    pub codec: String,

    /// Name of the merge policy in the merge policy registry.
    pub merge_policy: String,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            commit_on_close: true,
            max_full_flush_merge_wait_millis: 0,
            codec: SimpleCodec::NAME.to_string(),
            merge_policy: "tiered".to_string(),
        }
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    pub fn with_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.commit_on_close = commit_on_close;
        self
    }

    pub fn with_max_full_flush_merge_wait_millis(mut self, millis: u64) -> Self {
        self.max_full_flush_merge_wait_millis = millis;
        self
    }

    pub fn with_merge_policy<S: Into<String>>(mut self, name: S) -> Self {
        self.merge_policy = name.into();
        self
    }

    /// Check every setting.
    pub fn validate(&self) -> Result<()> {
        validate_flush_triggers(self.ram_buffer_size_mb, self.max_buffered_docs)?;
        if !(self.ram_per_thread_hard_limit_mb > 0.0 && self.ram_per_thread_hard_limit_mb < 2048.0)
        {
            return Err(SluiceError::invalid_argument(format!(
                "ram_per_thread_hard_limit_mb must be in (0, 2048) (got {})",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        Ok(())
    }
}

/// At least one flush trigger must stay enabled.
pub(crate) fn validate_flush_triggers(
    ram_buffer_size_mb: Option<f64>,
    max_buffered_docs: Option<usize>,
) -> Result<()> {
    if let Some(mb) = ram_buffer_size_mb {
        if mb.is_nan() || mb <= 0.0 {
            return Err(SluiceError::invalid_argument(format!(
                "ram_buffer_size_mb must be > 0 (got {mb})"
            )));
        }
    }
    if let Some(docs) = max_buffered_docs {
        if docs < 2 {
            return Err(SluiceError::invalid_argument(format!(
                "max_buffered_docs must be >= 2 (got {docs})"
            )));
        }
    }
    if ram_buffer_size_mb.is_none() && max_buffered_docs.is_none() {
        return Err(SluiceError::invalid_argument(
            "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled",
        ));
    }
    Ok(())
}
