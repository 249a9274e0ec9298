//! Error types for the Sluice library.
//!
//! All errors are represented by the [`SluiceError`] enum. Background merge
//! failures are wrapped so that the thread waiting on a forced merge can see
//! which merge failed and why.
//!
//! # Examples
//!
//! ```
//! use sluice::error::{Result, SluiceError};
//!
//! fn check_segments_per_tier(v: f64) -> Result<()> {
//!     if v < 2.0 {
//!         return Err(SluiceError::invalid_argument(format!(
//!             "segments_per_tier must be >= 2.0 (got {v})"
//!         )));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_segments_per_tier(1.0).is_err());
//! ```

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The main error type for Sluice operations.
#[derive(Error, Debug, Clone)]
pub enum SluiceError {
    /// I/O errors coming from a directory implementation.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A setter or constructor was handed an invalid value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal invariant was violated (overlapping merges, unknown segments, ...).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The writer (or one of its components) was closed, possibly by a tragic event.
    #[error("Already closed: {message}")]
    AlreadyClosed {
        message: String,
        #[source]
        cause: Option<Box<SluiceError>>,
    },

    /// A merge was aborted because the writer is closing or rolling back.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// A file failed its checksum or could not be decoded.
    #[error("Corrupt index: {0}")]
    Corruption(String),

    /// A background merge failed; surfaced to threads waiting on forced merges.
    #[error("Background merge hit exception: {segments}")]
    Merge {
        segments: String,
        #[source]
        cause: Box<SluiceError>,
    },

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for operations that may fail with SluiceError.
pub type Result<T> = std::result::Result<T, SluiceError>;

impl From<io::Error> for SluiceError {
    fn from(err: io::Error) -> Self {
        // Rate-limited outputs smuggle aborts through `io::Write`; unwrap them again.
        if let Some(inner) = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<SluiceError>())
        {
            return inner.clone();
        }
        SluiceError::Io(Arc::new(err))
    }
}

impl From<SluiceError> for io::Error {
    fn from(err: SluiceError) -> Self {
        match err {
            SluiceError::Io(inner) => io::Error::new(inner.kind(), SluiceError::Io(inner)),
            other => io::Error::other(other),
        }
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        SluiceError::Json(Arc::new(err))
    }
}

impl SluiceError {
    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SluiceError::InvalidArgument(msg.into())
    }

    /// Create a new illegal state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        SluiceError::IllegalState(msg.into())
    }

    /// Create a new already-closed error without a cause.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        SluiceError::AlreadyClosed {
            message: msg.into(),
            cause: None,
        }
    }

    /// Create an already-closed error that remembers the tragic event behind it.
    pub fn closed_by_tragedy(tragedy: &SluiceError) -> Self {
        SluiceError::AlreadyClosed {
            message: "this writer hit an unrecoverable error".to_string(),
            cause: Some(Box::new(tragedy.clone())),
        }
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        SluiceError::MergeAborted(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        SluiceError::Corruption(msg.into())
    }

    /// Wrap the failure of a background merge.
    pub fn merge_failed<S: Into<String>>(segments: S, cause: SluiceError) -> Self {
        SluiceError::Merge {
            segments: segments.into(),
            cause: Box::new(cause),
        }
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        SluiceError::Other(msg.into())
    }

    /// Returns true for errors a merge scheduler may swallow silently.
    pub fn is_recoverable_merge_error(&self) -> bool {
        matches!(
            self,
            SluiceError::AlreadyClosed { .. } | SluiceError::MergeAborted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = SluiceError::invalid_argument("negative size");
        assert_eq!(error.to_string(), "Invalid argument: negative size");

        let error = SluiceError::corruption("checksum mismatch");
        assert_eq!(error.to_string(), "Corrupt index: checksum mismatch");

        let error = SluiceError::already_closed("writer is closed");
        assert_eq!(error.to_string(), "Already closed: writer is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let sluice_error = SluiceError::from(io_error);

        match sluice_error {
            SluiceError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SluiceError::merge_aborted("rollback").is_recoverable_merge_error());
        assert!(SluiceError::already_closed("closed").is_recoverable_merge_error());
        assert!(!SluiceError::corruption("bad footer").is_recoverable_merge_error());
        assert!(!SluiceError::other("boom").is_recoverable_merge_error());
    }

    #[test]
    fn test_tragedy_is_kept_as_source() {
        use std::error::Error;

        let tragedy = SluiceError::corruption("bad footer");
        let closed = SluiceError::closed_by_tragedy(&tragedy);
        let source = closed.source().expect("cause");
        assert_eq!(source.to_string(), "Corrupt index: bad footer");
    }
}
