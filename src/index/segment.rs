//! Segment identity and per-commit segment state.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Encode a counter the way segment and commit names are spelled.
pub fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Decode a base-36 counter; `None` for anything malformed.
pub fn parse_base36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// How a segment came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    Flush,
    Merge,
}

/// Free-form facts recorded when a segment is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentDiagnostics {
    pub source: SegmentSource,
    pub timestamp: DateTime<Utc>,
    /// For merged segments, the target segment count of the forced merge that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_max_num_segments: Option<usize>,
}

impl SegmentDiagnostics {
    pub fn flush() -> Self {
        SegmentDiagnostics {
            source: SegmentSource::Flush,
            timestamp: Utc::now(),
            merge_max_num_segments: None,
        }
    }

    pub fn merge(max_num_segments: Option<usize>) -> Self {
        SegmentDiagnostics {
            source: SegmentSource::Merge,
            timestamp: Utc::now(),
            merge_max_num_segments: max_num_segments,
        }
    }
}

/// Immutable identity of a written segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// `_` followed by a base-36 counter, unique within an index.
    pub name: String,
    /// Number of documents written, deleted or not.
    pub max_doc: u32,
    /// Name of the codec that wrote the files.
    pub codec: String,
    /// Files owned by the segment, excluding live-docs generations.
    pub files: BTreeSet<String>,
    pub diagnostics: SegmentDiagnostics,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CommitState {
    del_count: u32,
    /// Generation of the live-docs file on disk, if any.
    del_gen: Option<u64>,
    next_write_del_gen: u64,
    /// Bytes of the segment files plus the current live-docs file.
    size_in_bytes: u64,
}

/// A segment as referenced by a commit: identity plus delete state.
///
/// Flushes and merges create new instances; a published instance only ever
/// changes its delete count, delete generation and size.
#[derive(Debug)]
pub struct SegmentCommitInfo {
    info: SegmentInfo,
    state: RwLock<CommitState>,
}

impl SegmentCommitInfo {
    pub fn new(info: SegmentInfo, del_count: u32, size_in_bytes: u64) -> Self {
        SegmentCommitInfo {
            info,
            state: RwLock::new(CommitState {
                del_count,
                del_gen: None,
                next_write_del_gen: 1,
                size_in_bytes,
            }),
        }
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn del_count(&self) -> u32 {
        self.state.read().del_count
    }

    pub fn live_docs(&self) -> u32 {
        self.info.max_doc - self.del_count()
    }

    pub fn del_gen(&self) -> Option<u64> {
        self.state.read().del_gen
    }

    pub fn next_write_del_gen(&self) -> u64 {
        self.state.read().next_write_del_gen
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.state.read().size_in_bytes
    }

    /// Percentage of deleted documents, 0.0 for empty segments.
    pub fn deletes_pct(&self) -> f64 {
        if self.info.max_doc == 0 {
            0.0
        } else {
            100.0 * self.del_count() as f64 / self.info.max_doc as f64
        }
    }

    /// Name of the live-docs file written at `generation`.
    pub fn live_docs_file_name(&self, generation: u64) -> String {
        format!("{}_{}.liv", self.info.name, base36(generation))
    }

    /// Current live-docs file, if deletes were ever written.
    pub fn live_docs_file(&self) -> Option<String> {
        self.del_gen().map(|generation| self.live_docs_file_name(generation))
    }

    /// Every file the segment references right now.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        if let Some(live_docs) = self.live_docs_file() {
            files.insert(live_docs);
        }
        files
    }

    /// Publish a new live-docs generation.
    ///
    /// `del_count` may only grow and must not exceed `max_doc`.
    pub fn advance_del_gen(
        &self,
        generation: u64,
        del_count: u32,
        size_in_bytes: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        if generation < state.next_write_del_gen {
            return Err(SluiceError::illegal_state(format!(
                "segment {}: del gen {generation} already used",
                self.info.name
            )));
        }
        if del_count < state.del_count || del_count > self.info.max_doc {
            return Err(SluiceError::illegal_state(format!(
                "segment {}: invalid del count {del_count} (was {}, max_doc {})",
                self.info.name, state.del_count, self.info.max_doc
            )));
        }
        state.del_gen = Some(generation);
        state.next_write_del_gen = generation + 1;
        state.del_count = del_count;
        state.size_in_bytes = size_in_bytes;
        Ok(())
    }

    /// Serialisable snapshot for a commit point.
    pub fn to_record(&self) -> SegmentRecord {
        let state = self.state.read();
        SegmentRecord {
            info: self.info.clone(),
            del_count: state.del_count,
            del_gen: state.del_gen,
            size_in_bytes: state.size_in_bytes,
        }
    }

    /// Rebuild from a commit point.
    pub fn from_record(record: SegmentRecord) -> Self {
        let next_write_del_gen = record.del_gen.map_or(1, |generation| generation + 1);
        SegmentCommitInfo {
            info: record.info,
            state: RwLock::new(CommitState {
                del_count: record.del_count,
                del_gen: record.del_gen,
                next_write_del_gen,
                size_in_bytes: record.size_in_bytes,
            }),
        }
    }
}

impl fmt::Display for SegmentCommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        write!(f, "{}({})", self.info.name, self.info.max_doc)?;
        if state.del_count > 0 {
            write!(f, "/{}", state.del_count)?;
        }
        if self.info.diagnostics.source == SegmentSource::Merge {
            write!(f, ":M")?;
        }
        Ok(())
    }
}

/// One segment as stored in a `segments_<gen>` file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub info: SegmentInfo,
    pub del_count: u32,
    pub del_gen: Option<u64>,
    pub size_in_bytes: u64,
}

#[cfg(test)]
pub(crate) fn test_segment(name: &str, max_doc: u32, del_count: u32, size: u64) -> SegmentCommitInfo {
    SegmentCommitInfo::new(
        SegmentInfo {
            name: name.to_string(),
            max_doc,
            codec: "simple".to_string(),
            files: BTreeSet::from([format!("{name}.sfd")]),
            diagnostics: SegmentDiagnostics::flush(),
        },
        del_count,
        size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_round_trip_edges() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(parse_base36("10"), Some(36));
        assert_eq!(parse_base36(""), None);
        assert_eq!(parse_base36("_1"), None);
    }

    #[test]
    fn test_advance_del_gen() {
        let segment = test_segment("_0", 10, 0, 100);
        assert_eq!(segment.live_docs_file(), None);

        segment.advance_del_gen(1, 3, 120).unwrap();
        assert_eq!(segment.del_count(), 3);
        assert_eq!(segment.live_docs(), 7);
        assert_eq!(segment.live_docs_file().as_deref(), Some("_0_1.liv"));
        assert!(segment.files().contains("_0_1.liv"));
        assert_eq!(segment.size_in_bytes(), 120);

        // Generations never go backwards and deletes never shrink.
        assert!(segment.advance_del_gen(1, 4, 120).is_err());
        assert!(segment.advance_del_gen(2, 2, 120).is_err());
        assert!(segment.advance_del_gen(2, 11, 120).is_err());
    }

    #[test]
    fn test_record_round_trip_keeps_next_gen() {
        let segment = test_segment("_a", 4, 0, 10);
        segment.advance_del_gen(3, 1, 12).unwrap();

        let restored = SegmentCommitInfo::from_record(segment.to_record());
        assert_eq!(restored.del_gen(), Some(3));
        assert_eq!(restored.next_write_del_gen(), 4);
        assert_eq!(restored.to_string(), "_a(4)/1");
    }

    #[test]
    fn test_deletes_pct() {
        assert_eq!(test_segment("_0", 0, 0, 0).deletes_pct(), 0.0);
        assert_eq!(test_segment("_1", 80, 20, 0).deletes_pct(), 25.0);
    }
}
