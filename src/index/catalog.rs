//! The ordered list of live segments and its commit points.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::checksum;
use crate::error::{Result, SluiceError};
use crate::index::segment::{SegmentCommitInfo, SegmentRecord, base36, parse_base36};
use crate::storage::Directory;

/// Prefix of commit point files.
pub const SEGMENTS_PREFIX: &str = "segments_";

/// Prefix of commit point files still being written.
pub const PENDING_SEGMENTS_PREFIX: &str = "pending_segments_";

const COMMIT_FORMAT_VERSION: u32 = 1;

/// Name of the commit point file for a generation.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}{}", base36(generation))
}

/// Generation encoded in a commit point file name.
pub fn generation_from_segments_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENTS_PREFIX).and_then(parse_base36)
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    format: u32,
    generation: u64,
    version: u64,
    counter: u64,
    segments: Vec<SegmentRecord>,
    #[serde(default)]
    user_data: BTreeMap<String, String>,
}

/// Ordered segments of an index plus commit bookkeeping.
///
/// Segment order is creation order except that a merged segment takes the
/// position of its first input.
#[derive(Clone, Debug, Default)]
pub struct SegmentCatalog {
    segments: Vec<Arc<SegmentCommitInfo>>,
    /// Generation of the last commit point written or loaded.
    generation: u64,
    /// Bumped on every mutation.
    version: u64,
    /// Next segment name counter.
    counter: u64,
    user_data: BTreeMap<String, String>,
}

impl SegmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next segment name.
    pub fn new_segment_name(&mut self) -> String {
        let name = format!("_{}", base36(self.counter));
        self.counter += 1;
        self.changed();
        name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Record a mutation that happened outside the segment list (deletes, names).
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Arc<SegmentCommitInfo>] {
        &self.segments
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SegmentCommitInfo>> {
        self.segments.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SegmentCommitInfo>> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn set_user_data(&mut self, user_data: BTreeMap<String, String>) {
        self.user_data = user_data;
        self.changed();
    }

    /// Append a segment; names must be unique.
    pub fn add(&mut self, segment: Arc<SegmentCommitInfo>) -> Result<()> {
        if self.contains(segment.name()) {
            return Err(SluiceError::illegal_state(format!(
                "segment {} is already in the catalog",
                segment.name()
            )));
        }
        self.segments.push(segment);
        self.changed();
        Ok(())
    }

    /// Remove a segment by name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<Arc<SegmentCommitInfo>> {
        let position = self.segments.iter().position(|s| s.name() == name)?;
        self.changed();
        Some(self.segments.remove(position))
    }

    /// Replace `inputs` by `merged` at the position of the first input.
    ///
    /// A merged segment without live documents is dropped instead. Every input
    /// must still be present.
    pub fn apply_merge_changes(
        &mut self,
        inputs: &[Arc<SegmentCommitInfo>],
        merged: Option<Arc<SegmentCommitInfo>>,
    ) -> Result<()> {
        let names: HashSet<&str> = inputs.iter().map(|s| s.name()).collect();
        let present = self
            .segments
            .iter()
            .filter(|s| names.contains(s.name()))
            .count();
        if present != names.len() {
            return Err(SluiceError::illegal_state(format!(
                "merge inputs {} are no longer all in the catalog",
                inputs
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(" ")
            )));
        }
        if let Some(merged) = &merged {
            if self.contains(merged.name()) {
                return Err(SluiceError::illegal_state(format!(
                    "merged segment {} is already in the catalog",
                    merged.name()
                )));
            }
        }

        let mut merged = merged.filter(|s| s.live_docs() > 0);
        let mut result = Vec::with_capacity(self.segments.len() + 1 - names.len());
        for segment in self.segments.drain(..) {
            if names.contains(segment.name()) {
                if let Some(merged) = merged.take() {
                    result.push(merged);
                }
            } else {
                result.push(segment);
            }
        }
        self.segments = result;
        self.changed();
        Ok(())
    }

    /// Drop every segment (used by delete-all).
    pub fn clear(&mut self) {
        self.segments.clear();
        self.changed();
    }

    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    pub fn total_live_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.live_docs() as u64).sum()
    }

    /// Files referenced by the segments (and by the current commit point if asked).
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files: BTreeSet<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        if include_segments_file && self.generation > 0 {
            files.insert(segments_file_name(self.generation));
        }
        files
    }

    /// Write the next commit point and make it durable.
    ///
    /// The commit is written under a pending name and renamed once synced,
    /// so readers never see a partial commit.
    pub fn commit(&mut self, directory: &dyn Directory) -> Result<String> {
        let next_generation = self.generation + 1;
        let record = CommitRecord {
            format: COMMIT_FORMAT_VERSION,
            generation: next_generation,
            version: self.version,
            counter: self.counter,
            segments: self.segments.iter().map(|s| s.to_record()).collect(),
            user_data: self.user_data.clone(),
        };
        let json = serde_json::to_vec(&record)?;

        let pending = format!("{PENDING_SEGMENTS_PREFIX}{}", base36(next_generation));
        let name = segments_file_name(next_generation);
        let mut output = directory.create_output(&pending)?;
        checksum::write_records(output.as_mut(), [json.as_slice()])?;
        output.close()?;

        let mut to_sync: Vec<String> = self.files(false).into_iter().collect();
        to_sync.push(pending.clone());
        directory.sync(&to_sync)?;
        directory.rename(&pending, &name)?;

        self.generation = next_generation;
        Ok(name)
    }

    /// Load the newest commit point, or `None` if the directory has none.
    pub fn read_latest(directory: &dyn Directory) -> Result<Option<SegmentCatalog>> {
        let latest = directory
            .list_all()?
            .iter()
            .filter_map(|name| generation_from_segments_file_name(name))
            .max();
        match latest {
            Some(generation) => Self::read(directory, generation).map(Some),
            None => Ok(None),
        }
    }

    /// Load a specific commit point.
    pub fn read(directory: &dyn Directory, generation: u64) -> Result<SegmentCatalog> {
        let name = segments_file_name(generation);
        let bytes = directory.read_file(&name)?;
        let mut records = checksum::read_records(&bytes, &name)?;
        let json = records
            .pop()
            .filter(|_| records.is_empty())
            .ok_or_else(|| SluiceError::corruption(format!("{name}: expected one record")))?;
        let record: CommitRecord = serde_json::from_slice(&json)?;
        if record.format != COMMIT_FORMAT_VERSION {
            return Err(SluiceError::corruption(format!(
                "{name}: unsupported commit format {}",
                record.format
            )));
        }
        if record.generation != generation {
            return Err(SluiceError::corruption(format!(
                "{name}: generation mismatch ({})",
                record.generation
            )));
        }

        let mut catalog = SegmentCatalog {
            segments: Vec::with_capacity(record.segments.len()),
            generation: record.generation,
            version: record.version,
            counter: record.counter,
            user_data: record.user_data,
        };
        for segment in record.segments {
            catalog.add(Arc::new(SegmentCommitInfo::from_record(segment)))?;
        }
        Ok(catalog)
    }

    /// Human-readable segment list, e.g. `_0(10) _1(5)/2:M`.
    pub fn describe(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::test_segment;
    use crate::storage::memory::RamDirectory;

    fn catalog_of(sizes: &[u32]) -> SegmentCatalog {
        let mut catalog = SegmentCatalog::new();
        for &max_doc in sizes {
            let name = catalog.new_segment_name();
            catalog
                .add(Arc::new(test_segment(&name, max_doc, 0, max_doc as u64)))
                .unwrap();
        }
        catalog
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut catalog = catalog_of(&[10]);
        let duplicate = Arc::new(test_segment("_0", 3, 0, 3));
        assert!(catalog.add(duplicate).is_err());
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_apply_merge_changes_keeps_first_input_position() {
        let mut catalog = catalog_of(&[10, 20, 30, 40]);
        let inputs = vec![
            Arc::clone(catalog.get("_1").unwrap()),
            Arc::clone(catalog.get("_3").unwrap()),
        ];
        let merged = Arc::new(test_segment("_m", 60, 0, 60));
        let version = catalog.version();

        catalog.apply_merge_changes(&inputs, Some(merged)).unwrap();

        let names: Vec<&str> = catalog.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["_0", "_m", "_2"]);
        assert_eq!(catalog.total_max_doc(), 100);
        assert!(catalog.version() > version);

        // Inputs are gone now, so the same merge cannot commit twice.
        assert!(
            catalog
                .apply_merge_changes(&inputs, Some(Arc::new(test_segment("_n", 1, 0, 1))))
                .is_err()
        );
    }

    #[test]
    fn test_fully_deleted_merge_result_is_dropped() {
        let mut catalog = catalog_of(&[5, 5]);
        let inputs: Vec<_> = catalog.iter().cloned().collect();
        let merged = Arc::new(test_segment("_m", 0, 0, 0));
        catalog.apply_merge_changes(&inputs, Some(merged)).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_live_doc_accounting() {
        let catalog = catalog_of(&[10, 20]);
        catalog.get("_1").unwrap().advance_del_gen(1, 5, 20).unwrap();
        assert_eq!(catalog.total_max_doc(), 30);
        assert_eq!(catalog.total_live_docs(), 25);
    }

    #[test]
    fn test_commit_and_read_latest() {
        let dir = RamDirectory::new();
        assert!(SegmentCatalog::read_latest(&dir).unwrap().is_none());

        let mut catalog = catalog_of(&[10, 20]);
        for name in catalog.files(false) {
            dir.write_file(&name, b"data").unwrap();
        }
        assert_eq!(catalog.commit(&dir).unwrap(), "segments_1");
        catalog.remove("_0");
        assert_eq!(catalog.commit(&dir).unwrap(), "segments_2");

        let loaded = SegmentCatalog::read_latest(&dir).unwrap().unwrap();
        assert_eq!(loaded.generation(), 2);
        assert_eq!(loaded.counter(), 2);
        assert_eq!(loaded.describe(), "_1(20)");
        assert!(loaded.files(true).contains("segments_2"));
        assert!(!dir.list_all().unwrap().iter().any(|f| f.starts_with("pending")));
    }

    #[test]
    fn test_corrupt_commit_is_detected() {
        let dir = RamDirectory::new();
        let mut catalog = catalog_of(&[1]);
        catalog.commit(&dir).unwrap();
        dir.corrupt_byte("segments_1", 6).unwrap();
        assert!(matches!(
            SegmentCatalog::read_latest(&dir),
            Err(SluiceError::Corruption(_))
        ));
    }
}
