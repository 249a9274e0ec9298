//! Log-structured merge policy.
//!
//! Segments are grouped into levels by `log(size) / log(merge_factor)`; each
//! level spans [`LEVEL_LOG_SPAN`] below the largest remaining segment. Within
//! a level, contiguous windows of `merge_factor` segments are merged. Size is
//! measured in documents ([`LogMergePolicy::doc`]) or bytes
//! ([`LogMergePolicy::byte_size`]).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::index::catalog::SegmentCatalog;
use crate::index::segment::SegmentCommitInfo;
use crate::merge::policy::{
    MergeContext, MergePolicy, MergeSpecification, MergeTrigger, OneMerge, keep_merges_below,
    mb_to_bytes,
};

const COMPONENT: &str = "LMP";

/// Segments within this many log units of the level's largest segment share its level.
pub const LEVEL_LOG_SPAN: f64 = 0.75;

/// What a segment's size is measured in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSizeUnit {
    Docs,
    Bytes,
}

/// Serialisable settings of a [`LogMergePolicy`].
///
/// `min_merge_docs` applies to the doc flavour, the `*_mb` values to the byte
/// flavour. `None` limits are unlimited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogMergePolicyConfig {
    pub unit: LogSizeUnit,
    pub merge_factor: usize,
    pub min_merge_docs: u64,
    pub min_merge_mb: f64,
    pub max_merge_mb: Option<f64>,
    pub max_merge_mb_for_forced_merge: Option<f64>,
    pub max_merge_docs: Option<u64>,
    /// Subtract deleted documents when sizing a segment.
    pub calibrate_size_by_deletes: bool,
}

impl LogMergePolicyConfig {
    pub fn doc() -> Self {
        LogMergePolicyConfig {
            unit: LogSizeUnit::Docs,
            merge_factor: 10,
            min_merge_docs: 1000,
            min_merge_mb: 1.6,
            max_merge_mb: None,
            max_merge_mb_for_forced_merge: None,
            max_merge_docs: None,
            calibrate_size_by_deletes: true,
        }
    }

    pub fn byte_size() -> Self {
        LogMergePolicyConfig {
            unit: LogSizeUnit::Bytes,
            max_merge_mb: Some(2048.0),
            ..Self::doc()
        }
    }
}

impl Default for LogMergePolicyConfig {
    fn default() -> Self {
        Self::doc()
    }
}

#[derive(Clone, Debug)]
pub struct LogMergePolicy {
    unit: LogSizeUnit,
    merge_factor: usize,
    /// Segments smaller than this all share the lowest level.
    min_merge_size: u64,
    max_merge_size: u64,
    max_merge_size_for_forced_merge: u64,
    max_merge_docs: u64,
    calibrate_size_by_deletes: bool,
}

impl LogMergePolicy {
    /// Sizes segments by document count.
    pub fn doc() -> Self {
        LogMergePolicy {
            unit: LogSizeUnit::Docs,
            merge_factor: 10,
            min_merge_size: 1000,
            max_merge_size: u64::MAX,
            max_merge_size_for_forced_merge: u64::MAX,
            max_merge_docs: u64::MAX,
            calibrate_size_by_deletes: true,
        }
    }

    /// Sizes segments by bytes on disk.
    pub fn byte_size() -> Self {
        LogMergePolicy {
            unit: LogSizeUnit::Bytes,
            min_merge_size: (1.6 * 1024.0 * 1024.0) as u64,
            max_merge_size: 2048 * 1024 * 1024,
            ..Self::doc()
        }
    }

    pub fn from_config(config: &LogMergePolicyConfig) -> Result<Self> {
        let mut policy = match config.unit {
            LogSizeUnit::Docs => {
                let mut policy = Self::doc();
                policy.set_min_merge_docs(config.min_merge_docs)?;
                policy
            }
            LogSizeUnit::Bytes => {
                let mut policy = Self::byte_size();
                policy.set_min_merge_mb(config.min_merge_mb)?;
                policy.set_max_merge_mb(config.max_merge_mb.unwrap_or(f64::INFINITY))?;
                policy.set_max_merge_mb_for_forced_merge(
                    config.max_merge_mb_for_forced_merge.unwrap_or(f64::INFINITY),
                )?;
                policy
            }
        };
        policy.set_merge_factor(config.merge_factor)?;
        policy.max_merge_docs = config.max_merge_docs.unwrap_or(u64::MAX);
        policy.calibrate_size_by_deletes = config.calibrate_size_by_deletes;
        Ok(policy)
    }

    pub fn unit(&self) -> LogSizeUnit {
        self.unit
    }

    pub fn merge_factor(&self) -> usize {
        self.merge_factor
    }

    pub fn set_merge_factor(&mut self, merge_factor: usize) -> Result<&mut Self> {
        if merge_factor < 2 {
            return Err(SluiceError::invalid_argument(format!(
                "merge_factor cannot be less than 2 (got {merge_factor})"
            )));
        }
        self.merge_factor = merge_factor;
        Ok(self)
    }

    pub fn set_min_merge_docs(&mut self, docs: u64) -> Result<&mut Self> {
        self.require_unit(LogSizeUnit::Docs, "min_merge_docs")?;
        self.min_merge_size = docs;
        Ok(self)
    }

    pub fn set_min_merge_mb(&mut self, mb: f64) -> Result<&mut Self> {
        self.require_unit(LogSizeUnit::Bytes, "min_merge_mb")?;
        self.min_merge_size = mb_to_bytes("min_merge_mb", mb)?;
        Ok(self)
    }

    pub fn set_max_merge_mb(&mut self, mb: f64) -> Result<&mut Self> {
        self.require_unit(LogSizeUnit::Bytes, "max_merge_mb")?;
        self.max_merge_size = mb_to_bytes("max_merge_mb", mb)?;
        Ok(self)
    }

    pub fn set_max_merge_mb_for_forced_merge(&mut self, mb: f64) -> Result<&mut Self> {
        self.require_unit(LogSizeUnit::Bytes, "max_merge_mb_for_forced_merge")?;
        self.max_merge_size_for_forced_merge = mb_to_bytes("max_merge_mb_for_forced_merge", mb)?;
        Ok(self)
    }

    /// Segments with more documents are never merged.
    pub fn set_max_merge_docs(&mut self, docs: u64) -> &mut Self {
        self.max_merge_docs = docs;
        self
    }

    pub fn set_calibrate_size_by_deletes(&mut self, calibrate: bool) -> &mut Self {
        self.calibrate_size_by_deletes = calibrate;
        self
    }

    fn require_unit(&self, unit: LogSizeUnit, setting: &str) -> Result<()> {
        if self.unit != unit {
            return Err(SluiceError::invalid_argument(format!(
                "{setting} does not apply to {}",
                self.name()
            )));
        }
        Ok(())
    }

    fn verbose(ctx: &dyn MergeContext) -> bool {
        ctx.info_stream().is_enabled(COMPONENT)
    }

    fn message(ctx: &dyn MergeContext, message: &str) {
        ctx.info_stream().message(COMPONENT, message);
    }

    fn size_docs(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        if self.calibrate_size_by_deletes {
            (info.max_doc() - ctx.num_deletes_to_merge(info)) as u64
        } else {
            info.max_doc() as u64
        }
    }

    fn size_bytes(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        if !self.calibrate_size_by_deletes || info.max_doc() == 0 {
            return info.size_in_bytes();
        }
        let del_ratio = ctx.num_deletes_to_merge(info) as f64 / info.max_doc() as f64;
        (info.size_in_bytes() as f64 * (1.0 - del_ratio)) as u64
    }

    fn too_large_for_forced_merge(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> bool {
        self.size(info, ctx) > self.max_merge_size_for_forced_merge
            || self.size_docs(info, ctx) > self.max_merge_docs
    }

    /// Whether the segments covered by a forced merge already meet its target.
    fn is_forced_merged(
        &self,
        catalog: &SegmentCatalog,
        max_num_segments: usize,
        segments_to_merge: &HashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> bool {
        let mut num_to_merge = 0;
        let mut last: Option<(&Arc<SegmentCommitInfo>, bool)> = None;
        for info in catalog.iter() {
            if num_to_merge > max_num_segments {
                break;
            }
            if let Some(&original) = segments_to_merge.get(info.name()) {
                num_to_merge += 1;
                last = Some((info, original));
            }
        }
        num_to_merge <= max_num_segments
            && (num_to_merge != 1
                || last.is_none_or(|(info, original)| {
                    !original || self.is_merged(catalog, info, ctx)
                }))
    }

    fn merge_of(segments: &[Arc<SegmentCommitInfo>]) -> Result<OneMerge> {
        OneMerge::new(segments.to_vec())
    }

    fn forced_merges_size_limit(
        &self,
        catalog: &SegmentCatalog,
        mut last: usize,
        ctx: &dyn MergeContext,
    ) -> Result<MergeSpecification> {
        let segments = catalog.segments();
        let mut spec = MergeSpecification::new();

        let mut start = last;
        while start > 0 {
            start -= 1;
            let info = &segments[start];
            if self.too_large_for_forced_merge(info, ctx) {
                // Skip the oversized segment and merge whatever lies to its right,
                // unless that is a single already-merged segment.
                if last - start - 1 > 1
                    || (start != last - 1 && !self.is_merged(catalog, &segments[start + 1], ctx))
                {
                    spec.add(Self::merge_of(&segments[start + 1..last])?);
                }
                last = start;
            } else if last - start == self.merge_factor {
                spec.add(Self::merge_of(&segments[start..last])?);
                last = start;
            }
        }

        // Left-over segments, unless just one that is already merged.
        if last > 0 && (last > 1 || !self.is_merged(catalog, &segments[0], ctx)) {
            spec.add(Self::merge_of(&segments[..last])?);
        }
        Ok(spec)
    }

    fn forced_merges_max_num_segments(
        &self,
        catalog: &SegmentCatalog,
        max_num_segments: usize,
        mut last: usize,
        ctx: &dyn MergeContext,
    ) -> Result<MergeSpecification> {
        let segments = catalog.segments();
        let mut spec = MergeSpecification::new();

        // Full windows first; they may run concurrently.
        while last + 1 >= self.merge_factor + max_num_segments {
            spec.add(Self::merge_of(&segments[last - self.merge_factor..last])?);
            last -= self.merge_factor;
        }

        // A final partial merge only once no full merge is left.
        if spec.is_empty() {
            if max_num_segments == 1 {
                if last > 1 || (last == 1 && !self.is_merged(catalog, &segments[0], ctx)) {
                    spec.add(Self::merge_of(&segments[..last])?);
                }
            } else if last > max_num_segments {
                let final_merge_size = last - max_num_segments + 1;

                // Cheapest window that does not leave the index lopsided.
                let mut best_size = 0u64;
                let mut best_start = 0usize;
                for i in 0..=(last - final_merge_size) {
                    let sum: u64 = segments[i..i + final_merge_size]
                        .iter()
                        .map(|info| self.size(info, ctx))
                        .sum();
                    if i == 0
                        || (sum < self.size(&segments[i - 1], ctx).saturating_mul(2) && sum < best_size)
                    {
                        best_start = i;
                        best_size = sum;
                    }
                }
                spec.add(Self::merge_of(
                    &segments[best_start..best_start + final_merge_size],
                )?);
            }
        }
        Ok(spec)
    }

    /// Drop merges touching segments that are already merging.
    fn without_merging(spec: MergeSpecification, ctx: &dyn MergeContext) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let mut kept = MergeSpecification::new();
        for merge in spec.merges {
            if merge.segments().iter().all(|s| !merging.contains(s.name())) {
                kept.add(merge);
            }
        }
        kept.into_option()
    }
}

impl MergePolicy for LogMergePolicy {
    fn name(&self) -> &str {
        match self.unit {
            LogSizeUnit::Docs => "log_doc",
            LogSizeUnit::Bytes => "log_byte_size",
        }
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        let segments = catalog.segments();
        let merging = ctx.merging_segments();
        let norm = (self.merge_factor as f64).ln();

        let levels: Vec<f64> = segments
            .iter()
            .map(|info| {
                let size = self.size(info, ctx).max(1);
                let level = (size as f64).ln() / norm;
                if Self::verbose(ctx) {
                    Self::message(
                        ctx,
                        &format!(
                            "seg={} level={level:.3} size={size}{}",
                            info,
                            if merging.contains(info.name()) { " [merging]" } else { "" }
                        ),
                    );
                }
                level
            })
            .collect();

        let level_floor = if self.min_merge_size == 0 {
            0.0
        } else {
            (self.min_merge_size as f64).ln() / norm
        };

        // Largest level at or right of each position.
        let mut max_levels = vec![-1.0f64; levels.len() + 1];
        for i in (0..levels.len()).rev() {
            max_levels[i] = levels[i].max(max_levels[i + 1]);
        }

        let mut spec = MergeSpecification::new();
        let mut start = 0;
        while start < levels.len() {
            let max_level = max_levels[start];

            let level_bottom = if max_level <= level_floor {
                // Everything left shares the lowest level.
                -1.0
            } else {
                let bottom = max_level - LEVEL_LOG_SPAN;
                if bottom < level_floor && max_level >= level_floor {
                    level_floor
                } else {
                    bottom
                }
            };

            // Rightmost segment that still falls into this level.
            let mut upto = levels.len();
            while upto > start && levels[upto - 1] < level_bottom {
                upto -= 1;
            }
            if Self::verbose(ctx) {
                Self::message(
                    ctx,
                    &format!(
                        "  level {level_bottom:.3} to {max_level:.3}: {} segments",
                        upto - start
                    ),
                );
            }

            let mut end = start + self.merge_factor;
            while end <= upto {
                let window = &segments[start..end];
                let any_merging = window.iter().any(|info| merging.contains(info.name()));
                let mut merge_size = 0u64;
                let mut merge_docs = 0u64;
                let mut any_too_large = false;
                for info in window {
                    merge_size = merge_size.saturating_add(self.size(info, ctx));
                    merge_docs += self.size_docs(info, ctx);
                    any_too_large |=
                        merge_size > self.max_merge_size || merge_docs > self.max_merge_docs;
                }

                if any_merging {
                    // Already being merged.
                } else if !any_too_large {
                    let merge = Self::merge_of(window)?;
                    if Self::verbose(ctx) {
                        Self::message(
                            ctx,
                            &format!("    add merge={} start={start} end={end}", merge.seg_string()),
                        );
                    }
                    spec.add(merge);
                } else if Self::verbose(ctx) {
                    Self::message(
                        ctx,
                        &format!(
                            "    {start} to {end}: contains segment over max merge size or docs; skipping"
                        ),
                    );
                }
                start = end;
                end = start + self.merge_factor;
            }
            start = upto;
        }

        Ok(spec.into_option())
    }

    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &HashMap<String, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        if max_segment_count == 0 {
            return Err(SluiceError::invalid_argument(
                "max_segment_count must be >= 1 (got 0)",
            ));
        }
        if Self::verbose(ctx) {
            Self::message(
                ctx,
                &format!(
                    "findForcedMerges: maxNumSegs={max_segment_count} segsToMerge={}",
                    segments_to_merge.len()
                ),
            );
        }

        if self.is_forced_merged(catalog, max_segment_count, segments_to_merge, ctx) {
            if Self::verbose(ctx) {
                Self::message(ctx, "already merged; skip");
            }
            return Ok(None);
        }

        // Newest segment the forced merge covers; later ones were flushed since.
        let segments = catalog.segments();
        let Some(last) = segments
            .iter()
            .rposition(|info| segments_to_merge.contains_key(info.name()))
            .map(|i| i + 1)
        else {
            return Ok(None);
        };

        if max_segment_count == 1 && last == 1 && self.is_merged(catalog, &segments[0], ctx) {
            return Ok(None);
        }

        let any_too_large = segments[..last]
            .iter()
            .any(|info| self.too_large_for_forced_merge(info, ctx));

        let spec = if any_too_large {
            self.forced_merges_size_limit(catalog, last, ctx)?
        } else {
            self.forced_merges_max_num_segments(catalog, max_segment_count, last, ctx)?
        };
        Ok(Self::without_merging(spec, ctx))
    }

    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        let segments = catalog.segments();
        let merging = ctx.merging_segments();
        let mut spec = MergeSpecification::new();

        // Runs of consecutive segments with deletes, at most merge_factor long.
        let mut first_with_deletes: Option<usize> = None;
        for (i, info) in segments.iter().enumerate() {
            let has_deletes =
                ctx.num_deletes_to_merge(info) > 0 && !merging.contains(info.name());
            match (has_deletes, first_with_deletes) {
                (true, None) => first_with_deletes = Some(i),
                (true, Some(first)) if i - first == self.merge_factor => {
                    spec.add(Self::merge_of(&segments[first..i])?);
                    first_with_deletes = Some(i);
                }
                (false, Some(first)) => {
                    spec.add(Self::merge_of(&segments[first..i])?);
                    first_with_deletes = None;
                }
                _ => {}
            }
        }
        if let Some(first) = first_with_deletes {
            spec.add(Self::merge_of(&segments[first..])?);
        }

        if Self::verbose(ctx) && !spec.is_empty() {
            Self::message(ctx, &format!("forced deletes merges: {}", spec.seg_string()));
        }
        Ok(spec.into_option())
    }

    fn find_full_flush_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        let spec = self.find_merges(trigger, catalog, ctx)?;
        Ok(keep_merges_below(self, spec, self.min_merge_size, ctx))
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        match self.unit {
            LogSizeUnit::Docs => self.size_docs(info, ctx),
            LogSizeUnit::Bytes => self.size_bytes(info, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::test_segment;
    use crate::merge::policy::SimpleMergeContext;

    fn catalog(segments: &[(u32, u32, u64)]) -> SegmentCatalog {
        let mut catalog = SegmentCatalog::new();
        for &(max_doc, del_count, size) in segments {
            let name = catalog.new_segment_name();
            catalog
                .add(Arc::new(test_segment(&name, max_doc, del_count, size)))
                .unwrap();
        }
        catalog
    }

    fn all_original(catalog: &SegmentCatalog) -> HashMap<String, bool> {
        catalog.iter().map(|s| (s.name().to_string(), true)).collect()
    }

    fn doc_counts(merge: &OneMerge) -> Vec<u32> {
        merge.segments().iter().map(|s| s.max_doc()).collect()
    }

    #[test]
    fn test_levels_merge_first_full_window() {
        let sizes: Vec<(u32, u32, u64)> = (1..=11).map(|i| (i * 1000, 0, 0)).collect();
        let catalog = catalog(&sizes);
        let policy = LogMergePolicy::doc();

        let spec = policy
            .find_merges(MergeTrigger::Explicit, &catalog, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        let merge = &spec.merges[0];
        assert_eq!(doc_counts(merge), (1..=10).map(|i| i * 1000).collect::<Vec<_>>());
        assert_eq!(merge.total_max_doc(), 55000);
    }

    #[test]
    fn test_windows_with_merging_segments_are_skipped() {
        let catalog = catalog(&[(1000, 0, 0); 20]);
        let policy = LogMergePolicy::doc();
        let mut ctx = SimpleMergeContext::new();
        ctx.add_merging("_3");

        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments()[0].name(), "_a");
    }

    #[test]
    fn test_byte_size_cap_skips_window() {
        let mb = 1024 * 1024;
        let catalog = catalog(&[(10, 0, 2 * mb); 10]);
        let mut policy = LogMergePolicy::byte_size();
        assert_eq!(policy.name(), "log_byte_size");

        assert!(
            policy
                .find_merges(MergeTrigger::SegmentFlush, &catalog, &SimpleMergeContext::new())
                .unwrap()
                .is_some()
        );
        policy.set_max_merge_mb(15.0).unwrap();
        assert!(
            policy
                .find_merges(MergeTrigger::SegmentFlush, &catalog, &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_forced_merge_enrolls_full_windows_first() {
        let catalog = catalog(&[(100, 0, 0); 25]);
        let policy = LogMergePolicy::doc();
        let to_merge = all_original(&catalog);

        let spec = policy
            .find_forced_merges(&catalog, 1, &to_merge, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec.merges[0].segments()[0].name(), "_f");
        assert_eq!(spec.merges[1].segments()[0].name(), "_5");
    }

    #[test]
    fn test_forced_merge_partial_window() {
        let catalog = catalog(&[(100, 0, 0); 5]);
        let policy = LogMergePolicy::doc();
        let to_merge = all_original(&catalog);

        let spec = policy
            .find_forced_merges(&catalog, 1, &to_merge, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(spec.merges[0].segments().len(), 5);

        let spec = policy
            .find_forced_merges(&catalog, 2, &to_merge, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        let names: Vec<&str> = spec.merges[0].segments().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["_0", "_1", "_2", "_3"]);

        // A merging input blocks the final merge until it is done.
        let mut ctx = SimpleMergeContext::new();
        ctx.add_merging("_2");
        assert!(
            policy
                .find_forced_merges(&catalog, 1, &to_merge, &ctx)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_forced_merge_already_merged() {
        let policy = LogMergePolicy::doc();
        let single = catalog(&[(100, 0, 0)]);
        assert!(
            policy
                .find_forced_merges(&single, 1, &all_original(&single), &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );

        let with_deletes = catalog(&[(100, 10, 0)]);
        let spec = policy
            .find_forced_merges(
                &with_deletes,
                1,
                &all_original(&with_deletes),
                &SimpleMergeContext::new(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(spec.merges[0].segments().len(), 1);

        let three = catalog(&[(100, 0, 0); 3]);
        assert!(
            policy
                .find_forced_merges(&three, 3, &all_original(&three), &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_forced_merge_skips_oversized_segments() {
        let mut policy = LogMergePolicy::doc();
        policy.set_max_merge_docs(500);
        let catalog = catalog(&[(100, 0, 0), (100, 0, 0), (1000, 0, 0), (100, 0, 0), (100, 0, 0)]);

        let spec = policy
            .find_forced_merges(&catalog, 1, &all_original(&catalog), &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        let groups: Vec<Vec<&str>> = spec
            .merges
            .iter()
            .map(|m| m.segments().iter().map(|s| s.name()).collect())
            .collect();
        assert_eq!(groups, vec![vec!["_3", "_4"], vec!["_0", "_1"]]);
    }

    #[test]
    fn test_forced_deletes_merges_runs() {
        let policy = LogMergePolicy::doc();
        let catalog = catalog(&[(10, 1, 0), (10, 2, 0), (10, 0, 0), (10, 5, 0)]);

        let spec = policy
            .find_forced_deletes_merges(&catalog, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        let groups: Vec<Vec<&str>> = spec
            .merges
            .iter()
            .map(|m| m.segments().iter().map(|s| s.name()).collect())
            .collect();
        assert_eq!(groups, vec![vec!["_0", "_1"], vec!["_3"]]);
    }

    #[test]
    fn test_setters_validate() {
        let mut doc = LogMergePolicy::doc();
        assert!(doc.set_merge_factor(1).is_err());
        assert!(doc.set_min_merge_mb(1.0).is_err());
        doc.set_min_merge_docs(10).unwrap();

        let mut bytes = LogMergePolicy::byte_size();
        assert!(bytes.set_min_merge_docs(10).is_err());
        assert!(bytes.set_max_merge_mb(-1.0).is_err());

        let config = LogMergePolicyConfig {
            merge_factor: 4,
            ..LogMergePolicyConfig::byte_size()
        };
        let policy = LogMergePolicy::from_config(&config).unwrap();
        assert_eq!(policy.merge_factor(), 4);
        assert_eq!(policy.unit(), LogSizeUnit::Bytes);
    }
}
