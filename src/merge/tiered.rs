//! Tiered merge policy.
//!
//! Segments are sorted by their delete-adjusted size and the index is
//! allowed a budget of segments per geometric size tier. When the budget is
//! exceeded, every window of up to `max_merge_at_once` consecutive segments
//! (in size order) is scored and the best one is merged:
//!
//! ```text
//! score = skew * total_bytes^0.05 * non_deleted_ratio^2      (lower wins)
//! ```
//!
//! where skew is the share of the biggest input in the merged size. Balanced
//! merges of similarly sized segments that reclaim deletes are preferred.
//! Merges that would not grow the biggest input by `min_merge_growth_ratio`
//! are skipped to avoid rewriting the same large segment again and again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::index::catalog::SegmentCatalog;
use crate::index::segment::SegmentCommitInfo;
use crate::merge::policy::{
    MergeContext, MergePolicy, MergeSpecification, MergeTrigger, OneMerge, bytes_to_mb,
    keep_merges_below, mb_to_bytes,
};

const COMPONENT: &str = "TP";

/// Serialisable settings of a [`TieredMergePolicy`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicyConfig {
    /// Maximum number of segments merged at once during natural merges.
    pub max_merge_at_once: usize,
    /// Maximum number of segments merged at once during forced merges.
    pub max_merge_at_once_explicit: usize,
    /// Merged segments are kept below this size (except forced merges to few segments).
    pub max_merged_segment_mb: f64,
    /// Smaller segments are treated as this size when budgeting and scoring.
    pub floor_segment_mb: f64,
    /// Allowed segments per tier.
    pub segments_per_tier: f64,
    /// Deleted-docs percentage above which `force_merge_deletes` rewrites a segment.
    pub force_merge_deletes_pct_allowed: f64,
    /// Target maximum percentage of deleted docs in the index.
    pub deletes_pct_allowed: f64,
    /// Keep at least this many segments at the top tier for search parallelism.
    pub target_search_concurrency: usize,
    /// A natural merge must grow its biggest input by this factor.
    pub min_merge_growth_ratio: f64,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        TieredMergePolicyConfig {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_mb: 5.0 * 1024.0,
            floor_segment_mb: 2.0,
            segments_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            deletes_pct_allowed: 20.0,
            target_search_concurrency: 1,
            min_merge_growth_ratio: 1.5,
        }
    }
}

/// Which entry point is selecting merges; changes the stopping rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergeType {
    Natural,
    ForceMergeDeletes,
}

/// A segment together with the numbers the policy works with.
#[derive(Clone, Debug)]
struct SegmentSizeAndDocs {
    info: Arc<SegmentCommitInfo>,
    size_in_bytes: u64,
    del_count: u32,
    max_doc: u32,
}

impl SegmentSizeAndDocs {
    fn name(&self) -> &str {
        self.info.name()
    }

    fn del_pct(&self) -> f64 {
        if self.max_doc == 0 {
            0.0
        } else {
            100.0 * self.del_count as f64 / self.max_doc as f64
        }
    }
}

#[derive(Debug)]
struct MergeScore {
    score: f64,
    explanation: String,
}

/// Merges segments of approximately equal size, subject to a per-tier budget.
#[derive(Clone, Debug)]
pub struct TieredMergePolicy {
    max_merge_at_once: usize,
    max_merge_at_once_explicit: usize,
    max_merged_segment_bytes: u64,
    floor_segment_bytes: u64,
    segs_per_tier: f64,
    force_merge_deletes_pct_allowed: f64,
    deletes_pct_allowed: f64,
    target_search_concurrency: usize,
    min_merge_growth_ratio: f64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredMergePolicy {
    pub fn new() -> Self {
        let defaults = TieredMergePolicyConfig::default();
        TieredMergePolicy {
            max_merge_at_once: defaults.max_merge_at_once,
            max_merge_at_once_explicit: defaults.max_merge_at_once_explicit,
            max_merged_segment_bytes: (defaults.max_merged_segment_mb * 1024.0 * 1024.0) as u64,
            floor_segment_bytes: (defaults.floor_segment_mb * 1024.0 * 1024.0) as u64,
            segs_per_tier: defaults.segments_per_tier,
            force_merge_deletes_pct_allowed: defaults.force_merge_deletes_pct_allowed,
            deletes_pct_allowed: defaults.deletes_pct_allowed,
            target_search_concurrency: defaults.target_search_concurrency,
            min_merge_growth_ratio: defaults.min_merge_growth_ratio,
        }
    }

    /// Build from settings, validating every value.
    pub fn from_config(config: &TieredMergePolicyConfig) -> Result<Self> {
        let mut policy = Self::new();
        policy
            .set_max_merge_at_once(config.max_merge_at_once)?
            .set_max_merge_at_once_explicit(config.max_merge_at_once_explicit)?
            .set_max_merged_segment_mb(config.max_merged_segment_mb)?
            .set_floor_segment_mb(config.floor_segment_mb)?
            .set_segments_per_tier(config.segments_per_tier)?
            .set_force_merge_deletes_pct_allowed(config.force_merge_deletes_pct_allowed)?
            .set_deletes_pct_allowed(config.deletes_pct_allowed)?
            .set_target_search_concurrency(config.target_search_concurrency)?
            .set_min_merge_growth_ratio(config.min_merge_growth_ratio)?;
        Ok(policy)
    }

    /// Current settings.
    pub fn config(&self) -> TieredMergePolicyConfig {
        TieredMergePolicyConfig {
            max_merge_at_once: self.max_merge_at_once,
            max_merge_at_once_explicit: self.max_merge_at_once_explicit,
            max_merged_segment_mb: bytes_to_mb(self.max_merged_segment_bytes),
            floor_segment_mb: bytes_to_mb(self.floor_segment_bytes),
            segments_per_tier: self.segs_per_tier,
            force_merge_deletes_pct_allowed: self.force_merge_deletes_pct_allowed,
            deletes_pct_allowed: self.deletes_pct_allowed,
            target_search_concurrency: self.target_search_concurrency,
            min_merge_growth_ratio: self.min_merge_growth_ratio,
        }
    }

    pub fn set_max_merge_at_once(&mut self, v: usize) -> Result<&mut Self> {
        if v < 2 {
            return Err(SluiceError::invalid_argument(format!(
                "max_merge_at_once must be > 1 (got {v})"
            )));
        }
        self.max_merge_at_once = v;
        Ok(self)
    }

    pub fn set_max_merge_at_once_explicit(&mut self, v: usize) -> Result<&mut Self> {
        if v < 2 {
            return Err(SluiceError::invalid_argument(format!(
                "max_merge_at_once_explicit must be > 1 (got {v})"
            )));
        }
        self.max_merge_at_once_explicit = v;
        Ok(self)
    }

    /// Infinite values clamp to the largest representable size.
    pub fn set_max_merged_segment_mb(&mut self, v: f64) -> Result<&mut Self> {
        self.max_merged_segment_bytes = mb_to_bytes("max_merged_segment_mb", v)?;
        Ok(self)
    }

    pub fn max_merged_segment_bytes(&self) -> u64 {
        self.max_merged_segment_bytes
    }

    pub fn set_floor_segment_mb(&mut self, v: f64) -> Result<&mut Self> {
        self.floor_segment_bytes = mb_to_bytes("floor_segment_mb", v)?;
        Ok(self)
    }

    pub fn floor_segment_bytes(&self) -> u64 {
        self.floor_segment_bytes
    }

    pub fn set_segments_per_tier(&mut self, v: f64) -> Result<&mut Self> {
        if v.is_nan() || v < 2.0 {
            return Err(SluiceError::invalid_argument(format!(
                "segments_per_tier must be >= 2.0 (got {v})"
            )));
        }
        self.segs_per_tier = v;
        Ok(self)
    }

    pub fn set_force_merge_deletes_pct_allowed(&mut self, v: f64) -> Result<&mut Self> {
        if !(0.0..=100.0).contains(&v) {
            return Err(SluiceError::invalid_argument(format!(
                "force_merge_deletes_pct_allowed must be between 0.0 and 100.0 inclusive (got {v})"
            )));
        }
        self.force_merge_deletes_pct_allowed = v;
        Ok(self)
    }

    pub fn set_deletes_pct_allowed(&mut self, v: f64) -> Result<&mut Self> {
        if !(5.0..=50.0).contains(&v) {
            return Err(SluiceError::invalid_argument(format!(
                "deletes_pct_allowed must be between 5.0 and 50.0 inclusive (got {v})"
            )));
        }
        self.deletes_pct_allowed = v;
        Ok(self)
    }

    pub fn set_target_search_concurrency(&mut self, v: usize) -> Result<&mut Self> {
        if v < 1 {
            return Err(SluiceError::invalid_argument(
                "target_search_concurrency must be >= 1 (got 0)",
            ));
        }
        self.target_search_concurrency = v;
        Ok(self)
    }

    pub fn set_min_merge_growth_ratio(&mut self, v: f64) -> Result<&mut Self> {
        if v.is_nan() || v < 1.0 {
            return Err(SluiceError::invalid_argument(format!(
                "min_merge_growth_ratio must be >= 1.0 (got {v})"
            )));
        }
        self.min_merge_growth_ratio = v;
        Ok(self)
    }

    fn verbose(ctx: &dyn MergeContext) -> bool {
        ctx.info_stream().is_enabled(COMPONENT)
    }

    fn message(ctx: &dyn MergeContext, message: &str) {
        ctx.info_stream().message(COMPONENT, message);
    }

    fn floor_size(&self, bytes: u64) -> u64 {
        bytes.max(self.floor_segment_bytes)
    }

    fn merge_factor(&self) -> usize {
        (self.max_merge_at_once as f64).min(self.segs_per_tier) as usize
    }

    fn max_allowed_docs(&self, total_max_doc: u64, total_del_docs: u64) -> u64 {
        (total_max_doc - total_del_docs).div_ceil(self.target_search_concurrency as u64)
    }

    /// Segments sorted by decreasing weighted size; ties by name.
    fn sorted_by_size(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Vec<SegmentSizeAndDocs> {
        let mut sorted: Vec<SegmentSizeAndDocs> = catalog
            .iter()
            .map(|info| SegmentSizeAndDocs {
                info: Arc::clone(info),
                size_in_bytes: self.size(info, ctx),
                del_count: ctx.num_deletes_to_merge(info),
                max_doc: info.max_doc(),
            })
            .collect();
        sorted.sort_by(|a, b| {
            b.size_in_bytes
                .cmp(&a.size_in_bytes)
                .then_with(|| a.name().cmp(b.name()))
        });
        sorted
    }

    fn score(
        &self,
        candidate: &[&SegmentSizeAndDocs],
        hit_too_large: bool,
    ) -> MergeScore {
        let mut before_bytes = 0u64;
        let mut after_bytes = 0u64;
        let mut after_bytes_floored = 0u64;
        for segment in candidate {
            after_bytes += segment.size_in_bytes;
            after_bytes_floored += self.floor_size(segment.size_in_bytes);
            before_bytes += segment.info.size_in_bytes();
        }

        // Skew ranges from 1/num_segments (perfectly balanced) to 1.0.
        let skew = if hit_too_large {
            // Max-sized merges never cascade, so their balance does not matter.
            1.0 / self.merge_factor() as f64
        } else {
            self.floor_size(candidate[0].size_in_bytes) as f64 / after_bytes_floored as f64
        };

        let mut score = skew;
        score *= (after_bytes as f64).powf(0.05);
        let non_del_ratio = if before_bytes == 0 {
            1.0
        } else {
            after_bytes as f64 / before_bytes as f64
        };
        score *= non_del_ratio.powi(2);

        MergeScore {
            score,
            explanation: format!("skew={skew:.3} nonDelRatio={non_del_ratio:.3}"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn do_find_merges(
        &self,
        sorted_eligible: Vec<SegmentSizeAndDocs>,
        max_merged_segment_bytes: u64,
        merge_factor: usize,
        allowed_seg_count: usize,
        allowed_del_count: u64,
        allowed_doc_count: u64,
        merge_type: MergeType,
        ctx: &dyn MergeContext,
        max_merge_is_running: bool,
    ) -> Result<Option<MergeSpecification>> {
        if Self::verbose(ctx) {
            Self::message(ctx, &format!("findMerges: {} segments", sorted_eligible.len()));
        }
        let mut eligible = sorted_eligible;
        let mut to_be_merged: HashSet<String> = HashSet::new();
        let mut spec = MergeSpecification::new();

        // Only one max-sized merge per call; the next call picks up another one.
        let mut have_one_large_merge = false;

        loop {
            eligible.retain(|segment| !to_be_merged.contains(segment.name()));
            if eligible.is_empty() {
                return Ok(spec.into_option());
            }

            let remaining_del_count: u64 = eligible.iter().map(|s| s.del_count as u64).sum();
            if merge_type == MergeType::Natural
                && eligible.len() <= allowed_seg_count
                && remaining_del_count <= allowed_del_count
            {
                return Ok(spec.into_option());
            }

            // Over budget: find the best merge.
            let mut best: Option<(Vec<usize>, MergeScore, bool, u64)> = None;

            for start in 0..eligible.len() {
                let mut candidate: Vec<usize> = Vec::new();
                let mut hit_too_large = false;
                let mut bytes_this_merge = 0u64;
                let mut docs_this_merge = 0u64;

                let mut idx = start;
                while idx < eligible.len()
                    && candidate.len() < merge_factor
                    && bytes_this_merge < max_merged_segment_bytes
                    && (bytes_this_merge < self.floor_segment_bytes
                        || docs_this_merge <= allowed_doc_count)
                {
                    let segment = &eligible[idx];
                    idx += 1;
                    let seg_bytes = segment.size_in_bytes;
                    let seg_docs = (segment.max_doc - segment.del_count) as u64;
                    let too_many_bytes =
                        bytes_this_merge.saturating_add(seg_bytes) > max_merged_segment_bytes;
                    if too_many_bytes
                        || (bytes_this_merge > self.floor_segment_bytes
                            && docs_this_merge + seg_docs > allowed_doc_count)
                    {
                        // Only the byte limit makes a max-sized segment that will sit out
                        // future merges for a long time.
                        hit_too_large |= too_many_bytes;
                        if !candidate.is_empty() {
                            // Keep packing smaller segments into this merge.
                            continue;
                        }
                    }
                    candidate.push(idx - 1);
                    bytes_this_merge = bytes_this_merge.saturating_add(seg_bytes);
                    docs_this_merge += seg_docs;
                }

                let Some(&first) = candidate.first() else {
                    continue;
                };
                let biggest = &eligible[first];

                if !hit_too_large
                    && merge_type == MergeType::Natural
                    && (bytes_this_merge as f64)
                        < biggest.size_in_bytes as f64 * self.min_merge_growth_ratio
                    && biggest.del_pct() < self.deletes_pct_allowed
                {
                    // The merged segment would barely be bigger than its biggest input.
                    continue;
                }

                // A singleton merge only makes sense when it reclaims deletes.
                if candidate.len() == 1 && biggest.del_count == 0 {
                    continue;
                }

                // Shorter windows from here on only get smaller.
                if best.is_some() && !hit_too_large && candidate.len() < merge_factor {
                    break;
                }

                let members: Vec<&SegmentSizeAndDocs> =
                    candidate.iter().map(|&i| &eligible[i]).collect();
                let score = self.score(&members, hit_too_large);
                if Self::verbose(ctx) {
                    Self::message(
                        ctx,
                        &format!(
                            "  maybe={} score={:.6} {} tooLarge={} size={:.3} MB",
                            members
                                .iter()
                                .map(|s| s.info.to_string())
                                .collect::<Vec<_>>()
                                .join(" "),
                            score.score,
                            score.explanation,
                            hit_too_large,
                            bytes_to_mb(bytes_this_merge)
                        ),
                    );
                }

                let better = best
                    .as_ref()
                    .is_none_or(|(_, best_score, _, _)| score.score < best_score.score);
                if better && (!hit_too_large || !max_merge_is_running) {
                    best = Some((candidate, score, hit_too_large, bytes_this_merge));
                }
            }

            let Some((best, best_score, best_too_large, best_bytes)) = best else {
                return Ok(spec.into_option());
            };

            if !have_one_large_merge
                || !best_too_large
                || merge_type == MergeType::ForceMergeDeletes
            {
                have_one_large_merge |= best_too_large;
                let segments: Vec<Arc<SegmentCommitInfo>> =
                    best.iter().map(|&i| Arc::clone(&eligible[i].info)).collect();
                let merge = OneMerge::new(segments)?;
                if Self::verbose(ctx) {
                    Self::message(
                        ctx,
                        &format!(
                            "  add merge={} size={:.3} MB score={:.6} {}{}",
                            merge.seg_string(),
                            bytes_to_mb(best_bytes),
                            best_score.score,
                            best_score.explanation,
                            if best_too_large { " [max merge]" } else { "" }
                        ),
                    );
                }
                spec.add(merge);
            } else {
                return Ok(spec.into_option());
            }

            to_be_merged.extend(best.iter().map(|&i| eligible[i].name().to_string()));
        }
    }
}

impl MergePolicy for TieredMergePolicy {
    fn name(&self) -> &str {
        "tiered"
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        let merging = ctx.merging_segments();

        let mut tot_index_bytes = 0u64;
        let mut min_segment_bytes = u64::MAX;
        let mut total_del_docs = 0u64;
        let mut total_max_doc = 0u64;
        let mut merging_bytes = 0u64;

        let mut sorted = self.sorted_by_size(catalog, ctx);
        sorted.retain(|segment| {
            if Self::verbose(ctx) {
                Self::message(
                    ctx,
                    &format!(
                        "  seg={} size={:.3} MB{}",
                        segment.info,
                        bytes_to_mb(segment.size_in_bytes),
                        if merging.contains(segment.name()) { " [merging]" } else { "" }
                    ),
                );
            }
            let keep = if merging.contains(segment.name()) {
                merging_bytes += segment.size_in_bytes;
                // Deletes of merging segments are already being reclaimed.
                total_max_doc += (segment.max_doc - segment.del_count) as u64;
                false
            } else {
                total_del_docs += segment.del_count as u64;
                total_max_doc += segment.max_doc as u64;
                true
            };
            min_segment_bytes = min_segment_bytes.min(segment.size_in_bytes);
            tot_index_bytes += segment.size_in_bytes;
            keep
        });

        let total_del_pct = if total_max_doc == 0 {
            0.0
        } else {
            100.0 * total_del_docs as f64 / total_max_doc as f64
        };
        let mut allowed_del_count = (self.deletes_pct_allowed * total_max_doc as f64 / 100.0) as i64;

        // Grace too-big segments out of the budget unless they carry many deletes; the
        // first target_search_concurrency - 1 big segments each count as one whole segment.
        let mut too_big_count = 0usize;
        let mut concurrency_count = 0usize;
        let mut allowed_seg_count = 0.0f64;
        sorted.retain(|segment| {
            if segment.size_in_bytes > self.max_merged_segment_bytes / 2
                && (total_del_pct <= self.deletes_pct_allowed
                    || segment.del_pct() <= self.deletes_pct_allowed)
            {
                too_big_count += 1;
                tot_index_bytes -= segment.size_in_bytes;
                allowed_del_count -= segment.del_count as i64;
                false
            } else {
                if concurrency_count + too_big_count < self.target_search_concurrency - 1 {
                    concurrency_count += 1;
                    allowed_seg_count += 1.0;
                    tot_index_bytes -= segment.size_in_bytes;
                }
                true
            }
        });
        let allowed_del_count = allowed_del_count.max(0) as u64;

        let merge_factor = self.merge_factor();
        let mut level_size = min_segment_bytes.max(self.floor_segment_bytes);
        let mut bytes_left = tot_index_bytes as f64;
        loop {
            let seg_count_level = bytes_left / level_size as f64;
            if seg_count_level < self.segs_per_tier || level_size == self.max_merged_segment_bytes {
                allowed_seg_count += seg_count_level.ceil();
                break;
            }
            allowed_seg_count += self.segs_per_tier;
            bytes_left -= self.segs_per_tier * level_size as f64;
            level_size = self
                .max_merged_segment_bytes
                .min(level_size.saturating_mul(merge_factor as u64));
        }
        // Below the floor the budget can drop under one tier.
        allowed_seg_count = allowed_seg_count.max(self.segs_per_tier);
        allowed_seg_count = allowed_seg_count.max(
            self.target_search_concurrency
                .saturating_sub(too_big_count) as f64,
        );
        let allowed_doc_count = self.max_allowed_docs(total_max_doc, total_del_docs);

        if Self::verbose(ctx) && too_big_count > 0 {
            Self::message(
                ctx,
                &format!(
                    "  allowedSegmentCount={allowed_seg_count} vs count={} (eligible count={}) tooBigCount={too_big_count}",
                    catalog.len(),
                    sorted.len()
                ),
            );
        }

        self.do_find_merges(
            sorted,
            self.max_merged_segment_bytes,
            merge_factor,
            allowed_seg_count as usize,
            allowed_del_count,
            allowed_doc_count,
            MergeType::Natural,
            ctx,
            merging_bytes >= self.max_merged_segment_bytes,
        )
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
                    "findForcedMerges maxSegmentCount={max_segment_count} infos={} segmentsToMerge={}",
                    catalog.describe(),
                    segments_to_merge.len()
                ),
            );
        }

        let merging = ctx.merging_segments();
        let mut sorted = self.sorted_by_size(catalog, ctx);
        let mut total_merge_bytes = 0u64;
        let mut force_merge_running = false;

        // Keep only segments the forced merge covers; note if some of them are already merging.
        sorted.retain(|segment| match segments_to_merge.get(segment.name()) {
            None => false,
            Some(_) if merging.contains(segment.name()) => {
                force_merge_running = true;
                false
            }
            Some(_) => {
                total_merge_bytes += segment.size_in_bytes;
                true
            }
        });

        let max_merge_bytes = if max_segment_count == 1 {
            u64::MAX
        } else if max_segment_count == usize::MAX {
            self.max_merged_segment_bytes
        } else {
            let per_segment = (total_merge_bytes as f64 / max_segment_count as f64) as u64;
            // Fudge up so one pass is likely enough to reach the target count.
            (per_segment.max(self.max_merged_segment_bytes) as f64 * 1.25) as u64
        };

        let mut found_deletes = false;
        sorted.retain(|segment| {
            let is_original = segments_to_merge.get(segment.name()).copied();
            if segment.del_count != 0 {
                // Every segment with deletes is rewritten by a forced merge.
                found_deletes |= is_original == Some(true);
                return true;
            }
            if max_segment_count == usize::MAX && is_original == Some(false) {
                return false;
            }
            // A segment without deletes that is already too big stays as it is.
            !(max_segment_count != usize::MAX && segment.size_in_bytes >= max_merge_bytes)
        });

        if sorted.is_empty() {
            return Ok(None);
        }

        if !found_deletes {
            let first = &sorted[0];
            let already_merged = (max_segment_count != usize::MAX
                && max_segment_count > 1
                && sorted.len() <= max_segment_count)
                || (max_segment_count == 1
                    && sorted.len() == 1
                    && (segments_to_merge.contains_key(first.name())
                        || self.is_merged(catalog, &first.info, ctx)));
            if already_merged {
                if Self::verbose(ctx) {
                    Self::message(ctx, "already merged");
                }
                return Ok(None);
            }
        }

        if Self::verbose(ctx) {
            Self::message(
                ctx,
                &format!(
                    "eligible={} forceMergeRunning={force_merge_running}",
                    sorted.iter().map(|s| s.info.to_string()).collect::<Vec<_>>().join(" ")
                ),
            );
        }

        // Merging everything into one segment in a single pass.
        if max_segment_count == 1 && total_merge_bytes < max_merge_bytes {
            if force_merge_running {
                // The final merge waits until the partial ones have finished.
                return Ok(None);
            }
            let mut spec = MergeSpecification::new();
            spec.add(OneMerge::new(
                sorted.iter().map(|s| Arc::clone(&s.info)).collect(),
            )?);
            return Ok(Some(spec));
        }

        // Bin-pack from the smallest segment upwards.
        let mut spec = MergeSpecification::new();
        let mut index = sorted.len();
        let mut resulting_segments = sorted.len();
        loop {
            let mut candidate: Vec<Arc<SegmentCommitInfo>> = Vec::new();
            let mut candidate_bytes = 0u64;
            while index > 0
                && resulting_segments > max_segment_count
                && candidate.len() < self.max_merge_at_once_explicit
            {
                let current = &sorted[index - 1];
                // Add when it fits, or while the bin holds fewer than two segments.
                if candidate_bytes.saturating_add(current.size_in_bytes) <= max_merge_bytes
                    || candidate.len() < 2
                {
                    if !candidate.is_empty() {
                        resulting_segments -= 1;
                    }
                    candidate.push(Arc::clone(&current.info));
                    candidate_bytes = candidate_bytes.saturating_add(current.size_in_bytes);
                    index -= 1;
                } else {
                    break;
                }
            }

            // While a forced merge runs, only full merges may start alongside it.
            let full_merge = candidate.len() == self.max_merge_at_once_explicit
                || candidate_bytes as f64 > 0.7 * max_merge_bytes as f64;
            if candidate.len() > 1 && (!force_merge_running || full_merge) {
                let merge = OneMerge::new(candidate)?;
                if Self::verbose(ctx) {
                    Self::message(ctx, &format!("add merge={}", merge.seg_string()));
                }
                spec.add(merge);
            } else {
                return Ok(spec.into_option());
            }
        }
    }

    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        if Self::verbose(ctx) {
            Self::message(
                ctx,
                &format!(
                    "findForcedDeletesMerges infos={} forceMergeDeletesPctAllowed={}",
                    catalog.describe(),
                    self.force_merge_deletes_pct_allowed
                ),
            );
        }
        let merging = ctx.merging_segments();

        let mut have_work = false;
        let mut total_del_count = 0u64;
        for info in catalog.iter() {
            let del_count = ctx.num_deletes_to_merge(info);
            total_del_count += del_count as u64;
            let pct = if info.max_doc() == 0 {
                0.0
            } else {
                100.0 * del_count as f64 / info.max_doc() as f64
            };
            have_work |= pct > self.force_merge_deletes_pct_allowed && !merging.contains(info.name());
        }
        if !have_work {
            return Ok(None);
        }

        let mut sorted = self.sorted_by_size(catalog, ctx);
        sorted.retain(|segment| {
            !merging.contains(segment.name())
                && segment.del_pct() > self.force_merge_deletes_pct_allowed
        });

        if Self::verbose(ctx) {
            Self::message(
                ctx,
                &format!(
                    "eligible={}",
                    sorted.iter().map(|s| s.info.to_string()).collect::<Vec<_>>().join(" ")
                ),
            );
        }

        self.do_find_merges(
            sorted,
            self.max_merged_segment_bytes,
            usize::MAX,
            usize::MAX,
            0,
            self.max_allowed_docs(catalog.total_max_doc(), total_del_count),
            MergeType::ForceMergeDeletes,
            ctx,
            false,
        )
    }

    fn find_full_flush_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        // Natural merges whose every input is still below the floor size.
        let spec = self.find_merges(trigger, catalog, ctx)?;
        Ok(keep_merges_below(self, spec, self.floor_segment_bytes, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment::test_segment;
    use crate::info_stream::RecordingInfoStream;
    use crate::merge::policy::SimpleMergeContext;

    const MB: u64 = 1024 * 1024;

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

    fn names(merge: &OneMerge) -> Vec<&str> {
        merge.segments().iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_setters_validate() {
        let mut policy = TieredMergePolicy::new();
        assert!(policy.set_segments_per_tier(1.5).is_err());
        assert!(policy.set_max_merge_at_once(1).is_err());
        assert!(policy.set_deletes_pct_allowed(4.0).is_err());
        assert!(policy.set_deletes_pct_allowed(51.0).is_err());
        assert!(policy.set_force_merge_deletes_pct_allowed(101.0).is_err());
        assert!(policy.set_target_search_concurrency(0).is_err());
        assert!(policy.set_min_merge_growth_ratio(0.9).is_err());
        assert!(policy.set_max_merged_segment_mb(-1.0).is_err());
        assert!(policy.set_floor_segment_mb(f64::NAN).is_err());

        policy.set_max_merged_segment_mb(f64::INFINITY).unwrap();
        assert_eq!(policy.max_merged_segment_bytes(), i64::MAX as u64);
    }

    #[test]
    fn test_config_round_trip() {
        let config = TieredMergePolicyConfig {
            segments_per_tier: 4.0,
            max_merge_at_once: 4,
            ..Default::default()
        };
        let policy = TieredMergePolicy::from_config(&config).unwrap();
        assert_eq!(policy.config(), config);

        let bad = TieredMergePolicyConfig {
            deletes_pct_allowed: 60.0,
            ..Default::default()
        };
        assert!(TieredMergePolicy::from_config(&bad).is_err());
    }

    #[test]
    fn test_no_merge_within_budget() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB); 5]);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &SimpleMergeContext::new())
            .unwrap();
        assert!(spec.is_none());
    }

    #[test]
    fn test_over_budget_merges_one_tier() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB); 20]);
        let stream = Arc::new(RecordingInfoStream::new());
        let ctx = SimpleMergeContext::new().with_info_stream(stream.clone());

        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(
            names(&spec.merges[0]),
            vec!["_0", "_1", "_2", "_3", "_4", "_5", "_6", "_7", "_8", "_9"]
        );
        assert!(stream.contains("TP", "add merge="));
    }

    #[test]
    fn test_merging_segments_are_never_proposed() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB); 30]);
        let mut ctx = SimpleMergeContext::new();
        for segment in catalog.iter().take(10) {
            ctx.add_merging(segment.name());
        }

        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
            .unwrap()
            .unwrap();
        for merge in &spec.merges {
            for segment in merge.segments() {
                assert!(!ctx.merging_segments().contains(segment.name()));
            }
        }
    }

    #[test]
    fn test_merged_size_stays_below_max() {
        let mut policy = TieredMergePolicy::new();
        policy.set_max_merged_segment_mb(4.5).unwrap();
        policy.set_floor_segment_mb(0.1).unwrap();
        let catalog = catalog(&[(100, 0, MB); 40]);

        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &catalog, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        for merge in &spec.merges {
            assert!(merge.total_merge_bytes() <= policy.max_merged_segment_bytes());
            assert_eq!(merge.segments().len(), 4);
        }
        // At most one max-sized merge per call.
        assert_eq!(spec.len(), 1);
    }

    #[test]
    fn test_too_big_segments_are_graced_unless_deleted() {
        let mut policy = TieredMergePolicy::new();
        policy.set_max_merged_segment_mb(10.0).unwrap();

        let clean = catalog(&[(100, 0, 6 * MB), (100, 0, 6 * MB), (100, 0, MB)]);
        assert!(
            policy
                .find_forced_deletes_merges(&clean, &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );
        assert!(
            policy
                .find_merges(MergeTrigger::Explicit, &clean, &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );

        // Half of the big segment is deleted: its weighted size drops and it is reclaimed.
        let deleted = catalog(&[(100, 60, 12 * MB), (100, 0, 6 * MB)]);
        let spec = policy
            .find_merges(MergeTrigger::Explicit, &deleted, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(names(&spec.merges[0]), vec!["_0"]);
    }

    #[test]
    fn test_forced_merge_to_one_segment() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB); 5]);
        let to_merge: HashMap<String, bool> =
            catalog.iter().map(|s| (s.name().to_string(), true)).collect();

        let spec = policy
            .find_forced_merges(&catalog, 1, &to_merge, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 5);

        // The final merge is not scheduled while part of the index is still merging.
        let mut ctx = SimpleMergeContext::new();
        ctx.add_merging("_0");
        assert!(
            policy
                .find_forced_merges(&catalog, 1, &to_merge, &ctx)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_forced_merge_already_merged() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB)]);
        let to_merge = HashMap::from([("_0".to_string(), true)]);
        assert!(
            policy
                .find_forced_merges(&catalog, 1, &to_merge, &SimpleMergeContext::new())
                .unwrap()
                .is_none()
        );
        assert!(
            policy
                .find_forced_merges(&catalog, 0, &to_merge, &SimpleMergeContext::new())
                .is_err()
        );
    }

    #[test]
    fn test_forced_merge_to_count_respects_max_size() {
        let mut policy = TieredMergePolicy::new();
        policy.set_max_merged_segment_mb(4.0).unwrap();
        let catalog = catalog(&[(100, 0, MB); 12]);
        let to_merge: HashMap<String, bool> =
            catalog.iter().map(|s| (s.name().to_string(), true)).collect();

        let spec = policy
            .find_forced_merges(&catalog, 3, &to_merge, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        // 12 MB over 3 segments with the 1.25 fudge: bins of at most 5 MB.
        let fudge = (4.0 * 1.25 * MB as f64) as u64;
        let mut remaining = 12;
        for merge in &spec.merges {
            assert!(merge.total_merge_bytes() <= fudge);
            remaining -= merge.segments().len() - 1;
        }
        assert_eq!(remaining, 3);
    }

    #[test]
    fn test_forced_deletes_selects_by_pct() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 20, MB), (100, 5, MB), (100, 0, MB)]);
        let spec = policy
            .find_forced_deletes_merges(&catalog, &SimpleMergeContext::new())
            .unwrap()
            .unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(names(&spec.merges[0]), vec!["_0"]);
    }

    #[test]
    fn test_forced_deletes_counts_pending_deletes() {
        let policy = TieredMergePolicy::new();
        let catalog = catalog(&[(100, 0, MB), (100, 0, MB)]);
        let mut ctx = SimpleMergeContext::new();
        assert!(policy.find_forced_deletes_merges(&catalog, &ctx).unwrap().is_none());

        ctx.set_pending_deletes("_1", 50);
        let spec = policy.find_forced_deletes_merges(&catalog, &ctx).unwrap().unwrap();
        assert_eq!(names(&spec.merges[0]), vec!["_1"]);
    }

    #[test]
    fn test_full_flush_merges_only_small_segments() {
        let policy = TieredMergePolicy::new();
        let ctx = SimpleMergeContext::new();

        let small = catalog(&[(10, 0, 100 * 1024); 12]);
        let spec = policy
            .find_full_flush_merges(MergeTrigger::FullFlush, &small, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(spec.merges[0].segments().len(), 10);

        let large = catalog(&[(10, 0, 3 * MB); 12]);
        assert!(
            policy
                .find_merges(MergeTrigger::FullFlush, &large, &ctx)
                .unwrap()
                .is_some()
        );
        assert!(
            policy
                .find_full_flush_merges(MergeTrigger::FullFlush, &large, &ctx)
                .unwrap()
                .is_none()
        );
    }
}
