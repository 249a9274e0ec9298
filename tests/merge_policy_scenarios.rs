use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sluice::index::catalog::SegmentCatalog;
use sluice::index::segment::{SegmentCommitInfo, SegmentDiagnostics, SegmentInfo};
use sluice::merge::policy::{MergePolicy, MergeTrigger, SimpleMergeContext};
use sluice::merge::{LogMergePolicy, TieredMergePolicy};

const MB: u64 = 1024 * 1024;

fn segment(name: String, max_doc: u32, del_count: u32, size: u64) -> Arc<SegmentCommitInfo> {
    Arc::new(SegmentCommitInfo::new(
        SegmentInfo {
            name,
            max_doc,
            codec: "simple".to_string(),
            files: BTreeSet::new(),
            diagnostics: SegmentDiagnostics::flush(),
        },
        del_count,
        size,
    ))
}

fn add_segment(catalog: &mut SegmentCatalog, max_doc: u32, del_count: u32, size: u64) {
    let name = catalog.new_segment_name();
    catalog.add(segment(name, max_doc, del_count, size)).unwrap();
}

/// Apply every merge the policy proposes until it proposes none.
fn merge_until_stable(policy: &dyn MergePolicy, catalog: &mut SegmentCatalog) {
    let ctx = SimpleMergeContext::new();
    for _ in 0..100 {
        let Some(spec) = policy
            .find_merges(MergeTrigger::SegmentFlush, catalog, &ctx)
            .unwrap()
        else {
            return;
        };
        for merge in spec.merges {
            let live: u32 = merge.segments().iter().map(|s| s.live_docs()).sum();
            let bytes = merge.total_merge_bytes();
            let name = catalog.new_segment_name();
            catalog
                .apply_merge_changes(merge.segments(), Some(segment(name, live, 0, bytes)))
                .unwrap();
        }
    }
    panic!("policy never settled: {}", catalog.describe());
}

#[test]
fn test_log_doc_policy_merges_increasing_sizes() {
    let mut catalog = SegmentCatalog::new();
    for docs in (1000..=11000).step_by(1000) {
        add_segment(&mut catalog, docs, 0, docs as u64 * 100);
    }

    merge_until_stable(&LogMergePolicy::doc(), &mut catalog);

    let sizes: Vec<u32> = catalog.iter().map(|s| s.max_doc()).collect();
    assert_eq!(sizes, vec![55000, 11000]);
}

#[test]
fn test_tiered_forced_merge_respects_max_segment_size() {
    let mut policy = TieredMergePolicy::new();
    policy.set_max_merged_segment_mb(10.0).unwrap();
    let max_bytes = policy.max_merged_segment_bytes();

    let mut rng = StdRng::seed_from_u64(42);
    let mut catalog = SegmentCatalog::new();
    for _ in 0..40 {
        // No segment above 60% of the maximum, so any pair still fits the fudge.
        let size = rng.random_range(MB / 2..6 * MB);
        add_segment(&mut catalog, (size / 1024) as u32, 0, size);
    }
    let to_merge: HashMap<String, bool> = catalog
        .iter()
        .map(|s| (s.name().to_string(), true))
        .collect();

    let spec = policy
        .find_forced_merges(&catalog, 30, &to_merge, &SimpleMergeContext::new())
        .unwrap()
        .unwrap();
    for merge in &spec.merges {
        assert!(
            merge.total_merge_bytes() as f64 <= max_bytes as f64 * 1.25,
            "{} bytes exceeds {}",
            merge.total_merge_bytes(),
            max_bytes
        );
    }
}

#[test]
fn test_natural_merges_never_include_merging_segments() {
    let policies: Vec<Arc<dyn MergePolicy>> = vec![
        Arc::new(TieredMergePolicy::new()),
        Arc::new(LogMergePolicy::doc()),
        Arc::new(LogMergePolicy::byte_size()),
    ];
    let mut rng = StdRng::seed_from_u64(7);

    for policy in policies {
        for _ in 0..20 {
            let mut catalog = SegmentCatalog::new();
            for _ in 0..rng.random_range(5..60) {
                let max_doc = rng.random_range(100..20_000);
                let del_count = rng.random_range(0..max_doc / 2);
                add_segment(&mut catalog, max_doc, del_count, max_doc as u64 * 512);
            }

            // Keep asking while pretending earlier proposals are running.
            let mut ctx = SimpleMergeContext::new();
            let mut in_flight: HashSet<String> = HashSet::new();
            for _ in 0..10 {
                let Some(spec) = policy
                    .find_merges(MergeTrigger::SegmentFlush, &catalog, &ctx)
                    .unwrap()
                else {
                    break;
                };
                for merge in &spec.merges {
                    for segment in merge.segments() {
                        assert!(
                            in_flight.insert(segment.name().to_string()),
                            "{} proposed {} twice",
                            policy.name(),
                            segment.name()
                        );
                        ctx.add_merging(segment.name());
                    }
                }
            }
        }
    }
}
