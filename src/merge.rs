//! Merge policies decide which segments to merge; merge schedulers decide
//! when and on which thread those merges run.
//!
//! # Examples
//!
//! ```
//! use sluice::merge::default_merge_policies;
//!
//! let policies = default_merge_policies();
//! let tiered = policies.lookup("tiered").unwrap();
//! assert_eq!(tiered.name(), "tiered");
//! assert!(policies.lookup("unknown").is_err());
//! ```

use std::sync::Arc;

use crate::registry::Registry;

pub mod concurrent;
pub mod executor;
pub mod log;
pub mod policy;
pub mod scheduler;
pub mod tiered;

pub use concurrent::{ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig};
pub use executor::{IntraMergeExecutor, MergeExecutor, MergeTask, SameThreadExecutor};
pub use self::log::{LogMergePolicy, LogMergePolicyConfig, LogSizeUnit};
pub use policy::{
    FilterMergePolicy, MergeContext, MergePolicy, MergeSpecification, MergeStatus, MergeTrigger,
    NoMergePolicy, OneMerge, SimpleMergeContext,
};
pub use scheduler::{
    DefaultMergeExceptionHandler, MergeErrorAction, MergeExceptionHandler, MergeScheduler,
    MergeSource, NoMergeScheduler, SerialMergeScheduler,
};
pub use tiered::{TieredMergePolicy, TieredMergePolicyConfig};

pub type MergePolicyRegistry = Registry<dyn MergePolicy>;

/// Registry with every built-in merge policy, each with default settings.
pub fn default_merge_policies() -> MergePolicyRegistry {
    Registry::new("merge policy")
        .with("tiered", || Arc::new(TieredMergePolicy::new()) as Arc<dyn MergePolicy>)
        .with("log_doc", || Arc::new(LogMergePolicy::doc()) as Arc<dyn MergePolicy>)
        .with("log_byte_size", || {
            Arc::new(LogMergePolicy::byte_size()) as Arc<dyn MergePolicy>
        })
        .with("no_merge", || Arc::new(NoMergePolicy) as Arc<dyn MergePolicy>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies_are_registered_by_name() {
        let policies = default_merge_policies();
        assert_eq!(
            policies.names(),
            vec!["log_byte_size", "log_doc", "no_merge", "tiered"]
        );
        for name in policies.names() {
            assert_eq!(policies.lookup(&name).unwrap().name(), name);
        }
    }
}
