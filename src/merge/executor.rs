//! Executors for the independent pieces of work inside one merge.
//!
//! A merge writes each data format (stored fields, postings, ...) separately,
//! so the writer hands the formats to an executor as a list of tasks. Small
//! merges always run their tasks on the merge thread. Large merges may borrow
//! idle threads from a shared rayon pool, but only while the number of busy
//! merge threads plus borrowed threads stays below the scheduler's
//! `max_thread_count`.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::unbounded;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Result, SluiceError};
use crate::merge::policy::OneMerge;

/// One unit of merge work; returns the files it wrote.
pub type MergeTask<'a> = Box<dyn FnOnce() -> Result<Vec<String>> + Send + 'a>;

/// Runs the tasks of one merge.
pub trait MergeExecutor: Send + Sync + Debug {
    /// Run every task and return all written files in task order.
    ///
    /// Every task runs even if an earlier one fails; the first error wins.
    fn execute<'a>(&self, merge: &OneMerge, tasks: Vec<MergeTask<'a>>) -> Result<Vec<String>>;
}

fn collect_results(results: Vec<Result<Vec<String>>>) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(written) => files.extend(written),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(files),
    }
}

/// Runs tasks one after the other on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameThreadExecutor;

impl MergeExecutor for SameThreadExecutor {
    fn execute<'a>(&self, _merge: &OneMerge, tasks: Vec<MergeTask<'a>>) -> Result<Vec<String>> {
        collect_results(tasks.into_iter().map(|task| task()).collect())
    }
}

/// Thread accounting shared by a scheduler and its intra-merge executor.
#[derive(Debug)]
pub struct ThreadBudget {
    max_threads: AtomicUsize,
    merge_threads: AtomicUsize,
    intra_tasks: AtomicUsize,
}

impl ThreadBudget {
    pub fn new(max_threads: usize) -> Self {
        ThreadBudget {
            max_threads: AtomicUsize::new(max_threads),
            merge_threads: AtomicUsize::new(0),
            intra_tasks: AtomicUsize::new(0),
        }
    }

    pub fn set_max_threads(&self, max_threads: usize) {
        self.max_threads.store(max_threads, Ordering::SeqCst);
    }

    pub fn set_merge_threads(&self, merge_threads: usize) {
        self.merge_threads.store(merge_threads, Ordering::SeqCst);
    }

    pub fn intra_tasks(&self) -> usize {
        self.intra_tasks.load(Ordering::SeqCst)
    }

    /// Reserve a pool thread if the budget allows it.
    fn try_acquire(self: &Arc<Self>) -> Option<BudgetPermit> {
        let max = self.max_threads.load(Ordering::SeqCst);
        let merge_threads = self.merge_threads.load(Ordering::SeqCst);
        self.intra_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tasks| {
                (merge_threads + tasks < max).then_some(tasks + 1)
            })
            .ok()
            .map(|_| BudgetPermit {
                budget: Arc::clone(self),
            })
    }
}

/// Returns its pool thread to the budget when dropped.
struct BudgetPermit {
    budget: Arc<ThreadBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.intra_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spreads the tasks of large merges over a rayon pool.
#[derive(Debug)]
pub struct IntraMergeExecutor {
    pool: ThreadPool,
    min_merge_bytes: u64,
    budget: Arc<ThreadBudget>,
}

impl IntraMergeExecutor {
    /// Merges smaller than `min_merge_bytes` run on the merge thread.
    pub fn new(pool_size: usize, min_merge_bytes: u64, budget: Arc<ThreadBudget>) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(pool_size.max(1))
            .thread_name(|i| format!("sluice-intra-merge-{i}"))
            .build()
            .map_err(|e| SluiceError::other(format!("failed to create intra-merge pool: {e}")))?;
        Ok(IntraMergeExecutor {
            pool,
            min_merge_bytes,
            budget,
        })
    }

    pub fn budget(&self) -> &Arc<ThreadBudget> {
        &self.budget
    }
}

impl MergeExecutor for IntraMergeExecutor {
    fn execute<'a>(&self, merge: &OneMerge, tasks: Vec<MergeTask<'a>>) -> Result<Vec<String>> {
        if tasks.len() < 2 || merge.total_merge_bytes() < self.min_merge_bytes {
            return SameThreadExecutor.execute(merge, tasks);
        }

        let count = tasks.len();
        let (sender, receiver) = unbounded();
        self.pool.in_place_scope(|scope| {
            for (index, task) in tasks.into_iter().enumerate() {
                match self.budget.try_acquire() {
                    Some(permit) => {
                        let sender = sender.clone();
                        scope.spawn(move |_| {
                            let result = task();
                            drop(permit);
                            let _ = sender.send((index, result));
                        });
                    }
                    None => {
                        let _ = sender.send((index, task()));
                    }
                }
            }
        });
        drop(sender);

        let mut results: Vec<Option<Result<Vec<String>>>> = (0..count).map(|_| None).collect();
        for (index, result) in receiver {
            results[index] = Some(result);
        }
        collect_results(
            results
                .into_iter()
                .map(|r| r.unwrap_or_else(|| Err(SluiceError::other("intra-merge task vanished"))))
                .collect(),
        )
    }
}
