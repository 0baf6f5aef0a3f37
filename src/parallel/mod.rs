//! Parallel Execution
//!
//! This module runs the map and reduce stages of a pass on multiple threads.
//!
//! # Features
//!
//! - **Thread Pool**: Scoped worker pool running one task per partition, with retries
//! - **Partitioning**: Hash partitioning of group keys onto reducers
//! - **Exchange**: Shuffle of partial sums into reduce buckets
//! - **Cancellation**: Cooperative stop signal shared by every task of a run
//!
//! # Example
//!
//! ```rust,ignore
//! use approxagg::parallel::{ShuffleExchange, WorkerPool};
//!
//! let pool = WorkerPool::new(4).with_max_attempts(2);
//! let results = pool.execute_all(tasks);
//! let buckets = ShuffleExchange::new(2).execute(partials);
//! ```

mod exchange;
mod partition;
mod worker;

pub use exchange::{reduce_bucket, KeyedPartial, ShuffleExchange};
pub use partition::HashPartitioner;
pub use worker::{TaskContext, TaskId, WorkerPool, WorkerTask};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aggregate::SumAggregator;
use crate::error::Result;

/// Shared stop flag.
///
/// Clones observe the same flag; once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Shuffle partials into `reducers` buckets and merge each bucket on the pool.
///
/// Buckets hold disjoint key sets, so the merged buckets combine without
/// overlap.
pub fn shuffle_reduce(
    pool: &WorkerPool,
    reducers: usize,
    partials: Vec<SumAggregator>,
) -> Result<SumAggregator> {
    let exchange = ShuffleExchange::new(reducers);
    let buckets = exchange.execute(partials);

    let tasks: Vec<WorkerTask<'_, SumAggregator>> = buckets
        .into_iter()
        .enumerate()
        .map(|(idx, bucket)| {
            WorkerTask::new(TaskId::Reduce(idx), move |_ctx| Ok(reduce_bucket(&bucket)))
        })
        .collect();

    let mut merged = SumAggregator::new();
    for reduced in pool.execute_all(tasks) {
        merged.merge(reduced?);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::KeySum;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_shuffle_reduce() {
        let mut left = SumAggregator::new();
        left.accumulate("A", 10.0);
        left.accumulate("B", 5.0);
        let mut right = SumAggregator::new();
        right.accumulate("A", 20.0);
        right.accumulate("C", 1.0);

        let pool = WorkerPool::new(2);
        let merged = shuffle_reduce(&pool, 3, vec![left, right]).unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get("A"), Some(&KeySum { sum: 30.0, count: 2 }));
        assert_eq!(merged.get("C"), Some(&KeySum { sum: 1.0, count: 1 }));
    }

    #[test]
    fn test_shuffle_reduce_empty() {
        let pool = WorkerPool::new(2);
        let merged = shuffle_reduce(&pool, 2, vec![]).unwrap();
        assert!(merged.is_empty());
    }
}
