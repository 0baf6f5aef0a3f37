//! Shuffle Exchange for Partial Sums
//!
//! Map tasks each produce a partition-local [`SumAggregator`]. The shuffle
//! exchange regroups those partials by key into reduce buckets; each bucket
//! is then merged independently by [`reduce_bucket`].

use super::partition::HashPartitioner;
use crate::aggregate::{KeySum, SumAggregator};

/// One key's partial sum from one map task.
pub type KeyedPartial = (String, KeySum);

/// Shuffle exchange redistributes partial sums based on key hash.
#[derive(Debug)]
pub struct ShuffleExchange {
    partitioner: HashPartitioner,
}

impl ShuffleExchange {
    /// Create a new shuffle exchange with `output_partitions` reduce buckets.
    pub fn new(output_partitions: usize) -> Self {
        Self {
            partitioner: HashPartitioner::new(output_partitions),
        }
    }

    /// Number of reduce buckets.
    pub fn output_partitions(&self) -> usize {
        self.partitioner.num_partitions()
    }

    /// Route every partial to the bucket of its key.
    ///
    /// Partials within a bucket keep the order of `inputs`.
    pub fn execute(&self, inputs: Vec<SumAggregator>) -> Vec<Vec<KeyedPartial>> {
        let mut buckets: Vec<Vec<KeyedPartial>> = vec![Vec::new(); self.output_partitions()];

        for partial in inputs {
            if partial.is_empty() {
                continue;
            }
            for (key, sum) in partial.into_partials() {
                let bucket = self.partitioner.partition_for_value(key.as_str());
                buckets[bucket].push((key, sum));
            }
        }

        buckets
    }
}

/// Merge one reduce bucket.
pub fn reduce_bucket(bucket: &[KeyedPartial]) -> SumAggregator {
    let mut merged = SumAggregator::new();
    for (key, partial) in bucket {
        merged.merge_key(key, *partial);
    }
    merged
}
