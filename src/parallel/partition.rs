//! Key Partitioning
//!
//! Assigns group keys to reduce buckets. The assignment only depends on the
//! key and the bucket count, so every map task routes a key to the same
//! reducer.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash partitioner for distributing keys across reducers.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    num_partitions: usize,
}

impl HashPartitioner {
    /// Create a new hash partitioner.
    pub fn new(num_partitions: usize) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }

    /// Number of output partitions.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Get partition ID for a single value.
    pub fn partition_for_value<T: Hash + ?Sized>(&self, value: &T) -> usize {
        if self.num_partitions == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        (hasher.finish() as usize) % self.num_partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_partition() {
        let partitioner = HashPartitioner::new(0);
        assert_eq!(partitioner.num_partitions(), 1);
        assert_eq!(partitioner.partition_for_value("anything"), 0);
    }

    #[test]
    fn test_assignment_is_stable_and_in_range() {
        let a = HashPartitioner::new(7);
        let b = HashPartitioner::new(7);
        for key in ["PushEvent", "WatchEvent", "ForkEvent", ""] {
            let p = a.partition_for_value(key);
            assert!(p < 7);
            assert_eq!(p, b.partition_for_value(key));
        }
    }

    #[test]
    fn test_keys_spread_across_partitions() {
        let partitioner = HashPartitioner::new(4);
        let mut used = [false; 4];
        for i in 0..100 {
            used[partitioner.partition_for_value(&format!("key-{}", i))] = true;
        }
        assert!(used.iter().all(|u| *u));
    }
}
