/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Key hashing and partition index functions of the reduce engine.
//!
//! All hashes use the crate-wide [fixed-seed
//! state](crate::data::fixed_state): key routing must agree across workers
//! and processes.

use crate::data::fixed_state;
use std::hash::{BuildHasher, Hash, Hasher};

/// A half-open index interval `[begin, end)`, used for index-keyed
/// reductions and for splitting work proportionally across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    pub begin: u64,
    pub end: u64,
}

impl IndexRange {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end);
        IndexRange { begin, end }
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.end - self.begin
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    #[inline(always)]
    pub fn contains(&self, index: u64) -> bool {
        self.begin <= index && index < self.end
    }

    /// The `i`-th of `n` proportional parts of this range; parts differ in
    /// size by at most one.
    pub fn partition(&self, i: usize, n: usize) -> IndexRange {
        debug_assert!(i < n);
        let size = self.size() as u128;
        IndexRange {
            begin: self.begin + (size * i as u128 / n as u128) as u64,
            end: self.begin + (size * (i + 1) as u128 / n as u128) as u64,
        }
    }

    /// The index of the part of [`partition`](IndexRange::partition)
    /// containing `index`.
    pub fn find_partition(&self, index: u64, n: usize) -> usize {
        debug_assert!(self.contains(index));
        let mut k =
            ((index - self.begin) as u128 * n as u128 / self.size() as u128) as usize;
        // proportional guess, then fix rounding on the boundaries
        while self.partition(k, n).begin > index {
            k -= 1;
        }
        while self.partition(k, n).end <= index {
            k += 1;
        }
        k
    }
}

/// Deterministic 64-bit hash of a key, optionally salted (re-reduction
/// levels re-partition spilled data under a different salt).
pub fn key_hash<K: Hash>(key: &K, salt: u64) -> u64 {
    let mut hasher = fixed_state().build_hasher();
    salt.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Result of an [`IndexFunction`]: the partition of a key and its probing
/// start slot.
#[derive(Debug, Clone, Copy)]
pub struct TableIndex {
    pub partition: usize,
    pub global_index: usize,
}

/// Maps keys to partitions and slots of a
/// [reduce table](super::ReduceTable). Probing never leaves the partition of
/// the start slot.
pub trait IndexFunction<K>: Clone {
    fn index(
        &self,
        key: &K,
        num_partitions: usize,
        slots_per_partition: usize,
        num_slots: usize,
    ) -> TableIndex;
}

/// Hash-keyed partitioning: the low hash bits pick the partition (so that
/// `partition == hash % num_partitions`, the routing contract of the
/// pre-phase), the high bits the slot within it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceByHash {
    pub salt: u64,
}

impl ReduceByHash {
    pub fn new(salt: u64) -> Self {
        ReduceByHash { salt }
    }
}

impl<K: Hash> IndexFunction<K> for ReduceByHash {
    fn index(
        &self,
        key: &K,
        num_partitions: usize,
        slots_per_partition: usize,
        _num_slots: usize,
    ) -> TableIndex {
        let hash = key_hash(key, self.salt);
        let partition = hash as usize % num_partitions;
        let offset = (hash >> 32) as usize % slots_per_partition;
        TableIndex {
            partition,
            global_index: partition * slots_per_partition + offset,
        }
    }
}

/// Index-keyed partitioning: keys are indices of an [`IndexRange`], mapped
/// proportionally onto the slot array, so that partitions own contiguous,
/// sorted index subranges.
#[derive(Debug, Clone, Copy)]
pub struct ReduceByIndex {
    pub range: IndexRange,
}

impl ReduceByIndex {
    pub fn new(range: IndexRange) -> Self {
        ReduceByIndex { range }
    }
}

impl IndexFunction<u64> for ReduceByIndex {
    fn index(
        &self,
        key: &u64,
        num_partitions: usize,
        slots_per_partition: usize,
        _num_slots: usize,
    ) -> TableIndex {
        debug_assert!(self.range.contains(*key));
        // partitions must cut exactly at the partition() boundaries, which
        // is what the receiving workers and subranges are keyed on
        let partition = self.range.find_partition(*key, num_partitions);
        let subrange = self.range.partition(partition, num_partitions);
        let offset = ((*key - subrange.begin) as u128 * slots_per_partition as u128
            / subrange.size() as u128) as usize;
        TableIndex {
            partition,
            global_index: partition * slots_per_partition + offset,
        }
    }
}

/// Hash-keyed routing overridden by a location map from
/// [`LocationDetection`](super::LocationDetection): keys whose reduced hash
/// has a detected home go there, the rest fall back to `hash % W`.
#[derive(Clone)]
pub struct ReduceByHashWithLocations {
    pub locations: std::sync::Arc<std::collections::HashMap<u32, u32>>,
}

impl<K: Hash> IndexFunction<K> for ReduceByHashWithLocations {
    fn index(
        &self,
        key: &K,
        num_partitions: usize,
        slots_per_partition: usize,
        _num_slots: usize,
    ) -> TableIndex {
        let hash = key_hash(key, 0);
        let reduced = super::location_hash(hash);
        let partition = match self.locations.get(&reduced) {
            Some(&worker) => worker as usize,
            None => hash as usize % num_partitions,
        };
        let offset = (hash >> 32) as usize % slots_per_partition;
        TableIndex {
            partition,
            global_index: partition * slots_per_partition + offset,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partition_exact_cover() {
        let range = IndexRange::new(3, 103);
        let mut covered = 3;
        for i in 0..7 {
            let part = range.partition(i, 7);
            assert_eq!(part.begin, covered);
            covered = part.end;
        }
        assert_eq!(covered, 103);
    }

    #[test]
    fn test_find_partition() {
        let range = IndexRange::new(0, 1000);
        for n in [1, 3, 7, 32] {
            for index in [0, 1, 499, 500, 998, 999] {
                let k = range.find_partition(index, n);
                assert!(range.partition(k, n).contains(index));
            }
        }
    }

    #[test]
    fn test_reduce_by_index_matches_partitions() {
        let range = IndexRange::new(0, 10);
        let index_fn = ReduceByIndex::new(range);
        for key in 0..10 {
            let index = index_fn.index(&key, 3, 8, 24);
            assert_eq!(index.partition, range.find_partition(key, 3));
            assert!(index.global_index >= index.partition * 8);
            assert!(index.global_index < (index.partition + 1) * 8);
        }
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(key_hash(&"abc", 0), key_hash(&"abc", 0));
        assert_ne!(key_hash(&"abc", 0), key_hash(&"abc", 1));
    }
}
