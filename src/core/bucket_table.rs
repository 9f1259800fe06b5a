/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{IndexFunction, ReduceEmit, ReduceTable};
use crate::data::{BlockPool, BlockWriter, File, Item};
use anyhow::Result;
use std::sync::Arc;

/// A chained key → value table: per-partition arrays of buckets holding
/// small chains of pairs.
///
/// The chained variant has no probing pathologies under adversarial fill
/// and keeps insertion order within a bucket stable; spill policy (fill
/// rate per partition, spill to file or emitter) is identical to the
/// [probing table](super::ProbingHashTable).
pub struct BucketHashTable<K: Item, V: Item, R, E, I> {
    buckets: Vec<Vec<(K, V)>>,
    num_partitions: usize,
    buckets_per_partition: usize,
    limit_items_per_partition: usize,
    items_per_partition: Vec<usize>,
    spill_writers: Vec<Option<BlockWriter<File>>>,
    immediate_flush: bool,
    reduce: R,
    emit: E,
    index_fn: I,
    pool: Arc<BlockPool>,
}

impl<K, V, R, E, I> BucketHashTable<K, V, R, E, I>
where
    K: Item + Clone + Eq,
    V: Item + Clone,
    R: Fn(V, V) -> V,
    E: ReduceEmit<K, V>,
    I: IndexFunction<K>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<BlockPool>,
        num_partitions: usize,
        limit_memory_bytes: usize,
        fill_rate: f64,
        immediate_flush: bool,
        reduce: R,
        emit: E,
        index_fn: I,
    ) -> Self {
        assert!(num_partitions > 0);
        let entry_size = core::mem::size_of::<(K, V)>();
        let buckets_per_partition =
            (limit_memory_bytes / entry_size / num_partitions).max(1);
        let num_buckets = buckets_per_partition * num_partitions;
        // at least one live item per partition, or a lone item would respill
        // forever during re-reduction
        let limit_items_per_partition =
            ((buckets_per_partition as f64 * fill_rate) as usize).max(1);
        BucketHashTable {
            buckets: (0..num_buckets).map(|_| Vec::new()).collect(),
            num_partitions,
            buckets_per_partition,
            limit_items_per_partition,
            items_per_partition: vec![0; num_partitions],
            spill_writers: (0..num_partitions).map(|_| None).collect(),
            immediate_flush,
            reduce,
            emit,
            index_fn,
            pool,
        }
    }

    pub fn emitter_mut(&mut self) -> &mut E {
        &mut self.emit
    }
}

impl<K, V, R, E, I> ReduceTable<K, V> for BucketHashTable<K, V, R, E, I>
where
    K: Item + Clone + Eq,
    V: Item + Clone,
    R: Fn(V, V) -> V,
    E: ReduceEmit<K, V>,
    I: IndexFunction<K>,
{
    fn insert(&mut self, key: K, value: V) -> Result<()> {
        let index = self.index_fn.index(
            &key,
            self.num_partitions,
            self.buckets_per_partition,
            self.buckets.len(),
        );
        let bucket = &mut self.buckets[index.global_index];
        match bucket.iter_mut().find(|(bucket_key, _)| *bucket_key == key) {
            Some(entry) => {
                entry.1 = (self.reduce)(entry.1.clone(), value);
            }
            None => {
                bucket.push((key, value));
                self.items_per_partition[index.partition] += 1;
                while self.items_per_partition[index.partition]
                    > self.limit_items_per_partition
                {
                    self.spill_partition(index.partition)?;
                }
            }
        }
        Ok(())
    }

    fn spill_partition(&mut self, partition: usize) -> Result<()> {
        if self.immediate_flush {
            return self.flush_partition(partition, true);
        }
        if self.items_per_partition[partition] == 0 {
            return Ok(());
        }
        log::debug!(
            "BucketHashTable: spilling {} items of partition {}",
            self.items_per_partition[partition],
            partition
        );
        let writer = self.spill_writers[partition]
            .get_or_insert_with(|| File::writer(self.pool.clone()));
        let begin = partition * self.buckets_per_partition;
        for bucket in &mut self.buckets[begin..begin + self.buckets_per_partition] {
            for pair in bucket.drain(..) {
                writer.put(&pair)?;
            }
        }
        self.items_per_partition[partition] = 0;
        Ok(())
    }

    fn flush_partition(&mut self, partition: usize, consume: bool) -> Result<()> {
        let buckets = &mut self.buckets;
        let emit = &mut self.emit;
        let begin = partition * self.buckets_per_partition;
        for bucket in &mut buckets[begin..begin + self.buckets_per_partition] {
            if consume {
                for (key, value) in bucket.drain(..) {
                    emit.emit(partition, key, value)?;
                }
            } else {
                for (key, value) in bucket.iter() {
                    emit.emit(partition, key.clone(), value.clone())?;
                }
            }
        }
        if consume {
            self.items_per_partition[partition] = 0;
        }
        Ok(())
    }

    fn flush_partition_with(
        &mut self,
        partition: usize,
        consume: bool,
        emit: &mut dyn FnMut(usize, K, V) -> Result<()>,
    ) -> Result<()> {
        let begin = partition * self.buckets_per_partition;
        for bucket in &mut self.buckets[begin..begin + self.buckets_per_partition] {
            if consume {
                for (key, value) in bucket.drain(..) {
                    emit(partition, key, value)?;
                }
            } else {
                for (key, value) in bucket.iter() {
                    emit(partition, key.clone(), value.clone())?;
                }
            }
        }
        if consume {
            self.items_per_partition[partition] = 0;
        }
        Ok(())
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn num_items(&self) -> usize {
        self.items_per_partition.iter().sum()
    }

    fn partition_spilled(&self, partition: usize) -> bool {
        self.spill_writers[partition].is_some()
    }

    fn take_partition_file(&mut self, partition: usize) -> Result<Option<File>> {
        match self.spill_writers[partition].take() {
            None => Ok(None),
            Some(writer) => Ok(Some(writer.into_sink()?)),
        }
    }
}
