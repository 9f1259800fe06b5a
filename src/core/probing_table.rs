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

/// An open-addressing, linear-probing key → value table, partitioned so
/// that each key probes only within its partition's contiguous slot range.
///
/// On key collision the two values are merged with the reduce function in
/// place. A partition spills to its file (or to the emitter, under
/// `immediate_flush`) when probing wraps around to the start slot or when
/// its live items exceed `fill_rate` of its slots.
///
/// Slots are `Option<(K, V)>`: the empty-slot marker lives outside the key
/// space, so no sentinel key is reserved.
pub struct ProbingHashTable<K: Item, V: Item, R, E, I> {
    slots: Vec<Option<(K, V)>>,
    num_partitions: usize,
    slots_per_partition: usize,
    limit_items_per_partition: usize,
    items_per_partition: Vec<usize>,
    spill_writers: Vec<Option<BlockWriter<File>>>,
    immediate_flush: bool,
    reduce: R,
    emit: E,
    index_fn: I,
    pool: Arc<BlockPool>,
}

impl<K, V, R, E, I> ProbingHashTable<K, V, R, E, I>
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
        assert!(
            (0.0..=1.0).contains(&fill_rate),
            "limit_partition_fill_rate must be in (0, 1]"
        );
        let slot_size = core::mem::size_of::<Option<(K, V)>>();
        let slots_per_partition =
            (limit_memory_bytes / slot_size / num_partitions).max(1);
        let num_slots = slots_per_partition * num_partitions;
        // at least one live item per partition, or a lone item would respill
        // forever during re-reduction
        let limit_items_per_partition =
            ((slots_per_partition as f64 * fill_rate) as usize).max(1);
        log::debug!(
            "ProbingHashTable: {} partitions x {} slots, spill limit {}",
            num_partitions,
            slots_per_partition,
            limit_items_per_partition
        );
        ProbingHashTable {
            slots: (0..num_slots).map(|_| None).collect(),
            num_partitions,
            slots_per_partition,
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

impl<K, V, R, E, I> ReduceTable<K, V> for ProbingHashTable<K, V, R, E, I>
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
            self.slots_per_partition,
            self.slots.len(),
        );
        debug_assert!(index.partition < self.num_partitions);
        let partition_begin = index.partition * self.slots_per_partition;
        let partition_end = partition_begin + self.slots_per_partition;

        let mut slot = index.global_index;
        loop {
            match self.slots[slot].take() {
                None => {
                    self.slots[slot] = Some((key, value));
                    self.items_per_partition[index.partition] += 1;
                    break;
                }
                Some((slot_key, slot_value)) => {
                    if slot_key == key {
                        // merge in place
                        self.slots[slot] = Some((slot_key, (self.reduce)(slot_value, value)));
                        return Ok(());
                    }
                    self.slots[slot] = Some((slot_key, slot_value));
                    slot += 1;
                    if slot == partition_end {
                        slot = partition_begin;
                    }
                    if slot == index.global_index {
                        // wrapped: every slot of the partition is taken
                        self.spill_partition(index.partition)?;
                        self.slots[slot] = Some((key, value));
                        self.items_per_partition[index.partition] += 1;
                        return Ok(());
                    }
                }
            }
        }

        while self.items_per_partition[index.partition] > self.limit_items_per_partition {
            self.spill_partition(index.partition)?;
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
            "ProbingHashTable: spilling {} items of partition {}",
            self.items_per_partition[partition],
            partition
        );
        let writer = self.spill_writers[partition]
            .get_or_insert_with(|| File::writer(self.pool.clone()));
        let begin = partition * self.slots_per_partition;
        for slot in begin..begin + self.slots_per_partition {
            if let Some(pair) = self.slots[slot].take() {
                writer.put(&pair)?;
            }
        }
        self.items_per_partition[partition] = 0;
        Ok(())
    }

    fn flush_partition(&mut self, partition: usize, consume: bool) -> Result<()> {
        // destructure to flush slots into the table's own emitter
        let slots = &mut self.slots;
        let emit = &mut self.emit;
        let begin = partition * self.slots_per_partition;
        for slot in begin..begin + self.slots_per_partition {
            if consume {
                if let Some((key, value)) = slots[slot].take() {
                    emit.emit(partition, key, value)?;
                }
            } else if let Some((key, value)) = &slots[slot] {
                emit.emit(partition, key.clone(), value.clone())?;
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
        let begin = partition * self.slots_per_partition;
        for slot in begin..begin + self.slots_per_partition {
            if consume {
                if let Some((key, value)) = self.slots[slot].take() {
                    emit(partition, key, value)?;
                }
            } else if let Some((key, value)) = &self.slots[slot] {
                emit(partition, key.clone(), value.clone())?;
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
