/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{AnyReduceTable, NoEmit, ReduceByHash, ReduceConfig, ReduceTable};
use crate::data::{BlockPool, File, Item};
use anyhow::{ensure, Result};
use std::hash::Hash;
use std::sync::Arc;

/// Hard cap on re-reduction recursion; reaching it means the hash function
/// cannot split the data (e.g. a quota of a few slots with adversarial
/// keys).
const MAX_LEVELS: u64 = 64;

/// The receiving phase of a hash-keyed shuffled reduction.
///
/// Received pairs are reduced into a second table; partitions that
/// oversubscribe their budget spill to per-partition files. On
/// [`push_data`](ReducePostPhase::push_data), in-memory partitions are
/// emitted directly, while each spilled partition is re-read into a fresh
/// sub-phase whose table re-partitions under a different hash salt, and
/// re-reduced recursively: every level's spill files are strictly smaller
/// than their parent partition, so the recursion terminates.
///
/// Emission order is arbitrary. A non-consuming push on a spilled table
/// writes the result through a cache file, which later pushes replay.
pub struct ReducePostPhase<K: Item, V: Item, R> {
    pool: Arc<BlockPool>,
    config: ReduceConfig,
    reduce: R,
    table: AnyReduceTable<K, V, R, NoEmit, ReduceByHash>,
    cache: Option<File>,
    level: u64,
}

impl<K, V, R> ReducePostPhase<K, V, R>
where
    K: Item + Clone + Eq + Hash,
    V: Item + Clone,
    R: Fn(V, V) -> V + Clone,
{
    pub fn new(pool: Arc<BlockPool>, config: ReduceConfig, reduce: R) -> Self {
        Self::with_level(pool, config, reduce, 0)
    }

    fn with_level(pool: Arc<BlockPool>, config: ReduceConfig, reduce: R, level: u64) -> Self {
        let table = AnyReduceTable::new(
            pool.clone(),
            &config,
            config.num_partitions,
            config.limit_memory_bytes,
            false,
            reduce.clone(),
            NoEmit,
            // salt 0 is the pre-phase routing hash; every table level uses
            // its own salt so partitions decorrelate from worker routing
            ReduceByHash::new(level + 1),
        );
        ReducePostPhase {
            pool,
            config,
            reduce,
            table,
            cache: None,
            level,
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.table.insert(key, value)
    }

    /// Emits every reduced pair exactly once. With `consume`, the table and
    /// spill files are drained; without it, the data remains available for
    /// another push (via a cache file when spilling has occurred).
    pub fn push_data(
        &mut self,
        consume: bool,
        emit: &mut dyn FnMut(K, V) -> Result<()>,
    ) -> Result<()> {
        if self.cache.is_some() {
            // a previous non-consuming push left the result in the cache
            if consume {
                let mut reader = self.cache.take().unwrap().into_consume_reader();
                while reader.has_next() {
                    let (key, value) = reader.next::<(K, V)>()?;
                    emit(key, value)?;
                }
            } else {
                let cache = self.cache.as_ref().unwrap();
                let mut reader = cache.get_keep_reader();
                while reader.has_next() {
                    let (key, value) = reader.next::<(K, V)>()?;
                    emit(key, value)?;
                }
            }
            return Ok(());
        }

        let spilled = (0..self.table.num_partitions()).any(|p| self.table.partition_spilled(p));

        if !consume {
            if !spilled {
                for partition in 0..self.table.num_partitions() {
                    self.table
                        .flush_partition_with(partition, false, &mut |_, key, value| {
                            emit(key, value)
                        })?;
                }
            } else {
                // drain once, mirroring the result into a cache file
                let mut writer = File::writer(self.pool.clone());
                self.push_consume(&mut |key, value| {
                    let pair = (key, value);
                    writer.put(&pair)?;
                    let (key, value) = pair;
                    emit(key, value)
                })?;
                self.cache = Some(writer.into_sink()?);
            }
            return Ok(());
        }

        self.push_consume(emit)
    }

    fn push_consume(&mut self, emit: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()> {
        ensure!(
            self.level < MAX_LEVELS,
            "reduce re-reduction did not converge: raise limit_memory_bytes"
        );
        for partition in 0..self.table.num_partitions() {
            if self.table.partition_spilled(partition) {
                // move the rest of the partition to its file, then re-reduce
                // the file under a different hash salt
                self.table.spill_partition(partition)?;
                let file = self.table.take_partition_file(partition)?.unwrap();
                log::debug!(
                    "ReducePostPhase: level {} re-reduces {} spilled items",
                    self.level,
                    file.num_items()
                );
                let mut sub = ReducePostPhase::with_level(
                    self.pool.clone(),
                    self.config.clone(),
                    self.reduce.clone(),
                    self.level + 1,
                );
                let mut reader = file.into_consume_reader();
                while reader.has_next() {
                    let (key, value) = reader.next::<(K, V)>()?;
                    sub.insert(key, value)?;
                }
                sub.push_data(true, emit)?;
            } else {
                self.table
                    .flush_partition_with(partition, true, &mut |_, key, value| {
                        emit(key, value)
                    })?;
            }
        }
        Ok(())
    }
}
