/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{BucketHashTable, IndexFunction, ProbingHashTable};
use crate::data::{BlockPool, File, Item};
use anyhow::Result;
use std::sync::Arc;

/// Which in-memory table backs a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableKind {
    /// Open-addressing linear probing within the partition; the default.
    #[default]
    Probing,
    /// Chained per-partition buckets; preserves insertion order within a
    /// bucket and has no probing pathologies under adversarial fill.
    Bucket,
}

/// Tuning knobs of a keyed reduction, handed down from stage planning.
#[derive(Debug, Clone)]
pub struct ReduceConfig {
    pub table_kind: TableKind,
    /// A partition spills once its live items exceed this fraction of its
    /// slots; in `(0, 1]`.
    pub limit_partition_fill_rate: f64,
    /// Granularity of spill units in the post-phase table.
    pub num_partitions: usize,
    /// Bytes budget of one phase's table.
    pub limit_memory_bytes: usize,
    /// Exchange shuffled pairs over a mix stream instead of a cat stream.
    pub use_mix_stream: bool,
    /// Run the post-phase reader in a thread concurrent with the pre-phase
    /// drain.
    pub use_post_thread: bool,
    /// Run a hash-count pre-pass and route keys to the worker already
    /// holding most of them.
    pub use_location_detection: bool,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ReduceConfig {
            table_kind: TableKind::Probing,
            limit_partition_fill_rate: 0.5,
            num_partitions: 32,
            limit_memory_bytes: 16 * 1024 * 1024,
            use_mix_stream: false,
            use_post_thread: false,
            use_location_detection: false,
        }
    }
}

/// Destination of items leaving a table: the pre-phase emits shuffled pairs
/// to per-destination stream writers, the post-phase to the downstream
/// operator.
pub trait ReduceEmit<K, V> {
    fn emit(&mut self, partition: usize, key: K, value: V) -> Result<()>;
}

/// Emitter of tables that are only ever flushed through
/// [`flush_partition_with`](ReduceTable::flush_partition_with).
pub struct NoEmit;

impl<K, V> ReduceEmit<K, V> for NoEmit {
    fn emit(&mut self, _partition: usize, _key: K, _value: V) -> Result<()> {
        unreachable!("table has no emitter")
    }
}

/// The common contract of the partitioned reduce tables: a partitioned
/// key → value store with per-partition spill files and
/// fill-rate-triggered spills.
pub trait ReduceTable<K: Item, V: Item> {
    /// Inserts a pair, reducing in place on key collision. May spill the
    /// pair's partition.
    fn insert(&mut self, key: K, value: V) -> Result<()>;

    /// Writes all live items of the partition to its spill file (or to the
    /// emitter under `immediate_flush`) and clears it.
    fn spill_partition(&mut self, partition: usize) -> Result<()>;

    /// Streams the live items of a partition to the table's emitter,
    /// clearing them if `consume`.
    fn flush_partition(&mut self, partition: usize, consume: bool) -> Result<()>;

    /// As [`flush_partition`](ReduceTable::flush_partition), but to a
    /// caller-supplied callback.
    fn flush_partition_with(
        &mut self,
        partition: usize,
        consume: bool,
        emit: &mut dyn FnMut(usize, K, V) -> Result<()>,
    ) -> Result<()>;

    /// Flushes and clears every partition through the table's emitter.
    fn flush_all(&mut self) -> Result<()> {
        for partition in 0..self.num_partitions() {
            self.flush_partition(partition, true)?;
        }
        Ok(())
    }

    fn num_partitions(&self) -> usize;

    /// Live items currently in memory.
    fn num_items(&self) -> usize;

    /// Whether the partition has spilled to its file at least once.
    fn partition_spilled(&self, partition: usize) -> bool;

    /// Closes and takes the partition's spill file, if any.
    fn take_partition_file(&mut self, partition: usize) -> Result<Option<File>>;
}

/// A [`ReduceTable`] of the kind selected by a [`ReduceConfig`].
pub enum AnyReduceTable<K: Item, V: Item, R, E, I> {
    Probing(ProbingHashTable<K, V, R, E, I>),
    Bucket(BucketHashTable<K, V, R, E, I>),
}

impl<K, V, R, E, I> AnyReduceTable<K, V, R, E, I>
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
        config: &ReduceConfig,
        num_partitions: usize,
        limit_memory_bytes: usize,
        immediate_flush: bool,
        reduce: R,
        emit: E,
        index_fn: I,
    ) -> Self {
        match config.table_kind {
            TableKind::Probing => AnyReduceTable::Probing(ProbingHashTable::new(
                pool,
                num_partitions,
                limit_memory_bytes,
                config.limit_partition_fill_rate,
                immediate_flush,
                reduce,
                emit,
                index_fn,
            )),
            TableKind::Bucket => AnyReduceTable::Bucket(BucketHashTable::new(
                pool,
                num_partitions,
                limit_memory_bytes,
                config.limit_partition_fill_rate,
                immediate_flush,
                reduce,
                emit,
                index_fn,
            )),
        }
    }

    pub fn emitter_mut(&mut self) -> &mut E {
        match self {
            AnyReduceTable::Probing(table) => table.emitter_mut(),
            AnyReduceTable::Bucket(table) => table.emitter_mut(),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $table:ident, $body:expr) => {
        match $self {
            AnyReduceTable::Probing($table) => $body,
            AnyReduceTable::Bucket($table) => $body,
        }
    };
}

impl<K, V, R, E, I> ReduceTable<K, V> for AnyReduceTable<K, V, R, E, I>
where
    K: Item + Clone + Eq,
    V: Item + Clone,
    R: Fn(V, V) -> V,
    E: ReduceEmit<K, V>,
    I: IndexFunction<K>,
{
    fn insert(&mut self, key: K, value: V) -> Result<()> {
        delegate!(self, table, table.insert(key, value))
    }

    fn spill_partition(&mut self, partition: usize) -> Result<()> {
        delegate!(self, table, table.spill_partition(partition))
    }

    fn flush_partition(&mut self, partition: usize, consume: bool) -> Result<()> {
        delegate!(self, table, table.flush_partition(partition, consume))
    }

    fn flush_partition_with(
        &mut self,
        partition: usize,
        consume: bool,
        emit: &mut dyn FnMut(usize, K, V) -> Result<()>,
    ) -> Result<()> {
        delegate!(
            self,
            table,
            table.flush_partition_with(partition, consume, emit)
        )
    }

    fn num_partitions(&self) -> usize {
        delegate!(self, table, table.num_partitions())
    }

    fn num_items(&self) -> usize {
        delegate!(self, table, table.num_items())
    }

    fn partition_spilled(&self, partition: usize) -> bool {
        delegate!(self, table, table.partition_spilled(partition))
    }

    fn take_partition_file(&mut self, partition: usize) -> Result<Option<File>> {
        delegate!(self, table, table.take_partition_file(partition))
    }
}
