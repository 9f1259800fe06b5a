/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{AnyReduceTable, IndexFunction, ReduceConfig, ReduceEmit, ReduceTable};
use crate::data::{BlockPool, BlockSink, BlockWriter, Item};
use anyhow::Result;
use std::sync::Arc;

/// An emitter writing pairs into one [`BlockWriter`] per partition; in the
/// pre-phase, partition `p` *is* destination worker `p`.
pub struct WriterEmit<S: BlockSink> {
    writers: Vec<BlockWriter<S>>,
}

impl<K: Item, V: Item, S: BlockSink> ReduceEmit<K, V> for WriterEmit<S> {
    fn emit(&mut self, partition: usize, key: K, value: V) -> Result<()> {
        self.writers[partition].put(&(key, value))
    }
}

/// The local phase of a shuffled reduction.
///
/// Upstream items are reduced into a table whose partitions correspond to
/// the destination workers; a filling partition streams its content
/// *directly to its destination sink* (`immediate_flush`), so the pre-phase
/// never spills locally — receivers combine whatever arrives in their own
/// post-phase.
///
/// Routing is `hash(key) % W`, or the
/// [`LocationDetection`](super::LocationDetection) map, or contiguous index
/// ranges for index-keyed reductions, depending on the index function.
pub struct ReducePrePhase<K: Item, V: Item, R, I, S: BlockSink> {
    table: AnyReduceTable<K, V, R, WriterEmit<S>, I>,
}

impl<K, V, R, I, S> ReducePrePhase<K, V, R, I, S>
where
    K: Item + Clone + Eq,
    V: Item + Clone,
    R: Fn(V, V) -> V,
    I: IndexFunction<K>,
    S: BlockSink,
{
    /// `writers` holds exactly one writer per destination worker;
    /// `limit_memory_bytes` is this phase's budget (half the stage budget
    /// when the post-phase runs concurrently in the same process).
    pub fn new(
        pool: Arc<BlockPool>,
        config: &ReduceConfig,
        writers: Vec<BlockWriter<S>>,
        limit_memory_bytes: usize,
        reduce: R,
        index_fn: I,
    ) -> Self {
        let num_workers = writers.len();
        ReducePrePhase {
            table: AnyReduceTable::new(
                pool,
                config,
                num_workers,
                limit_memory_bytes,
                true,
                reduce,
                WriterEmit { writers },
                index_fn,
            ),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.table.insert(key, value)
    }

    /// Pushes the rest of the table to the destination sinks.
    pub fn flush_all(&mut self) -> Result<()> {
        self.table.flush_all()
    }

    /// Flushes and closes every destination writer, delivering the
    /// end-of-stream sentinels.
    pub fn close_all(&mut self) -> Result<()> {
        self.table.flush_all()?;
        for writer in &mut self.table.emitter_mut().writers {
            writer.close()?;
        }
        Ok(())
    }
}
