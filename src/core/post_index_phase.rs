/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::IndexRange;
use crate::data::{BlockPool, BlockWriter, File, Item};
use anyhow::{ensure, Result};
use std::sync::Arc;

/// The receiving phase of an index-keyed shuffled reduction.
///
/// The worker owns the index subrange `range`; if a dense value array of
/// that size fits the memory budget, received pairs are folded in by index
/// with O(1) lookup. Otherwise the range is split into
/// `1 + range · entry_size / budget` contiguous subranges: the first stays
/// in memory, the others stream to per-subrange files and are re-reduced
/// recursively after the first pass.
///
/// Emission is in strict ascending index order; indices nobody inserted
/// yield the *neutral element* (P4: output at `i` equals the fold over all
/// inserted `(i, v)` pairs, else the neutral element).
pub struct ReduceByIndexPostPhase<V: Item, R> {
    pool: Arc<BlockPool>,
    limit_memory_bytes: usize,
    reduce: R,
    neutral: V,
    /// Whole range owned by this phase, including outsourced subranges.
    full_range: IndexRange,
    /// The leading subrange kept in memory.
    range: IndexRange,
    items: Vec<Option<V>>,
    subranges: Vec<IndexRange>,
    subrange_writers: Vec<BlockWriter<File>>,
    cache: Option<File>,
}

impl<V, R> ReduceByIndexPostPhase<V, R>
where
    V: Item + Clone,
    R: Fn(V, V) -> V + Clone,
{
    pub fn new(
        pool: Arc<BlockPool>,
        limit_memory_bytes: usize,
        reduce: R,
        neutral: V,
        range: IndexRange,
    ) -> Self {
        let entry_size = core::mem::size_of::<Option<V>>() as u64;
        // a range of one index can never be split further
        let fits =
            range.size() <= 1 || range.size() * entry_size < limit_memory_bytes as u64;

        let (kept, subranges, subrange_writers) = if fits {
            (range, Vec::new(), Vec::new())
        } else {
            let num_subranges =
                1 + (range.size() * entry_size / limit_memory_bytes as u64) as usize;
            log::debug!(
                "ReduceByIndexPostPhase: range {:?} split into {} subranges",
                range,
                num_subranges
            );
            let subranges: Vec<IndexRange> = (1..num_subranges)
                .map(|i| range.partition(i, num_subranges))
                .collect();
            let writers = subranges
                .iter()
                .map(|_| File::writer(pool.clone()))
                .collect();
            (range.partition(0, num_subranges), subranges, writers)
        };

        ReduceByIndexPostPhase {
            pool,
            limit_memory_bytes,
            reduce,
            neutral,
            full_range: range,
            range: kept,
            items: vec![None; kept.size() as usize],
            subranges,
            subrange_writers,
            cache: None,
        }
    }

    /// Folds `(index, value)` into the dense array, or routes it to the
    /// subrange file owning `index`.
    pub fn insert(&mut self, index: u64, value: V) -> Result<()> {
        ensure!(
            self.full_range.contains(index),
            "index {} outside of range {:?}",
            index,
            self.full_range
        );
        if index < self.range.end {
            let offset = (index - self.range.begin) as usize;
            self.items[offset] = Some(match self.items[offset].take() {
                Some(old) => (self.reduce)(old, value),
                None => value,
            });
        } else {
            let num_subranges = self.subranges.len() + 1;
            let subrange = self.full_range.find_partition(index, num_subranges) - 1;
            debug_assert!(self.subranges[subrange].contains(index));
            self.subrange_writers[subrange].put(&(index, value))?;
        }
        Ok(())
    }

    /// Emits the values of the whole range in ascending index order. See
    /// [`ReducePostPhase::push_data`](super::ReducePostPhase::push_data) for
    /// the consume semantics.
    pub fn push_data(
        &mut self,
        consume: bool,
        emit: &mut dyn FnMut(V) -> Result<()>,
    ) -> Result<()> {
        if self.cache.is_some() {
            if consume {
                let mut reader = self.cache.take().unwrap().into_consume_reader();
                while reader.has_next() {
                    emit(reader.next::<V>()?)?;
                }
            } else {
                let cache = self.cache.as_ref().unwrap();
                let mut reader = cache.get_keep_reader();
                while reader.has_next() {
                    emit(reader.next::<V>()?)?;
                }
            }
            return Ok(());
        }

        if !consume {
            if self.subranges.is_empty() {
                for slot in &self.items {
                    emit(match slot {
                        Some(value) => value.clone(),
                        None => self.neutral.clone(),
                    })?;
                }
            } else {
                let mut writer = File::writer(self.pool.clone());
                self.push_consume(&mut |value| {
                    writer.put(&value)?;
                    emit(value)
                })?;
                self.cache = Some(writer.into_sink()?);
            }
            return Ok(());
        }

        self.push_consume(emit)
    }

    fn push_consume(&mut self, emit: &mut dyn FnMut(V) -> Result<()>) -> Result<()> {
        // the in-memory leading subrange, holes filled with the neutral
        for slot in std::mem::take(&mut self.items) {
            emit(slot.unwrap_or_else(|| self.neutral.clone()))?;
        }

        // outsourced subranges, in ascending index order
        let writers = std::mem::take(&mut self.subrange_writers);
        let subranges = std::mem::take(&mut self.subranges);
        for (subrange, writer) in subranges.into_iter().zip(writers) {
            let file = writer.into_sink()?;
            log::debug!(
                "ReduceByIndexPostPhase: re-reducing {} items of subrange {:?}",
                file.num_items(),
                subrange
            );
            let mut sub = ReduceByIndexPostPhase::new(
                self.pool.clone(),
                self.limit_memory_bytes,
                self.reduce.clone(),
                self.neutral.clone(),
                subrange,
            );
            let mut reader = file.into_consume_reader();
            while reader.has_next() {
                let (index, value) = reader.next::<(u64, V)>()?;
                sub.insert(index, value)?;
            }
            sub.push_data(true, emit)?;
        }
        Ok(())
    }
}
