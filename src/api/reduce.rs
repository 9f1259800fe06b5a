/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::Dia;
use crate::core::{
    key_hash, IndexFunction, IndexRange, LocationDetection, ReduceByHash,
    ReduceByHashWithLocations, ReduceByIndex, ReduceByIndexPostPhase, ReduceConfig,
    ReducePostPhase, ReducePrePhase,
};
use crate::data::{
    BlockPool, BlockSink, BlockWriter, CatStream, File, Item, MixStream,
};
use anyhow::Result;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// The exchange context of one shuffled reduction: a cat stream, or a mix
/// stream when `use_mix_stream` asks for arrival-order draining.
enum Exchange {
    Cat(CatStream),
    Mix(MixStream),
}

impl Exchange {
    fn new(dia_ctx: &super::Context, use_mix_stream: bool) -> Self {
        if use_mix_stream {
            Exchange::Mix(dia_ctx.new_mix_stream())
        } else {
            Exchange::Cat(dia_ctx.new_cat_stream())
        }
    }

    fn open_writers(&self) -> Vec<BlockWriter<crate::data::StreamSink>> {
        match self {
            Exchange::Cat(stream) => stream.open_writers(),
            Exchange::Mix(stream) => stream.open_writers(),
        }
    }

    /// Drains the inbound side, feeding every received pair to `insert`.
    fn drain<K: Item, V: Item>(
        &self,
        insert: &mut dyn FnMut(K, V) -> Result<()>,
    ) -> Result<()> {
        match self {
            Exchange::Cat(stream) => {
                let mut reader = stream.open_cat_reader(true);
                while reader.has_next() {
                    let (key, value) = reader.next::<(K, V)>()?;
                    insert(key, value)?;
                }
            }
            Exchange::Mix(stream) => {
                let mut reader = stream.open_mix_reader(true);
                while reader.has_next() {
                    let (key, value) = reader.next::<(K, V)>()?;
                    insert(key, value)?;
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        match self {
            Exchange::Cat(stream) => stream.close(),
            Exchange::Mix(stream) => stream.close(),
        }
    }
}

/// Runs the whole pre-phase: reduce the local pairs into the
/// per-destination table, then flush and close the shuffle writers.
fn run_pre_phase<K, V, R, I, S>(
    pool: Arc<BlockPool>,
    config: &ReduceConfig,
    writers: Vec<BlockWriter<S>>,
    limit_memory_bytes: usize,
    reduce: R,
    index_fn: I,
    file: File,
) -> Result<()>
where
    K: Item + Clone + Eq,
    V: Item + Clone,
    R: Fn(V, V) -> V,
    I: IndexFunction<K>,
    S: BlockSink,
{
    let mut pre = ReducePrePhase::new(pool, config, writers, limit_memory_bytes, reduce, index_fn);
    let mut reader = file.into_consume_reader();
    while reader.has_next() {
        let (key, value) = reader.next::<(K, V)>()?;
        pre.insert(key, value)?;
    }
    pre.close_all()
}

impl<K, V> Dia<(K, V)>
where
    K: Item + Clone + Eq + Hash + Send,
    V: Item + Clone + Send,
{
    /// Shuffled hash-keyed reduction: for each distinct key, the fold of
    /// `reduce` over its values, distributed over the workers by key hash.
    ///
    /// `reduce` must be associative and commutative; the result order is
    /// arbitrary. The result is independent of the number of workers and
    /// partitions, of the fill rate, and of whether spilling occurred.
    pub fn reduce_by_key<R>(&self, config: ReduceConfig, reduce: R) -> Result<Dia<(K, V)>>
    where
        R: Fn(V, V) -> V + Clone + Send + Sync,
    {
        let ctx = self.ctx().clone();
        let pool = ctx.pool().clone();
        let file = self.fetch_file();
        // pre- and post-phase share this worker's budget
        let phase_budget = (config.limit_memory_bytes / 2).max(1);

        // optional pre-pass: route keys to the worker holding most of them
        let locations = if config.use_location_detection {
            let mut detection = LocationDetection::new();
            let mut reader = file.get_keep_reader();
            while reader.has_next() {
                let (key, _) = reader.next::<(K, V)>()?;
                detection.insert(key_hash(&key, 0));
            }
            let home = ctx.new_cat_stream();
            let reply = ctx.new_cat_stream();
            Some(Arc::new(detection.flush(&home, &reply)?))
        } else {
            None
        };

        let exchange = Exchange::new(&ctx, config.use_mix_stream);
        let writers = exchange.open_writers();

        let post_config = ReduceConfig {
            limit_memory_bytes: phase_budget,
            ..config.clone()
        };
        let mut post = ReducePostPhase::<K, V, R>::new(pool.clone(), post_config, reduce.clone());

        let pre = || -> Result<()> {
            match &locations {
                Some(locations) => run_pre_phase::<K, V, R, _, _>(
                    pool.clone(),
                    &config,
                    writers,
                    phase_budget,
                    reduce.clone(),
                    ReduceByHashWithLocations {
                        locations: locations.clone(),
                    },
                    file,
                ),
                None => run_pre_phase::<K, V, R, _, _>(
                    pool.clone(),
                    &config,
                    writers,
                    phase_budget,
                    reduce.clone(),
                    ReduceByHash::new(0),
                    file,
                ),
            }
        };

        if config.use_post_thread {
            // receive concurrently with the pre-phase drain
            let post = &mut post;
            let exchange = &exchange;
            std::thread::scope(|scope| -> Result<()> {
                let receiver = scope.spawn(move || {
                    exchange.drain::<K, V>(&mut |key, value| post.insert(key, value))
                });
                pre()?;
                receiver.join().unwrap()
            })?;
        } else {
            // shuffled pairs buffer up in the stream queues meanwhile
            pre()?;
            exchange.drain::<K, V>(&mut |key, value| post.insert(key, value))?;
        }

        let mut writer = File::writer(pool);
        post.push_data(true, &mut |key, value| writer.put(&(key, value)))?;
        exchange.close();
        Ok(self.derive("reduce_by_key", writer.into_sink()?))
    }
}

impl<V> Dia<(u64, V)>
where
    V: Item + Clone + Send,
{
    /// Shuffled index-keyed reduction over the universe `[0, size)`: the
    /// result collection has exactly `size` items in ascending index
    /// order, where index `i` holds the fold of `reduce` over all inserted
    /// `(i, v)` pairs, or `neutral` if there are none. Worker `k` ends up
    /// with the `k`-th proportional index subrange.
    pub fn reduce_to_index<R>(
        &self,
        config: ReduceConfig,
        size: u64,
        neutral: V,
        reduce: R,
    ) -> Result<Dia<V>>
    where
        R: Fn(V, V) -> V + Clone + Send + Sync,
    {
        let ctx = self.ctx().clone();
        let pool = ctx.pool().clone();
        let file = self.fetch_file();
        let phase_budget = (config.limit_memory_bytes / 2).max(1);

        let universe = IndexRange::new(0, size);
        let my_range = universe.partition(ctx.my_rank(), ctx.num_workers());

        let exchange = Exchange::new(&ctx, config.use_mix_stream);
        let writers = exchange.open_writers();

        let mut post = ReduceByIndexPostPhase::new(
            pool.clone(),
            phase_budget,
            reduce.clone(),
            neutral,
            my_range,
        );

        let pre = || -> Result<()> {
            run_pre_phase::<u64, V, R, _, _>(
                pool.clone(),
                &config,
                writers,
                phase_budget,
                reduce.clone(),
                ReduceByIndex::new(universe),
                file,
            )
        };

        if config.use_post_thread {
            let post = &mut post;
            let exchange = &exchange;
            std::thread::scope(|scope| -> Result<()> {
                let receiver = scope.spawn(move || {
                    exchange.drain::<u64, V>(&mut |index, value| post.insert(index, value))
                });
                pre()?;
                receiver.join().unwrap()
            })?;
        } else {
            pre()?;
            exchange.drain::<u64, V>(&mut |index, value| post.insert(index, value))?;
        }

        let mut writer = File::writer(pool);
        post.push_data(true, &mut |value| writer.put(&value))?;
        exchange.close();
        Ok(self.derive("reduce_to_index", writer.into_sink()?))
    }
}

/// Convenience for tests and small jobs: gathers a reduction's result as a
/// key → value map replicated on every worker.
pub fn gather_as_map<K, V>(reduced: &Dia<(K, V)>) -> Result<HashMap<K, V>>
where
    K: Item + Clone + Eq + Hash + Send,
    V: Item + Clone + Send,
{
    Ok(reduced.all_gather()?.into_iter().collect())
}
