/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::Dia;
use crate::core::SplitterTree;
use crate::data::{File, Item};
use anyhow::Result;
use dsi_progress_logger::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Default bound on the relative imbalance of the per-worker output sizes.
pub const DEFAULT_IMBALANCE: f64 = 0.25;

/// Received buckets below this size are not worth a parallel sort.
const PAR_SORT_THRESHOLD: usize = 1 << 14;

fn log2_ceil(x: usize) -> u32 {
    usize::BITS - x.saturating_sub(1).leading_zeros()
}

impl<T> Dia<T>
where
    T: Item + Clone + Send,
{
    /// Distributed sample sort with the [default
    /// imbalance](DEFAULT_IMBALANCE) bound.
    pub fn sort<L>(&self, less: L) -> Result<Dia<T>>
    where
        L: Fn(&T, &T) -> bool + Send + Sync,
    {
        self.sort_with_imbalance(less, DEFAULT_IMBALANCE)
    }

    /// Distributed sample sort: the result is globally ordered by `less`
    /// (worker `k`'s slice precedes worker `k + 1`'s), and each worker's
    /// output size stays within `(1 ± epsilon)` of the mean.
    ///
    /// Every worker samples `⌈log₂(total)⌉ / epsilon²` items, rank 0 picks
    /// the `W − 1` equal quantiles of the gathered sample as splitters, and
    /// items are classified down the [`SplitterTree`] — with the global-rank
    /// tiebreaker spreading runs of equal keys — and shuffled to their
    /// bucket's worker, which sorts locally.
    pub fn sort_with_imbalance<L>(&self, less: L, epsilon: f64) -> Result<Dia<T>>
    where
        L: Fn(&T, &T) -> bool + Send + Sync,
    {
        let ctx = self.ctx().clone();
        let file = self.fetch_file();
        let num_workers = ctx.num_workers();

        let mut data: Vec<T> = file.into_consume_reader().read_complete()?;
        let local_size = data.len();
        let flow = ctx.flow();
        let prefix = flow.ex_prefix_sum(local_size, 0, |a, b| a + b)?;
        let total = flow.all_reduce(local_size, |a, b| a + b)?;

        if total == 0 {
            return Ok(self.derive("sort", ctx.new_file()));
        }

        // draw this worker's proportional share of the global sample and
        // gather it on rank 0
        let sample_size =
            ((log2_ceil(total) as f64 / (epsilon * epsilon)).ceil() as usize).max(num_workers);
        let local_share = ((sample_size as u128 * local_size as u128 / total as u128) as usize)
            .max(usize::from(local_size > 0));
        let mut rng = SmallRng::seed_from_u64(0x5EED_0000 + ctx.my_rank() as u64);
        let sample_stream = ctx.new_cat_stream();
        {
            let mut writers = sample_stream.open_writers();
            for _ in 0..local_share.min(local_size * 4) {
                writers[0].put(&data[rng.random_range(0..local_size)])?;
            }
            for mut writer in writers {
                writer.close()?;
            }
        }
        let splitters: Vec<T> = if ctx.my_rank() == 0 {
            let mut samples = sample_stream.open_cat_reader(true).read_complete::<T>()?;
            samples.sort_unstable_by(|a, b| compare(a, b, &less));
            // W - 1 equal quantiles
            (1..num_workers)
                .map(|i| samples[i * samples.len() / num_workers].clone())
                .collect()
        } else {
            Vec::new()
        };
        sample_stream.close();
        let splitters = flow.broadcast(splitters)?;

        // classify and ship every item to its bucket's worker
        let tree = SplitterTree::new(&splitters, num_workers);
        let exchange = ctx.new_cat_stream();
        {
            let mut writers = exchange.open_writers();
            let mut pl = ProgressLogger::default();
            pl.item_name("item").expected_updates(Some(data.len()));
            pl.start("Classifying and shuffling items...");
            tree.classify(&data, &less, prefix, total, |bucket, item| {
                pl.light_update();
                writers[bucket].put(item)
            })?;
            pl.done();
            for mut writer in writers {
                writer.close()?;
            }
        }
        data.clear();
        data.shrink_to_fit();

        // local sort of the received bucket
        let mut bucket: Vec<T> = exchange.open_cat_reader(true).read_complete()?;
        exchange.close();
        if bucket.len() >= PAR_SORT_THRESHOLD {
            bucket.par_sort_unstable_by(|a, b| compare(a, b, &less));
        } else {
            bucket.sort_unstable_by(|a, b| compare(a, b, &less));
        }

        let mut writer = File::writer(ctx.pool().clone());
        for item in &bucket {
            writer.put(item)?;
        }
        Ok(self.derive("sort", writer.into_sink()?))
    }
}

#[inline(always)]
fn compare<T, L: Fn(&T, &T) -> bool>(a: &T, b: &T, less: &L) -> std::cmp::Ordering {
    if less(a, b) {
        std::cmp::Ordering::Less
    } else if less(b, a) {
        std::cmp::Ordering::Greater
    } else {
        std::cmp::Ordering::Equal
    }
}
