/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use millrace::api::{run_local, Context, Dia};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Sorts `total` seeded uniform integers and checks global order and the
/// per-worker balance bound (E3, P5).
fn sort_uniform(ctx: Context, total: u64, epsilon: f64) -> Result<()> {
    let num_workers = ctx.num_workers();
    let mut rng = SmallRng::seed_from_u64(0xDA7A + ctx.my_rank() as u64);
    let local = millrace::core::IndexRange::new(0, total)
        .partition(ctx.my_rank(), num_workers)
        .size();
    let data: Vec<u64> = (0..local).map(|_| rng.random::<u64>()).collect();

    let dia = Dia::from_vec(ctx.clone(), data)?;
    let sorted = dia.sort_with_imbalance(|a, b| a < b, epsilon)?;

    // the balance criterion: every worker ends up within (1 ± ε) of the mean
    let local_output = sorted.local_size() as f64;
    let mean = total as f64 / num_workers as f64;
    assert!(
        local_output <= (1.0 + epsilon) * mean && local_output >= (1.0 - epsilon) * mean,
        "worker {} got {} items, mean {}",
        ctx.my_rank(),
        local_output,
        mean
    );

    // global order: worker k's slice precedes worker k + 1's
    let gathered = sorted.all_gather()?;
    assert_eq!(gathered.len(), total as usize);
    assert!(gathered.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn test_sort_uniform() {
    let _ = env_logger::builder().is_test(true).try_init();
    for (hosts, workers) in [(1, 1), (1, 4), (2, 2)] {
        run_local(hosts, workers, |ctx| sort_uniform(ctx, 100_000, 0.25)).unwrap();
    }
}

#[cfg(feature = "slow_tests")]
#[test]
fn test_sort_uniform_large() {
    for (hosts, workers) in [(1, 4), (4, 4)] {
        run_local(hosts, workers, |ctx| sort_uniform(ctx, 1_000_000, 0.25)).unwrap();
    }
}

/// Heavy duplication: a handful of distinct keys must still respect the
/// balance bound thanks to the global-rank tiebreaker.
#[test]
fn test_sort_few_distinct_keys() {
    run_local(1, 4, |ctx: Context| -> Result<()> {
        const TOTAL: u64 = 40_000;
        let dia = Dia::generate(ctx.clone(), TOTAL, |i| i % 3)?;
        let sorted = dia.sort(|a, b| a < b)?;

        let local_output = sorted.local_size() as f64;
        let mean = TOTAL as f64 / ctx.num_workers() as f64;
        assert!(
            local_output <= 1.25 * mean && local_output >= 0.75 * mean,
            "worker {} got {} items with 3 distinct keys",
            ctx.my_rank(),
            local_output
        );

        let gathered = sorted.all_gather()?;
        assert!(gathered.windows(2).all(|w| w[0] <= w[1]));
        let zeros = gathered.iter().filter(|&&v| v == 0).count() as u64;
        assert_eq!(zeros, TOTAL.div_ceil(3));
        Ok(())
    })
    .unwrap();
}

/// Sorting by a custom, reversed order.
#[test]
fn test_sort_custom_order() {
    run_local(2, 2, |ctx: Context| -> Result<()> {
        let dia = Dia::generate(ctx, 10_000, |i| (i * 2654435761) % 10_000)?;
        let sorted = dia.sort(|a, b| a > b)?;
        let gathered = sorted.all_gather()?;
        assert_eq!(gathered.len(), 10_000);
        assert!(gathered.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    })
    .unwrap();
}

/// Sorting nothing must not get stuck in the collectives.
#[test]
fn test_sort_empty() {
    run_local(1, 3, |ctx: Context| -> Result<()> {
        let dia = Dia::from_vec(ctx, Vec::<u64>::new())?;
        let sorted = dia.sort(|a, b| a < b)?;
        assert_eq!(sorted.size()?, 0);
        Ok(())
    })
    .unwrap();
}

/// Strings sort too (variable-size items through the whole exchange).
#[test]
fn test_sort_strings() {
    run_local(1, 2, |ctx: Context| -> Result<()> {
        let dia = Dia::generate(ctx, 5_000, |i| format!("{:05}", (i * 7919) % 5_000))?;
        let sorted = dia.sort(|a, b| a < b)?;
        let gathered = sorted.all_gather()?;
        assert_eq!(gathered.len(), 5_000);
        assert!(gathered.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    })
    .unwrap();
}
