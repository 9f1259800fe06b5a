/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use millrace::api::{run_local, run_local_tests, Context, Dia};
use millrace::core::ReduceConfig;

/// E2: universe of 10, three insertions, holes filled with the neutral
/// element.
#[test]
fn test_holes_get_neutral_element() {
    run_local_tests(|ctx: Context| -> Result<()> {
        let pairs: Vec<(u64, u64)> = if ctx.my_rank() == 0 {
            vec![(2, 5), (2, 7), (7, 1)]
        } else {
            Vec::new()
        };
        let dia = Dia::from_vec(ctx, pairs)?;
        let result = dia.reduce_to_index(ReduceConfig::default(), 10, 0, |a, b| a + b)?;
        assert_eq!(result.size()?, 10);
        let gathered = result.all_gather()?;
        assert_eq!(gathered, vec![0, 0, 12, 0, 0, 0, 0, 1, 0, 0]);
        Ok(())
    })
    .unwrap();
}

/// P4 at scale: every index of the universe folds exactly the pairs
/// inserted for it, in ascending index order.
fn index_histogram(ctx: Context, config: ReduceConfig) -> Result<()> {
    const TOTAL: u64 = 20_000;
    const UNIVERSE: u64 = 1_000;

    // index i receives one pair per multiple of i in [0, TOTAL)
    let pairs = Dia::generate(ctx, TOTAL, |i| (i % UNIVERSE, 1u64))?;
    let result = pairs.reduce_to_index(config, UNIVERSE, 0, |a, b| a + b)?;
    let gathered = result.all_gather()?;
    assert_eq!(gathered, vec![TOTAL / UNIVERSE; UNIVERSE as usize]);
    Ok(())
}

#[test]
fn test_index_histogram() {
    for (hosts, workers) in [(1, 1), (1, 3), (2, 2)] {
        run_local(hosts, workers, |ctx| {
            index_histogram(ctx, ReduceConfig::default())
        })
        .unwrap();
    }
}

/// The dense array cannot hold the local range: subranges spill to files
/// and are re-reduced; the output must not change.
#[test]
fn test_index_histogram_subrange_spill() {
    let config = ReduceConfig {
        // a few dozen entries per phase at most
        limit_memory_bytes: 1024,
        ..Default::default()
    };
    run_local(2, 2, |ctx| index_histogram(ctx, config.clone())).unwrap();
}

/// Sparse insertions with a non-zero neutral element.
#[test]
fn test_sparse_with_neutral() {
    run_local(1, 3, |ctx: Context| -> Result<()> {
        const UNIVERSE: u64 = 5_000;
        // only worker 1 inserts anything
        let pairs: Vec<(u64, u64)> = if ctx.my_rank() == 1 {
            (0..UNIVERSE).step_by(100).map(|i| (i, i)).collect()
        } else {
            Vec::new()
        };
        let dia = Dia::from_vec(ctx, pairs)?;
        let result =
            dia.reduce_to_index(ReduceConfig::default(), UNIVERSE, u64::MAX, |a, b| {
                a.min(b)
            })?;
        let gathered = result.all_gather()?;
        assert_eq!(gathered.len(), UNIVERSE as usize);
        for (i, value) in gathered.into_iter().enumerate() {
            if i % 100 == 0 {
                assert_eq!(value, i as u64);
            } else {
                assert_eq!(value, u64::MAX);
            }
        }
        Ok(())
    })
    .unwrap();
}
