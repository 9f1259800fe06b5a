/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use millrace::api::{gather_as_map, run_local, Context, Dia};
use millrace::core::{ReduceConfig, TableKind};
use std::collections::HashMap;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The word-count fixture: two lines spread over the workers.
fn word_count(ctx: Context, config: ReduceConfig) -> Result<()> {
    let lines = ["a b a c", "b c c a"];
    let my_lines: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| i % ctx.num_workers() == ctx.my_rank())
        .map(|(_, line)| *line)
        .collect();
    let pairs: Vec<(String, u64)> = my_lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .map(|token| (token.to_string(), 1))
        .collect();

    let words = Dia::from_vec(ctx, pairs)?;
    let counts = words.reduce_by_key(config, |a, b| a + b)?;
    let map = gather_as_map(&counts)?;

    let expected: HashMap<String, u64> =
        [("a", 3), ("b", 2), ("c", 3)]
            .into_iter()
            .map(|(word, count)| (word.to_string(), count))
            .collect();
    assert_eq!(map, expected);
    Ok(())
}

/// E1: word count, independent of the number of workers.
#[test]
fn test_word_count() {
    init_logger();
    for (hosts, workers) in [(1, 1), (1, 2), (2, 2), (1, 7)] {
        run_local(hosts, workers, |ctx| word_count(ctx, ReduceConfig::default())).unwrap();
    }
}

#[test]
fn test_word_count_bucket_table() {
    let config = ReduceConfig {
        table_kind: TableKind::Bucket,
        ..Default::default()
    };
    run_local(2, 2, |ctx| word_count(ctx, config.clone())).unwrap();
}

#[test]
fn test_word_count_mix_stream() {
    let config = ReduceConfig {
        use_mix_stream: true,
        ..Default::default()
    };
    run_local(2, 2, |ctx| word_count(ctx, config.clone())).unwrap();
}

#[test]
fn test_word_count_post_thread() {
    let config = ReduceConfig {
        use_post_thread: true,
        ..Default::default()
    };
    run_local(2, 2, |ctx| word_count(ctx, config.clone())).unwrap();
}

#[test]
fn test_word_count_location_detection() {
    let config = ReduceConfig {
        use_location_detection: true,
        ..Default::default()
    };
    run_local(2, 2, |ctx| word_count(ctx, config.clone())).unwrap();
}

/// The reference reduction of the randomized fixture, computed directly.
fn expected_sums(total: u64, modulus: u64) -> HashMap<u64, u64> {
    let mut expected: HashMap<u64, u64> = HashMap::new();
    for i in 0..total {
        *expected.entry(i % modulus).or_default() += i;
    }
    expected
}

/// P3: the reduction equals the per-key fold, whatever the partitioning,
/// fill rate, worker count, and spill behavior.
fn keyed_sums(ctx: Context, config: ReduceConfig) -> Result<()> {
    const TOTAL: u64 = 10_000;
    const MODULUS: u64 = 97;

    let pairs = Dia::generate(ctx, TOTAL, |i| (i % MODULUS, i))?;
    let reduced = pairs.reduce_by_key(config, |a, b| a + b)?;
    assert_eq!(reduced.size()?, MODULUS as usize);
    let map = gather_as_map(&reduced)?;
    assert_eq!(map, expected_sums(TOTAL, MODULUS));
    Ok(())
}

#[test]
fn test_keyed_sums() {
    for (hosts, workers) in [(1, 1), (1, 3), (2, 2)] {
        run_local(hosts, workers, |ctx| keyed_sums(ctx, ReduceConfig::default())).unwrap();
    }
}

/// E6: a budget of a handful of slots forces constant spilling and
/// multi-level re-reduction; the result must not change.
#[test]
fn test_keyed_sums_tight_memory() {
    let config = ReduceConfig {
        limit_memory_bytes: 512,
        limit_partition_fill_rate: 0.5,
        num_partitions: 4,
        ..Default::default()
    };
    run_local(2, 2, |ctx| keyed_sums(ctx, config.clone())).unwrap();
}

#[test]
fn test_keyed_sums_tight_memory_bucket() {
    let config = ReduceConfig {
        table_kind: TableKind::Bucket,
        limit_memory_bytes: 512,
        num_partitions: 4,
        ..Default::default()
    };
    run_local(1, 3, |ctx| keyed_sums(ctx, config.clone())).unwrap();
}

/// Non-commutative keys with heavy skew, with and without location
/// detection: one key holds half of all items.
#[test]
fn test_skewed_keys() {
    for use_location_detection in [false, true] {
        let config = ReduceConfig {
            use_location_detection,
            ..Default::default()
        };
        run_local(2, 2, move |ctx: Context| -> Result<()> {
            const TOTAL: u64 = 4_000;
            let pairs = Dia::generate(ctx, TOTAL, |i| {
                let key = if i % 2 == 0 { 0 } else { 1 + i % 5 };
                (key, 1u64)
            })?;
            let reduced = pairs.reduce_by_key(config.clone(), |a, b| a + b)?;
            let map = gather_as_map(&reduced)?;
            assert_eq!(map[&0], TOTAL / 2);
            let rest: u64 = (1..=5).map(|k| map[&k]).sum();
            assert_eq!(rest, TOTAL / 2);
            Ok(())
        })
        .unwrap();
    }
}

/// map and filter compose with the reduction, and `keep` allows reading a
/// collection twice.
#[test]
fn test_map_filter_keep() {
    run_local(1, 2, |ctx: Context| -> Result<()> {
        let numbers = Dia::generate(ctx, 1000, |i| i)?;
        let evens = numbers.filter(|&i| i % 2 == 0)?;
        assert_eq!(evens.size()?, 500);
        // two reads of the same collection: declare the extra one
        evens.keep();
        let first_pass = evens.all_gather()?;
        assert_eq!(first_pass, (0..1000).filter(|i| i % 2 == 0).collect::<Vec<_>>());
        let doubled = evens.map(|i| i * 2)?;
        let gathered = doubled.all_gather()?;
        assert_eq!(gathered.len(), 500);
        assert!(gathered.iter().all(|i| i % 4 == 0));
        Ok(())
    })
    .unwrap();
}
