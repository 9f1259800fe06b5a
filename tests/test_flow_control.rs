/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use millrace::api::{run_local, run_local_tests, Context};

/// Inclusive prefix sum: worker `k` observes the fold over ranks `0..=k`
/// (P6).
#[test]
fn test_prefix_sum_inclusive() {
    run_local_tests(|ctx: Context| -> Result<()> {
        let rank = ctx.my_rank();
        let value = (rank + 1) as u64;
        let sum = ctx.flow().prefix_sum(value, |a, b| a + b)?;
        let expected: u64 = (1..=rank as u64 + 1).sum();
        assert_eq!(sum, expected);
        Ok(())
    })
    .unwrap();
}

/// Exclusive prefix sum: identity at rank 0, fold over ranks `0..k`
/// elsewhere (P6).
#[test]
fn test_prefix_sum_exclusive() {
    run_local_tests(|ctx: Context| -> Result<()> {
        let rank = ctx.my_rank();
        let sum = ctx.flow().ex_prefix_sum((rank + 1) as u64, 0, |a, b| a + b)?;
        let expected: u64 = (1..=rank as u64).sum();
        assert_eq!(sum, expected);
        Ok(())
    })
    .unwrap();
}

/// Prefix sums preserve operand order, so non-commutative operators work:
/// string concatenation in rank order.
#[test]
fn test_prefix_sum_non_commutative() {
    run_local(1, 4, |ctx: Context| -> Result<()> {
        let rank = ctx.my_rank();
        let value = rank.to_string();
        let cat = ctx
            .flow()
            .prefix_sum(value, |a, b| format!("{}{}", a, b))?;
        let expected: String = (0..=rank).map(|r| r.to_string()).collect();
        assert_eq!(cat, expected);
        Ok(())
    })
    .unwrap();
}

/// AllReduce yields the same fold on every worker (P7).
#[test]
fn test_all_reduce() {
    run_local_tests(|ctx: Context| -> Result<()> {
        let num_workers = ctx.num_workers() as u64;
        let rank = ctx.my_rank() as u64;
        let sum = ctx.flow().all_reduce(rank + 1, |a, b| a + b)?;
        assert_eq!(sum, num_workers * (num_workers + 1) / 2);
        let max = ctx.flow().all_reduce(rank, |a, b| *a.max(b))?;
        assert_eq!(max, num_workers - 1);
        Ok(())
    })
    .unwrap();
}

/// Broadcast distributes rank 0's value; the other ranks' arguments are
/// ignored.
#[test]
fn test_broadcast() {
    run_local_tests(|ctx: Context| -> Result<()> {
        let value = if ctx.my_rank() == 0 {
            vec![3u64, 1, 4, 1, 5]
        } else {
            Vec::new()
        };
        let received = ctx.flow().broadcast(value)?;
        assert_eq!(received, vec![3, 1, 4, 1, 5]);
        Ok(())
    })
    .unwrap();
}

/// A barrier is a synchronization point: a rank-dependent sleep before it
/// cannot reorder the phases observed after it.
#[test]
fn test_barrier() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static BEFORE: AtomicUsize = AtomicUsize::new(0);

    run_local(1, 4, |ctx: Context| -> Result<()> {
        std::thread::sleep(std::time::Duration::from_millis(
            10 * ctx.my_rank() as u64,
        ));
        BEFORE.fetch_add(1, Ordering::SeqCst);
        ctx.flow().barrier()?;
        assert_eq!(BEFORE.load(Ordering::SeqCst), 4);
        Ok(())
    })
    .unwrap();
}
