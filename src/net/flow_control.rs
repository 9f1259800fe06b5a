/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{Group, GroupExt};
use crate::data::Item;
use anyhow::Result;
use std::sync::Arc;

/// Synchronous collective operations over a [`Group`] with one rank per
/// worker.
///
/// All workers must call the same collective in the same order; each call is
/// a strict synchronization barrier, and these barriers are the only
/// synchronization points between stages. Operators are expected to be
/// associative; prefix sums preserve operand order, so non-commutative
/// operators are fine.
#[derive(Clone)]
pub struct FlowControlChannel {
    group: Arc<dyn Group>,
}

impl FlowControlChannel {
    pub fn new(group: Arc<dyn Group>) -> Self {
        FlowControlChannel { group }
    }

    pub fn my_rank(&self) -> usize {
        self.group.my_rank()
    }

    pub fn num_workers(&self) -> usize {
        self.group.num_peers()
    }

    /// Inclusive prefix sum: rank `k` receives the fold of the values of
    /// ranks `0..=k`. Pointer doubling, `Θ(log W)` rounds.
    pub fn prefix_sum<T, Op>(&self, value: T, op: Op) -> Result<T>
    where
        T: Item + Clone,
        Op: Fn(&T, &T) -> T,
    {
        self.prefix_sum_base(value, op, true)
    }

    /// Exclusive prefix sum: rank `k` receives the fold of the values of
    /// ranks `0..k`, and rank 0 receives `initial`.
    pub fn ex_prefix_sum<T, Op>(&self, value: T, initial: T, op: Op) -> Result<T>
    where
        T: Item + Clone,
        Op: Fn(&T, &T) -> T,
    {
        let result = self.prefix_sum_base(value, op, false)?;
        Ok(if self.my_rank() == 0 { initial } else { result })
    }

    fn prefix_sum_base<T, Op>(&self, value: T, op: Op, inclusive: bool) -> Result<T>
    where
        T: Item + Clone,
        Op: Fn(&T, &T) -> T,
    {
        let rank = self.my_rank();
        let n = self.num_workers();
        let mut value = value;
        // in the exclusive case we forward a value that is not our result
        let mut forward = value.clone();
        let mut first = true;

        let mut d = 1;
        while d < n {
            if rank + d < n {
                self.group.send_to(rank + d, &forward)?;
            }
            if rank >= d {
                let received: T = self.group.recv_from(rank - d)?;
                // mind the operand order, or associativity breaks
                forward = op(&received, &forward);
                if !first || inclusive {
                    value = op(&received, &value);
                } else {
                    value = received;
                    first = false;
                }
            }
            d <<= 1;
        }
        Ok(value)
    }

    /// Reduces the values of all ranks into rank 0 over a binomial tree.
    fn reduce_to_root<T, Op>(&self, value: &mut T, op: &Op) -> Result<()>
    where
        T: Item + Clone,
        Op: Fn(&T, &T) -> T,
    {
        let rank = self.my_rank();
        let n = self.num_workers();
        let mut active = true;
        let mut d = 1;
        while d < n {
            if active {
                if rank & d != 0 {
                    self.group.send_to(rank - d, value)?;
                    active = false;
                } else if rank + d < n {
                    let received: T = self.group.recv_from(rank + d)?;
                    *value = op(value, &received);
                }
            }
            d <<= 1;
        }
        Ok(())
    }

    /// Broadcasts the value of rank 0 to all ranks over a binomial tree;
    /// the argument of every other rank is ignored.
    pub fn broadcast<T: Item + Clone>(&self, value: T) -> Result<T> {
        let rank = self.my_rank();
        let n = self.num_workers();
        let mut value = value;
        let mut d = 1;
        if rank > 0 {
            // the predecessor is our rank with the lowest one bit cleared
            while rank & d == 0 {
                d <<= 1;
            }
            value = self.group.recv_from(rank ^ d)?;
        } else {
            d = n.next_power_of_two();
        }
        d >>= 1;
        while d > 0 {
            if rank + d < n {
                self.group.send_to(rank + d, &value)?;
            }
            d >>= 1;
        }
        Ok(value)
    }

    /// Folds the values of all ranks and distributes the result to every
    /// rank.
    pub fn all_reduce<T, Op>(&self, value: T, op: Op) -> Result<T>
    where
        T: Item + Clone,
        Op: Fn(&T, &T) -> T,
    {
        let mut value = value;
        self.reduce_to_root(&mut value, &op)?;
        self.broadcast(value)
    }

    /// All workers synchronize at this point.
    pub fn barrier(&self) -> Result<()> {
        self.all_reduce(0u8, |a, b| a.wrapping_add(*b))?;
        Ok(())
    }
}
