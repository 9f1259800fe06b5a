/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::PinnedByteBlock;
use crate::mem::AlignedBuf;
use std::sync::{Arc, Condvar, Mutex};

/// Default size of data blocks: 2 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Default)]
struct BlockPoolData {
    /// Bytes currently held by live byte blocks.
    used: usize,
    /// Number of live byte blocks.
    blocks: usize,
    /// High-water mark of `used`.
    max_used: usize,
}

/// The host-wide accountant and allocator of byte blocks.
///
/// All byte blocks of a host are issued against this pool's byte quota;
/// accounting is exact: [`used`](BlockPool::used) equals the sum of live
/// byte-block sizes at all times. When the quota is exhausted,
/// [`allocate_byte_block`](BlockPool::allocate_byte_block) either blocks
/// until memory is returned or, for sinks that can apply backpressure,
/// returns `None`.
pub struct BlockPool {
    data: Mutex<BlockPoolData>,
    available: Condvar,
    quota: usize,
    default_block_size: usize,
}

impl BlockPool {
    pub fn new(quota: usize, default_block_size: usize) -> Arc<Self> {
        Arc::new(BlockPool {
            data: Mutex::new(BlockPoolData::default()),
            available: Condvar::new(),
            quota,
            default_block_size,
        })
    }

    #[inline(always)]
    pub fn default_block_size(&self) -> usize {
        self.default_block_size
    }

    #[inline(always)]
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Bytes currently held by live byte blocks.
    pub fn used(&self) -> usize {
        self.data.lock().unwrap().used
    }

    /// Number of live byte blocks.
    pub fn num_blocks(&self) -> usize {
        self.data.lock().unwrap().blocks
    }

    /// High-water mark of [`used`](BlockPool::used).
    pub fn max_used(&self) -> usize {
        self.data.lock().unwrap().max_used
    }

    /// Allocates a writable byte block of `size` bytes.
    ///
    /// With `can_fail` the call returns `None` instead of waiting when the
    /// quota is exhausted; callers are expected to apply backpressure and
    /// retry after [`wait_for_quota`](BlockPool::wait_for_quota). Without it
    /// the call blocks until quota is available.
    ///
    /// # Panics
    ///
    /// If `size` exceeds the whole quota; no amount of waiting could ever
    /// satisfy such a request.
    pub fn allocate_byte_block(
        self: &Arc<Self>,
        size: usize,
        can_fail: bool,
    ) -> Option<PinnedByteBlock> {
        assert!(
            size <= self.quota,
            "BlockPool: quota exceeded: block of {} bytes requested with a quota of {} bytes",
            size,
            self.quota
        );
        {
            let mut data = self.data.lock().unwrap();
            while data.used + size > self.quota {
                if can_fail {
                    return None;
                }
                log::debug!(
                    "BlockPool: waiting for {} bytes ({} used of {})",
                    size,
                    data.used,
                    self.quota
                );
                data = self.available.wait(data).unwrap();
            }
            data.used += size;
            data.blocks += 1;
            data.max_used = data.max_used.max(data.used);
        }
        Some(PinnedByteBlock::new(
            AlignedBuf::new_default_aligned(size),
            self.clone(),
        ))
    }

    /// Blocks until at least `size` bytes of quota are free. Used by writers
    /// whose sink allows allocation failure, between failed allocation
    /// attempts.
    pub fn wait_for_quota(&self, size: usize) {
        let mut data = self.data.lock().unwrap();
        while data.used + size > self.quota {
            data = self.available.wait(data).unwrap();
        }
    }

    pub(crate) fn release(&self, size: usize) {
        let mut data = self.data.lock().unwrap();
        assert!(
            data.used >= size && data.blocks > 0,
            "BlockPool: release below zero"
        );
        data.used -= size;
        data.blocks -= 1;
        drop(data);
        self.available.notify_all();
    }
}

impl core::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let data = self.data.lock().unwrap();
        f.debug_struct("BlockPool")
            .field("quota", &self.quota)
            .field("used", &data.used)
            .field("blocks", &data.blocks)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quota_accounting() {
        let pool = BlockPool::new(1 << 20, 1 << 16);
        let a = pool.allocate_byte_block(1 << 16, false).unwrap();
        let b = pool.allocate_byte_block(1 << 18, false).unwrap();
        assert_eq!(pool.used(), (1 << 16) + (1 << 18));
        assert_eq!(pool.num_blocks(), 2);
        let a = a.freeze();
        let a2 = a.clone();
        drop(a);
        // still referenced
        assert_eq!(pool.used(), (1 << 16) + (1 << 18));
        drop(a2);
        assert_eq!(pool.used(), 1 << 18);
        drop(b);
        assert_eq!(pool.used(), 0);
        assert_eq!(pool.num_blocks(), 0);
    }

    #[test]
    fn test_can_fail() {
        let pool = BlockPool::new(1 << 16, 1 << 16);
        let a = pool.allocate_byte_block(1 << 16, true).unwrap();
        assert!(pool.allocate_byte_block(1, true).is_none());
        drop(a);
        assert!(pool.allocate_byte_block(1, true).is_some());
    }

    #[test]
    fn test_blocking_allocation() {
        let pool = BlockPool::new(1 << 16, 1 << 16);
        let a = pool.allocate_byte_block(1 << 16, false).unwrap();
        let pool2 = pool.clone();
        let t = std::thread::spawn(move || {
            // blocks until the main thread frees the first block
            pool2.allocate_byte_block(1 << 16, false).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(a);
        let b = t.join().unwrap();
        assert_eq!(b.len(), 1 << 16);
    }
}
