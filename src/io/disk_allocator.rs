/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::Bid;
use anyhow::{bail, ensure, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

struct AllocInner {
    /// Free regions, `offset → size`, disjoint and sorted by construction.
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
    disk_bytes: u64,
}

/// First-fit free-space management for one disk file.
///
/// The free map is kept disjoint and coalesced: freeing a range adjacent to
/// existing free ranges merges them, and freeing a range overlapping a free
/// range is a fatal double-free error. At any time the sum of allocated and
/// free bytes equals the grown file size.
pub struct DiskAllocator {
    inner: Mutex<AllocInner>,
    autogrow: bool,
    file_id: usize,
}

impl DiskAllocator {
    pub fn new(file_id: usize, initial_bytes: u64, autogrow: bool) -> Self {
        let mut free = BTreeMap::new();
        if initial_bytes > 0 {
            free.insert(0, initial_bytes);
        }
        DiskAllocator {
            inner: Mutex::new(AllocInner {
                free,
                free_bytes: initial_bytes,
                disk_bytes: initial_bytes,
            }),
            autogrow,
            file_id,
        }
    }

    pub fn file_id(&self) -> usize {
        self.file_id
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().unwrap().free_bytes
    }

    /// Current (possibly grown) size of the managed file.
    pub fn disk_bytes(&self) -> u64 {
        self.inner.lock().unwrap().disk_bytes
    }

    /// Snapshot of the free regions, for diagnostics and tests.
    pub fn free_regions(&self) -> Vec<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner.free.iter().map(|(&o, &s)| (o, s)).collect()
    }

    /// Allocates contiguous offsets for a batch of bids, first-fit. If no
    /// single free region can hold the whole batch, it is split recursively
    /// in halves (with a warning, since scattered batches hurt I/O
    /// locality).
    pub fn new_blocks(&self, bids: &mut [Bid]) -> Result<()> {
        if bids.is_empty() {
            return Ok(());
        }
        let requested: u64 = bids.iter().map(|b| b.size as u64).sum();
        let largest = bids.iter().map(|b| b.size).max().unwrap() as u64;

        {
            let mut inner = self.inner.lock().unwrap();
            log::debug!(
                "DiskAllocator: requesting {} bytes in {} blocks, {} of {} free",
                requested,
                bids.len(),
                inner.free_bytes,
                inner.disk_bytes
            );
            if inner.free_bytes < requested {
                ensure!(
                    self.autogrow,
                    "disk full: {} bytes requested, {} free (enable autogrow?)",
                    requested,
                    inner.free_bytes
                );
                Self::grow(&mut inner, requested)?;
            }

            if Self::try_allocate(&mut inner, bids, requested) {
                return Ok(());
            }

            if bids.len() == 1 {
                // a single block cannot be split: grow past the fragmentation
                ensure!(
                    self.autogrow,
                    "disk full: severe external memory fragmentation, {} bytes requested",
                    largest
                );
                log::warn!("DiskAllocator: severe external memory fragmentation");
                Self::grow(&mut inner, largest)?;
                ensure!(
                    Self::try_allocate(&mut inner, bids, requested),
                    "disk full: could not allocate {} bytes after growing",
                    requested
                );
                return Ok(());
            }
        }

        // no contiguous region: split the batch
        log::warn!(
            "DiskAllocator: no contiguous region for {} blocks, splitting batch",
            bids.len()
        );
        let mid = bids.len() / 2;
        self.new_blocks(&mut bids[..mid])?;
        self.new_blocks(&mut bids[mid..])
    }

    /// Returns the bid's range to the free map, coalescing with adjacent
    /// free regions. Any overlap with an existing free region is a fatal
    /// double free.
    pub fn delete_block(&self, bid: &Bid) -> Result<()> {
        debug_assert!(bid.is_allocated());
        let mut inner = self.inner.lock().unwrap();
        log::debug!(
            "DiskAllocator: freeing [{}, {}) with {} free",
            bid.offset,
            bid.offset + bid.size as u64,
            inner.free_bytes
        );
        Self::add_free_region(&mut inner, bid.offset, bid.size as u64)
    }

    fn try_allocate(inner: &mut AllocInner, bids: &mut [Bid], requested: u64) -> bool {
        let Some((&offset, &size)) = inner.free.iter().find(|(_, &size)| size >= requested)
        else {
            return false;
        };
        inner.free.remove(&offset);
        if size > requested {
            inner.free.insert(offset + requested, size - requested);
        }
        let mut position = offset;
        for bid in bids {
            bid.offset = position;
            position += bid.size as u64;
        }
        inner.free_bytes -= requested;
        true
    }

    fn grow(inner: &mut AllocInner, bytes: u64) -> Result<()> {
        let start = inner.disk_bytes;
        inner.disk_bytes += bytes;
        log::debug!("DiskAllocator: growing file to {} bytes", inner.disk_bytes);
        Self::add_free_region(inner, start, bytes)
    }

    fn add_free_region(inner: &mut AllocInner, offset: u64, size: u64) -> Result<()> {
        ensure!(
            offset + size <= inner.disk_bytes,
            "double free: region [{}, {}) beyond file end {}",
            offset,
            offset + size,
            inner.disk_bytes
        );

        let mut new_offset = offset;
        let mut new_size = size;

        // predecessor: last free region starting at or before offset
        if let Some((&prev_offset, &prev_size)) = inner.free.range(..=offset).next_back() {
            if prev_offset + prev_size > offset {
                bail!(
                    "double free: [{}, {}) overlaps free region [{}, {})",
                    offset,
                    offset + size,
                    prev_offset,
                    prev_offset + prev_size
                );
            }
            if prev_offset + prev_size == offset {
                inner.free.remove(&prev_offset);
                new_offset = prev_offset;
                new_size += prev_size;
            }
        }

        // successor: first free region starting after offset
        if let Some((&next_offset, &next_size)) = inner.free.range(offset + 1..).next() {
            if next_offset < offset + size {
                bail!(
                    "double free: [{}, {}) overlaps free region [{}, {})",
                    offset,
                    offset + size,
                    next_offset,
                    next_offset + next_size
                );
            }
            if next_offset == offset + size {
                inner.free.remove(&next_offset);
                new_size += next_size;
            }
        }

        inner.free.insert(new_offset, new_size);
        inner.free_bytes += size;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_allocate_free_cycle() {
        let alloc = DiskAllocator::new(0, 1 << 20, false);
        let mut bids = [Bid::new(0, 1 << 16), Bid::new(0, 1 << 16)];
        alloc.new_blocks(&mut bids).unwrap();
        assert!(bids.iter().all(|b| b.is_allocated()));
        assert_eq!(bids[1].offset, bids[0].offset + (1 << 16));
        assert_eq!(alloc.free_bytes(), (1 << 20) - (1 << 17));

        alloc.delete_block(&bids[0]).unwrap();
        alloc.delete_block(&bids[1]).unwrap();
        assert_eq!(alloc.free_bytes(), 1 << 20);
        // the two freed blocks coalesced with the tail into one region
        assert_eq!(alloc.free_regions(), vec![(0, 1 << 20)]);
    }

    #[test]
    fn test_double_free() {
        let alloc = DiskAllocator::new(0, 1 << 20, false);
        let mut bids = [Bid::new(0, 4096)];
        alloc.new_blocks(&mut bids).unwrap();
        alloc.delete_block(&bids[0]).unwrap();
        assert!(alloc.delete_block(&bids[0]).is_err());
    }

    #[test]
    fn test_disk_full() {
        let alloc = DiskAllocator::new(0, 8192, false);
        let mut bids = [Bid::new(0, 16384)];
        assert!(alloc.new_blocks(&mut bids).is_err());
    }

    #[test]
    fn test_autogrow() {
        let alloc = DiskAllocator::new(0, 0, true);
        let mut bids = [Bid::new(0, 16384)];
        alloc.new_blocks(&mut bids).unwrap();
        assert_eq!(alloc.disk_bytes(), 16384);
    }

    #[test]
    fn test_coalescing_middle() {
        let alloc = DiskAllocator::new(0, 3 * 4096, false);
        let mut bids = [Bid::new(0, 4096), Bid::new(0, 4096), Bid::new(0, 4096)];
        alloc.new_blocks(&mut bids).unwrap();
        alloc.delete_block(&bids[0]).unwrap();
        alloc.delete_block(&bids[2]).unwrap();
        assert_eq!(alloc.free_regions().len(), 2);
        alloc.delete_block(&bids[1]).unwrap();
        assert_eq!(alloc.free_regions(), vec![(0, 3 * 4096)]);
    }

    #[test]
    fn test_fragmented_batch_splits() {
        let alloc = DiskAllocator::new(0, 4 * 4096, false);
        let mut bids: Vec<Bid> = (0..4).map(|_| Bid::new(0, 4096)).collect();
        alloc.new_blocks(&mut bids).unwrap();
        // free two non-adjacent blocks, then ask for a two-block batch
        alloc.delete_block(&bids[0]).unwrap();
        alloc.delete_block(&bids[2]).unwrap();
        let mut batch = [Bid::new(0, 4096), Bid::new(0, 4096)];
        alloc.new_blocks(&mut batch).unwrap();
        assert!(batch.iter().all(|b| b.is_allocated()));
        assert_ne!(batch[0].offset + 4096, batch[1].offset);
        assert_eq!(alloc.free_bytes(), 0);
    }
}
