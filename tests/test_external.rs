/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use millrace::io::{wait_all, Bid, DiskAllocator, IoPool, TypedBlock};
use std::sync::Arc;

type Block = TypedBlock<{ 64 * 1024 }, u64>;

fn temp_disk() -> (tempfile::TempDir, Arc<std::fs::File>) {
    let dir = tempfile::tempdir().unwrap();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.path().join("disk"))
        .unwrap();
    (dir, Arc::new(file))
}

#[test]
fn test_typed_block_round_trip() {
    let (_dir, file) = temp_disk();
    let io = IoPool::new(2);
    let alloc = DiskAllocator::new(0, 0, true);

    let mut bids: Vec<Bid> = (0..4).map(|_| Bid::new(0, 64 * 1024)).collect();
    alloc.new_blocks(&mut bids).unwrap();

    // write four blocks asynchronously, then wait for the batch
    let mut requests = Vec::new();
    for (index, bid) in bids.iter().enumerate() {
        let mut block = Block::new();
        for (i, slot) in block.items_mut().iter_mut().enumerate() {
            *slot = (index * Block::CAPACITY + i) as u64;
        }
        requests.push(block.write(&io, &file, bid).unwrap());
    }
    wait_all(requests).unwrap();

    // read them back in reverse order
    for (index, bid) in bids.iter().enumerate().rev() {
        let mut block = Block::new();
        block.read(&io, &file, bid).unwrap();
        for (i, &slot) in block.items().iter().enumerate() {
            assert_eq!(slot, (index * Block::CAPACITY + i) as u64);
        }
    }

    for bid in &bids {
        alloc.delete_block(bid).unwrap();
    }
    assert_eq!(alloc.free_bytes(), alloc.disk_bytes());
}

#[test]
fn test_many_concurrent_requests() {
    let (_dir, file) = temp_disk();
    let io = IoPool::new(4);

    let writes: Vec<_> = (0..64u64)
        .map(|i| io.write(&file, i * 4096, vec![i as u8; 4096]))
        .collect();
    wait_all(writes).unwrap();

    let reads: Vec<_> = (0..64u64).map(|i| io.read(&file, i * 4096, 4096)).collect();
    for (i, data) in wait_all(reads).unwrap().into_iter().enumerate() {
        assert_eq!(data.unwrap(), vec![i as u8; 4096]);
    }
}

/// The allocation invariant (P11): free regions are disjoint and sorted,
/// and allocated plus free bytes equal the grown file size.
#[test]
fn test_allocator_accounting() {
    let alloc = DiskAllocator::new(0, 1 << 20, true);
    let mut rng_state = 0x243F6A88u64;
    let mut live: Vec<Bid> = Vec::new();
    let mut allocated = 0u64;

    for _ in 0..500 {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        if rng_state % 3 != 0 || live.is_empty() {
            let size = 4096 << (rng_state % 4);
            let mut bids = [Bid::new(0, size as usize)];
            alloc.new_blocks(&mut bids).unwrap();
            allocated += size;
            live.push(bids[0]);
        } else {
            let bid = live.swap_remove((rng_state % live.len() as u64) as usize);
            alloc.delete_block(&bid).unwrap();
            allocated -= bid.size as u64;
        }

        assert_eq!(alloc.free_bytes() + allocated, alloc.disk_bytes());
        let regions = alloc.free_regions();
        for pair in regions.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping free regions");
        }
    }
}
