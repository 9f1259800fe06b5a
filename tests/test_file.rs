/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use millrace::data::{BlockPool, BlockWriter, File};

/// Tiny blocks, so that every test exercises block boundaries.
const BLOCK_SIZE: usize = 53;

fn file_of<T: millrace::data::Item>(items: impl Iterator<Item = T>) -> File {
    let pool = BlockPool::new(1 << 30, BLOCK_SIZE);
    let mut writer = BlockWriter::new(File::new(pool), BLOCK_SIZE);
    for item in items {
        writer.put(&item).unwrap();
    }
    writer.into_sink().unwrap()
}

#[test]
fn test_round_trip_fixed_size() {
    let file = file_of((0..10_000u64).map(|i| i.wrapping_mul(0x9E3779B97F4A7C15)));
    assert_eq!(file.num_items(), 10_000);
    let items = file.get_keep_reader().read_complete::<u64>().unwrap();
    assert_eq!(items.len(), 10_000);
    for (i, item) in items.into_iter().enumerate() {
        assert_eq!(item, (i as u64).wrapping_mul(0x9E3779B97F4A7C15));
    }
}

#[test]
fn test_round_trip_variable_size() {
    let strings: Vec<String> = (0..1000)
        .map(|i| "x".repeat(i % 97) + &i.to_string())
        .collect();
    let file = file_of(strings.iter().cloned());
    assert_eq!(file.num_items(), 1000);
    // keep-readers may read multiple times
    for _ in 0..2 {
        let back = file.get_keep_reader().read_complete::<String>().unwrap();
        assert_eq!(back, strings);
    }
}

#[test]
fn test_items_larger_than_a_block() {
    // each item spans several 53-byte blocks
    let strings: Vec<String> = (0..50)
        .map(|i| format!("{:0>1$}", i, 10 + i * 37))
        .collect();
    let file = file_of(strings.iter().cloned());
    let back = file.get_keep_reader().read_complete::<String>().unwrap();
    assert_eq!(back, strings);
}

#[test]
fn test_consume_reader_returns_quota() {
    let pool = BlockPool::new(1 << 30, BLOCK_SIZE);
    let mut writer = BlockWriter::new(File::new(pool.clone()), BLOCK_SIZE);
    for i in 0..10_000u64 {
        writer.put(&i).unwrap();
    }
    let file = writer.into_sink().unwrap();
    let used_before = pool.used();
    assert!(used_before > 0);

    let mut reader = file.into_consume_reader();
    let mut count = 0u64;
    while reader.has_next() {
        assert_eq!(reader.next::<u64>().unwrap(), count);
        count += 1;
    }
    assert_eq!(count, 10_000);
    // every block was freed while reading (the reader still pins the last)
    drop(reader);
    assert_eq!(pool.used(), 0);
}

#[test]
fn test_get_reader_at() {
    let file = file_of((0..5000u32).map(|i| (i, i * 3)));
    for index in [0usize, 1, 17, 999, 4998, 4999] {
        let mut reader = file.get_reader_at::<(u32, u32)>(index).unwrap();
        assert_eq!(reader.next::<(u32, u32)>().unwrap(), (index as u32, index as u32 * 3));
    }
    assert!(file.get_reader_at::<(u32, u32)>(5000).is_err());
}

#[test]
fn test_get_reader_at_variable_size() {
    let strings: Vec<String> = (0..500).map(|i| "y".repeat(i % 31)).collect();
    let file = file_of(strings.iter().cloned());
    for index in [0usize, 30, 31, 255, 499] {
        let mut reader = file.get_reader_at::<String>(index).unwrap();
        assert_eq!(reader.next::<String>().unwrap(), strings[index]);
    }
}

#[test]
fn test_get_item_range_preserves_items() {
    let file = file_of(0..2000u64);
    for (begin, end) in [(0usize, 2000usize), (0, 1), (37, 1800), (1999, 2000), (500, 500)] {
        let blocks = file.get_item_range::<u64>(begin, end).unwrap();
        let total: usize = blocks.iter().map(|b| b.num_items()).sum();
        assert_eq!(total, end - begin, "range [{}, {})", begin, end);

        // reassemble the byte range into a file and read it back
        let mut piece = File::new(file.pool().clone());
        for block in blocks {
            piece.append_block(block);
        }
        let items = piece.get_keep_reader().read_complete::<u64>().unwrap();
        assert_eq!(items, (begin as u64..end as u64).collect::<Vec<_>>());
    }
}

#[test]
fn test_get_item_at_and_index_of() {
    let file = file_of((0..300u64).map(|i| i * 2));
    assert_eq!(file.get_item_at::<u64>(150).unwrap(), 300);
    // the file is sorted: index_of finds exact and next-greater positions
    assert_eq!(file.index_of::<u64, _>(&100, |a, b| a < b).unwrap(), 50);
    assert_eq!(file.index_of::<u64, _>(&101, |a, b| a < b).unwrap(), 51);
}

/// With self-verification, deserializing at the wrong type is a hard error
/// rather than garbage.
#[cfg(feature = "self_verify")]
#[test]
fn test_type_fingerprint_mismatch() {
    let file = file_of(0..10u32);
    let mut reader = file.get_keep_reader();
    assert!(reader.next::<u64>().is_err());
}

#[test]
fn test_prefix_sums_monotone() {
    let file = file_of((0..5000u16).map(|i| i % 251));
    let mut last = 0;
    for i in 0..file.num_blocks() {
        let items = file.items_start_in(i);
        last += items;
    }
    assert_eq!(last, file.num_items());
}
