/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{Block, BlockPool, BlockReader, BlockSink, BlockSource, BlockWriter, Item};
use anyhow::{ensure, Result};
use std::sync::Arc;

/// An ordered sequence of [`Block`]s backing a local materialized
/// collection.
///
/// Thanks to the block indirection a file can share blocks with other files
/// and queues by reference counting, and [`clone`](Clone::clone) is cheap.
/// An inclusive prefix sum over the per-block item counts allows seeking to
/// the block containing any item index in `O(log n)`, followed by an
/// in-block skip ([`get_reader_at`](File::get_reader_at)).
///
/// A file is append-only until [`close`](File::close); keep-readers borrow
/// it, while [`into_consume_reader`](File::into_consume_reader) takes the
/// file by value and frees each block as soon as it has been read.
#[derive(Clone)]
pub struct File {
    pool: Arc<BlockPool>,
    blocks: Vec<Block>,
    /// Inclusive prefix sum of the number of items of the blocks, hence
    /// `num_items_sum[i]` counts the items starting in blocks `0..=i`.
    num_items_sum: Vec<usize>,
    size: usize,
    closed: bool,
}

impl File {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        File {
            pool,
            blocks: Vec::new(),
            num_items_sum: Vec::new(),
            size: 0,
            closed: false,
        }
    }

    /// Creates a writer that appends to a fresh file owned by the writer;
    /// recover the file with [`BlockWriter::into_sink`].
    pub fn writer(pool: Arc<BlockPool>) -> BlockWriter<File> {
        BlockWriter::with_default_block_size(File::new(pool))
    }

    pub fn append_block(&mut self, block: Block) {
        assert!(!self.closed, "append to closed File");
        if block.size() == 0 {
            return;
        }
        self.size += block.size();
        self.num_items_sum.push(self.num_items() + block.num_items());
        self.blocks.push(block);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of items in this file.
    pub fn num_items(&self) -> usize {
        self.num_items_sum.last().copied().unwrap_or(0)
    }

    /// Number of bytes of user data in this file.
    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn block(&self, i: usize) -> &Block {
        &self.blocks[i]
    }

    /// Number of items starting in block `i`.
    pub fn items_start_in(&self, i: usize) -> usize {
        self.num_items_sum[i] - if i == 0 { 0 } else { self.num_items_sum[i - 1] }
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// A reader from the beginning of the file, sharing its blocks.
    pub fn get_keep_reader(&self) -> BlockReader<FileBlockSource<'_>> {
        BlockReader::new(FileBlockSource {
            file: self,
            current: 0,
            first_block: 0,
            clip_begin: None,
        })
    }

    /// A destructive reader: each block is dropped (and its memory returned
    /// to the pool) as soon as the reader moves past it.
    pub fn into_consume_reader(self) -> BlockReader<FileConsumeSource> {
        BlockReader::new(self.into_consume_source())
    }

    /// The block source behind [`into_consume_reader`](File::into_consume_reader).
    pub fn into_consume_source(self) -> FileConsumeSource {
        FileConsumeSource {
            blocks: self.blocks.into_iter(),
        }
    }

    /// A reader positioned on the item with the given index.
    pub fn get_reader_at<T: Item>(
        &self,
        index: usize,
    ) -> Result<BlockReader<FileBlockSource<'_>>> {
        // first block whose inclusive prefix sum reaches index
        let begin_block = self.num_items_sum.partition_point(|&s| s < index);
        ensure!(
            begin_block < self.blocks.len(),
            "seek beyond the end of File"
        );
        let items_before = if begin_block == 0 {
            0
        } else {
            self.num_items_sum[begin_block - 1]
        };
        debug_assert!(items_before <= index);

        // start at the first whole item of the located block, skipping a
        // possible leading continuation
        let mut reader = BlockReader::new(FileBlockSource {
            file: self,
            current: begin_block,
            first_block: begin_block,
            clip_begin: Some(self.blocks[begin_block].first_item()),
        });

        let skip_items = index - items_before;
        if let Some(fixed_size) = T::FIXED_SIZE {
            let per_item = fixed_size + if cfg!(feature = "self_verify") { 8 } else { 0 };
            reader.skip(skip_items, skip_items * per_item)?;
        } else {
            for _ in 0..skip_items {
                reader.next::<T>()?;
            }
        }
        Ok(reader)
    }

    /// Random access to a single item. Do not use this to read successive
    /// items; get a seeked reader instead.
    pub fn get_item_at<T: Item>(&self, index: usize) -> Result<T> {
        self.get_reader_at::<T>(index)?.next::<T>()
    }

    /// The blocks covering items `[begin, end)`, with clipped boundary
    /// blocks and shared middles.
    pub fn get_item_range<T: Item>(&self, begin: usize, end: usize) -> Result<Vec<Block>> {
        debug_assert!(begin <= end);
        if begin == end {
            return Ok(Vec::new());
        }
        self.get_reader_at::<T>(begin)?.get_item_batch::<T>(end - begin)
    }

    /// Index of the given item, or of the next greater one, in a file sorted
    /// according to `less`. Binary search over
    /// [`get_item_at`](File::get_item_at).
    pub fn index_of<T: Item, L: Fn(&T, &T) -> bool>(&self, item: &T, less: L) -> Result<usize> {
        let mut left = 0;
        let mut right = self.num_items();
        while left < right {
            let mid = (left + right) / 2;
            let cur = self.get_item_at::<T>(mid)?;
            if less(&cur, item) {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        Ok(left)
    }
}

impl BlockSink for File {
    fn append_block(&mut self, block: Block) -> Result<()> {
        File::append_block(self, block);
        Ok(())
    }

    fn close_sink(&mut self) -> Result<()> {
        self.close();
        Ok(())
    }

    fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("num_blocks", &self.num_blocks())
            .field("num_items", &self.num_items())
            .field("size", &self.size)
            .field("closed", &self.closed)
            .finish()
    }
}

/// A [`BlockSource`] over a borrowed [`File`], optionally clipping the first
/// delivered block to its first whole item (for seeked readers).
pub struct FileBlockSource<'a> {
    file: &'a File,
    current: usize,
    first_block: usize,
    clip_begin: Option<usize>,
}

impl BlockSource for FileBlockSource<'_> {
    fn next_block(&mut self) -> Option<Block> {
        if self.current >= self.file.num_blocks() {
            return None;
        }
        let mut block = self.file.block(self.current).clone();
        if self.current == self.first_block {
            if let Some(clip) = self.clip_begin {
                block.set_begin(clip);
            }
        }
        self.current += 1;
        Some(block)
    }
}

/// A [`BlockSource`] that owns the file's blocks and drops each one after
/// delivering it.
pub struct FileConsumeSource {
    blocks: std::vec::IntoIter<Block>,
}

impl BlockSource for FileConsumeSource {
    fn next_block(&mut self) -> Option<Block> {
        self.blocks.next()
    }
}
