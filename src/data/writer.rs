/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{Block, BlockPool, Item, ItemWriter, PinnedByteBlock};
use anyhow::Result;
use std::sync::Arc;

/// A destination of finished [`Block`]s: a [`File`](super::File), a
/// [`BlockQueue`](super::BlockQueue), or a stream sink.
pub trait BlockSink {
    fn append_block(&mut self, block: Block) -> Result<()>;

    /// Delivers the end-of-sequence signal appropriate for this sink.
    fn close_sink(&mut self) -> Result<()>;

    /// Whether block allocation on behalf of this sink may fail so that the
    /// writer can apply backpressure (true for network sinks). When it does,
    /// the writer waits for pool quota and retries rather than failing the
    /// `put`.
    fn allocate_can_fail(&self) -> bool {
        false
    }

    fn pool(&self) -> &Arc<BlockPool>;
}

/// A typed cursor appending items to a sequence of blocks delivered to a
/// [`BlockSink`].
///
/// The writer records, per block, the offset of the first item beginning in
/// it and the number of items beginning in it; an item that does not fit the
/// current block spans any number of subsequent blocks. [`close`]
/// (BlockWriter::close) must be called before the writer is dropped in the
/// success path; dropping an unclosed writer closes it, swallowing errors.
pub struct BlockWriter<S: BlockSink> {
    sink: Option<S>,
    pool: Arc<BlockPool>,
    block_size: usize,
    current: Option<PinnedByteBlock>,
    pos: usize,
    first_item: Option<usize>,
    num_items: usize,
    closed: bool,
}

impl<S: BlockSink> BlockWriter<S> {
    pub fn new(sink: S, block_size: usize) -> Self {
        let pool = sink.pool().clone();
        BlockWriter {
            sink: Some(sink),
            pool,
            block_size,
            current: None,
            pos: 0,
            first_item: None,
            num_items: 0,
            closed: false,
        }
    }

    /// Creates a writer with the pool's default block size.
    pub fn with_default_block_size(sink: S) -> Self {
        let block_size = sink.pool().default_block_size();
        Self::new(sink, block_size)
    }

    pub fn sink(&self) -> &S {
        self.sink.as_ref().unwrap()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.sink.as_mut().unwrap()
    }

    /// Serializes one item, marking its beginning in the current block.
    pub fn put<T: Item>(&mut self, item: &T) -> Result<()> {
        debug_assert!(!self.closed);
        self.mark_item()?;
        #[cfg(feature = "self_verify")]
        {
            let fingerprint = super::type_fingerprint::<T>();
            fingerprint.write_to(self)?;
        }
        item.write_to(self)
    }

    /// Appends raw bytes without item bookkeeping; reserved for framing.
    pub fn put_raw(&mut self, data: &[u8]) -> Result<()> {
        self.put_slice(data)
    }

    /// Forces the current (possibly partial) block to the sink without
    /// closing the writer.
    pub fn flush(&mut self) -> Result<()> {
        self.finish_block()
    }

    /// Passes pre-cut blocks through to the sink unmodified, after flushing
    /// any partially written block. This is the zero-copy path used by
    /// [`scatter`](super::CatStream::scatter).
    pub fn append_blocks(&mut self, blocks: Vec<Block>) -> Result<()> {
        self.flush()?;
        let sink = self.sink.as_mut().unwrap();
        for block in blocks {
            if block.size() > 0 {
                sink.append_block(block)?;
            }
        }
        Ok(())
    }

    /// Flushes the current block and delivers the end-of-sequence signal to
    /// the sink. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.finish_block()?;
        self.closed = true;
        self.sink.as_mut().unwrap().close_sink()
    }

    /// Closes the writer and returns the sink (e.g. to recover a spill
    /// [`File`](super::File)).
    pub fn into_sink(mut self) -> Result<S> {
        self.close()?;
        Ok(self.sink.take().unwrap())
    }

    /// Number of items written into the current block so far.
    pub fn block_items(&self) -> usize {
        self.num_items
    }

    /// Makes sure a block with at least one free byte exists and records the
    /// start of a new item in it.
    fn mark_item(&mut self) -> Result<()> {
        if self.current.is_none() || self.pos == self.current.as_ref().unwrap().len() {
            self.next_block()?;
        }
        if self.first_item.is_none() {
            self.first_item = Some(self.pos);
        }
        self.num_items += 1;
        Ok(())
    }

    /// Seals the current block, if nonempty, and hands it to the sink.
    fn finish_block(&mut self) -> Result<()> {
        if self.pos == 0 {
            // nothing written; return an unused allocation to the pool
            self.current = None;
            return Ok(());
        }
        let pinned = self.current.take().unwrap();
        let block = Block::new(
            pinned.freeze(),
            0,
            self.pos,
            self.first_item.unwrap_or(self.pos),
            self.num_items,
        );
        self.pos = 0;
        self.first_item = None;
        self.num_items = 0;
        self.sink.as_mut().unwrap().append_block(block)
    }

    /// Flushes the full current block and allocates the next one, waiting
    /// for pool quota if necessary.
    fn next_block(&mut self) -> Result<()> {
        self.finish_block()?;
        let can_fail = self.sink.as_ref().unwrap().allocate_can_fail();
        loop {
            match self.pool.allocate_byte_block(self.block_size, can_fail) {
                Some(block) => {
                    self.current = Some(block);
                    return Ok(());
                }
                None => {
                    log::debug!("BlockWriter: backpressure, waiting for block pool quota");
                    self.pool.wait_for_quota(self.block_size);
                }
            }
        }
    }
}

impl<S: BlockSink> ItemWriter for BlockWriter<S> {
    fn put_slice(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.current.is_none() || self.pos == self.current.as_ref().unwrap().len() {
                self.next_block()?;
            }
            let block = self.current.as_mut().unwrap();
            let room = (block.len() - self.pos).min(data.len());
            block.as_mut_slice()[self.pos..self.pos + room].copy_from_slice(&data[..room]);
            self.pos += room;
            data = &data[room..];
        }
        Ok(())
    }
}

impl<S: BlockSink> Drop for BlockWriter<S> {
    fn drop(&mut self) {
        if self.sink.is_some() && !self.closed {
            if let Err(error) = self.close() {
                log::error!("BlockWriter: close failed in drop: {:?}", error);
            }
        }
    }
}
