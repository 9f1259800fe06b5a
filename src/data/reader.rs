/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{Block, ByteBlock, Item, ItemReader};
use anyhow::{bail, ensure, Result};
use std::sync::Arc;

/// A source of [`Block`]s for a [`BlockReader`]: a file, a queue, or a
/// concatenation of sources. `next_block` returns `None` once the source is
/// exhausted and closed; queue-backed sources block until a block or the
/// close sentinel arrives.
pub trait BlockSource {
    fn next_block(&mut self) -> Option<Block>;
}

/// A boxed [`BlockSource`], used where sources of different kinds must be
/// mixed (e.g. concatenating queue and file sources).
pub struct DynBlockSource(Box<dyn BlockSource + Send>);

impl DynBlockSource {
    pub fn new(source: impl BlockSource + Send + 'static) -> Self {
        DynBlockSource(Box::new(source))
    }
}

impl BlockSource for DynBlockSource {
    #[inline]
    fn next_block(&mut self) -> Option<Block> {
        self.0.next_block()
    }
}

/// Concatenates a vector of sources in order: all blocks of the first
/// source, then all blocks of the second, and so on.
pub struct CatBlockSource<S: BlockSource> {
    sources: Vec<S>,
    current: usize,
}

impl<S: BlockSource> CatBlockSource<S> {
    pub fn new(sources: Vec<S>) -> Self {
        CatBlockSource {
            sources,
            current: 0,
        }
    }
}

impl<S: BlockSource> BlockSource for CatBlockSource<S> {
    fn next_block(&mut self) -> Option<Block> {
        while self.current < self.sources.len() {
            if let Some(block) = self.sources[self.current].next_block() {
                return Some(block);
            }
            self.current += 1;
        }
        None
    }
}

/// Reads items back from a sequence of blocks delivered by a
/// [`BlockSource`], reassembling items that straddle block boundaries.
pub struct BlockReader<S: BlockSource> {
    source: S,
    bytes: Option<Arc<ByteBlock>>,
    cur: usize,
    end: usize,
    first_item: usize,
    num_items: usize,
    /// While set, blocks fetched from the source are also collected here;
    /// used by [`get_item_batch`](BlockReader::get_item_batch).
    collect: Option<Vec<Block>>,
}

impl<S: BlockSource> BlockReader<S> {
    pub fn new(source: S) -> Self {
        BlockReader {
            source,
            bytes: None,
            cur: 0,
            end: 0,
            first_item: 0,
            num_items: 0,
            collect: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns true if at least one more item is available, advancing to the
    /// next block (and possibly blocking on the source) as needed.
    pub fn has_next(&mut self) -> bool {
        while self.cur == self.end {
            if !self.fetch_next_block() {
                return false;
            }
        }
        true
    }

    /// Deserializes one complete item, fetching additional blocks as needed
    /// to cover an item straddling block boundaries. Reading past the end of
    /// a closed source is a fatal underflow.
    pub fn next<T: Item>(&mut self) -> Result<T> {
        ensure!(self.has_next(), "data underflow in BlockReader");
        debug_assert!(self.num_items > 0);
        self.num_items -= 1;
        #[cfg(feature = "self_verify")]
        {
            let fingerprint = u64::read_from(self)?;
            ensure!(
                fingerprint == super::type_fingerprint::<T>(),
                "type fingerprint mismatch in BlockReader"
            );
        }
        T::read_from(self)
    }

    /// Drains the rest of the source into a vector. Only use this when the
    /// content is known to fit in memory, i.e. mostly in tests.
    pub fn read_complete<T: Item>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next::<T>()?);
        }
        Ok(out)
    }

    /// Returns exactly the blocks covering the next `n` items, advancing the
    /// reader without deserializing anything. The first and last blocks are
    /// clipped to item-aligned byte ranges; middle blocks are shared with
    /// the source by reference. This is the fast path for shuffles.
    pub fn get_item_batch<T: Item>(&mut self, mut n: usize) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        if n == 0 {
            return Ok(out);
        }
        ensure!(self.has_next(), "data underflow in BlockReader");
        debug_assert!(self.bytes.is_some());

        let mut begin_output = self.cur;
        let mut first_output = self.cur;

        // Inside this branch the cursor may not point at an item boundary.
        if n >= self.num_items {
            // The current block still holds items: push it partially,
            // clipped to exclude the already-consumed prefix.
            out.push(Block::new(
                self.bytes.clone().unwrap(),
                self.cur,
                self.end,
                self.cur,
                self.num_items,
            ));
            n -= self.num_items;
            if !self.fetch_next_block() {
                ensure!(n == 0, "data underflow in BlockReader");
                return Ok(out);
            }

            // Append complete blocks without touching their content.
            while n >= self.num_items {
                out.push(Block::new(
                    self.bytes.clone().unwrap(),
                    self.cur,
                    self.end,
                    self.first_item,
                    self.num_items,
                ));
                n -= self.num_items;
                if !self.fetch_next_block() {
                    ensure!(n == 0, "data underflow in BlockReader");
                    return Ok(out);
                }
            }

            // The last block must include the partial item at its front, but
            // the cursor continues from the first whole item.
            begin_output = self.cur;
            first_output = self.first_item;
            self.cur = self.first_item;
        }

        out.push(Block::new(
            self.bytes.clone().unwrap(),
            begin_output,
            self.end,
            first_output,
            n,
        ));

        // Skip over the remaining n items; blocks fetched along the way (an
        // item may span several) are collected into the output.
        self.collect = Some(out);
        let result = self.skip_items::<T>(n);
        let mut out = self.collect.take().unwrap();
        result?;
        out.last_mut().unwrap().set_end(self.cur);
        Ok(out)
    }

    /// Advances the cursor over `items` items and `bytes` bytes without
    /// reading them.
    pub fn skip(&mut self, items: usize, mut bytes: usize) -> Result<()> {
        let mut item_discount = items as isize;
        while self.cur + bytes > self.end {
            bytes -= self.end - self.cur;
            // deduct the items of the block we skip entirely
            item_discount -= self.num_items as isize;
            if !self.fetch_next_block() {
                bail!("data underflow in BlockReader");
            }
        }
        self.cur += bytes;
        debug_assert!(self.num_items as isize >= item_discount);
        self.num_items = (self.num_items as isize - item_discount) as usize;
        Ok(())
    }

    fn skip_items<T: Item>(&mut self, n: usize) -> Result<()> {
        if let Some(fixed_size) = T::FIXED_SIZE {
            let per_item = fixed_size + if cfg!(feature = "self_verify") { 8 } else { 0 };
            self.skip(n, n * per_item)
        } else {
            for _ in 0..n {
                self.next::<T>()?;
            }
            Ok(())
        }
    }

    /// Fetches the next block from the source, collecting it if a batch
    /// extraction is in progress. Returns false once the source is done.
    fn fetch_next_block(&mut self) -> bool {
        match self.source.next_block() {
            None => false,
            Some(block) => {
                if let Some(collect) = &mut self.collect {
                    collect.push(block.clone());
                }
                self.cur = block.begin();
                self.end = block.end();
                self.first_item = block.first_item();
                self.num_items = block.num_items();
                self.bytes = Some(block.byte_block().clone());
                true
            }
        }
    }
}

impl<S: BlockSource> ItemReader for BlockReader<S> {
    fn read_slice(&mut self, out: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while self.cur + (out.len() - off) > self.end {
            let part = self.end - self.cur;
            if part > 0 {
                let bytes = self.bytes.as_ref().unwrap();
                out[off..off + part].copy_from_slice(&bytes[self.cur..self.end]);
                off += part;
                self.cur = self.end;
            }
            if !self.fetch_next_block() {
                bail!("data underflow in BlockReader");
            }
        }
        let rest = out.len() - off;
        if rest > 0 {
            let bytes = self.bytes.as_ref().unwrap();
            out[off..].copy_from_slice(&bytes[self.cur..self.cur + rest]);
            self.cur += rest;
        }
        Ok(())
    }

    fn get_byte(&mut self) -> Result<u8> {
        // blocks can be empty, so loop
        while self.cur == self.end {
            if !self.fetch_next_block() {
                bail!("data underflow in BlockReader");
            }
        }
        let b = self.bytes.as_ref().unwrap()[self.cur];
        self.cur += 1;
        Ok(b)
    }
}
