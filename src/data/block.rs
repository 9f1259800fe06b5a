/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::BlockPool;
use crate::mem::AlignedBuf;
use std::sync::Arc;

/// A byte buffer owned by a [`BlockPool`], which accounts its size against
/// the pool quota until the last reference is dropped.
///
/// A byte block is mutable only while held as a [`PinnedByteBlock`] by the
/// single writer building it; [`PinnedByteBlock::freeze`] turns it into an
/// immutable, shareable `Arc<ByteBlock>`. Its lifetime is that of the
/// longest-lived [`Block`] referencing it.
pub struct ByteBlock {
    data: AlignedBuf,
    pool: Arc<BlockPool>,
}

impl ByteBlock {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }
}

impl std::ops::Deref for ByteBlock {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl AsRef<[u8]> for ByteBlock {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl Drop for ByteBlock {
    fn drop(&mut self) {
        self.pool.release(self.data.len());
    }
}

impl core::fmt::Debug for ByteBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ByteBlock")
            .field("len", &self.len())
            .finish()
    }
}

/// A byte block under construction, exclusively owned by one writer.
pub struct PinnedByteBlock {
    inner: ByteBlock,
}

impl PinnedByteBlock {
    pub(crate) fn new(data: AlignedBuf, pool: Arc<BlockPool>) -> Self {
        PinnedByteBlock {
            inner: ByteBlock { data, pool },
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.inner.data.as_mut_slice()
    }

    /// Seals the block; no further mutation is possible.
    pub fn freeze(self) -> Arc<ByteBlock> {
        Arc::new(self.inner)
    }
}

/// A value type referencing a byte range of a [`ByteBlock`], together with
/// the item metadata required to cut and reassemble item sequences:
/// `first_item` is the offset of the first item whose serialization *begins*
/// in `[begin, end)`, and `num_items` counts the items beginning there. An
/// item may straddle into subsequent blocks; the trailing fragment is counted
/// in its block of origin.
///
/// Invariant: `begin <= first_item <= end <= byte_block.len()`; when no item
/// begins in the range, `num_items == 0` and `first_item == end`.
#[derive(Clone)]
pub struct Block {
    bytes: Arc<ByteBlock>,
    begin: usize,
    end: usize,
    first_item: usize,
    num_items: usize,
}

impl Block {
    pub fn new(
        bytes: Arc<ByteBlock>,
        begin: usize,
        end: usize,
        first_item: usize,
        num_items: usize,
    ) -> Self {
        debug_assert!(begin <= first_item);
        debug_assert!(first_item <= end);
        debug_assert!(end <= bytes.len());
        debug_assert!(num_items == 0 || first_item < end);
        Block {
            bytes,
            begin,
            end,
            first_item,
            num_items,
        }
    }

    #[inline(always)]
    pub fn byte_block(&self) -> &Arc<ByteBlock> {
        &self.bytes
    }

    /// Valid byte range of this block.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.begin..self.end]
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    #[inline(always)]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Offset of the first item beginning in this block, absolute within the
    /// byte block.
    #[inline(always)]
    pub fn first_item(&self) -> usize {
        self.first_item
    }

    /// Offset of the first item relative to `begin`.
    #[inline(always)]
    pub fn first_item_relative(&self) -> usize {
        self.first_item - self.begin
    }

    #[inline(always)]
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Moves the start of the valid range forward, e.g. to clip off a leading
    /// item continuation when seeking.
    pub fn set_begin(&mut self, begin: usize) {
        debug_assert!(begin <= self.first_item);
        self.begin = begin;
    }

    /// Moves the end of the valid range backward, e.g. to clip the last block
    /// of an item batch to an item boundary.
    pub fn set_end(&mut self, end: usize) {
        debug_assert!(end <= self.bytes.len());
        self.end = end;
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("first_item", &self.first_item)
            .field("num_items", &self.num_items)
            .finish()
    }
}
