/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    Block, BlockPool, BlockReader, BlockSink, BlockSource, DynBlockSource, File,
};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

struct QueueInner {
    /// FIFO of blocks; `None` is the close sentinel.
    fifo: VecDeque<Option<Block>>,
    /// Producer delivered the close sentinel.
    write_closed: bool,
    /// Consumer observed the close sentinel (the queue is drained).
    read_closed: bool,
    /// Mirror of the popped blocks for caching readers.
    cache: File,
    /// The whole content has been mirrored into `cache`.
    cache_complete: bool,
}

/// A thread-safe FIFO of blocks between one producer and one consumer, with
/// a close sentinel.
///
/// The queue is unbounded in block count; the producer is bounded by the
/// block pool quota instead. Two kinds of readers exist: a *consume* reader
/// destructively drains the queue, while a *caching* reader mirrors the
/// blocks into an embedded backing [`File`] during the first pass so that
/// subsequent readers can replay the same sequence.
pub struct BlockQueue {
    pool: Arc<BlockPool>,
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl BlockQueue {
    pub fn new(pool: Arc<BlockPool>) -> Arc<Self> {
        Arc::new(BlockQueue {
            pool: pool.clone(),
            inner: Mutex::new(QueueInner {
                fifo: VecDeque::new(),
                write_closed: false,
                read_closed: false,
                cache: File::new(pool),
                cache_complete: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    pub fn append_block(&self, block: Block) {
        debug_assert!(block.size() > 0);
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.write_closed, "append to closed BlockQueue");
        inner.fifo.push_back(Some(block));
        drop(inner);
        self.cond.notify_all();
    }

    /// Enqueues the close sentinel. Must be called exactly once.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(!inner.write_closed, "double close of BlockQueue");
        inner.write_closed = true;
        inner.fifo.push_back(None);
        drop(inner);
        self.cond.notify_all();
    }

    pub fn write_closed(&self) -> bool {
        self.inner.lock().unwrap().write_closed
    }

    /// Consumer observed the close sentinel.
    pub fn read_closed(&self) -> bool {
        self.inner.lock().unwrap().read_closed
    }

    /// Blocks until the producer has closed the queue.
    pub fn wait_write_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.write_closed {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Blocking pop; `None` signals that the queue is closed and drained.
    pub fn pop(&self) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.read_closed {
                return None;
            }
            if let Some(front) = inner.fifo.pop_front() {
                match front {
                    Some(block) => return Some(block),
                    None => {
                        inner.read_closed = true;
                        return None;
                    }
                }
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Pop for caching readers: serves position `pos` from the cache if
    /// already mirrored, otherwise pops the next live block and mirrors it.
    fn pop_or_cache(&self, pos: usize) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if pos < inner.cache.num_blocks() {
                return Some(inner.cache.block(pos).clone());
            }
            if inner.cache_complete {
                return None;
            }
            if inner.read_closed {
                // a consume reader drained the queue; nothing more to mirror
                return None;
            }
            if let Some(front) = inner.fifo.pop_front() {
                match front {
                    Some(block) => {
                        inner.cache.append_block(block.clone());
                        return Some(block);
                    }
                    None => {
                        inner.cache_complete = true;
                        inner.read_closed = true;
                        inner.cache.close();
                        return None;
                    }
                }
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// A block source over this queue: consuming or caching, replaying the
    /// cache when the queue was already drained by a caching reader.
    pub fn block_source(self: &Arc<Self>, consume: bool) -> DynBlockSource {
        if !consume {
            return DynBlockSource::new(CachingQueueSource {
                queue: self.clone(),
                pos: 0,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.cache_complete {
            // drained by a caching reader: consume the backing file
            let pool = self.pool.clone();
            let cache = std::mem::replace(&mut inner.cache, File::new(pool));
            DynBlockSource::new(cache.into_consume_source())
        } else {
            DynBlockSource::new(ConsumeQueueSource {
                queue: self.clone(),
            })
        }
    }

    pub fn get_reader(self: &Arc<Self>, consume: bool) -> BlockReader<DynBlockSource> {
        BlockReader::new(self.block_source(consume))
    }
}

impl core::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("BlockQueue")
            .field("len", &inner.fifo.len())
            .field("write_closed", &inner.write_closed)
            .field("read_closed", &inner.read_closed)
            .finish()
    }
}

/// Writers append into the queue through its [`Arc`].
impl BlockSink for Arc<BlockQueue> {
    fn append_block(&mut self, block: Block) -> Result<()> {
        BlockQueue::append_block(self, block);
        Ok(())
    }

    fn close_sink(&mut self) -> Result<()> {
        BlockQueue::close(self);
        Ok(())
    }

    fn pool(&self) -> &Arc<BlockPool> {
        BlockQueue::pool(self)
    }
}

/// Destructively drains a [`BlockQueue`].
pub struct ConsumeQueueSource {
    queue: Arc<BlockQueue>,
}

impl BlockSource for ConsumeQueueSource {
    fn next_block(&mut self) -> Option<Block> {
        self.queue.pop()
    }
}

/// Reads a [`BlockQueue`] while mirroring it into the queue's backing file,
/// or replays the mirror if it is already complete.
pub struct CachingQueueSource {
    queue: Arc<BlockQueue>,
    pos: usize,
}

impl BlockSource for CachingQueueSource {
    fn next_block(&mut self) -> Option<Block> {
        let block = self.queue.pop_or_cache(self.pos);
        if block.is_some() {
            self.pos += 1;
        }
        block
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data::{BlockWriter, DEFAULT_BLOCK_SIZE};

    fn pool() -> Arc<BlockPool> {
        BlockPool::new(64 * 1024 * 1024, DEFAULT_BLOCK_SIZE)
    }

    #[test]
    fn test_spsc() {
        let queue = BlockQueue::new(pool());
        let producer = queue.clone();
        let t = std::thread::spawn(move || {
            let mut writer = BlockWriter::new(producer, 64);
            for i in 0..1000u32 {
                writer.put(&i).unwrap();
            }
            writer.close().unwrap();
        });
        let mut reader = queue.get_reader(true);
        let items = reader.read_complete::<u32>().unwrap();
        t.join().unwrap();
        assert_eq!(items, (0..1000).collect::<Vec<_>>());
        assert!(queue.read_closed());
    }

    #[test]
    fn test_caching_replay() {
        let queue = BlockQueue::new(pool());
        {
            let mut writer = BlockWriter::new(queue.clone(), 64);
            for i in 0..100u64 {
                writer.put(&(i, i * i)).unwrap();
            }
            writer.close().unwrap();
        }
        let first = queue.get_reader(false).read_complete::<(u64, u64)>().unwrap();
        let second = queue.get_reader(false).read_complete::<(u64, u64)>().unwrap();
        assert_eq!(first, second);
        // a final consume pass drains the cache
        let third = queue.get_reader(true).read_complete::<(u64, u64)>().unwrap();
        assert_eq!(first, third);
    }
}
