/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    Block, BlockPool, BlockQueue, BlockReader, CatBlockSource, DynBlockSource, Item,
};
use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

/// Sentinel source id returned by [`MixBlockQueue::pop`] once all sources
/// have closed.
const NO_SOURCE: usize = usize::MAX;

struct MixState {
    /// Sources that have not yet sent their close sentinel.
    write_open: usize,
    /// Close sentinels not yet popped by the reader.
    read_open: usize,
    write_closed: Vec<bool>,
}

/// An N-producer / 1-consumer queue of `(source, block)` pairs, the inbound
/// side of a [`MixStream`](super::MixStream).
///
/// Blocks are stored in one main FIFO in reception order. When the consumer
/// pops a pair it also appends the block to the source's caching sub-queue,
/// so that per-source readers can be constructed over the same data, and so
/// that the whole content can be re-read after close (in per-source order,
/// not arrival order).
pub struct MixBlockQueue {
    pool: Arc<BlockPool>,
    tx: Sender<(usize, Option<Block>)>,
    rx: Receiver<(usize, Option<Block>)>,
    queues: Vec<Arc<BlockQueue>>,
    state: Mutex<MixState>,
    closed: Condvar,
}

impl MixBlockQueue {
    pub fn new(pool: Arc<BlockPool>, num_workers: usize) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Arc::new(MixBlockQueue {
            queues: (0..num_workers).map(|_| BlockQueue::new(pool.clone())).collect(),
            pool,
            tx,
            rx,
            state: Mutex::new(MixState {
                write_open: num_workers,
                read_open: num_workers,
                write_closed: vec![false; num_workers],
            }),
            closed: Condvar::new(),
        })
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    /// Appends a block delivered (via network or loopback) from `src`.
    pub fn append_block(&self, src: usize, block: Block) {
        log::trace!("MixBlockQueue::append_block src={} {:?}", src, block);
        self.tx.send((src, Some(block))).unwrap();
    }

    /// Appends the closing sentinel from `src`.
    pub fn close(&self, src: usize) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.write_closed[src], "double close from source {}", src);
        state.write_closed[src] = true;
        state.write_open -= 1;
        drop(state);
        self.closed.notify_all();
        self.tx.send((src, None)).unwrap();
    }

    /// Whether `src` has delivered its close sentinel.
    pub fn write_closed_from(&self, src: usize) -> bool {
        self.state.lock().unwrap().write_closed[src]
    }

    /// Blocks until every source has delivered its close sentinel.
    pub fn wait_write_closed(&self) {
        let mut state = self.state.lock().unwrap();
        while state.write_open > 0 {
            state = self.closed.wait(state).unwrap();
        }
    }

    /// Blocking retrieval of a `(source, block)` pair; `(NO_SOURCE, None)`
    /// once every source has closed and been drained.
    fn pop(&self) -> (usize, Option<Block>) {
        {
            let state = self.state.lock().unwrap();
            if state.read_open == 0 {
                return (NO_SOURCE, None);
            }
        }
        let (src, block) = self.rx.recv().unwrap();
        if block.is_none() {
            self.state.lock().unwrap().read_open -= 1;
        }
        (src, block)
    }

    /// All sources have delivered their close sentinel.
    pub fn write_closed(&self) -> bool {
        self.state.lock().unwrap().write_open == 0
    }

    /// The reader has popped every close sentinel.
    pub fn read_closed(&self) -> bool {
        self.state.lock().unwrap().read_open == 0
    }
}

impl core::fmt::Debug for MixBlockQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MixBlockQueue")
            .field("num_workers", &self.queues.len())
            .field("write_open", &state.write_open)
            .field("read_open", &state.read_open)
            .finish()
    }
}

/// Reads items in arrival order from a [`MixBlockQueue`].
///
/// The reader keeps one sub-reader per source, attached to the source's
/// sub-queue, and tracks how many *whole* items each source has available:
/// one less than the number of items known to start in the received blocks,
/// since the last item may span a block that has not arrived yet. Items are
/// only served from sources with a whole item available, so no item-granular
/// synchronization with the producers is ever needed.
///
/// After the queue has been fully drained once, further readers replay the
/// cached sub-queues concatenated in source order; arrival order is not
/// preserved across re-reads, per-source order is.
pub struct MixBlockQueueReader {
    queue: Arc<MixBlockQueue>,
    /// Sub-readers for each source, in live (first-pass) mode.
    readers: Vec<BlockReader<DynBlockSource>>,
    selected: usize,
    /// Whole items ready on the selected source.
    available: usize,
    /// Further whole items known per source (excluding `available`).
    available_at: Vec<usize>,
    /// Sources that have not closed yet.
    open: usize,
    /// Replay mode: a cat-reader over the cached sub-queues.
    cat: Option<BlockReader<CatBlockSource<DynBlockSource>>>,
}

impl MixBlockQueueReader {
    pub fn new(queue: Arc<MixBlockQueue>, consume: bool) -> Self {
        let num_workers = queue.num_workers();
        if queue.read_closed() {
            // rereading: concatenate the cached sub-queues in source order
            let sources = queue
                .queues
                .iter()
                .map(|q| q.block_source(consume))
                .collect();
            MixBlockQueueReader {
                queue,
                readers: Vec::new(),
                selected: NO_SOURCE,
                available: 0,
                available_at: Vec::new(),
                open: 0,
                cat: Some(BlockReader::new(CatBlockSource::new(sources))),
            }
        } else {
            let readers = queue
                .queues
                .iter()
                .map(|q| q.get_reader(consume))
                .collect();
            MixBlockQueueReader {
                queue,
                readers,
                selected: NO_SOURCE,
                available: 0,
                available_at: vec![0; num_workers],
                open: num_workers,
                cat: None,
            }
        }
    }

    /// Returns true if at least one more whole item is available.
    pub fn has_next(&mut self) -> bool {
        if let Some(cat) = &mut self.cat {
            return cat.has_next();
        }
        if self.available > 0 {
            return true;
        }
        if self.open == 0 {
            return false;
        }
        self.pull_block()
    }

    pub fn next<T: Item>(&mut self) -> Result<T> {
        if let Some(cat) = &mut self.cat {
            return cat.next::<T>();
        }
        if self.available == 0 && !self.pull_block() {
            bail!("data underflow in MixBlockQueueReader");
        }
        debug_assert!(self.available > 0);
        debug_assert!(self.selected < self.readers.len());
        self.available -= 1;
        self.readers[self.selected].next::<T>()
    }

    pub fn read_complete<T: Item>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next::<T>()?);
        }
        Ok(out)
    }

    /// Pulls pairs from the main queue until a whole item is available on
    /// some source, forwarding each block to its source's sub-queue.
    fn pull_block(&mut self) -> bool {
        while self.available == 0 {
            let (src, block) = self.queue.pop();
            if src == NO_SOURCE {
                return false;
            }
            match block {
                Some(block) => {
                    let num_items = block.num_items();
                    self.queue.queues[src].append_block(block);
                    self.available_at[src] += num_items;
                    // hold back one item: it may continue in a later block
                    if self.available_at[src] > 1 {
                        self.selected = src;
                        self.available = self.available_at[src] - 1;
                        self.available_at[src] -= self.available;
                    }
                }
                None => {
                    debug_assert!(self.open > 0);
                    self.open -= 1;
                    self.queue.queues[src].close();
                    // the reserved last item is now known to be whole
                    if self.available_at[src] > 0 {
                        debug_assert_eq!(self.available_at[src], 1);
                        self.selected = src;
                        self.available = 1;
                        self.available_at[src] = 0;
                    } else if self.open == 0 {
                        return false;
                    }
                }
            }
        }
        true
    }
}
