/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    BlockPool, BlockQueue, BlockReader, BlockWriter, CatBlockSource, DynBlockSource, File, Item,
    Multiplexer, StreamId, StreamSink, TYPE_CAT,
};
use anyhow::Result;
use std::sync::Arc;

/// The per-worker inbound state of a [`CatStream`]: one queue per global
/// sender rank. Created lazily by the [`Multiplexer`] when the first remote
/// block arrives, or when the stream is opened locally, whichever happens
/// first.
pub struct CatStreamData {
    pub(crate) id: StreamId,
    pub(crate) local_worker: usize,
    pub(crate) queues: Vec<Arc<BlockQueue>>,
}

impl CatStreamData {
    pub(crate) fn new(
        pool: Arc<BlockPool>,
        id: StreamId,
        local_worker: usize,
        num_workers: usize,
    ) -> Self {
        CatStreamData {
            id,
            local_worker,
            queues: (0..num_workers).map(|_| BlockQueue::new(pool.clone())).collect(),
        }
    }
}

/// An all-to-all communication context whose readers deliver the inbound
/// per-sender sequences *concatenated in global worker-rank order*.
///
/// Every worker of the job must create the stream (ids are allocated in
/// lockstep), open and close its `W` writers, and eventually [`close`]
/// (CatStream::close) the stream. Same-host destinations are served by a
/// loopback fast path that appends blocks directly into the destination
/// queue, with no framing and no copy.
pub struct CatStream {
    mux: Arc<Multiplexer>,
    data: Arc<CatStreamData>,
}

impl CatStream {
    pub(crate) fn new(mux: Arc<Multiplexer>, local_worker: usize) -> Self {
        let id = mux.allocate_cat_id(local_worker);
        let data = mux.get_or_create_cat(id, local_worker);
        CatStream { mux, data }
    }

    pub fn id(&self) -> StreamId {
        self.data.id
    }

    pub fn num_workers(&self) -> usize {
        self.mux.num_workers()
    }

    /// Global rank of the worker owning this stream instance.
    fn my_global_rank(&self) -> usize {
        self.mux.my_host_rank() * self.mux.workers_per_host() + self.data.local_worker
    }

    /// Creates exactly one writer per destination worker. Writers may only
    /// be opened once per stream, and each must be closed (directly or by
    /// drop) to deliver the end-of-stream sentinel to its destination.
    pub fn open_writers(&self) -> Vec<BlockWriter<StreamSink>> {
        let workers_per_host = self.mux.workers_per_host();
        let my_global = self.my_global_rank();
        let pool = self.mux.pool().clone();
        (0..self.num_workers())
            .map(|dest| {
                let host = dest / workers_per_host;
                let local_worker = dest % workers_per_host;
                let sink = if host == self.mux.my_host_rank() {
                    let target = self.mux.get_or_create_cat(self.data.id, local_worker);
                    StreamSink::cat_loopback(pool.clone(), target.queues[my_global].clone())
                } else {
                    StreamSink::net(
                        pool.clone(),
                        self.mux.clone(),
                        host,
                        self.data.id,
                        self.data.local_worker as u32,
                        local_worker as u32,
                        TYPE_CAT,
                    )
                };
                BlockWriter::with_default_block_size(sink)
            })
            .collect()
    }

    /// One consuming reader per sender, in global rank order.
    pub fn open_readers(&self) -> Vec<BlockReader<DynBlockSource>> {
        self.data
            .queues
            .iter()
            .map(|queue| queue.get_reader(true))
            .collect()
    }

    /// A single reader concatenating the inbound queues in global worker
    /// rank order.
    pub fn open_cat_reader(&self, consume: bool) -> BlockReader<CatBlockSource<DynBlockSource>> {
        let sources = self
            .data
            .queues
            .iter()
            .map(|queue| queue.block_source(consume))
            .collect();
        BlockReader::new(CatBlockSource::new(sources))
    }

    /// Sends items `[offsets[k], offsets[k + 1])` of `file` to worker `k`.
    ///
    /// `offsets` must hold `num_workers() + 1` non-decreasing item indices.
    /// Only the boundary blocks of each range are cut; middle blocks are
    /// shipped by reference, without copy or deserialization.
    pub fn scatter<T: Item>(&self, file: &File, offsets: &[usize]) -> Result<()> {
        assert_eq!(offsets.len(), self.num_workers() + 1);
        let mut writers = self.open_writers();
        let mut reader = None;
        for (k, writer) in writers.iter_mut().enumerate() {
            let (begin, end) = (offsets[k], offsets[k + 1]);
            debug_assert!(begin <= end);
            if begin < end {
                if reader.is_none() {
                    reader = Some(file.get_reader_at::<T>(begin)?);
                }
                let reader = reader.as_mut().unwrap();
                writer.append_blocks(reader.get_item_batch::<T>(end - begin)?)?;
            }
            writer.close()?;
        }
        Ok(())
    }

    /// Waits until every sender (including this worker's own loopback) has
    /// delivered its end-of-stream sentinel, then drops the stream from the
    /// demultiplexing map. The data itself stays readable through readers
    /// opened before or after this call.
    pub fn close(&self) {
        let my_queue = &self.data.queues[self.my_global_rank()];
        if !my_queue.write_closed() {
            // writers were never opened; release our own readers
            my_queue.close();
        }
        for queue in &self.data.queues {
            queue.wait_write_closed();
        }
        self.mux.unregister_cat(self.data.id, self.data.local_worker);
    }
}
