/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    BlockPool, BlockWriter, MixBlockQueue, MixBlockQueueReader, Multiplexer, StreamId,
    StreamSink, TYPE_MIX,
};
use std::sync::Arc;

/// The per-worker inbound state of a [`MixStream`]: one
/// [`MixBlockQueue`] fed by all senders.
pub struct MixStreamData {
    pub(crate) id: StreamId,
    pub(crate) local_worker: usize,
    pub(crate) queue: Arc<MixBlockQueue>,
}

impl MixStreamData {
    pub(crate) fn new(
        pool: Arc<BlockPool>,
        id: StreamId,
        local_worker: usize,
        num_workers: usize,
    ) -> Self {
        MixStreamData {
            id,
            local_worker,
            queue: MixBlockQueue::new(pool, num_workers),
        }
    }
}

/// An all-to-all communication context whose reader delivers items in
/// *arrival order*: first-in-first-out per sender, arbitrary interleaving
/// across senders.
///
/// Re-reading after close replays the cached per-sender sequences
/// concatenated in sender order; two successive re-reads deliver identical
/// sequences, but not the original arrival interleaving.
pub struct MixStream {
    mux: Arc<Multiplexer>,
    data: Arc<MixStreamData>,
}

impl MixStream {
    pub(crate) fn new(mux: Arc<Multiplexer>, local_worker: usize) -> Self {
        let id = mux.allocate_mix_id(local_worker);
        let data = mux.get_or_create_mix(id, local_worker);
        MixStream { mux, data }
    }

    pub fn id(&self) -> StreamId {
        self.data.id
    }

    pub fn num_workers(&self) -> usize {
        self.mux.num_workers()
    }

    fn my_global_rank(&self) -> usize {
        self.mux.my_host_rank() * self.mux.workers_per_host() + self.data.local_worker
    }

    /// Creates exactly one writer per destination worker; see
    /// [`CatStream::open_writers`](super::CatStream::open_writers) for the
    /// contract.
    pub fn open_writers(&self) -> Vec<BlockWriter<StreamSink>> {
        let workers_per_host = self.mux.workers_per_host();
        let my_global = self.my_global_rank();
        let pool = self.mux.pool().clone();
        (0..self.num_workers())
            .map(|dest| {
                let host = dest / workers_per_host;
                let local_worker = dest % workers_per_host;
                let sink = if host == self.mux.my_host_rank() {
                    let target = self.mux.get_or_create_mix(self.data.id, local_worker);
                    StreamSink::mix_loopback(pool.clone(), target.queue.clone(), my_global)
                } else {
                    StreamSink::net(
                        pool.clone(),
                        self.mux.clone(),
                        host,
                        self.data.id,
                        self.data.local_worker as u32,
                        local_worker as u32,
                        TYPE_MIX,
                    )
                };
                BlockWriter::with_default_block_size(sink)
            })
            .collect()
    }

    /// The arrival-order reader over all senders.
    pub fn open_mix_reader(&self, consume: bool) -> MixBlockQueueReader {
        MixBlockQueueReader::new(self.data.queue.clone(), consume)
    }

    /// Waits until every sender has delivered its end-of-stream sentinel,
    /// then drops the stream from the demultiplexing map.
    pub fn close(&self) {
        let my_global = self.my_global_rank();
        if !self.data.queue.write_closed_from(my_global) {
            // writers were never opened; release our own readers
            self.data.queue.close(my_global);
        }
        self.data.queue.wait_write_closed();
        self.mux.unregister_mix(self.data.id, self.data.local_worker);
    }
}
