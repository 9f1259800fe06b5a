/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{
    Block, BlockPool, CatStreamData, FrameHeader, MixStreamData, StreamId, TYPE_CAT, TYPE_MIX,
};
use crate::mem;
use crate::net::{Buffer, Dispatcher, Group, WriteCallback};
use anyhow::{bail, ensure, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Sanity limit on frame payloads; anything above this is a protocol error.
const MAX_PAYLOAD: u32 = 1 << 30;

#[derive(Default)]
struct MuxMap {
    next_cat_id: Vec<StreamId>,
    next_mix_id: Vec<StreamId>,
    cat: HashMap<(StreamId, usize), Arc<CatStreamData>>,
    mix: HashMap<(StreamId, usize), Arc<MixStreamData>>,
}

/// The host-wide outbound/inbound hub of the stream layer.
///
/// Outbound, stream sinks frame blocks with a [`FrameHeader`] and enqueue
/// them on the [`Dispatcher`]; the payload is sent as a shared reference to
/// the byte block, without copying. Inbound, the multiplexer chains
/// asynchronous reads on every host connection: header, then payload into a
/// freshly allocated byte block, then delivery to the per-sender queue of
/// the destination stream, which is created lazily if the stream has not
/// been opened locally yet (arriving blocks simply buffer up in its queues).
///
/// Stream ids are allocated in lockstep: every worker allocates ids for its
/// local-worker slot in the same order, so equal ids on all workers denote
/// the same logical stream.
pub struct Multiplexer {
    pool: Arc<BlockPool>,
    dispatcher: Dispatcher,
    group: Option<Arc<dyn Group>>,
    workers_per_host: usize,
    my_host_rank: usize,
    num_hosts: usize,
    map: Mutex<MuxMap>,
}

impl Multiplexer {
    /// Creates the multiplexer of one host and starts its receive chains.
    /// `group` is the host-level data group; `None` for single-host jobs,
    /// where every stream transfer is a loopback.
    pub fn new(
        pool: Arc<BlockPool>,
        group: Option<Arc<dyn Group>>,
        workers_per_host: usize,
    ) -> Arc<Self> {
        let (num_hosts, my_host_rank) = match &group {
            Some(group) => (group.num_peers(), group.my_rank()),
            None => (1, 0),
        };
        let mux = Arc::new(Multiplexer {
            pool,
            dispatcher: Dispatcher::new(&format!("mux-{}", my_host_rank)),
            group,
            workers_per_host,
            my_host_rank,
            num_hosts,
            map: Mutex::new(MuxMap {
                next_cat_id: vec![0; workers_per_host],
                next_mix_id: vec![0; workers_per_host],
                ..Default::default()
            }),
        });
        for host in 0..mux.num_hosts {
            if host != mux.my_host_rank {
                mux.post_header_read(host);
            }
        }
        mux
    }

    #[inline(always)]
    pub fn num_hosts(&self) -> usize {
        self.num_hosts
    }

    #[inline(always)]
    pub fn my_host_rank(&self) -> usize {
        self.my_host_rank
    }

    #[inline(always)]
    pub fn workers_per_host(&self) -> usize {
        self.workers_per_host
    }

    #[inline(always)]
    pub fn num_workers(&self) -> usize {
        self.num_hosts * self.workers_per_host
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Tears down the dispatcher; every blocked receive chain fails.
    pub fn terminate(&self) {
        self.dispatcher.terminate();
    }

    pub(crate) fn allocate_cat_id(&self, local_worker: usize) -> StreamId {
        let mut map = self.map.lock().unwrap();
        let id = map.next_cat_id[local_worker];
        map.next_cat_id[local_worker] += 1;
        id
    }

    pub(crate) fn allocate_mix_id(&self, local_worker: usize) -> StreamId {
        let mut map = self.map.lock().unwrap();
        let id = map.next_mix_id[local_worker];
        map.next_mix_id[local_worker] += 1;
        id
    }

    pub(crate) fn get_or_create_cat(
        &self,
        id: StreamId,
        local_worker: usize,
    ) -> Arc<CatStreamData> {
        let mut map = self.map.lock().unwrap();
        let num_workers = self.num_workers();
        map.cat
            .entry((id, local_worker))
            .or_insert_with(|| {
                Arc::new(CatStreamData::new(
                    self.pool.clone(),
                    id,
                    local_worker,
                    num_workers,
                ))
            })
            .clone()
    }

    pub(crate) fn get_or_create_mix(
        &self,
        id: StreamId,
        local_worker: usize,
    ) -> Arc<MixStreamData> {
        let mut map = self.map.lock().unwrap();
        let num_workers = self.num_workers();
        map.mix
            .entry((id, local_worker))
            .or_insert_with(|| {
                Arc::new(MixStreamData::new(
                    self.pool.clone(),
                    id,
                    local_worker,
                    num_workers,
                ))
            })
            .clone()
    }

    /// Removes a fully closed stream from the demultiplexing map.
    pub(crate) fn unregister_cat(&self, id: StreamId, local_worker: usize) {
        self.map.lock().unwrap().cat.remove(&(id, local_worker));
    }

    pub(crate) fn unregister_mix(&self, id: StreamId, local_worker: usize) {
        self.map.lock().unwrap().mix.remove(&(id, local_worker));
    }

    /// Frames `block` (or the end-of-stream sentinel, for `None`) and
    /// enqueues it towards `dest_host`. Header and payload are enqueued as
    /// one unit so that concurrent senders cannot interleave within a frame.
    pub(crate) fn send_block(
        &self,
        dest_host: usize,
        stream_id: StreamId,
        sender_worker: u32,
        receiver_worker: u32,
        typecode: u32,
        block: Option<Block>,
    ) -> Result<()> {
        let group = self
            .group
            .as_ref()
            .expect("remote send without a data group");
        let conn = group.connection(dest_host).clone();

        let header = match &block {
            Some(block) => FrameHeader {
                magic: super::FRAME_MAGIC,
                stream_id,
                sender_host: self.my_host_rank as u32,
                sender_worker,
                receiver_worker,
                payload_bytes: block.size() as u32,
                num_items: block.num_items() as u32,
                first_item: block.first_item_relative() as u32,
                typecode,
                flags: 0,
            },
            None => FrameHeader {
                magic: super::FRAME_MAGIC,
                stream_id,
                sender_host: self.my_host_rank as u32,
                sender_worker,
                receiver_worker,
                payload_bytes: 0,
                num_items: 0,
                first_item: 0,
                typecode,
                flags: 0,
            },
        };

        let mut header_buf = mem::pool().allocate(FrameHeader::SIZE);
        header.encode(header_buf.as_mut_slice());

        let log_failure: fn(Result<()>) = |result| {
            if let Err(error) = result {
                log::debug!("Multiplexer: send failed: {}", error);
            }
        };
        let mut ops: Vec<(Buffer, WriteCallback)> =
            vec![(Buffer::Pool(header_buf), Box::new(log_failure))];
        if let Some(block) = block {
            ops.push((
                Buffer::Shared {
                    data: block.byte_block().clone(),
                    begin: block.begin(),
                    end: block.end(),
                },
                Box::new(log_failure),
            ));
        }
        self.dispatcher.async_write_seq(dest_host, conn, ops);
        Ok(())
    }

    /// Chains the next header read on the connection to `host`.
    fn post_header_read(self: &Arc<Self>, host: usize) {
        let conn = self.group.as_ref().unwrap().connection(host).clone();
        let weak = Arc::downgrade(self);
        self.dispatcher.async_read(
            host,
            conn,
            FrameHeader::SIZE,
            Box::new(move |result| dispatch(&weak, result, move |mux, data| {
                mux.on_header(host, &data)
            })),
        );
    }

    /// Handles a received frame header: either a close sentinel, delivered
    /// directly, or the announcement of a payload, for which the read is
    /// chained.
    fn on_header(self: &Arc<Self>, host: usize, data: &[u8]) -> Result<()> {
        let header = FrameHeader::decode(data)?;
        ensure!(
            header.sender_host == host as u32 && (header.sender_worker as usize) < self.workers_per_host,
            "protocol error: impossible sender {}:{} on connection to host {}",
            header.sender_host,
            header.sender_worker,
            host
        );
        ensure!(
            (header.receiver_worker as usize) < self.workers_per_host,
            "protocol error: receiver worker {} out of range",
            header.receiver_worker
        );
        ensure!(
            header.payload_bytes <= MAX_PAYLOAD && header.first_item <= header.payload_bytes,
            "protocol error: impossible frame sizes"
        );

        if header.payload_bytes == 0 {
            self.deliver_close(&header)?;
            self.post_header_read(host);
            return Ok(());
        }

        let conn = self.group.as_ref().unwrap().connection(host).clone();
        let weak = Arc::downgrade(self);
        self.dispatcher.async_read(
            host,
            conn,
            header.payload_bytes as usize,
            Box::new(move |result| dispatch(&weak, result, move |mux, data| {
                mux.on_payload(host, &header, &data)
            })),
        );
        Ok(())
    }

    /// Copies a received payload into a fresh byte block and delivers it.
    fn on_payload(self: &Arc<Self>, host: usize, header: &FrameHeader, data: &[u8]) -> Result<()> {
        // This may wait for pool quota: inbound traffic is bounded by the
        // same budget as everything else, which is what propagates
        // backpressure to remote senders.
        let mut pinned = self
            .pool
            .allocate_byte_block(data.len(), false)
            .unwrap();
        pinned.as_mut_slice().copy_from_slice(data);
        let block = Block::new(
            pinned.freeze(),
            0,
            data.len(),
            header.first_item as usize,
            header.num_items as usize,
        );

        let src_global =
            header.sender_host as usize * self.workers_per_host + header.sender_worker as usize;
        match header.typecode {
            TYPE_CAT => {
                let stream =
                    self.get_or_create_cat(header.stream_id, header.receiver_worker as usize);
                stream.queues[src_global].append_block(block);
            }
            TYPE_MIX => {
                let stream =
                    self.get_or_create_mix(header.stream_id, header.receiver_worker as usize);
                stream.queue.append_block(src_global, block);
            }
            code => bail!("protocol error: unknown typecode {}", code),
        }

        self.post_header_read(host);
        Ok(())
    }

    fn deliver_close(&self, header: &FrameHeader) -> Result<()> {
        let src_global =
            header.sender_host as usize * self.workers_per_host + header.sender_worker as usize;
        match header.typecode {
            TYPE_CAT => {
                let stream =
                    self.get_or_create_cat(header.stream_id, header.receiver_worker as usize);
                stream.queues[src_global].close();
            }
            TYPE_MIX => {
                let stream =
                    self.get_or_create_mix(header.stream_id, header.receiver_worker as usize);
                stream.queue.close(src_global);
            }
            code => bail!("protocol error: unknown typecode {}", code),
        }
        Ok(())
    }
}

/// Boilerplate of receive-chain callbacks: upgrade the multiplexer, ignore
/// transport teardown, terminate on protocol errors.
fn dispatch<F>(weak: &Weak<Multiplexer>, result: Result<Vec<u8>>, handle: F)
where
    F: FnOnce(&Arc<Multiplexer>, Vec<u8>) -> Result<()>,
{
    let Some(mux) = weak.upgrade() else { return };
    match result {
        Err(error) => log::debug!("Multiplexer: receive chain stopped: {}", error),
        Ok(data) => {
            if let Err(error) = handle(&mux, data) {
                log::error!("Multiplexer: fatal: {:?}", error);
                mux.terminate();
            }
        }
    }
}

impl core::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let map = self.map.lock().unwrap();
        f.debug_struct("Multiplexer")
            .field("num_hosts", &self.num_hosts)
            .field("my_host_rank", &self.my_host_rank)
            .field("workers_per_host", &self.workers_per_host)
            .field("cat_streams", &map.cat.len())
            .field("mix_streams", &map.mix.len())
            .finish()
    }
}
