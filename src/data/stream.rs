/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::{Block, BlockPool, BlockQueue, BlockSink, MixBlockQueue, Multiplexer};
use anyhow::{ensure, Result};
use std::sync::Arc;

/// Identifier of a stream, allocated in lockstep by every worker of the job
/// (one counter per local worker and stream flavor).
pub type StreamId = u32;

/// Value of the magic field; rejects mismatched builds and stray bytes.
pub const FRAME_MAGIC: u32 = 0x4D4C_5243;

/// Typecode of [`CatStream`](super::CatStream) frames.
pub const TYPE_CAT: u32 = 0;
/// Typecode of [`MixStream`](super::MixStream) frames.
pub const TYPE_MIX: u32 = 1;

/// The fixed-size header preceding every shipped block on the wire,
/// little-endian. `payload_bytes == 0` marks the end-of-stream sentinel for
/// this `(stream, sender → receiver)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub stream_id: StreamId,
    pub sender_host: u32,
    pub sender_worker: u32,
    pub receiver_worker: u32,
    pub payload_bytes: u32,
    pub num_items: u32,
    pub first_item: u32,
    pub typecode: u32,
    pub flags: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 40;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), Self::SIZE);
        let words = [
            self.magic,
            self.stream_id,
            self.sender_host,
            self.sender_worker,
            self.receiver_worker,
            self.payload_bytes,
            self.num_items,
            self.first_item,
            self.typecode,
            self.flags,
        ];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == Self::SIZE,
            "protocol error: truncated frame header"
        );
        let mut words = [0u32; 10];
        for (chunk, word) in data.chunks_exact(4).zip(words.iter_mut()) {
            *word = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        let header = FrameHeader {
            magic: words[0],
            stream_id: words[1],
            sender_host: words[2],
            sender_worker: words[3],
            receiver_worker: words[4],
            payload_bytes: words[5],
            num_items: words[6],
            first_item: words[7],
            typecode: words[8],
            flags: words[9],
        };
        ensure!(
            header.magic == FRAME_MAGIC,
            "protocol error: bad frame magic {:#x}",
            header.magic
        );
        Ok(header)
    }
}

enum StreamSinkKind {
    /// Same-host destination of a cat stream: append straight into the
    /// receiver's per-sender queue, no framing, no copy.
    CatLoopback { queue: Arc<BlockQueue> },
    /// Same-host destination of a mix stream.
    MixLoopback {
        queue: Arc<MixBlockQueue>,
        src: usize,
    },
    /// Remote destination: frame and hand over to the multiplexer.
    Net {
        mux: Arc<Multiplexer>,
        dest_host: usize,
        stream_id: StreamId,
        sender_worker: u32,
        receiver_worker: u32,
        typecode: u32,
    },
}

/// The per-destination [`BlockSink`] behind the writers of a stream.
pub struct StreamSink {
    pool: Arc<BlockPool>,
    kind: StreamSinkKind,
}

impl StreamSink {
    pub(crate) fn cat_loopback(pool: Arc<BlockPool>, queue: Arc<BlockQueue>) -> Self {
        StreamSink {
            pool,
            kind: StreamSinkKind::CatLoopback { queue },
        }
    }

    pub(crate) fn mix_loopback(
        pool: Arc<BlockPool>,
        queue: Arc<MixBlockQueue>,
        src: usize,
    ) -> Self {
        StreamSink {
            pool,
            kind: StreamSinkKind::MixLoopback { queue, src },
        }
    }

    pub(crate) fn net(
        pool: Arc<BlockPool>,
        mux: Arc<Multiplexer>,
        dest_host: usize,
        stream_id: StreamId,
        sender_worker: u32,
        receiver_worker: u32,
        typecode: u32,
    ) -> Self {
        StreamSink {
            pool,
            kind: StreamSinkKind::Net {
                mux,
                dest_host,
                stream_id,
                sender_worker,
                receiver_worker,
                typecode,
            },
        }
    }
}

impl BlockSink for StreamSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        match &self.kind {
            StreamSinkKind::CatLoopback { queue } => {
                BlockQueue::append_block(queue, block);
                Ok(())
            }
            StreamSinkKind::MixLoopback { queue, src } => {
                queue.append_block(*src, block);
                Ok(())
            }
            StreamSinkKind::Net {
                mux,
                dest_host,
                stream_id,
                sender_worker,
                receiver_worker,
                typecode,
            } => mux.send_block(
                *dest_host,
                *stream_id,
                *sender_worker,
                *receiver_worker,
                *typecode,
                Some(block),
            ),
        }
    }

    fn close_sink(&mut self) -> Result<()> {
        match &self.kind {
            StreamSinkKind::CatLoopback { queue } => {
                queue.close();
                Ok(())
            }
            StreamSinkKind::MixLoopback { queue, src } => {
                queue.close(*src);
                Ok(())
            }
            StreamSinkKind::Net {
                mux,
                dest_host,
                stream_id,
                sender_worker,
                receiver_worker,
                typecode,
            } => mux.send_block(
                *dest_host,
                *stream_id,
                *sender_worker,
                *receiver_worker,
                *typecode,
                None,
            ),
        }
    }

    fn allocate_can_fail(&self) -> bool {
        // network sinks apply backpressure through the pool quota
        matches!(self.kind, StreamSinkKind::Net { .. })
    }

    fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader {
            magic: FRAME_MAGIC,
            stream_id: 7,
            sender_host: 1,
            sender_worker: 2,
            receiver_worker: 3,
            payload_bytes: 4096,
            num_items: 17,
            first_item: 12,
            typecode: TYPE_MIX,
            flags: 0,
        };
        let mut buf = [0u8; FrameHeader::SIZE];
        header.encode(&mut buf);
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_bad_magic() {
        let buf = [0u8; FrameHeader::SIZE];
        assert!(FrameHeader::decode(&buf).is_err());
    }
}
