/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use crate::data::{deserialize_from_slice, serialize_to_vec, Item};
use anyhow::Result;
use std::sync::Arc;

/// A bidirectional point-to-point byte stream to one peer of a [`Group`].
///
/// The synchronous operations block until the whole buffer is transferred;
/// the `try_*` operations transfer at least zero bytes and never block, and
/// are the interface the [`Dispatcher`](super::Dispatcher) drives. A
/// connection must tolerate concurrent use of the send and receive
/// directions, but each direction is used by one thread at a time.
pub trait Connection: Send + Sync {
    /// Rank of the peer this connection leads to.
    fn peer(&self) -> usize;

    fn sync_send(&self, data: &[u8]) -> Result<()>;

    fn sync_recv(&self, data: &mut [u8]) -> Result<()>;

    /// Sends at most `data.len()` bytes without blocking; `Ok(0)` means the
    /// transport cannot accept bytes right now.
    fn try_send(&self, data: &[u8]) -> Result<usize>;

    /// Receives at most `data.len()` bytes without blocking; `Ok(0)` means
    /// no bytes are available right now.
    fn try_recv(&self, data: &mut [u8]) -> Result<usize>;
}

/// A numbered set of point-to-point connections, one per peer.
///
/// Rank `my_rank` has no connection to itself; asking for it is a
/// programming error.
pub trait Group: Send + Sync {
    fn my_rank(&self) -> usize;

    /// Number of ranks in the group (including this one).
    fn num_peers(&self) -> usize;

    fn connection(&self, peer: usize) -> &Arc<dyn Connection>;
}

/// Typed sends and receives of serializable items, length-prefixed on the
/// wire. Implemented for every [`Group`], including `dyn Group`.
pub trait GroupExt: Group {
    fn send_to<T: Item>(&self, peer: usize, item: &T) -> Result<()> {
        let payload = serialize_to_vec(item);
        let mut frame = Vec::with_capacity(payload.len() + 4);
        (payload.len() as u32).write_to(&mut frame)?;
        frame.extend_from_slice(&payload);
        self.connection(peer).sync_send(&frame)
    }

    fn recv_from<T: Item>(&self, peer: usize) -> Result<T> {
        let conn = self.connection(peer);
        let mut len = [0u8; 4];
        conn.sync_recv(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        let mut payload = vec![0u8; len];
        conn.sync_recv(&mut payload)?;
        deserialize_from_slice(&payload)
    }
}

impl<G: Group + ?Sized> GroupExt for G {}
