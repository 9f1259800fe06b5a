/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! An in-process transport: a full mesh of byte channels between `n` ranks
//! living in the same process. This is the transport behind
//! [`run_local`](crate::api::run_local) and most of the test suite, and the
//! natural choice for single-host jobs.

use super::{Connection, Group};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Pending {
    buf: Vec<u8>,
    pos: usize,
}

/// One endpoint of a channel pair between two mesh ranks.
struct MeshConnection {
    peer: usize,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    /// Partially consumed inbound chunk.
    pending: Mutex<Pending>,
}

impl MeshConnection {
    /// Copies from the pending chunk into `out`, returning the bytes moved.
    fn drain_pending(pending: &mut Pending, out: &mut [u8]) -> usize {
        let n = (pending.buf.len() - pending.pos).min(out.len());
        out[..n].copy_from_slice(&pending.buf[pending.pos..pending.pos + n]);
        pending.pos += n;
        if pending.pos == pending.buf.len() {
            pending.buf.clear();
            pending.pos = 0;
        }
        n
    }
}

impl Connection for MeshConnection {
    fn peer(&self) -> usize {
        self.peer
    }

    fn sync_send(&self, data: &[u8]) -> Result<()> {
        self.tx
            .send(data.to_vec())
            .ok()
            .context("transport error: mesh peer disconnected")
    }

    fn sync_recv(&self, data: &mut [u8]) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let mut off = 0;
        while off < data.len() {
            if pending.buf.len() == pending.pos {
                match self.rx.recv() {
                    Ok(chunk) => {
                        pending.buf = chunk;
                        pending.pos = 0;
                    }
                    Err(_) => bail!("transport error: mesh peer disconnected"),
                }
            }
            off += Self::drain_pending(&mut pending, &mut data[off..]);
        }
        Ok(())
    }

    fn try_send(&self, data: &[u8]) -> Result<usize> {
        self.sync_send(data)?;
        Ok(data.len())
    }

    fn try_recv(&self, data: &mut [u8]) -> Result<usize> {
        let mut pending = self.pending.lock().unwrap();
        if pending.buf.len() == pending.pos {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    pending.buf = chunk;
                    pending.pos = 0;
                }
                Err(TryRecvError::Empty) => return Ok(0),
                Err(TryRecvError::Disconnected) => {
                    bail!("transport error: mesh peer disconnected")
                }
            }
        }
        Ok(Self::drain_pending(&mut pending, data))
    }
}

/// The [`Group`] of one mesh rank.
pub struct MeshGroup {
    rank: usize,
    conns: Vec<Option<Arc<dyn Connection>>>,
}

impl Group for MeshGroup {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_peers(&self) -> usize {
        self.conns.len()
    }

    fn connection(&self, peer: usize) -> &Arc<dyn Connection> {
        self.conns[peer]
            .as_ref()
            .expect("no mesh connection to self")
    }
}

/// Builds a full mesh of `n` ranks and returns one group per rank.
pub fn make_mesh(n: usize) -> Vec<Arc<MeshGroup>> {
    let mut conns: Vec<Vec<Option<Arc<dyn Connection>>>> = (0..n)
        .map(|_| (0..n).map(|_| None).collect())
        .collect();
    for i in 0..n {
        for j in (i + 1)..n {
            let (tx_ij, rx_ij) = crossbeam_channel::unbounded();
            let (tx_ji, rx_ji) = crossbeam_channel::unbounded();
            conns[i][j] = Some(Arc::new(MeshConnection {
                peer: j,
                tx: tx_ij,
                rx: rx_ji,
                pending: Mutex::new(Pending::default()),
            }));
            conns[j][i] = Some(Arc::new(MeshConnection {
                peer: i,
                tx: tx_ji,
                rx: rx_ij,
                pending: Mutex::new(Pending::default()),
            }));
        }
    }
    conns
        .into_iter()
        .enumerate()
        .map(|(rank, conns)| Arc::new(MeshGroup { rank, conns }))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mesh_send_recv() {
        let groups = make_mesh(3);
        let g0 = groups[0].clone();
        let g1 = groups[1].clone();
        let t = std::thread::spawn(move || {
            let mut buf = [0u8; 5];
            g1.connection(0).sync_recv(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            g1.connection(0).sync_send(b"world").unwrap();
        });
        g0.connection(1).sync_send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        g0.connection(1).sync_recv(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        t.join().unwrap();
    }

    #[test]
    fn test_partial_reads() {
        let groups = make_mesh(2);
        groups[0].connection(1).sync_send(b"abcdef").unwrap();
        let conn = groups[1].connection(0);
        let mut buf = [0u8; 2];
        conn.sync_recv(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");
        let mut buf = [0u8; 4];
        assert_eq!(conn.try_recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"cdef");
        assert_eq!(conn.try_recv(&mut buf).unwrap(), 0);
    }
}
