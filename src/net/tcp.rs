/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A TCP transport: a full mesh of sockets between the hosts of a job.
//!
//! Ranks connect to all lower ranks and accept from all higher ranks,
//! exchanging their rank in a one-word handshake. Connections meant to be
//! driven by the [`Dispatcher`](super::Dispatcher) are switched to
//! non-blocking mode; connections for synchronous collectives stay blocking.

use super::{Connection, Group};
use anyhow::{bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long [`connect_mesh`] keeps retrying peers that are not up yet.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

struct TcpConnection {
    peer: usize,
    stream: TcpStream,
    nonblocking: bool,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl Connection for TcpConnection {
    fn peer(&self) -> usize {
        self.peer
    }

    fn sync_send(&self, mut data: &[u8]) -> Result<()> {
        let _guard = self.send_lock.lock().unwrap();
        let mut stream = &self.stream;
        while !data.is_empty() {
            match stream.write(data) {
                Ok(0) => bail!("transport error: TCP peer {} closed", self.peer),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(50));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("transport error to TCP peer {}", self.peer))
                }
            }
        }
        Ok(())
    }

    fn sync_recv(&self, data: &mut [u8]) -> Result<()> {
        let _guard = self.recv_lock.lock().unwrap();
        let mut stream = &self.stream;
        let mut off = 0;
        while off < data.len() {
            match stream.read(&mut data[off..]) {
                Ok(0) => bail!("transport error: TCP peer {} closed", self.peer),
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(50));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("transport error from TCP peer {}", self.peer))
                }
            }
        }
        Ok(())
    }

    fn try_send(&self, data: &[u8]) -> Result<usize> {
        debug_assert!(self.nonblocking);
        let _guard = self.send_lock.lock().unwrap();
        match (&self.stream).write(data) {
            Ok(0) => bail!("transport error: TCP peer {} closed", self.peer),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => {
                Err(e).with_context(|| format!("transport error to TCP peer {}", self.peer))
            }
        }
    }

    fn try_recv(&self, data: &mut [u8]) -> Result<usize> {
        debug_assert!(self.nonblocking);
        let _guard = self.recv_lock.lock().unwrap();
        match (&self.stream).read(data) {
            Ok(0) => bail!("transport error: TCP peer {} closed", self.peer),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => {
                Err(e).with_context(|| format!("transport error from TCP peer {}", self.peer))
            }
        }
    }
}

/// The [`Group`] of one TCP mesh rank.
pub struct TcpGroup {
    rank: usize,
    conns: Vec<Option<Arc<dyn Connection>>>,
}

impl Group for TcpGroup {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_peers(&self) -> usize {
        self.conns.len()
    }

    fn connection(&self, peer: usize) -> &Arc<dyn Connection> {
        self.conns[peer]
            .as_ref()
            .expect("no TCP connection to self")
    }
}

fn connect_with_retry(addr: &SocketAddr) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                log::debug!("TCP connect to {} failed ({}), retrying", addr, e);
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("cannot connect to TCP peer {}", addr))
            }
        }
    }
}

/// Builds the full mesh for rank `rank` of `addrs.len()` ranks, listening on
/// `addrs[rank]`. All ranks must call this with the same address list.
pub fn connect_mesh(rank: usize, addrs: &[SocketAddr], nonblocking: bool) -> Result<TcpGroup> {
    let n = addrs.len();
    let listener = TcpListener::bind(addrs[rank])
        .with_context(|| format!("cannot listen on {}", addrs[rank]))?;
    let mut conns: Vec<Option<Arc<dyn Connection>>> = (0..n).map(|_| None).collect();

    // connect to all lower ranks, announcing our own
    for (peer, addr) in addrs.iter().enumerate().take(rank) {
        let stream = connect_with_retry(addr)?;
        stream.set_nodelay(true)?;
        (&stream).write_all(&(rank as u32).to_le_bytes())?;
        stream.set_nonblocking(nonblocking)?;
        conns[peer] = Some(Arc::new(TcpConnection {
            peer,
            stream,
            nonblocking,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }));
    }

    // accept from all higher ranks
    for _ in rank + 1..n {
        let (stream, from) = listener.accept().context("accept failed")?;
        stream.set_nodelay(true)?;
        let mut word = [0u8; 4];
        (&stream).read_exact(&mut word)?;
        let peer = u32::from_le_bytes(word) as usize;
        if peer <= rank || peer >= n {
            bail!("protocol error: bad rank {} in handshake from {}", peer, from);
        }
        stream.set_nonblocking(nonblocking)?;
        conns[peer] = Some(Arc::new(TcpConnection {
            peer,
            stream,
            nonblocking,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }));
    }

    Ok(TcpGroup { rank, conns })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::GroupExt;

    #[test]
    fn test_tcp_pair() {
        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:41271".parse().unwrap(),
            "127.0.0.1:41272".parse().unwrap(),
        ];
        let addrs2 = addrs.clone();
        let t = std::thread::spawn(move || {
            let group = connect_mesh(1, &addrs2, false).unwrap();
            let v: u64 = group.recv_from(0).unwrap();
            group.send_to(0, &(v * 2)).unwrap();
        });
        let group = connect_mesh(0, &addrs, false).unwrap();
        group.send_to(1, &21u64).unwrap();
        assert_eq!(group.recv_from::<u64>(1).unwrap(), 42);
        t.join().unwrap();
    }
}
