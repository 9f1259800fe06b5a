/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::Connection;
use crate::mem::PoolAlloc;
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An outbound buffer moved into the [`Dispatcher`].
///
/// The `Shared` variant sends a range of a reference-counted byte region
/// without copying; it is how block payloads travel, keeping the block alive
/// until the write completes.
pub enum Buffer {
    Vec(Vec<u8>),
    /// A small control-plane buffer from the arena [`Pool`](crate::mem::Pool)
    /// (frame headers).
    Pool(PoolAlloc),
    Shared {
        data: Arc<dyn AsRef<[u8]> + Send + Sync>,
        begin: usize,
        end: usize,
    },
}

impl Buffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Vec(v) => v,
            Buffer::Pool(p) => p.as_slice(),
            Buffer::Shared { data, begin, end } => &(**data).as_ref()[*begin..*end],
        }
    }
}

pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;
/// Returning true reschedules the timer for another period.
pub type TimerCallback = Box<dyn FnMut() -> bool + Send>;

enum Command {
    AsyncRead {
        key: usize,
        conn: Arc<dyn Connection>,
        size: usize,
        cb: ReadCallback,
    },
    AsyncWrite {
        key: usize,
        conn: Arc<dyn Connection>,
        ops: Vec<(Buffer, WriteCallback)>,
    },
    AddTimer {
        period: Duration,
        cb: TimerCallback,
    },
    Cancel {
        key: usize,
    },
    Terminate,
}

struct ReadOp {
    buf: Vec<u8>,
    filled: usize,
    cb: ReadCallback,
}

struct WriteOp {
    buf: Buffer,
    written: usize,
    cb: WriteCallback,
}

struct ConnState {
    conn: Arc<dyn Connection>,
    reads: VecDeque<ReadOp>,
    writes: VecDeque<WriteOp>,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    period: Duration,
    cb: TimerCallback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Timer {}
impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap on deadline
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Pause between progress sweeps while transfers are pending but the
/// transport has nothing for us.
const POLL_PAUSE: Duration = Duration::from_micros(200);

/// A single-threaded event loop multiplexing asynchronous reads and writes
/// over a set of connections, plus a queue of timers.
///
/// Completion callbacks run on the dispatcher thread and must never execute
/// user operators, only I/O bookkeeping. Per connection, reads complete in
/// request order and writes are sent back-to-back in request order, which is
/// what gives streams their per-(sender, receiver) FIFO guarantee.
///
/// [`terminate`](Dispatcher::terminate) breaks the loop at the next
/// iteration; every pending operation fails with a transport error.
pub struct Dispatcher {
    tx: Sender<Command>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("dispatcher-{}", name))
            .spawn(move || run(rx))
            .unwrap();
        Dispatcher {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Requests an asynchronous read of exactly `size` bytes. `key`
    /// identifies the connection for [`cancel`](Dispatcher::cancel).
    pub fn async_read(
        &self,
        key: usize,
        conn: Arc<dyn Connection>,
        size: usize,
        cb: ReadCallback,
    ) {
        // ignore failures after terminate: the callbacks are already failed
        let _ = self.tx.send(Command::AsyncRead {
            key,
            conn,
            size,
            cb,
        });
    }

    /// Requests an asynchronous write of the whole buffer, which is moved in.
    pub fn async_write(
        &self,
        key: usize,
        conn: Arc<dyn Connection>,
        buf: Buffer,
        cb: WriteCallback,
    ) {
        self.async_write_seq(key, conn, vec![(buf, cb)]);
    }

    /// Enqueues several writes as one unit: no write from another thread can
    /// end up between them on the wire. Used to keep a frame header and its
    /// payload adjacent.
    pub fn async_write_seq(
        &self,
        key: usize,
        conn: Arc<dyn Connection>,
        ops: Vec<(Buffer, WriteCallback)>,
    ) {
        let _ = self.tx.send(Command::AsyncWrite { key, conn, ops });
    }

    /// Runs `cb` after `period`, and again every `period` for as long as it
    /// returns true.
    pub fn add_timer(&self, period: Duration, cb: TimerCallback) {
        let _ = self.tx.send(Command::AddTimer { period, cb });
    }

    /// Drops all pending operations on the connection registered under
    /// `key`, without running their callbacks.
    pub fn cancel(&self, key: usize) {
        let _ = self.tx.send(Command::Cancel { key });
    }

    /// Breaks the event loop; all pending operations fail.
    pub fn terminate(&self) {
        let _ = self.tx.send(Command::Terminate);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: Receiver<Command>) {
    let mut conns: HashMap<usize, ConnState> = HashMap::new();
    let mut timers: BinaryHeap<Timer> = BinaryHeap::new();
    let mut timer_seq = 0u64;

    'outer: loop {
        // make progress on pending transfers
        let mut pending = false;
        let mut broken: Vec<usize> = Vec::new();
        for (&key, state) in conns.iter_mut() {
            if let Err(error) = progress(state) {
                log::error!("Dispatcher: connection {} failed: {:?}", key, error);
                fail_pending(state, &error);
                broken.push(key);
                continue;
            }
            pending |= !state.reads.is_empty() || !state.writes.is_empty();
        }
        for key in broken {
            conns.remove(&key);
        }

        // fire due timers
        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.deadline <= now) {
            let mut timer = timers.pop().unwrap();
            if (timer.cb)() {
                timer.deadline = now + timer.period;
                timers.push(timer);
            }
        }

        // wait for commands: briefly if I/O is pending, until the next timer
        // or indefinitely otherwise
        let timeout = if pending {
            POLL_PAUSE
        } else if let Some(timer) = timers.peek() {
            timer.deadline.saturating_duration_since(now)
        } else {
            Duration::from_secs(3600)
        };
        let mut command = match rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break 'outer,
        };

        while let Some(cmd) = command {
            match cmd {
                Command::AsyncRead {
                    key,
                    conn,
                    size,
                    cb,
                } => {
                    conns
                        .entry(key)
                        .or_insert_with(|| ConnState {
                            conn,
                            reads: VecDeque::new(),
                            writes: VecDeque::new(),
                        })
                        .reads
                        .push_back(ReadOp {
                            buf: vec![0u8; size],
                            filled: 0,
                            cb,
                        });
                }
                Command::AsyncWrite { key, conn, ops } => {
                    let state = conns.entry(key).or_insert_with(|| ConnState {
                        conn,
                        reads: VecDeque::new(),
                        writes: VecDeque::new(),
                    });
                    for (buf, cb) in ops {
                        state.writes.push_back(WriteOp {
                            buf,
                            written: 0,
                            cb,
                        });
                    }
                }
                Command::AddTimer { period, cb } => {
                    timers.push(Timer {
                        deadline: Instant::now() + period,
                        seq: timer_seq,
                        period,
                        cb,
                    });
                    timer_seq += 1;
                }
                Command::Cancel { key } => {
                    conns.remove(&key);
                }
                Command::Terminate => {
                    let error = anyhow!("transport error: dispatcher terminated");
                    for state in conns.values_mut() {
                        fail_pending(state, &error);
                    }
                    break 'outer;
                }
            }
            command = rx.try_recv().ok();
        }
    }
    log::debug!("Dispatcher: loop done");
}

/// Advances the front read and write of one connection as far as the
/// transport allows, completing finished operations.
fn progress(state: &mut ConnState) -> Result<()> {
    loop {
        let mut advanced = false;
        if let Some(op) = state.reads.front_mut() {
            let n = state.conn.try_recv(&mut op.buf[op.filled..])?;
            op.filled += n;
            advanced |= n > 0;
            if op.filled == op.buf.len() {
                let op = state.reads.pop_front().unwrap();
                (op.cb)(Ok(op.buf));
            }
        }
        if let Some(op) = state.writes.front_mut() {
            let n = state.conn.try_send(&op.buf.as_slice()[op.written..])?;
            op.written += n;
            advanced |= n > 0;
            if op.written == op.buf.as_slice().len() {
                let op = state.writes.pop_front().unwrap();
                (op.cb)(Ok(()));
            }
        }
        if !advanced {
            return Ok(());
        }
    }
}

fn fail_pending(state: &mut ConnState, error: &anyhow::Error) {
    for op in state.reads.drain(..) {
        (op.cb)(Err(anyhow!("{}", error)));
    }
    for op in state.writes.drain(..) {
        (op.cb)(Err(anyhow!("{}", error)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::{make_mesh, Group};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_async_round_trip() {
        let groups = make_mesh(2);
        let dispatcher = Dispatcher::new("test");
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        dispatcher.async_read(
            0,
            groups[1].connection(0).clone(),
            5,
            Box::new(move |data| {
                done_tx.send(data.unwrap()).unwrap();
            }),
        );
        dispatcher.async_write(
            1,
            groups[0].connection(1).clone(),
            Buffer::Vec(b"hello".to_vec()),
            Box::new(|r| r.unwrap()),
        );
        assert_eq!(
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .unwrap(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn test_timer() {
        let dispatcher = Dispatcher::new("timer");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.add_timer(
            Duration::from_millis(10),
            Box::new(move || c.fetch_add(1, Ordering::SeqCst) < 2),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
