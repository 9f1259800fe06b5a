/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Condvar, Mutex};

enum Job {
    Read {
        file: Arc<File>,
        offset: u64,
        len: usize,
        state: Arc<RequestState>,
    },
    Write {
        file: Arc<File>,
        offset: u64,
        data: Vec<u8>,
        state: Arc<RequestState>,
    },
}

struct RequestState {
    result: Mutex<Option<Result<Option<Vec<u8>>>>>,
    done: Condvar,
}

/// Handle of one asynchronous disk request.
///
/// Reads resolve to `Some(data)`, writes to `None`. A request must be
/// waited on exactly once, individually or through [`wait_all`].
pub struct Request(Arc<RequestState>);

impl Request {
    /// Blocks until completion and returns the read data, if any.
    pub fn wait(self) -> Result<Option<Vec<u8>>> {
        let mut result = self.0.result.lock().unwrap();
        while result.is_none() {
            result = self.0.done.wait(result).unwrap();
        }
        result.take().unwrap()
    }
}

/// Waits for a batch of requests, returning their read payloads in order.
pub fn wait_all(requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>> {
    requests.into_iter().map(Request::wait).collect()
}

/// A small thread pool performing positional disk I/O.
pub struct IoPool {
    tx: Sender<Job>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl IoPool {
    pub fn new(num_threads: usize) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..num_threads.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("io-{}", i))
                    .spawn(move || {
                        for job in rx {
                            run_job(job);
                        }
                    })
                    .unwrap()
            })
            .collect();
        Arc::new(IoPool {
            tx,
            handles: Mutex::new(handles),
        })
    }

    /// Posts an asynchronous read of `[offset, offset + len)`.
    pub fn read(&self, file: &Arc<File>, offset: u64, len: usize) -> Request {
        let state = Arc::new(RequestState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        self.post(Job::Read {
            file: file.clone(),
            offset,
            len,
            state: state.clone(),
        });
        Request(state)
    }

    /// Posts an asynchronous write of `data` at `offset`.
    pub fn write(&self, file: &Arc<File>, offset: u64, data: Vec<u8>) -> Request {
        let state = Arc::new(RequestState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        self.post(Job::Write {
            file: file.clone(),
            offset,
            data,
            state: state.clone(),
        });
        Request(state)
    }

    fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            // the pool is being torn down; the request will never complete,
            // which only happens after the owner dropped it
            log::error!("IoPool: request posted after shutdown");
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        // close the channel, then drain the workers
        let (tx, _) = crossbeam_channel::bounded(0);
        let _ = std::mem::replace(&mut self.tx, tx);
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn run_job(job: Job) {
    match job {
        Job::Read {
            file,
            offset,
            len,
            state,
        } => {
            let mut data = vec![0u8; len];
            let result = file
                .read_exact_at(&mut data, offset)
                .map(|()| Some(data))
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("disk read of {} bytes at {}", len, offset));
            complete(&state, result);
        }
        Job::Write {
            file,
            offset,
            data,
            state,
        } => {
            let result = file
                .write_all_at(&data, offset)
                .map(|()| None)
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("disk write of {} bytes at {}", data.len(), offset));
            complete(&state, result);
        }
    }
}

fn complete(state: &RequestState, result: Result<Option<Vec<u8>>>) {
    *state.result.lock().unwrap() = Some(result);
    state.done.notify_all();
}
